use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use super::{ACCOUNT, random_hex, random_uuid};
use crate::error::{SubstrateError, SubstrateResult};
use crate::objects::{ObjectStore, parse_object_url};
use crate::stack::*;
use crate::template::TemplateDoc;

struct Entry {
    stack: Stack,
    template: String,
    resources: Vec<StackResource>,
    events: Vec<StackEvent>,
}

/// Stack engine that applies every change synchronously.
///
/// Creates and updates complete immediately. Outputs are materialized from
/// the template: string values verbatim, `{"Ref": P}` as the parameter
/// value or resource physical id.
pub struct MemoryStacks {
    region: String,
    objects: Option<Arc<dyn ObjectStore>>,
    entries: Mutex<BTreeMap<String, Entry>>,
    updates: Mutex<Vec<UpdateStackRequest>>,
    creates: Mutex<Vec<CreateStackRequest>>,
    deletes: Mutex<Vec<String>>,
    describe_calls: AtomicUsize,
}

impl MemoryStacks {
    pub fn new(region: &str, objects: Option<Arc<dyn ObjectStore>>) -> Self {
        Self {
            region: region.to_string(),
            objects,
            entries: Mutex::new(BTreeMap::new()),
            updates: Mutex::new(Vec::new()),
            creates: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            describe_calls: AtomicUsize::new(0),
        }
    }

    // ── Fixtures ───────────────────────────────────────────────────

    /// Seed a stack as-is. Resources and outputs come from `template` when
    /// the stack does not already carry outputs.
    pub fn insert(&self, mut stack: Stack, template: &str) {
        let doc = TemplateDoc::parse(template).unwrap_or_default();
        let resources = materialize_resources(&stack.name, &doc);
        if stack.outputs.is_empty() {
            stack.outputs = materialize_outputs(&doc, &stack.parameters, &resources);
        }
        if stack.id.is_empty() {
            stack.id = self.stack_id(&stack.name);
        }
        self.entries.lock().insert(
            stack.name.clone(),
            Entry {
                stack,
                template: template.to_string(),
                resources,
                events: Vec::new(),
            },
        );
    }

    pub fn set_status(&self, name: &str, status: &str) {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            entry.stack.status = status.to_string();
        }
    }

    pub fn add_resource(&self, name: &str, resource: StackResource) {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            entry.resources.retain(|r| r.logical_id != resource.logical_id);
            entry.resources.push(resource);
        }
    }

    pub fn push_event(&self, name: &str, event: StackEvent) {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            entry.events.insert(0, event);
        }
    }

    pub fn get(&self, name: &str) -> Option<Stack> {
        self.entries.lock().get(name).map(|e| e.stack.clone())
    }

    pub fn updates(&self) -> Vec<UpdateStackRequest> {
        self.updates.lock().clone()
    }

    pub fn creates(&self) -> Vec<CreateStackRequest> {
        self.creates.lock().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().clone()
    }

    /// Number of `describe_stacks` calls that reached the engine.
    pub fn describe_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    // ── Internals ──────────────────────────────────────────────────

    fn stack_id(&self, name: &str) -> String {
        format!(
            "arn:aws:cloudformation:{}:{ACCOUNT}:stack/{name}/{}",
            self.region,
            random_uuid()
        )
    }

    async fn resolve(&self, template: &TemplateSource, current: Option<&str>) -> SubstrateResult<String> {
        match template {
            TemplateSource::Body(body) => Ok(body.clone()),
            TemplateSource::Previous => current
                .map(str::to_string)
                .ok_or_else(|| SubstrateError::api("ValidationError", "no previous template")),
            TemplateSource::Url(url) => {
                let (bucket, key) = parse_object_url(url).ok_or_else(|| {
                    SubstrateError::api("ValidationError", format!("TemplateURL must reference a valid object: {url}"))
                })?;
                let objects = self
                    .objects
                    .as_ref()
                    .ok_or_else(|| SubstrateError::api("ValidationError", "template urls unsupported"))?;
                let data = objects.get(&bucket, &key).await?;
                String::from_utf8(data)
                    .map_err(|e| SubstrateError::api("ValidationError", format!("Template format error: {e}")))
            }
        }
    }

    fn missing(name: &str) -> SubstrateError {
        SubstrateError::api("ValidationError", format!("Stack with id {name} does not exist"))
    }
}

fn materialize_resources(stack: &str, doc: &TemplateDoc) -> Vec<StackResource> {
    doc.resources
        .iter()
        .map(|(logical, kind)| StackResource {
            logical_id: logical.clone(),
            physical_id: format!("{stack}-{logical}-{}", random_hex(8).to_uppercase()),
            resource_type: kind.clone(),
            status: "CREATE_COMPLETE".to_string(),
        })
        .collect()
}

fn materialize_outputs(
    doc: &TemplateDoc,
    params: &BTreeMap<String, String>,
    resources: &[StackResource],
) -> BTreeMap<String, String> {
    doc.outputs
        .iter()
        .filter_map(|(name, value)| {
            let resolved = match value {
                Value::String(s) => Some(s.clone()),
                Value::Object(obj) => obj.get("Ref").and_then(Value::as_str).and_then(|target| {
                    params.get(target).cloned().or_else(|| {
                        resources
                            .iter()
                            .find(|r| r.logical_id == target)
                            .map(|r| r.physical_id.clone())
                    })
                }),
                _ => None,
            };
            resolved.map(|v| (name.clone(), v))
        })
        .collect()
}

fn event(stack: &str, status: &str) -> StackEvent {
    StackEvent {
        id: random_uuid(),
        logical_id: stack.to_string(),
        resource_type: "AWS::CloudFormation::Stack".to_string(),
        status: status.to_string(),
        reason: String::new(),
        timestamp: Utc::now(),
    }
}

#[async_trait]
impl StackEngine for MemoryStacks {
    async fn describe_stacks(&self, name: Option<&str>) -> SubstrateResult<Vec<Stack>> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        let entries = self.entries.lock();
        match name {
            None => Ok(entries.values().map(|e| e.stack.clone()).collect()),
            Some(name) => entries
                .get(name)
                .or_else(|| entries.values().find(|e| e.stack.id == name))
                .map(|e| vec![e.stack.clone()])
                .ok_or_else(|| Self::missing(name)),
        }
    }

    async fn describe_stack_events(&self, name: &str) -> SubstrateResult<Vec<StackEvent>> {
        self.entries
            .lock()
            .get(name)
            .map(|e| e.events.clone())
            .ok_or_else(|| Self::missing(name))
    }

    async fn describe_stack_resources(&self, name: &str) -> SubstrateResult<Vec<StackResource>> {
        self.entries
            .lock()
            .get(name)
            .map(|e| e.resources.clone())
            .ok_or_else(|| Self::missing(name))
    }

    async fn get_template(&self, name: &str) -> SubstrateResult<String> {
        self.entries
            .lock()
            .get(name)
            .map(|e| e.template.clone())
            .ok_or_else(|| Self::missing(name))
    }

    async fn create_stack(&self, req: CreateStackRequest) -> SubstrateResult<String> {
        if self.entries.lock().contains_key(&req.name) {
            return Err(SubstrateError::api(
                "AlreadyExistsException",
                format!("Stack [{}] already exists", req.name),
            ));
        }

        let body = self.resolve(&req.template, None).await?;
        let doc = TemplateDoc::parse(&body)?;

        let mut parameters: BTreeMap<String, String> = doc
            .parameters
            .iter()
            .filter_map(|(k, v)| v.clone().map(|v| (k.clone(), v)))
            .collect();
        parameters.extend(req.parameters.clone());

        let resources = materialize_resources(&req.name, &doc);
        let outputs = materialize_outputs(&doc, &parameters, &resources);
        let id = self.stack_id(&req.name);

        let stack = Stack {
            name: req.name.clone(),
            id: id.clone(),
            status: "CREATE_COMPLETE".to_string(),
            status_reason: String::new(),
            parameters,
            outputs,
            tags: req.tags.clone(),
            created: Utc::now(),
        };

        self.entries.lock().insert(
            req.name.clone(),
            Entry {
                stack,
                template: body,
                resources,
                events: vec![event(&req.name, "CREATE_COMPLETE")],
            },
        );
        self.creates.lock().push(req);
        Ok(id)
    }

    async fn update_stack(&self, req: UpdateStackRequest) -> SubstrateResult<()> {
        let (current_template, current) = {
            let entries = self.entries.lock();
            let entry = entries.get(&req.name).ok_or_else(|| Self::missing(&req.name))?;
            (entry.template.clone(), entry.stack.clone())
        };

        if current.status.ends_with("_IN_PROGRESS") {
            return Err(SubstrateError::api(
                "ValidationError",
                format!("Stack:{} is in {} state and can not be updated.", current.id, current.status),
            ));
        }

        let body = self.resolve(&req.template, Some(&current_template)).await?;
        let doc = TemplateDoc::parse(&body)?;

        let mut parameters = BTreeMap::new();
        for p in &req.parameters {
            match &p.value {
                Some(v) => {
                    parameters.insert(p.key.clone(), v.clone());
                }
                None => {
                    let previous = current.parameters.get(&p.key).ok_or_else(|| {
                        SubstrateError::api(
                            "ValidationError",
                            format!("Invalid input for parameter key {}. Cannot specify usePreviousValue as true for a parameter key not in the previous template", p.key),
                        )
                    })?;
                    parameters.insert(p.key.clone(), previous.clone());
                }
            }
        }
        for (k, default) in &doc.parameters {
            if let (false, Some(d)) = (parameters.contains_key(k), default) {
                parameters.insert(k.clone(), d.clone());
            }
        }

        if parameters == current.parameters && body == current_template {
            return Err(SubstrateError::api("ValidationError", "No updates are to be performed."));
        }

        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&req.name).ok_or_else(|| Self::missing(&req.name))?;
        if body != entry.template {
            let previous = std::mem::take(&mut entry.resources);
            entry.resources = materialize_resources(&req.name, &doc)
                .into_iter()
                .map(|fresh| {
                    previous
                        .iter()
                        .find(|old| old.logical_id == fresh.logical_id)
                        .cloned()
                        .unwrap_or(fresh)
                })
                .collect();
        }
        entry.stack.outputs = materialize_outputs(&doc, &parameters, &entry.resources);
        entry.stack.parameters = parameters;
        entry.stack.status = "UPDATE_COMPLETE".to_string();
        entry.template = body;
        entry.events.insert(0, event(&req.name, "UPDATE_COMPLETE"));
        drop(entries);

        self.updates.lock().push(req);
        Ok(())
    }

    async fn delete_stack(&self, name: &str) -> SubstrateResult<()> {
        self.entries.lock().remove(name);
        self.deletes.lock().push(name.to_string());
        Ok(())
    }

    async fn cancel_update_stack(&self, name: &str) -> SubstrateResult<()> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(name).ok_or_else(|| Self::missing(name))?;
        if entry.stack.status != "UPDATE_IN_PROGRESS" {
            return Err(SubstrateError::api(
                "ValidationError",
                format!("Stack:{} is in {} state and can not be cancelled", entry.stack.id, entry.stack.status),
            ));
        }
        entry.stack.status = "UPDATE_ROLLBACK_IN_PROGRESS".to_string();
        Ok(())
    }
}
