use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{ACCOUNT, random_uuid};
use crate::error::{SubstrateError, SubstrateResult};
use crate::scheduler::*;

/// Scripted result of the next exec.
#[derive(Debug, Clone, Default)]
struct ExecScript {
    output: Vec<u8>,
    exit_code: i32,
}

#[derive(Default)]
struct State {
    tasks: BTreeMap<String, Task>,
    definitions: BTreeMap<String, TaskDefinition>,
    revisions: BTreeMap<String, u32>,
    services: BTreeMap<String, Vec<Service>>,
    instances: BTreeMap<String, Vec<ContainerInstance>>,
    run_failures: VecDeque<String>,
    /// Status newly run tasks start in.
    run_status: Option<String>,
    exec: ExecScript,
    exec_requests: Vec<ExecRequest>,
    exec_input: Vec<u8>,
    stats: BTreeMap<String, ContainerStats>,
    runs: Vec<RunTaskRequest>,
    stopped: Vec<String>,
    registered: Vec<TaskDefinition>,
    describe_definition_calls: usize,
}

pub struct MemoryScheduler {
    region: String,
    state: Arc<Mutex<State>>,
}

impl MemoryScheduler {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    // ── Fixtures ───────────────────────────────────────────────────

    pub fn task_arn(&self, id: &str) -> String {
        format!("arn:aws:ecs:{}:{ACCOUNT}:task/{id}", self.region)
    }

    pub fn add_task(&self, task: Task) {
        self.state.lock().tasks.insert(task.arn.clone(), task);
    }

    pub fn add_task_definition(&self, def: TaskDefinition) {
        self.state.lock().definitions.insert(def.arn.clone(), def);
    }

    pub fn add_service(&self, cluster: &str, service: Service) {
        self.state
            .lock()
            .services
            .entry(cluster.to_string())
            .or_default()
            .push(service);
    }

    pub fn add_container_instance(&self, cluster: &str, instance: ContainerInstance) {
        self.state
            .lock()
            .instances
            .entry(cluster.to_string())
            .or_default()
            .push(instance);
    }

    pub fn set_task_status(&self, arn: &str, status: &str) {
        if let Some(task) = self.state.lock().tasks.get_mut(arn) {
            task.last_status = status.to_string();
        }
    }

    pub fn set_agent_connected(&self, ec2_instance_id: &str, connected: bool) {
        let mut state = self.state.lock();
        for ci in state.instances.values_mut().flatten() {
            if ci.ec2_instance_id == ec2_instance_id {
                ci.agent_connected = connected;
            }
        }
    }

    /// The next `run_task` fails placement with `reason`.
    pub fn fail_next_run(&self, reason: &str) {
        self.state.lock().run_failures.push_back(reason.to_string());
    }

    /// Tasks started by `run_task` begin in this status (default `RUNNING`).
    pub fn set_run_status(&self, status: &str) {
        self.state.lock().run_status = Some(status.to_string());
    }

    pub fn script_exec(&self, output: &[u8], exit_code: i32) {
        self.state.lock().exec = ExecScript {
            output: output.to_vec(),
            exit_code,
        };
    }

    pub fn set_stats(&self, task_arn: &str, stats: ContainerStats) {
        self.state.lock().stats.insert(task_arn.to_string(), stats);
    }

    pub fn runs(&self) -> Vec<RunTaskRequest> {
        self.state.lock().runs.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().stopped.clone()
    }

    pub fn registered(&self) -> Vec<TaskDefinition> {
        self.state.lock().registered.clone()
    }

    pub fn exec_requests(&self) -> Vec<ExecRequest> {
        self.state.lock().exec_requests.clone()
    }

    /// Bytes written into exec sessions so far.
    pub fn exec_input(&self) -> Vec<u8> {
        self.state.lock().exec_input.clone()
    }

    pub fn describe_definition_calls(&self) -> usize {
        self.state.lock().describe_definition_calls
    }
}

#[async_trait]
impl ContainerScheduler for MemoryScheduler {
    async fn list_tasks(&self, cluster: &str, filter: ListTasksFilter) -> SubstrateResult<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .tasks
            .values()
            .filter(|t| t.cluster == cluster && t.desired_status != "STOPPED")
            .filter(|t| match &filter.service {
                Some(s) => {
                    let name = s.rsplit('/').next().unwrap_or(s);
                    t.group == format!("service:{name}")
                }
                None => true,
            })
            .filter(|t| match &filter.started_by {
                Some(by) => &t.started_by == by,
                None => true,
            })
            .map(|t| t.arn.clone())
            .collect())
    }

    async fn describe_tasks(&self, cluster: &str, arns: &[String]) -> SubstrateResult<Vec<Task>> {
        let state = self.state.lock();
        Ok(arns
            .iter()
            .filter_map(|arn| state.tasks.get(arn))
            .filter(|t| t.cluster == cluster)
            .cloned()
            .collect())
    }

    async fn describe_task_definition(&self, arn: &str) -> SubstrateResult<TaskDefinition> {
        let mut state = self.state.lock();
        state.describe_definition_calls += 1;
        state
            .definitions
            .get(arn)
            .cloned()
            .ok_or_else(|| SubstrateError::api("ClientException", "Unable to describe task definition."))
    }

    async fn register_task_definition(&self, mut def: TaskDefinition) -> SubstrateResult<String> {
        let mut state = self.state.lock();
        let revision = state.revisions.entry(def.family.clone()).or_insert(0);
        *revision += 1;
        def.arn = format!(
            "arn:aws:ecs:{}:{ACCOUNT}:task-definition/{}:{}",
            self.region, def.family, revision
        );
        let arn = def.arn.clone();
        state.definitions.insert(arn.clone(), def.clone());
        state.registered.push(def);
        Ok(arn)
    }

    async fn run_task(&self, req: RunTaskRequest) -> SubstrateResult<RunTaskResult> {
        let mut state = self.state.lock();
        state.runs.push(req.clone());

        if let Some(reason) = state.run_failures.pop_front() {
            return Ok(RunTaskResult {
                tasks: Vec::new(),
                failures: vec![reason],
            });
        }

        let def = state
            .definitions
            .get(&req.task_definition)
            .cloned()
            .ok_or_else(|| SubstrateError::api("ClientException", "TaskDefinition not found."))?;

        let container_instance_arn = state
            .instances
            .get(&req.cluster)
            .and_then(|list| list.first())
            .map(|ci| ci.arn.clone());

        let status = state.run_status.clone().unwrap_or_else(|| "RUNNING".to_string());
        let task = Task {
            arn: self.task_arn(&random_uuid()),
            cluster: req.cluster.clone(),
            task_definition_arn: def.arn.clone(),
            container_instance_arn,
            last_status: status,
            desired_status: "RUNNING".to_string(),
            started_by: req.started_by.clone(),
            group: format!("family:{}", def.family),
            started_at: Some(Utc::now()),
            containers: def
                .containers
                .iter()
                .map(|c| TaskContainer {
                    name: c.name.clone(),
                    last_status: "RUNNING".to_string(),
                    network_bindings: c.port_mappings.clone(),
                })
                .collect(),
            overrides: req.overrides.clone(),
        };
        state.tasks.insert(task.arn.clone(), task.clone());

        Ok(RunTaskResult {
            tasks: vec![task],
            failures: Vec::new(),
        })
    }

    async fn stop_task(&self, cluster: &str, arn: &str) -> SubstrateResult<()> {
        let mut state = self.state.lock();
        match state.tasks.get_mut(arn) {
            Some(task) if task.cluster == cluster => {
                task.desired_status = "STOPPED".to_string();
                task.last_status = "STOPPED".to_string();
                state.stopped.push(arn.to_string());
                Ok(())
            }
            _ => Err(SubstrateError::api("InvalidParameterException", "The referenced task was not found.")),
        }
    }

    async fn list_container_instances(&self, cluster: &str) -> SubstrateResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .instances
            .get(cluster)
            .map(|list| list.iter().map(|ci| ci.arn.clone()).collect())
            .unwrap_or_default())
    }

    async fn describe_container_instances(
        &self,
        cluster: &str,
        arns: &[String],
    ) -> SubstrateResult<Vec<ContainerInstance>> {
        let state = self.state.lock();
        let list = state.instances.get(cluster).cloned().unwrap_or_default();
        Ok(arns
            .iter()
            .filter_map(|arn| list.iter().find(|ci| &ci.arn == arn).cloned())
            .collect())
    }

    async fn list_services(&self, cluster: &str) -> SubstrateResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .services
            .get(cluster)
            .map(|list| list.iter().map(|s| s.arn.clone()).collect())
            .unwrap_or_default())
    }

    async fn describe_services(&self, cluster: &str, names: &[String]) -> SubstrateResult<Vec<Service>> {
        let state = self.state.lock();
        let list = state.services.get(cluster).cloned().unwrap_or_default();
        Ok(names
            .iter()
            .filter_map(|n| list.iter().find(|s| &s.arn == n || &s.name == n).cloned())
            .collect())
    }

    async fn exec(&self, req: ExecRequest) -> SubstrateResult<ExecSession> {
        let script = {
            let mut state = self.state.lock();
            let running = state
                .tasks
                .get(&req.task_arn)
                .is_some_and(|t| t.last_status == "RUNNING");
            if !running {
                return Err(SubstrateError::api("InvalidParameterException", "task is not running"));
            }
            state.exec_requests.push(req);
            state.exec.clone()
        };

        let (mut container_out, client_out) = tokio::io::duplex(64 * 1024);
        let (client_in, mut container_in) = tokio::io::duplex(64 * 1024);

        let state = self.state.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match container_in.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => state.lock().exec_input.extend_from_slice(&buf[..n]),
                }
            }
        });

        let exit_code = script.exit_code;
        let writer = tokio::spawn(async move {
            let _ = container_out.write_all(&script.output).await;
            let _ = container_out.shutdown().await;
        });

        let exit: BoxFuture<'static, SubstrateResult<i32>> = Box::pin(async move {
            writer
                .await
                .map_err(|e| SubstrateError::Transport(e.to_string()))?;
            Ok(exit_code)
        });

        Ok(ExecSession {
            input: Box::pin(client_in),
            output: Box::pin(client_out),
            exit,
        })
    }

    async fn stats(&self, _cluster: &str, task_arn: &str) -> SubstrateResult<ContainerStats> {
        Ok(self
            .state
            .lock()
            .stats
            .get(task_arn)
            .copied()
            .unwrap_or_default())
    }
}
