//! Minimal reader for stack template documents.
//!
//! Templates are JSON with optional `Parameters`, `Resources` and
//! `Outputs` objects. Only the shape is read here; rendering happens
//! elsewhere.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{SubstrateError, SubstrateResult};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateDoc {
    /// Parameter name → default value.
    pub parameters: BTreeMap<String, Option<String>>,
    /// Logical id → resource type.
    pub resources: BTreeMap<String, String>,
    /// Output name → raw value expression.
    pub outputs: BTreeMap<String, Value>,
}

impl TemplateDoc {
    pub fn parse(body: &str) -> SubstrateResult<Self> {
        let root: Value = serde_json::from_str(body)
            .map_err(|e| SubstrateError::api("ValidationError", format!("Template format error: {e}")))?;

        let section = |name: &str| root.get(name).and_then(Value::as_object);

        let parameters = section("Parameters")
            .map(|params| {
                params
                    .iter()
                    .map(|(k, v)| (k.clone(), v.get("Default").map(scalar)))
                    .collect()
            })
            .unwrap_or_default();

        let resources = section("Resources")
            .map(|res| {
                res.iter()
                    .map(|(k, v)| {
                        let kind = v.get("Type").and_then(Value::as_str).unwrap_or("").to_string();
                        (k.clone(), kind)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let outputs = section("Outputs")
            .map(|outs| {
                outs.iter()
                    .filter_map(|(k, v)| v.get("Value").map(|val| (k.clone(), val.clone())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            parameters,
            resources,
            outputs,
        })
    }
}

fn scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
