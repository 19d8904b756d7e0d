use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{SubstrateError, SubstrateResult};
use crate::scaling::*;

#[derive(Default)]
struct State {
    groups: BTreeMap<String, ScalingGroup>,
    desired_calls: Vec<(String, i64)>,
    health_calls: Vec<(String, String)>,
    terminated: Vec<(String, bool)>,
}

pub struct MemoryScaling {
    state: Mutex<State>,
}

impl Default for MemoryScaling {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryScaling {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    pub fn insert(&self, group: ScalingGroup) {
        self.state.lock().groups.insert(group.name.clone(), group);
    }

    pub fn group(&self, name: &str) -> Option<ScalingGroup> {
        self.state.lock().groups.get(name).cloned()
    }

    pub fn desired_calls(&self) -> Vec<(String, i64)> {
        self.state.lock().desired_calls.clone()
    }

    pub fn health_calls(&self) -> Vec<(String, String)> {
        self.state.lock().health_calls.clone()
    }

    pub fn terminated(&self) -> Vec<(String, bool)> {
        self.state.lock().terminated.clone()
    }
}

#[async_trait]
impl ScalingGroups for MemoryScaling {
    async fn describe_groups(&self, names: &[String]) -> SubstrateResult<Vec<ScalingGroup>> {
        let state = self.state.lock();
        Ok(names.iter().filter_map(|n| state.groups.get(n).cloned()).collect())
    }

    async fn set_desired_capacity(&self, group: &str, desired: i64) -> SubstrateResult<()> {
        let mut state = self.state.lock();
        let g = state
            .groups
            .get_mut(group)
            .ok_or_else(|| SubstrateError::api("ValidationError", format!("AutoScalingGroup name not found - {group}")))?;
        if desired < g.min_size || desired > g.max_size {
            return Err(SubstrateError::api(
                "ValidationError",
                format!("New SetDesiredCapacity value {desired} is outside bounds"),
            ));
        }
        g.desired_capacity = desired;
        state.desired_calls.push((group.to_string(), desired));
        Ok(())
    }

    async fn set_instance_health(&self, instance: &str, status: &str, _respect_grace_period: bool) -> SubstrateResult<()> {
        let mut state = self.state.lock();
        for g in state.groups.values_mut() {
            for i in g.instances.iter_mut().filter(|i| i.id == instance) {
                i.health_status = status.to_string();
            }
        }
        state.health_calls.push((instance.to_string(), status.to_string()));
        Ok(())
    }

    async fn terminate_instance(&self, instance: &str, decrement_desired: bool) -> SubstrateResult<()> {
        let mut state = self.state.lock();
        let mut found = false;
        for g in state.groups.values_mut() {
            let before = g.instances.len();
            g.instances.retain(|i| i.id != instance);
            if g.instances.len() != before {
                found = true;
                if decrement_desired {
                    g.desired_capacity -= 1;
                }
            }
        }
        if !found {
            return Err(SubstrateError::api("ValidationError", format!("Instance Id not found - {instance}")));
        }
        state.terminated.push((instance.to_string(), decrement_desired));
        Ok(())
    }
}
