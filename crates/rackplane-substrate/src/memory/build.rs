use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use crate::build::*;
use crate::error::SubstrateResult;

/// What the next started build container does.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub output: Vec<u8>,
    /// `None` keeps the container running until killed.
    pub exit_code: Option<i32>,
    pub delay: Duration,
}

impl Default for BuildOutcome {
    fn default() -> Self {
        Self {
            output: b"building\n".to_vec(),
            exit_code: Some(0),
            delay: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct State {
    outcome: BuildOutcome,
    started: Vec<BuildSpec>,
    killed: Vec<String>,
}

pub struct MemoryBuildRunner {
    state: Mutex<State>,
}

impl Default for MemoryBuildRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBuildRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    pub fn set_outcome(&self, outcome: BuildOutcome) {
        self.state.lock().outcome = outcome;
    }

    pub fn started(&self) -> Vec<BuildSpec> {
        self.state.lock().started.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.state.lock().killed.clone()
    }
}

#[async_trait]
impl BuildRunner for MemoryBuildRunner {
    async fn start(&self, spec: BuildSpec) -> SubstrateResult<RunningBuild> {
        let outcome = {
            let mut state = self.state.lock();
            state.started.push(spec);
            state.outcome.clone()
        };

        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let _ = tx.write_all(&outcome.output).await;
            let _ = tx.shutdown().await;
        });

        let wait: BoxFuture<'static, SubstrateResult<i32>> = Box::pin(async move {
            tokio::time::sleep(outcome.delay).await;
            match outcome.exit_code {
                Some(code) => Ok(code),
                None => std::future::pending().await,
            }
        });

        Ok(RunningBuild {
            stdout: Box::pin(rx),
            wait,
        })
    }

    async fn kill(&self, name: &str) -> SubstrateResult<()> {
        self.state.lock().killed.push(name.to_string());
        Ok(())
    }
}
