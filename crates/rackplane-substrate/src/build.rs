//! Build container runner.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::SubstrateResult;
use crate::scheduler::ByteReader;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSpec {
    /// Container name, used again by [`BuildRunner::kill`].
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Bytes piped to the container's stdin (tarball sources).
    pub stdin: Option<Vec<u8>>,
}

/// A started build container. `stdout` carries stdout and stderr; `wait`
/// resolves to the exit code.
pub struct RunningBuild {
    pub stdout: ByteReader,
    pub wait: BoxFuture<'static, SubstrateResult<i32>>,
}

#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn start(&self, spec: BuildSpec) -> SubstrateResult<RunningBuild>;

    async fn kill(&self, name: &str) -> SubstrateResult<()>;
}
