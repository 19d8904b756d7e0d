//! Per-call cancellation and deadlines.

use std::future::Future;
use std::time::Duration;

use rackplane_substrate::{SubstrateError, SubstrateResult};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::DEADLINE_CODE;

/// Carried by every substrate call a provider makes.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self { token, deadline: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run one substrate call under this context.
    pub async fn run<T, F>(&self, call: F) -> SubstrateResult<T>
    where
        F: Future<Output = SubstrateResult<T>>,
    {
        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, call)
                    .await
                    .unwrap_or_else(|_| Err(SubstrateError::api(DEADLINE_CODE, "deadline exceeded"))),
                None => call.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(SubstrateError::Canceled),
            result = bounded => result,
        }
    }

    /// Sleep unless canceled first. Returns false on cancel.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn canceled_context_short_circuits() {
        let ctx = CallContext::new();
        ctx.cancel();
        let res: SubstrateResult<()> = ctx.run(std::future::pending()).await;
        assert_eq!(res, Err(SubstrateError::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let ctx = CallContext::new().with_timeout(Duration::from_secs(5));
        let res: SubstrateResult<()> = ctx.run(std::future::pending()).await;
        assert!(res.unwrap_err().is_code(DEADLINE_CODE));
    }

    #[tokio::test]
    async fn completed_call_passes_through() {
        let ctx = CallContext::new();
        assert_eq!(ctx.run(async { Ok(7) }).await, Ok(7));
    }
}
