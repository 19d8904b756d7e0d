//! Certificate manager.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SubstrateResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSummary {
    pub arn: String,
    pub domain: String,
    pub domains: Vec<String>,
    pub expiration: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait CertificateManager: Send + Sync {
    async fn list(&self) -> SubstrateResult<Vec<CertificateSummary>>;

    /// Returns the certificate arn.
    async fn import(&self, public: &str, key: &str, chain: Option<&str>) -> SubstrateResult<String>;

    /// Request a managed certificate. Returns its arn.
    async fn request(&self, domains: &[String]) -> SubstrateResult<String>;

    async fn delete(&self, arn: &str) -> SubstrateResult<()>;
}
