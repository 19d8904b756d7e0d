use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;

use super::{ACCOUNT, random_uuid};
use crate::certs::*;
use crate::error::{SubstrateError, SubstrateResult};

pub struct MemoryCerts {
    region: String,
    certs: Mutex<BTreeMap<String, CertificateSummary>>,
}

impl MemoryCerts {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            certs: Mutex::new(BTreeMap::new()),
        }
    }

    fn store(&self, domains: Vec<String>) -> String {
        let arn = format!("arn:aws:acm:{}:{ACCOUNT}:certificate/{}", self.region, random_uuid());
        self.certs.lock().insert(
            arn.clone(),
            CertificateSummary {
                arn: arn.clone(),
                domain: domains.first().cloned().unwrap_or_default(),
                domains,
                expiration: Some(Utc::now() + Duration::days(365)),
            },
        );
        arn
    }
}

#[async_trait]
impl CertificateManager for MemoryCerts {
    async fn list(&self) -> SubstrateResult<Vec<CertificateSummary>> {
        Ok(self.certs.lock().values().cloned().collect())
    }

    async fn import(&self, public: &str, key: &str, _chain: Option<&str>) -> SubstrateResult<String> {
        if !public.contains("BEGIN CERTIFICATE") || !key.contains("PRIVATE KEY") {
            return Err(SubstrateError::api("ValidationException", "could not parse certificate"));
        }
        Ok(self.store(vec!["imported".to_string()]))
    }

    async fn request(&self, domains: &[String]) -> SubstrateResult<String> {
        Ok(self.store(domains.to_vec()))
    }

    async fn delete(&self, arn: &str) -> SubstrateResult<()> {
        self.certs
            .lock()
            .remove(arn)
            .map(|_| ())
            .ok_or_else(|| SubstrateError::api("ResourceNotFoundException", format!("Could not find certificate {arn}")))
    }
}
