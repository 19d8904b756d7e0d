use std::collections::BTreeMap;

use async_trait::async_trait;
use rack_core::Certificate;
use rackplane_substrate::CertificateSummary;
use tracing::info;

use crate::error::{ProviderError, ProviderResult};
use crate::ops::{AppOps, CertificateOps};
use crate::provider::Provider;
use crate::render::upper_name;

/// `acm-{last arn segment}`.
fn certificate_id(arn: &str) -> String {
    format!("acm-{}", arn.rsplit('-').next().unwrap_or(arn))
}

fn certificate(summary: CertificateSummary) -> Certificate {
    Certificate {
        id: certificate_id(&summary.arn),
        arn: summary.arn,
        domain: summary.domain,
        domains: summary.domains,
        expiration: summary.expiration,
    }
}

#[async_trait]
impl CertificateOps for Provider {
    async fn certificate_create(&self, public: &str, key: &str, chain: Option<&str>) -> ProviderResult<Certificate> {
        let arn = self.call(self.substrate().certs.import(public, key, chain)).await?;
        info!(%arn, "certificate imported");
        self.certificate_by(|c| c.arn == arn).await
    }

    async fn certificate_generate(&self, domains: &[String]) -> ProviderResult<Certificate> {
        let Some(domain) = domains.first() else {
            return Err(ProviderError::validation("must specify at least one domain"));
        };
        let arn = self.call(self.substrate().certs.request(domains)).await?;
        info!(%arn, %domain, "certificate requested");
        Ok(Certificate {
            id: certificate_id(&arn),
            arn,
            domain: domain.clone(),
            domains: domains.to_vec(),
            expiration: None,
        })
    }

    async fn certificate_list(&self) -> ProviderResult<Vec<Certificate>> {
        let summaries = self.call(self.substrate().certs.list()).await?;
        Ok(summaries.into_iter().map(certificate).collect())
    }

    async fn certificate_delete(&self, id: &str) -> ProviderResult<()> {
        let cert = self.certificate_by(|c| c.id == id).await?;
        self.call(self.substrate().certs.delete(&cert.arn)).await?;
        info!(%id, "certificate deleted");
        Ok(())
    }

    /// Only generation 1 apps take certificates on their listeners.
    async fn certificate_apply(&self, app: &str, service: &str, port: u16, id: &str) -> ProviderResult<()> {
        let app = self.app_get(app).await?;
        if app.is_gen2() {
            return Err(ProviderError::validation(
                "generation 2 apps use the domain: attribute on services in convox.yml",
            ));
        }

        let cert = self.certificate_by(|c| c.id == id).await?;
        let listener = format!("{}Port{port}Listener", upper_name(service));
        let current = app
            .parameters
            .get(&listener)
            .ok_or_else(|| ProviderError::validation(format!("no listener for {service} on port {port}")))?;
        let balancer_port = current.split(',').next().unwrap_or_default();

        let changes = BTreeMap::from([(listener, format!("{balancer_port},{}", cert.arn))]);
        self.update_stack(&self.rack_stack(&app.name), None, &changes).await?;
        info!(app = %app.name, %service, port, %id, "certificate applied");
        Ok(())
    }
}

impl Provider {
    async fn certificate_by(&self, matches: impl Fn(&Certificate) -> bool + Send) -> ProviderResult<Certificate> {
        self.certificate_list()
            .await?
            .into_iter()
            .find(|c| matches(c))
            .ok_or_else(|| ProviderError::not_found("certificate not found"))
    }
}
