//! Hourly telemetry summary POSTed to the heartbeat endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::StatusCode;
use rackplane_provider::{AppOps, Provider, SystemOps};
use rustls::pki_types::ServerName;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use url::Url;

use crate::runner::Worker;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60 * 60);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Rack parameters sent as-is.
const ALLOW: &[&str] = &[
    "Autoscale",
    "Development",
    "InstanceCount",
    "InstanceType",
    "Internal",
    "Private",
    "Version",
];

/// Rack parameters sent only as a SHA-256 digest.
const REDACT: &[&str] = &[
    "ExistingVpc",
    "Key",
    "Password",
    "Subnets",
    "SubnetsPrivate",
    "VPC",
    "VPCCIDR",
];

fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub id: String,
    pub app_count: usize,
    pub instance_count: u32,
    pub instance_type: String,
    pub version: String,
    pub region: String,
    pub params: BTreeMap<String, String>,
}

/// Allowed parameters verbatim, redacted ones hashed, the rest dropped.
fn filter_params(params: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    params
        .iter()
        .filter_map(|(key, value)| {
            if ALLOW.contains(&key.as_str()) {
                Some((key.clone(), value.clone()))
            } else if REDACT.contains(&key.as_str()) {
                Some((key.clone(), sha256_hex(value)))
            } else {
                None
            }
        })
        .collect()
}

pub struct Heartbeat {
    provider: Provider,
    url: Url,
    /// Set for `https` endpoints.
    tls: Option<TlsConnector>,
}

/// Client TLS against the Mozilla root store.
fn tls_connector() -> anyhow::Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder_with_provider(rustls::crypto::ring::default_provider().into())
        .with_safe_default_protocol_versions()
        .context("tls protocol versions")?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Send one request over an established connection.
async fn exchange<S>(io: S, req: http::Request<Full<Bytes>>) -> anyhow::Result<StatusCode>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(hyper_util::rt::TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "heartbeat connection closed");
        }
    });
    Ok(sender.send_request(req).await?.status())
}

impl Heartbeat {
    pub fn new(provider: Provider, url: &str) -> anyhow::Result<Self> {
        let url = Url::parse(url).with_context(|| format!("invalid heartbeat url: {url}"))?;
        let tls = match url.scheme() {
            "http" => None,
            "https" => Some(tls_connector()?),
            scheme => bail!("unsupported heartbeat scheme {scheme}: {url}"),
        };
        Ok(Self { provider, url, tls })
    }

    pub async fn summary(&self) -> anyhow::Result<Summary> {
        let stack = self.provider.rack_stack_info().await?;
        let system = self.provider.system_get().await?;
        let apps = self.provider.app_list().await?;

        Ok(Summary {
            id: sha256_hex(&stack.id),
            app_count: apps.len(),
            instance_count: system.count,
            instance_type: system.instance_type,
            version: system.version,
            region: system.region,
            params: filter_params(&system.parameters),
        })
    }

    async fn post(&self, summary: &Summary) -> anyhow::Result<()> {
        let host = self.url.host_str().context("heartbeat url has no host")?;
        let port = self.url.port_or_known_default().unwrap_or(80);
        let address = format!("{host}:{port}");

        let req = http::Request::builder()
            .method("POST")
            .uri(&self.url[url::Position::BeforePath..])
            .header("host", &address)
            .header("content-type", "application/json")
            .header("user-agent", concat!("rackd/", env!("CARGO_PKG_VERSION")))
            .body(Full::new(Bytes::from(serde_json::to_vec(summary)?)))?;

        let status = tokio::time::timeout(REQUEST_TIMEOUT, async {
            let stream = tokio::net::TcpStream::connect(&address).await?;
            match &self.tls {
                Some(connector) => {
                    let name = ServerName::try_from(host.to_string())
                        .with_context(|| format!("invalid tls server name: {host}"))?;
                    exchange(connector.connect(name, stream).await?, req).await
                }
                None => exchange(stream, req).await,
            }
        })
        .await
        .context("heartbeat timed out")??;

        if !status.is_success() {
            bail!("heartbeat rejected with {status}");
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for Heartbeat {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn interval(&self) -> Duration {
        HEARTBEAT_INTERVAL
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let summary = self.summary().await?;
        self.post(&summary).await?;
        info!(id = %summary.id, apps = summary.app_count, "heartbeat sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use rackplane_provider::testing::TestRack;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// One-connection server that hands every request body to the test.
    async fn collector() -> (String, mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/heartbeat", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let svc = service_fn(move |req: Request<Incoming>| {
                let tx = tx.clone();
                async move {
                    let path = req.uri().path().to_string();
                    let body = req.into_body().collect().await?.to_bytes().to_vec();
                    tx.send((path, body)).unwrap();
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from_static(b"ok"))))
                }
            });
            let _ = http1::Builder::new()
                .serve_connection(hyper_util::rt::TokioIo::new(stream), svc)
                .await;
        });

        (url, rx)
    }

    #[test]
    fn params_are_allowed_redacted_or_dropped() {
        let params = BTreeMap::from([
            ("InstanceCount".to_string(), "3".to_string()),
            ("Password".to_string(), "secret".to_string()),
            ("ApiCpu".to_string(), "128".to_string()),
        ]);
        let filtered = filter_params(&params);
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered["InstanceCount"], "3");
        assert_eq!(
            filtered["Password"],
            "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
        );
    }

    #[tokio::test]
    async fn http_and_https_endpoints_are_accepted() {
        let rack = TestRack::new();
        assert!(Heartbeat::new(rack.provider.clone(), "http://metrics.example.org/").unwrap().tls.is_none());
        assert!(Heartbeat::new(rack.provider.clone(), "https://metrics.example.org/").unwrap().tls.is_some());
        assert!(Heartbeat::new(rack.provider.clone(), "ftp://metrics.example.org/").is_err());
        assert!(Heartbeat::new(rack.provider.clone(), "not a url").is_err());
    }

    #[tokio::test]
    async fn https_endpoints_open_with_a_tls_handshake() {
        let rack = TestRack::new();
        rack.seed_rack();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut first) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).await.unwrap();
            tx.send(byte[0]).unwrap();
        });

        let url = format!("https://localhost:{port}/heartbeat");
        let mut heartbeat = Heartbeat::new(rack.provider.clone(), &url).unwrap();
        assert!(heartbeat.tick().await.is_err());
        // 0x16 opens a TLS handshake record.
        assert_eq!(first.recv().await, Some(0x16));
    }

    #[tokio::test]
    async fn summary_is_posted_as_json() {
        let rack = TestRack::new();
        rack.seed_rack();
        rack.seed_app("httpd", "2");
        rack.seed_app("worker", "2");

        let (url, mut bodies) = collector().await;
        let mut heartbeat = Heartbeat::new(rack.provider.clone(), &url).unwrap();
        heartbeat.tick().await.unwrap();

        let (path, body) = bodies.recv().await.unwrap();
        assert_eq!(path, "/heartbeat");
        let sent: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let stack = rack.cloud.stacks.get("convox").unwrap();
        assert_eq!(sent["id"], sha256_hex(&stack.id));
        assert_eq!(sent["app_count"], 2);
        assert_eq!(sent["instance_count"], 3);
        assert_eq!(sent["instance_type"], "t2.small");
        assert_eq!(sent["params"]["Autoscale"], "No");
        assert_eq!(sent["params"]["VPC"], sha256_hex("vpc-1"));
        assert!(sent["params"].get("Domain").is_none());
    }
}
