//! Stack template rendering.
//!
//! The provider never builds templates inline; it hands a
//! [`TemplateRenderer`] the facts it knows and submits whatever JSON comes
//! back. [`JsonRenderer`] is the built-in renderer used by the local
//! binding and tests.

use std::collections::BTreeMap;

use rack_core::{ResourceParameter, ResourceType, ServiceIndex};
use serde_json::{Map, Value, json};

use crate::error::{ProviderError, ProviderResult};

/// Inputs for an app stack template.
#[derive(Debug, Clone)]
pub struct AppTemplate<'a> {
    pub app: &'a str,
    pub generation: &'a str,
    pub release: Option<&'a str>,
    pub services: &'a ServiceIndex,
    pub version: &'a str,
}

/// Inputs for a resource stack template.
#[derive(Debug, Clone)]
pub struct ResourceTemplate<'a> {
    pub stack: &'a str,
    pub kind: &'a str,
    /// Linked apps as `(app name, log group)`.
    pub links: &'a [(String, String)],
}

pub trait TemplateRenderer: Send + Sync {
    fn app(&self, input: &AppTemplate<'_>) -> ProviderResult<String>;

    /// Unknown kinds fail with `Validation`.
    fn resource(&self, input: &ResourceTemplate<'_>) -> ProviderResult<String>;

    fn resource_types(&self) -> Vec<ResourceType>;
}

/// `web-api` → `WebApi`.
pub fn upper_name(name: &str) -> String {
    name.split(|c: char| c == '-' || c == '_' || c == '.')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

// ── Resource kinds ─────────────────────────────────────────────────

/// How a resource kind is provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioning {
    /// Backed entirely by its stack template.
    Stack,
    /// Wraps an external URL with one of the listed schemes.
    Url(&'static [&'static str]),
}

/// Static description of an addon kind.
#[derive(Debug)]
pub struct ResourceKind {
    pub name: &'static str,
    pub provisioning: Provisioning,
    /// `(name, default, description)`.
    pub parameters: &'static [(&'static str, &'static str, &'static str)],
    /// `(logical id, resource type)`.
    resources: &'static [(&'static str, &'static str)],
    /// `(output, source)` where a source starting with `@` is a `Ref`.
    outputs: &'static [(&'static str, &'static str)],
    /// Whether apps link by subscribing their log group.
    pub links_logs: bool,
}

const NETWORK: [(&str, &str, &str); 5] = [
    ("SecurityGroups", "", "Security groups allowed to connect"),
    ("Subnets", "", "Public subnets"),
    ("SubnetsPrivate", "", "Private subnets"),
    ("Vpc", "", "VPC id"),
    ("VpcCidr", "", "VPC address range"),
];

const CREDENTIAL_RESOURCES: [(&str, &str); 2] = [("User", "AWS::IAM::User"), ("AccessKey", "AWS::IAM::AccessKey")];

pub static RESOURCE_KINDS: &[ResourceKind] = &[
    ResourceKind {
        name: "fluentd",
        provisioning: Provisioning::Url(&["tcp"]),
        parameters: &[("Url", "", "Forwarding endpoint")],
        resources: &[("Function", "AWS::Lambda::Function")],
        outputs: &[],
        links_logs: true,
    },
    ResourceKind {
        name: "memcached",
        provisioning: Provisioning::Stack,
        parameters: &[
            ("InstanceType", "cache.t2.micro", "Cache node type"),
            ("NumCacheNodes", "1", "Number of cache nodes"),
            ("Private", "false", "Place in private subnets"),
            NETWORK[0], NETWORK[1], NETWORK[2], NETWORK[3], NETWORK[4],
        ],
        resources: &[("CacheCluster", "AWS::ElastiCache::CacheCluster")],
        outputs: &[("Port11211TcpAddr", "@CacheCluster"), ("Port11211TcpPort", "11211")],
        links_logs: false,
    },
    ResourceKind {
        name: "mysql",
        provisioning: Provisioning::Stack,
        parameters: &[
            ("AllocatedStorage", "10", "Storage in GB"),
            ("Database", "app", "Database name"),
            ("InstanceType", "db.t2.micro", "Instance class"),
            ("MultiAZ", "false", "Multiple availability zones"),
            ("Password", "", "Server password"),
            ("Private", "false", "Place in private subnets"),
            NETWORK[0], NETWORK[1], NETWORK[2], NETWORK[3], NETWORK[4],
        ],
        resources: &[("Instance", "AWS::RDS::DBInstance")],
        outputs: &[
            ("EnvMysqlDatabase", "@Database"),
            ("EnvMysqlPassword", "@Password"),
            ("EnvMysqlUsername", "app"),
            ("Port3306TcpAddr", "@Instance"),
            ("Port3306TcpPort", "3306"),
        ],
        links_logs: false,
    },
    ResourceKind {
        name: "postgres",
        provisioning: Provisioning::Stack,
        parameters: &[
            ("AllocatedStorage", "10", "Storage in GB"),
            ("Database", "app", "Database name"),
            ("InstanceType", "db.t2.micro", "Instance class"),
            ("MultiAZ", "false", "Multiple availability zones"),
            ("Password", "", "Server password"),
            ("Private", "false", "Place in private subnets"),
            ("Version", "9.6", "Engine version"),
            NETWORK[0], NETWORK[1], NETWORK[2], NETWORK[3], NETWORK[4],
        ],
        resources: &[("Instance", "AWS::RDS::DBInstance")],
        outputs: &[
            ("EnvPostgresDatabase", "@Database"),
            ("EnvPostgresPassword", "@Password"),
            ("EnvPostgresUsername", "postgres"),
            ("Port5432TcpAddr", "@Instance"),
            ("Port5432TcpPort", "5432"),
        ],
        links_logs: false,
    },
    ResourceKind {
        name: "redis",
        provisioning: Provisioning::Stack,
        parameters: &[
            ("AutomaticFailoverEnabled", "false", "Fail over to a replica"),
            ("Database", "0", "Database index"),
            ("InstanceType", "cache.t2.micro", "Cache node type"),
            ("NumCacheClusters", "1", "Number of clusters"),
            ("Private", "false", "Place in private subnets"),
            NETWORK[0], NETWORK[1], NETWORK[2], NETWORK[3], NETWORK[4],
        ],
        resources: &[("ReplicationGroup", "AWS::ElastiCache::ReplicationGroup")],
        outputs: &[
            ("EnvRedisDatabase", "@Database"),
            ("Port6379TcpAddr", "@ReplicationGroup"),
            ("Port6379TcpPort", "6379"),
        ],
        links_logs: false,
    },
    ResourceKind {
        name: "s3",
        provisioning: Provisioning::Stack,
        parameters: &[
            ("Topic", "", "Notification topic for object events"),
            ("Versioning", "Suspended", "Bucket versioning"),
        ],
        resources: &[("Bucket", "AWS::S3::Bucket"), CREDENTIAL_RESOURCES[0], CREDENTIAL_RESOURCES[1]],
        outputs: &[("AccessKey", "@AccessKey"), ("Bucket", "@Bucket"), ("SecretAccessKey", "@User")],
        links_logs: false,
    },
    ResourceKind {
        name: "sns",
        provisioning: Provisioning::Stack,
        parameters: &[("Queue", "", "Queue subscribed to the topic")],
        resources: &[("Topic", "AWS::SNS::Topic"), CREDENTIAL_RESOURCES[0], CREDENTIAL_RESOURCES[1]],
        outputs: &[("AccessKey", "@AccessKey"), ("SecretAccessKey", "@User"), ("Topic", "@Topic")],
        links_logs: false,
    },
    ResourceKind {
        name: "sqs",
        provisioning: Provisioning::Stack,
        parameters: &[
            ("MessageRetentionPeriod", "345600", "Seconds a message is kept"),
            ("ReceiveMessageWaitTime", "0", "Long poll seconds"),
            ("VisibilityTimeout", "30", "Seconds a received message stays hidden"),
        ],
        resources: &[("Queue", "AWS::SQS::Queue"), CREDENTIAL_RESOURCES[0], CREDENTIAL_RESOURCES[1]],
        outputs: &[("AccessKey", "@AccessKey"), ("SecretAccessKey", "@User")],
        links_logs: false,
    },
    ResourceKind {
        name: "syslog",
        provisioning: Provisioning::Url(&["tcp", "tcp+tls", "udp"]),
        parameters: &[("Private", "false", "Forward from private subnets"), ("Url", "", "Syslog endpoint")],
        resources: &[("Function", "AWS::Lambda::Function")],
        outputs: &[],
        links_logs: true,
    },
    ResourceKind {
        name: "webhook",
        provisioning: Provisioning::Url(&["http", "https"]),
        parameters: &[("Url", "", "Endpoint notified of rack events")],
        resources: &[("Subscription", "AWS::SNS::Subscription")],
        outputs: &[],
        links_logs: false,
    },
];

pub fn resource_kind(name: &str) -> Option<&'static ResourceKind> {
    RESOURCE_KINDS.iter().find(|k| k.name == name)
}

// ── Built-in renderer ──────────────────────────────────────────────

/// Renders JSON templates the in-memory stack engine understands.
#[derive(Debug, Clone)]
pub struct JsonRenderer {
    region: String,
    account: String,
}

impl JsonRenderer {
    pub fn new(region: &str, account: &str) -> Self {
        Self {
            region: region.to_string(),
            account: account.to_string(),
        }
    }
}

fn parameter(default: Option<&str>) -> Value {
    match default {
        Some(d) => json!({ "Type": "String", "Default": d }),
        None => json!({ "Type": "String" }),
    }
}

fn output(source: &str) -> Value {
    match source.strip_prefix('@') {
        Some(target) => json!({ "Value": { "Ref": target } }),
        None => json!({ "Value": source }),
    }
}

fn document(parameters: Map<String, Value>, resources: Map<String, Value>, outputs: Map<String, Value>) -> ProviderResult<String> {
    let doc = json!({
        "AWSTemplateFormatVersion": "2010-09-09",
        "Parameters": parameters,
        "Resources": resources,
        "Outputs": outputs,
    });
    serde_json::to_string_pretty(&doc).map_err(ProviderError::from)
}

impl TemplateRenderer for JsonRenderer {
    fn app(&self, input: &AppTemplate<'_>) -> ProviderResult<String> {
        let gen2 = input.generation == "2";

        let mut parameters = Map::new();
        for key in ["LogBucket", "Rack", "Subnets", "SubnetsPrivate", "Version"] {
            parameters.insert(key.to_string(), parameter(None));
        }
        parameters.insert("Private".to_string(), parameter(Some("No")));
        if !gen2 {
            for key in ["Cluster", "Key", "Release", "VPC", "VPCCIDR"] {
                parameters.insert(key.to_string(), parameter(None));
            }
        }

        let mut resources = Map::new();
        resources.insert("LogGroup".to_string(), json!({ "Type": "AWS::Logs::LogGroup" }));
        resources.insert("Settings".to_string(), json!({ "Type": "AWS::S3::Bucket" }));
        resources.insert("Registry".to_string(), json!({ "Type": "AWS::ECR::Repository" }));

        for service in input.services.names() {
            let upper = upper_name(service);
            parameters.insert(format!("{upper}Count"), parameter(Some("1")));
            if gen2 {
                resources.insert(format!("Service{upper}Service"), json!({ "Type": "AWS::ECS::Service" }));
            } else {
                resources.insert(format!("Service{upper}"), json!({ "Type": "Custom::ECSService" }));
            }
        }

        let mut outputs = Map::new();
        outputs.insert("LogGroup".to_string(), output("@LogGroup"));
        outputs.insert("Settings".to_string(), output("@Settings"));
        outputs.insert("RegistryRepository".to_string(), output("@Registry"));
        outputs.insert("RegistryId".to_string(), output(&self.account));
        if let Some(release) = input.release.filter(|r| !r.is_empty()) {
            outputs.insert("Release".to_string(), output(release));
        }

        document(parameters, resources, outputs)
    }

    fn resource(&self, input: &ResourceTemplate<'_>) -> ProviderResult<String> {
        let kind = resource_kind(input.kind)
            .ok_or_else(|| ProviderError::validation(format!("Invalid resource type: {}", input.kind)))?;

        let parameters: Map<String, Value> = kind
            .parameters
            .iter()
            .map(|(name, default, _)| (name.to_string(), parameter(Some(default))))
            .collect();

        let mut resources: Map<String, Value> = kind
            .resources
            .iter()
            .map(|(id, kind)| (id.to_string(), json!({ "Type": kind })))
            .collect();

        let mut outputs: Map<String, Value> = kind
            .outputs
            .iter()
            .map(|(name, source)| (name.to_string(), output(source)))
            .collect();

        if kind.name == "sqs" {
            let url = format!("https://sqs.{}.amazonaws.com/{}/{}", self.region, self.account, input.stack);
            outputs.insert("Queue".to_string(), output(&url));
        }

        if kind.links_logs {
            for (app, log_group) in input.links {
                let upper = upper_name(app);
                resources.insert(
                    format!("{upper}SubscriptionFilter"),
                    json!({ "Type": "AWS::Logs::SubscriptionFilter", "Properties": { "LogGroupName": log_group } }),
                );
                outputs.insert(format!("{upper}Link"), output(log_group));
            }
        }

        document(parameters, resources, outputs)
    }

    fn resource_types(&self) -> Vec<ResourceType> {
        RESOURCE_KINDS
            .iter()
            .map(|kind| ResourceType {
                name: kind.name.to_string(),
                parameters: kind
                    .parameters
                    .iter()
                    .map(|(name, default, description)| ResourceParameter {
                        name: name.to_string(),
                        default: default.to_string(),
                        description: description.to_string(),
                    })
                    .collect(),
            })
            .collect()
    }
}

/// Parameter names a rendered template declares.
pub(crate) fn template_parameters(body: &str) -> ProviderResult<BTreeMap<String, Option<String>>> {
    rackplane_substrate::TemplateDoc::parse(body)
        .map(|doc| doc.parameters)
        .map_err(ProviderError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rackplane_substrate::TemplateDoc;

    #[test]
    fn upper_name_joins_parts() {
        assert_eq!(upper_name("web"), "Web");
        assert_eq!(upper_name("web-api"), "WebApi");
        assert_eq!(upper_name("a--b"), "AB");
    }

    #[test]
    fn app_template_per_generation() {
        let renderer = JsonRenderer::new("us-east-1", "123456789012");
        let services = ServiceIndex::parse("services:\n  web:\n    build: .\n  worker-jobs:\n    agent: true\n");

        let gen2 = renderer
            .app(&AppTemplate {
                app: "httpd",
                generation: "2",
                release: Some("RABCDEFGHIJ"),
                services: &services,
                version: "dev",
            })
            .unwrap();
        let doc = TemplateDoc::parse(&gen2).unwrap();
        assert_eq!(doc.resources["ServiceWebService"], "AWS::ECS::Service");
        assert_eq!(doc.parameters["WorkerJobsCount"], Some("1".to_string()));
        assert!(!doc.parameters.contains_key("Cluster"));
        assert_eq!(doc.outputs["Release"], Value::String("RABCDEFGHIJ".into()));
        assert_eq!(doc.outputs["RegistryId"], Value::String("123456789012".into()));

        let gen1 = renderer
            .app(&AppTemplate {
                app: "httpd",
                generation: "1",
                release: None,
                services: &services,
                version: "dev",
            })
            .unwrap();
        let doc = TemplateDoc::parse(&gen1).unwrap();
        assert_eq!(doc.resources["ServiceWeb"], "Custom::ECSService");
        assert!(doc.parameters.contains_key("VPCCIDR"));
        assert!(!doc.outputs.contains_key("Release"));
    }

    #[test]
    fn log_resources_emit_link_outputs() {
        let renderer = JsonRenderer::new("us-east-1", "123456789012");
        let links = vec![("httpd".to_string(), "convox-httpd-LogGroup-ABC".to_string())];
        let body = renderer
            .resource(&ResourceTemplate {
                stack: "convox-logs",
                kind: "syslog",
                links: &links,
            })
            .unwrap();
        let doc = TemplateDoc::parse(&body).unwrap();
        assert_eq!(doc.outputs["HttpdLink"], Value::String("convox-httpd-LogGroup-ABC".into()));
        assert_eq!(doc.resources["HttpdSubscriptionFilter"], "AWS::Logs::SubscriptionFilter");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let renderer = JsonRenderer::new("us-east-1", "123456789012");
        let err = renderer
            .resource(&ResourceTemplate {
                stack: "convox-x",
                kind: "cassandra",
                links: &[],
            })
            .unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
    }

    #[test]
    fn types_cover_every_kind() {
        let types = JsonRenderer::new("us-east-1", "0").resource_types();
        let names: Vec<_> = types.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            ["fluentd", "memcached", "mysql", "postgres", "redis", "s3", "sns", "sqs", "syslog", "webhook"]
        );
        let sqs = types.iter().find(|t| t.name == "sqs").unwrap();
        assert!(sqs.parameters.iter().any(|p| p.name == "VisibilityTimeout" && p.default == "30"));
    }
}
