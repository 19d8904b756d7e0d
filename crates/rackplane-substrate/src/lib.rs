//! rackplane-substrate: the capability set the rack runs on.
//!
//! Each managed service the control plane depends on is a narrow async
//! trait. A binding supplies one implementation of every trait, bundled
//! into a [`Substrate`]:
//!
//! ```text
//!   StackEngine ─── stacks, parameters, outputs, resources
//!   ContainerScheduler ─── tasks, services, instances, exec
//!   Tables / ObjectStore ─── durable records and blobs
//!   LogAggregator / Queue / EventBus ─── telemetry and messaging
//!   Kms / ImageRegistry / CertificateManager ─── secrets and artifacts
//!   ScalingGroups / Compute / MetricsSource ─── capacity
//!   BuildRunner ─── build containers
//! ```
//!
//! The [`memory`] module is a complete in-process binding used by the
//! local daemon and by tests.

pub mod build;
pub mod bus;
pub mod certs;
pub mod compute;
pub mod error;
pub mod kms;
pub mod logs;
pub mod memory;
pub mod metrics;
pub mod objects;
pub mod queue;
pub mod registry;
pub mod scaling;
pub mod scheduler;
pub mod stack;
pub mod tables;
pub mod template;

use std::sync::Arc;

pub use build::{BuildRunner, BuildSpec, RunningBuild};
pub use bus::EventBus;
pub use certs::{CertificateManager, CertificateSummary};
pub use compute::{Compute, ComputeInstance};
pub use error::{SubstrateError, SubstrateResult};
pub use kms::{DataKey, Kms};
pub use logs::{FilterLogEventsPage, FilterLogEventsRequest, InputLogEvent, LogAggregator, LogEvent};
pub use metrics::{Datapoint, MetricQuery, MetricsSource};
pub use objects::{ObjectStore, object_url, parse_object_url};
pub use queue::{Queue, QueueMessage, ReceiveOptions};
pub use registry::{ImageRegistry, RegistryAuth};
pub use scaling::{GroupInstance, ScalingGroup, ScalingGroups};
pub use scheduler::*;
pub use stack::*;
pub use tables::{Item, Tables};
pub use template::TemplateDoc;

/// One implementation of every capability.
#[derive(Clone)]
pub struct Substrate {
    pub stacks: Arc<dyn StackEngine>,
    pub scheduler: Arc<dyn ContainerScheduler>,
    pub tables: Arc<dyn Tables>,
    pub objects: Arc<dyn ObjectStore>,
    pub logs: Arc<dyn LogAggregator>,
    pub queues: Arc<dyn Queue>,
    pub kms: Arc<dyn Kms>,
    pub registry: Arc<dyn ImageRegistry>,
    pub bus: Arc<dyn EventBus>,
    pub scaling: Arc<dyn ScalingGroups>,
    pub certs: Arc<dyn CertificateManager>,
    pub compute: Arc<dyn Compute>,
    pub metrics: Arc<dyn MetricsSource>,
    pub builds: Arc<dyn BuildRunner>,
}
