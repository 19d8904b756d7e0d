//! In-process binding of every substrate capability.
//!
//! Each fake keeps its state behind a `parking_lot::Mutex`, exposes
//! fixture helpers for seeding state, and records the writes it receives
//! so callers can assert on them. Tables and objects are supplied from
//! outside (see `rackplane-state`).

mod build;
mod bus;
mod certs;
mod compute;
mod kms;
mod logs;
mod metrics;
mod queue;
mod registry;
mod scaling;
mod scheduler;
mod stack;

use std::sync::Arc;

use rand::Rng;

pub use build::{BuildOutcome, MemoryBuildRunner};
pub use bus::{MemoryBus, Published};
pub use certs::MemoryCerts;
pub use compute::MemoryCompute;
pub use kms::MemoryKms;
pub use logs::MemoryLogs;
pub use metrics::MemoryMetrics;
pub use queue::MemoryQueues;
pub use registry::MemoryRegistry;
pub use scaling::MemoryScaling;
pub use scheduler::MemoryScheduler;
pub use stack::MemoryStacks;

use crate::{ObjectStore, Substrate, Tables};

pub(crate) const ACCOUNT: &str = "000000000000";

/// Lowercase hex string of `len` random characters.
pub(crate) fn random_hex(len: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}

/// Dashed 8-4-4-4-12 identifier, the shape of scheduler task ids.
pub(crate) fn random_uuid() -> String {
    format!(
        "{}-{}-{}-{}-{}",
        random_hex(8),
        random_hex(4),
        random_hex(4),
        random_hex(4),
        random_hex(12)
    )
}

/// Every in-memory fake, held by concrete type so fixtures can reach them.
#[derive(Clone)]
pub struct MemoryCloud {
    pub region: String,
    pub stacks: Arc<MemoryStacks>,
    pub scheduler: Arc<MemoryScheduler>,
    pub logs: Arc<MemoryLogs>,
    pub queues: Arc<MemoryQueues>,
    pub kms: Arc<MemoryKms>,
    pub registry: Arc<MemoryRegistry>,
    pub bus: Arc<MemoryBus>,
    pub scaling: Arc<MemoryScaling>,
    pub certs: Arc<MemoryCerts>,
    pub compute: Arc<MemoryCompute>,
    pub metrics: Arc<MemoryMetrics>,
    pub builds: Arc<MemoryBuildRunner>,
}

impl MemoryCloud {
    /// `objects` lets the stack engine resolve template URLs.
    pub fn new(region: &str, objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            region: region.to_string(),
            stacks: Arc::new(MemoryStacks::new(region, Some(objects))),
            scheduler: Arc::new(MemoryScheduler::new(region)),
            logs: Arc::new(MemoryLogs::new()),
            queues: Arc::new(MemoryQueues::new()),
            kms: Arc::new(MemoryKms::new()),
            registry: Arc::new(MemoryRegistry::new(region)),
            bus: Arc::new(MemoryBus::new()),
            scaling: Arc::new(MemoryScaling::new()),
            certs: Arc::new(MemoryCerts::new(region)),
            compute: Arc::new(MemoryCompute::new()),
            metrics: Arc::new(MemoryMetrics::new()),
            builds: Arc::new(MemoryBuildRunner::new()),
        }
    }

    pub fn substrate(&self, tables: Arc<dyn Tables>, objects: Arc<dyn ObjectStore>) -> Substrate {
        Substrate {
            stacks: self.stacks.clone(),
            scheduler: self.scheduler.clone(),
            tables,
            objects,
            logs: self.logs.clone(),
            queues: self.queues.clone(),
            kms: self.kms.clone(),
            registry: self.registry.clone(),
            bus: self.bus.clone(),
            scaling: self.scaling.clone(),
            certs: self.certs.clone(),
            compute: self.compute.clone(),
            metrics: self.metrics.clone(),
            builds: self.builds.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_shape() {
        let id = random_uuid();
        let parts: Vec<_> = id.split('-').collect();
        assert_eq!(parts.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![8, 4, 4, 4, 12]);
    }
}
