//! rackplane-workers: the rack's background loops.
//!
//! ```text
//!   rackd ──▶ spawn_workers ──▶ runner::run(worker, shutdown)   one task each
//!                                   │
//!                                   ├── cleanup          1h
//!                                   ├── events           queues + service poller
//!                                   ├── heartbeat        1h   (HEARTBEAT_URL)
//!                                   ├── monitor          5m
//!                                   ├── autoscale        1m   (AUTOSCALE)
//!                                   ├── spot-replace     60s  (SPOT_INSTANCES)
//!                                   └── agents           1m
//! ```
//!
//! Every worker implements [`Worker`]; the runner owns the tick, the panic
//! trap and shutdown.

pub mod agents;
pub mod autoscale;
pub mod cleanup;
pub mod events;
pub mod heartbeat;
pub mod monitor;
pub mod runner;
pub mod spot;

use std::sync::Arc;

use rackplane_provider::Provider;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use runner::{Worker, run, spawn};

/// Spawn every worker the configuration enables.
pub fn spawn_workers(provider: &Provider, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let config = provider.config_arc();
    let logs = Arc::new(events::AppLogs::new(provider.clone()));

    let mut handles = vec![
        spawn(cleanup::Cleanup::new(provider.clone()), shutdown),
        spawn(
            events::QueueConsumer::new(provider.clone(), logs.clone(), events::EventQueue::StackEvents),
            shutdown,
        ),
        spawn(
            events::QueueConsumer::new(provider.clone(), logs.clone(), events::EventQueue::AccountEvents),
            shutdown,
        ),
        spawn(events::ServiceEvents::new(provider.clone(), logs), shutdown),
        spawn(monitor::Monitor::new(provider.clone()), shutdown),
        spawn(agents::AgentScaler::new(provider.clone()), shutdown),
    ];

    if let Some(url) = &config.heartbeat_url {
        match heartbeat::Heartbeat::new(provider.clone(), url) {
            Ok(worker) => handles.push(spawn(worker, shutdown)),
            Err(e) => warn!(error = %e, "heartbeat disabled"),
        }
    }

    if config.autoscale {
        handles.push(spawn(autoscale::Autoscaler::new(provider.clone()), shutdown));
    }

    if config.spot_instances {
        match config.on_demand_min_count {
            Some(min) => handles.push(spawn(spot::SpotReplace::new(provider.clone(), min), shutdown)),
            None => warn!("SPOT_INSTANCES is set without ON_DEMAND_MIN_COUNT, spot replace disabled"),
        }
    }

    info!(workers = handles.len(), "workers spawned");
    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use rack_core::Config;
    use rackplane_provider::testing::TestRack;

    #[tokio::test]
    async fn optional_workers_follow_config() {
        let rack = TestRack::new();
        let (tx, rx) = watch::channel(false);
        let base = spawn_workers(&rack.provider, &rx);
        assert_eq!(base.len(), 6);

        let mut config = Config::local("convox");
        config.autoscale = true;
        config.spot_instances = true;
        config.on_demand_min_count = Some(1);
        config.heartbeat_url = Some("http://127.0.0.1:9/heartbeat".to_string());
        let full = TestRack::with_config(config);
        let all = spawn_workers(&full.provider, &rx);
        assert_eq!(all.len(), 9);

        tx.send(true).unwrap();
        for handle in base.into_iter().chain(all) {
            handle.await.unwrap();
        }
    }
}
