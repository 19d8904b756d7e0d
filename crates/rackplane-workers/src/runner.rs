//! Fixed-tick runner shared by every worker.
//!
//! A worker is ticked after each `interval` until shutdown flips. Errors
//! are logged and a panicking tick is caught and logged the same way, so
//! one bad tick never takes the worker down. After a failed tick the pause
//! is at least [`ERROR_BACKOFF`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub const ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Worker: Send + 'static {
    fn name(&self) -> &'static str;

    /// Pause before each tick.
    fn interval(&self) -> Duration;

    async fn tick(&mut self) -> anyhow::Result<()>;
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Run one tick with panics trapped. Returns false if the tick failed.
pub async fn tick_once<W: Worker + ?Sized>(worker: &mut W) -> bool {
    let name = worker.name();
    match AssertUnwindSafe(worker.tick()).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(worker = name, error = %e, "worker tick failed");
            false
        }
        Err(panic) => {
            error!(worker = name, panic = panic_message(panic.as_ref()), "worker tick panicked");
            false
        }
    }
}

/// Tick `worker` until `shutdown` changes or its sender is dropped.
pub async fn run<W: Worker>(mut worker: W, mut shutdown: watch::Receiver<bool>) {
    let name = worker.name();
    let interval = worker.interval();
    info!(worker = name, interval_ms = interval.as_millis() as u64, "worker started");

    let mut pause = interval;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(pause) => {
                debug!(worker = name, "tick");
                // Long-polling ticks are abandoned on shutdown.
                let ok = tokio::select! {
                    ok = tick_once(&mut worker) => ok,
                    _ = shutdown.changed() => {
                        info!(worker = name, "worker shutting down mid-tick");
                        break;
                    }
                };
                pause = if ok { interval } else { interval.max(ERROR_BACKOFF) };
            }
            _ = shutdown.changed() => {
                info!(worker = name, "worker shutting down");
                break;
            }
        }
    }
}

pub fn spawn<W: Worker>(worker: W, shutdown: &watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(run(worker, shutdown.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        ticks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Worker for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(60)
        }

        async fn tick(&mut self) -> anyhow::Result<()> {
            match self.ticks.fetch_add(1, Ordering::SeqCst) {
                0 => panic!("first tick blows up"),
                1 => anyhow::bail!("second tick fails"),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panics_and_errors_do_not_stop_the_worker() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);
        let handle = spawn(Flaky { ticks: ticks.clone() }, &rx);

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(61)).await;
        }
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn tick_once_reports_failure() {
        let mut worker = Flaky {
            ticks: Arc::new(AtomicUsize::new(0)),
        };
        assert!(!tick_once(&mut worker).await);
        assert!(!tick_once(&mut worker).await);
        assert!(tick_once(&mut worker).await);
    }

    #[test]
    fn panic_payloads_are_readable() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(boxed.as_ref()), "owned message");
    }
}
