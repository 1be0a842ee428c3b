//! Periodic reclamation of leases held by dead containers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use orch_core::epoch_secs;

use crate::broker::CheckoutBroker;

/// Outcome of the most recent sweep pass, shared with the health endpoint.
#[derive(Debug, Default)]
pub struct SweepStats {
    last_reclaimed: AtomicUsize,
    total_reclaimed: AtomicUsize,
    last_run_at: AtomicU64,
}

impl SweepStats {
    pub fn last_reclaimed(&self) -> usize {
        self.last_reclaimed.load(Ordering::Relaxed)
    }

    pub fn total_reclaimed(&self) -> usize {
        self.total_reclaimed.load(Ordering::Relaxed)
    }

    /// Unix time of the last successful pass, `0` if none ran yet.
    pub fn last_run_at(&self) -> u64 {
        self.last_run_at.load(Ordering::Relaxed)
    }

    fn record(&self, reclaimed: usize) {
        self.last_reclaimed.store(reclaimed, Ordering::Relaxed);
        self.total_reclaimed.fetch_add(reclaimed, Ordering::Relaxed);
        self.last_run_at.store(epoch_secs(), Ordering::Relaxed);
    }
}

pub struct Sweeper {
    broker: Arc<CheckoutBroker>,
    stats: Arc<SweepStats>,
}

impl Sweeper {
    pub fn new(broker: Arc<CheckoutBroker>) -> Self {
        Self {
            broker,
            stats: Arc::new(SweepStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SweepStats> {
        self.stats.clone()
    }

    /// Run one pass. Runtime or store failures skip the pass.
    pub async fn sweep_once(&self) -> usize {
        match self.broker.cleanup_sweep().await {
            Ok(reclaimed) => {
                if !reclaimed.is_empty() {
                    info!(count = reclaimed.len(), "sweep reclaimed leases");
                }
                self.stats.record(reclaimed.len());
                reclaimed.len()
            }
            Err(e) => {
                warn!(error = %e, "sweep skipped");
                0
            }
        }
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "lease sweeper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.sweep_once().await;
                }
                _ = shutdown.changed() => {
                    info!("lease sweeper shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use orch_core::CredentialType;

    use super::*;
    use crate::testing::Fixture;

    #[tokio::test]
    async fn sweep_once_records_stats() {
        let fx = Fixture::new();
        fx.mapping("hub", CredentialType::Cert, "koji-hub");
        fx.container("c1", "a", "172.20.0.2");
        let broker = Arc::new(fx.broker());
        broker.checkout("hub", "172.20.0.2").await.unwrap();
        fx.runtime.remove("c1");

        let sweeper = Sweeper::new(broker);
        assert_eq!(sweeper.sweep_once().await, 1);
        assert_eq!(sweeper.stats().last_reclaimed(), 1);
        assert!(sweeper.stats().last_run_at() > 0);

        assert_eq!(sweeper.sweep_once().await, 0);
        assert_eq!(sweeper.stats().last_reclaimed(), 0);
        assert_eq!(sweeper.stats().total_reclaimed(), 1);
    }

    #[tokio::test]
    async fn failed_pass_is_skipped() {
        let fx = Fixture::new();
        fx.runtime.set_unavailable(true);
        let sweeper = Sweeper::new(Arc::new(fx.broker()));
        assert_eq!(sweeper.sweep_once().await, 0);
        assert_eq!(sweeper.stats().last_run_at(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_sweeps_until_shutdown() {
        let fx = Fixture::new();
        let sweeper = Arc::new(Sweeper::new(Arc::new(fx.broker())));
        let stats = sweeper.stats();
        let (tx, rx) = watch::channel(false);

        let task = sweeper.clone();
        let handle = tokio::spawn(async move { task.run(Duration::from_secs(60), rx).await });
        tokio::time::sleep(Duration::from_secs(185)).await;
        assert_eq!(fx.runtime.list_calls(), 3);
        assert!(stats.last_run_at() > 0);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
