//! Background idle eviction.
//!
//! Records of instances that have recovered to full and stayed untouched for the
//! retention window carry no information (a missing record already means full).
//! [`spawn_evictor`] runs [`Buckets::evict_idle`] periodically so storage stays
//! proportional to the set of recently active instances.
//!
//! The first sweep is delayed by a random fraction of the period so that several
//! processes started together do not sweep a shared store in lockstep.

use std::sync::Arc;
use std::time::Duration;

use rand::{rng, Rng};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::registry::Buckets;
use crate::store::KvStore;

/// Handle to a running evictor task.
#[derive(Debug)]
pub struct EvictorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl EvictorHandle {
    /// Stop sweeping and wait for the task to exit.
    ///
    /// A sweep in progress is allowed to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for EvictorHandle {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.task.abort();
        }
    }
}

/// Random initial offset in `[0, period)`.
fn first_tick_offset(period: Duration) -> Duration {
    let millis = period.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng().random_range(0..millis))
}

/// Spawn a task that evicts idle records from `buckets` every `period`.
///
/// Must be called from within a tokio runtime. Dropping the handle aborts the task.
pub fn spawn_evictor<S: KvStore>(buckets: Arc<Buckets<S>>, period: Duration) -> EvictorHandle {
    let period = period.max(Duration::from_millis(1));
    let (tx, mut rx) = oneshot::channel::<()>();
    let start = Instant::now() + first_tick_offset(period);
    let task = tokio::spawn(async move {
        let mut ticks = interval_at(start, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(target: "limitd::eviction", period_ms = period.as_millis() as u64, "idle evictor started");
        loop {
            tokio::select! {
                _ = &mut rx => break,
                _ = ticks.tick() => {
                    let report = buckets.evict_idle().await;
                    if report.evicted > 0 || report.failed > 0 {
                        info!(
                            target: "limitd::eviction",
                            scanned = report.scanned,
                            evicted = report.evicted,
                            failed = report.failed,
                            "idle sweep"
                        );
                    } else {
                        debug!(target: "limitd::eviction", scanned = report.scanned, "idle sweep");
                    }
                }
            }
        }
        info!(target: "limitd::eviction", "idle evictor stopped");
    });
    EvictorHandle { shutdown: Some(tx), task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LimitdConfig;
    use crate::store::InMemoryKvStore;

    #[test]
    fn offset_stays_inside_the_period() {
        let period = Duration::from_millis(250);
        for _ in 0..100 {
            assert!(first_tick_offset(period) < period);
        }
        assert_eq!(first_tick_offset(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_full_idle_records() {
        let clock = ManualClock::at_secs(100);
        let config = LimitdConfig::from_json_str(
            r#"{ "retention_ms": 1000, "buckets": { "ip": { "per_second": 5, "size": 10 } } }"#,
        )
        .unwrap();
        let db = Arc::new(InMemoryKvStore::new());
        let buckets = Arc::new(Buckets::with_clock(db.clone(), &config, Arc::new(clock.clone())).unwrap());

        buckets.take("ip", "1.1.1.1", 1).await.unwrap();
        assert_eq!(db.len(), 1);

        let handle = spawn_evictor(buckets.clone(), Duration::from_millis(100));
        clock.advance(Duration::from_millis(2_200));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(db.is_empty());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_task() {
        let db = Arc::new(InMemoryKvStore::new());
        let buckets = Arc::new(Buckets::new(db, &LimitdConfig::default()).unwrap());
        let handle = spawn_evictor(buckets, Duration::from_secs(1));
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown()).await.unwrap();
    }
}
