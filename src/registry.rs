//! Registry of bucket engines, one per configured bucket type.
//!
//! Built once from the process configuration and never mutated afterwards; share
//! it behind an `Arc` and route every request through [`Buckets::engine`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::bucket::{
    BucketEngine, EvictionReport, PutResponse, StatusResponse, TakeResponse, WaitDecision,
};
use crate::clock::{Clock, SystemClock};
use crate::config::LimitdConfig;
use crate::error::{ConfigError, LimitdError};
use crate::store::{BucketStore, KvStore};

/// Immutable map of bucket type name to engine.
pub struct Buckets<S> {
    engines: BTreeMap<String, Arc<BucketEngine<S>>>,
    sweep_interval: Duration,
}

impl<S> std::fmt::Debug for Buckets<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buckets")
            .field("types", &self.engines.keys().collect::<Vec<_>>())
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

impl<S: KvStore> Buckets<S> {
    /// Build every engine over the shared store `db`, reading time from the wall clock.
    pub fn new(db: Arc<S>, config: &LimitdConfig) -> Result<Self, ConfigError> {
        Self::with_clock(db, config, Arc::new(SystemClock))
    }

    /// Build every engine with an explicit clock (useful for deterministic tests).
    pub fn with_clock(
        db: Arc<S>,
        config: &LimitdConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let engines = config
            .normalize()?
            .into_iter()
            .map(|(name, bucket)| {
                let engine = BucketEngine::new(bucket, BucketStore::new(name.clone(), db.clone()))
                    .with_clock(clock.clone())
                    .with_retention(config.retention())
                    .with_max_wait(config.max_wait());
                (name, Arc::new(engine))
            })
            .collect::<BTreeMap<_, _>>();
        info!(target: "limitd::registry", types = engines.len(), "bucket registry built");
        Ok(Self { engines, sweep_interval: config.sweep_interval() })
    }

    /// Engine for `name`, if configured.
    pub fn get(&self, name: &str) -> Option<&Arc<BucketEngine<S>>> {
        self.engines.get(name)
    }

    /// Engine for `name`, or [`LimitdError::UnknownBucketType`].
    pub fn engine(&self, name: &str) -> Result<&Arc<BucketEngine<S>>, LimitdError> {
        self.get(name).ok_or_else(|| LimitdError::UnknownBucketType { name: name.to_string() })
    }

    /// Configured type names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(String::as_str)
    }

    /// Period at which [`evict_idle`](Self::evict_idle) should run.
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub async fn take(&self, bucket: &str, instance: &str, count: u64) -> Result<TakeResponse, LimitdError> {
        self.engine(bucket)?.take(instance, count).await
    }

    pub async fn wait(&self, bucket: &str, instance: &str, count: u64) -> Result<WaitDecision, LimitdError> {
        self.engine(bucket)?.wait(instance, count).await
    }

    pub async fn put(
        &self,
        bucket: &str,
        instance: &str,
        tokens: Option<u64>,
    ) -> Result<PutResponse, LimitdError> {
        self.engine(bucket)?.put(instance, tokens).await
    }

    pub async fn status(&self, bucket: &str, prefix: &str) -> Result<StatusResponse, LimitdError> {
        self.engine(bucket)?.status(prefix).await
    }

    /// Run one idle-eviction pass over every type.
    ///
    /// A type whose scan fails is logged and skipped; the sweep is best effort.
    pub async fn evict_idle(&self) -> EvictionReport {
        let mut total = EvictionReport::default();
        for (name, engine) in &self.engines {
            match engine.evict_idle().await {
                Ok(report) => total += report,
                Err(err) => {
                    warn!(target: "limitd::registry", bucket = %name, error = %err, "idle sweep failed");
                }
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryKvStore;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Store whose scans always fail.
    #[derive(Debug, Default)]
    struct BrokenScan;

    #[derive(Debug, thiserror::Error)]
    #[error("scan exploded")]
    struct ScanError;

    #[async_trait::async_trait]
    impl KvStore for BrokenScan {
        type Error = ScanError;
        async fn get(&self, _key: &[u8]) -> Result<Option<Vec<u8>>, ScanError> {
            Ok(None)
        }
        async fn put(&self, _key: &[u8], _value: Vec<u8>) -> Result<(), ScanError> {
            Ok(())
        }
        async fn delete(&self, _key: &[u8]) -> Result<(), ScanError> {
            Ok(())
        }
        async fn scan_prefix(&self, _prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ScanError> {
            Err(ScanError)
        }
    }

    fn config() -> LimitdConfig {
        LimitdConfig::from_json_str(
            r#"{ "buckets": { "ip": { "per_second": 5, "size": 10 }, "user": { "per_minute": 1 } } }"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn routes_by_type() {
        let db = Arc::new(InMemoryKvStore::new());
        let buckets = Buckets::with_clock(db, &config(), Arc::new(ManualClock::at_secs(1))).unwrap();
        assert_eq!(buckets.names().collect::<Vec<_>>(), ["ip", "user"]);
        assert_eq!(buckets.take("ip", "x", 1).await.unwrap().remaining, 9);
        assert_eq!(buckets.take("user", "x", 1).await.unwrap().remaining, 0);
    }

    #[tokio::test]
    async fn unknown_type_is_reported_without_touching_storage() {
        let db = Arc::new(InMemoryKvStore::new());
        let buckets = Buckets::new(db.clone(), &config()).unwrap();
        let err = buckets.take("blabla", "211.123.12.12", 1).await.unwrap_err();
        assert_eq!(err.to_string(), "blabla is not a valid bucket type");
        assert!(db.is_empty());
    }

    #[test]
    fn malformed_type_fails_construction() {
        let bad = LimitdConfig::from_json_str(r#"{ "buckets": { "ip": { "size": 3 } } }"#).unwrap();
        let err = Buckets::new(Arc::new(InMemoryKvStore::new()), &bad).unwrap_err();
        assert!(matches!(err, ConfigError::MissingInterval { .. }));
    }

    #[tokio::test]
    async fn failed_sweep_is_logged_and_skipped() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_target(true)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let buckets = Buckets::new(Arc::new(BrokenScan), &config()).unwrap();
        assert_eq!(buckets.evict_idle().await, EvictionReport::default());

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("idle sweep failed"));
        assert!(logs.contains("scan exploded"));
    }
}
