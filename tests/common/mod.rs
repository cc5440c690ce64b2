#![allow(dead_code)]

use std::sync::Arc;

use limitd::{
    Buckets, ClockSleeper, InMemoryKvStore, LimitdConfig, LimitdService, ManualClock, PutResponse,
    Request, Response, StatusResponse, TakeResponse, WaitResponse,
};

/// 2015-03-09T16:57:47Z, in seconds.
pub const NOW: u64 = 1_425_920_267;

pub const FIXTURE: &str = r#"{
    "retention_ms": 1000,
    "buckets": {
        "ip": {
            "per_second": 5,
            "size": 10,
            "overrides": {
                "127.0.0.1": { "per_second": 100 },
                "10.0.0.1": { "per_hour": 2, "size": 1 }
            }
        },
        "wrong_password": { "per_hour": 3, "size": 3 },
        "internal": { "unlimited": true, "size": 50 }
    }
}"#;

/// Service over the fixture config with a manual clock and a clock-advancing sleeper.
pub struct Harness {
    pub service: LimitdService<InMemoryKvStore>,
    pub buckets: Arc<Buckets<InMemoryKvStore>>,
    pub db: Arc<InMemoryKvStore>,
    pub clock: ManualClock,
    pub sleeper: ClockSleeper,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(FIXTURE)
    }

    pub fn with_config(json: &str) -> Self {
        let config = LimitdConfig::from_json_str(json).expect("fixture parses");
        let clock = ManualClock::at_secs(NOW);
        let db = Arc::new(InMemoryKvStore::new());
        let buckets = Arc::new(
            Buckets::with_clock(db.clone(), &config, Arc::new(clock.clone())).expect("fixture is valid"),
        );
        let sleeper = ClockSleeper::new(clock.clone());
        let service = LimitdService::new(buckets.clone()).with_sleeper(Arc::new(sleeper.clone()));
        Self { service, buckets, db, clock, sleeper }
    }

    pub async fn take(&self, bucket: &str, instance: &str, count: u64) -> TakeResponse {
        let req = Request::Take { bucket: bucket.into(), instance: instance.into(), count };
        match self.service.handle(req).await.expect("take succeeds") {
            Response::Take(r) => r,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    pub async fn wait(&self, bucket: &str, instance: &str, count: u64) -> WaitResponse {
        let req = Request::Wait { bucket: bucket.into(), instance: instance.into(), count };
        match self.service.handle(req).await.expect("wait succeeds") {
            Response::Wait(r) => r,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    pub async fn put(&self, bucket: &str, instance: &str, tokens: Option<u64>) -> PutResponse {
        let req = Request::Put { bucket: bucket.into(), instance: instance.into(), tokens };
        match self.service.handle(req).await.expect("put succeeds") {
            Response::Put(r) => r,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    pub async fn status(&self, bucket: &str, prefix: &str) -> StatusResponse {
        let req = Request::Status { bucket: bucket.into(), instance: prefix.into() };
        match self.service.handle(req).await.expect("status succeeds") {
            Response::Status(r) => r,
            other => panic!("unexpected reply {other:?}"),
        }
    }
}
