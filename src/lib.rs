#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # limitd
//!
//! Token-bucket rate limiting with persistent per-instance state.
//!
//! ## Features
//!
//! - **Bucket types** configured once at startup, each with size, refill rate and
//!   prefix-matched per-instance overrides
//! - **TAKE / WAIT / PUT / STATUS** over any ordered key-value store
//! - **On-demand refill**: state is computed from a stored `(remaining, last_drip)`
//!   pair, so idle instances cost nothing and missing records mean "full"
//! - **Per-instance serialization** without a global lock
//! - **Idle eviction** of records that have recovered to full
//! - **Tower integration**: the request front is a `Service`, and
//!   [`AdmissionLayer`] gates any service on a bucket
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use limitd::{Buckets, InMemoryKvStore, LimitdConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = LimitdConfig::from_json_str(r#"{
//!         "buckets": {
//!             "ip": {
//!                 "per_second": 5,
//!                 "size": 10,
//!                 "overrides": { "127.0.0.1": { "per_second": 100 } }
//!             }
//!         }
//!     }"#).unwrap();
//!
//!     let buckets = Buckets::new(Arc::new(InMemoryKvStore::new()), &config).unwrap();
//!     let res = buckets.take("ip", "211.45.66.1", 1).await.unwrap();
//!     assert!(res.conformant);
//!     assert_eq!((res.remaining, res.limit), (9, 10));
//! }
//! ```

pub mod bucket;
pub mod clock;
pub mod config;
pub mod error;
pub mod eviction;
pub mod front;
pub mod middleware;
pub mod prelude;
pub mod registry;
pub mod sleeper;
pub mod store;

// Re-exports
pub use bucket::{
    BucketEngine, EvictionReport, InstanceState, PutResponse, StatusItem, StatusResponse,
    TakeResponse, WaitDecision,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BucketConfig, BucketSource, LimitdConfig, Override};
pub use error::{BoxError, ConfigError, LimitdError};
pub use eviction::{spawn_evictor, EvictorHandle};
pub use front::{
    CodecError, ErrorBody, FrameCodec, JsonLines, LimitdService, ReplyFrame, Request,
    RequestFrame, Response, WaitResponse,
};
pub use middleware::{AdmissionError, AdmissionLayer, AdmissionService};
pub use registry::Buckets;
pub use sleeper::{ClockSleeper, Sleeper, TokioSleeper};
pub use store::{BucketStore, InMemoryKvStore, KvStore};
