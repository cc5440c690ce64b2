//! Convenient re-exports for common limitd types.
pub use crate::{
    bucket::{PutResponse, StatusResponse, TakeResponse},
    config::LimitdConfig,
    error::{ConfigError, LimitdError},
    eviction::spawn_evictor,
    front::{JsonLines, LimitdService, Request, Response},
    middleware::{AdmissionError, AdmissionLayer},
    registry::Buckets,
    store::{InMemoryKvStore, KvStore},
};
