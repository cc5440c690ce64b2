//! Error types for configuration loading and bucket operations.
use std::error::Error as StdError;

/// Boxed error produced by a storage backend.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Interval keys recognised in a bucket definition.
pub(crate) const INTERVAL_KEYS: &str = "per_second, per_minute, per_hour, per_day, per_month";

/// Malformed bucket-type configuration. Fatal at startup.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// A bucket definition named none of the interval keys.
    #[error("bucket `{path}`: missing interval (expected one of {})", INTERVAL_KEYS)]
    MissingInterval {
        /// Dotted path to the offending definition (e.g. `ip.overrides.127.0.0.1`).
        path: String,
    },
    /// A bucket definition named more than one interval key.
    #[error("bucket `{path}`: more than one interval given ({keys})")]
    AmbiguousInterval {
        /// Dotted path to the offending definition.
        path: String,
        /// The interval keys that were present.
        keys: String,
    },
    /// A numeric field was zero.
    #[error("bucket `{path}`: `{field}` must be > 0")]
    ZeroValue {
        /// Dotted path to the offending definition.
        path: String,
        /// Field name.
        field: &'static str,
    },
    /// The configuration document could not be parsed.
    #[error("invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        "configuration"
    }
}

/// Errors returned by bucket operations (TAKE, WAIT, PUT, STATUS).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum LimitdError {
    /// The request named a bucket type that is not configured.
    #[error("{name} is not a valid bucket type")]
    UnknownBucketType {
        /// Requested type name.
        name: String,
    },
    /// The request was rejected before touching storage.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The storage backend failed.
    #[error("storage failure in bucket `{bucket}`: {source}")]
    Storage {
        /// Bucket type whose namespace was being accessed.
        bucket: String,
        /// Underlying backend error.
        #[source]
        source: BoxError,
    },
    /// A persisted record could not be decoded.
    #[error("corrupt record for `{bucket}`/`{instance}`: {source}")]
    Corrupt {
        /// Bucket type.
        bucket: String,
        /// Instance id whose record is unreadable.
        instance: String,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
}

impl LimitdError {
    pub(crate) fn storage<E>(bucket: &str, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        LimitdError::Storage { bucket: bucket.to_string(), source: Box::new(source) }
    }

    /// Stable machine-readable kind, transmitted next to the message on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            LimitdError::UnknownBucketType { .. } => "unknown_bucket_type",
            LimitdError::InvalidArgument(_) => "invalid_argument",
            LimitdError::Storage { .. } | LimitdError::Corrupt { .. } => "storage",
        }
    }

    /// Check if this error is due to an unconfigured bucket type.
    pub fn is_unknown_bucket_type(&self) -> bool {
        matches!(self, LimitdError::UnknownBucketType { .. })
    }

    /// Check if the request itself was malformed.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, LimitdError::InvalidArgument(_))
    }

    /// Check if this error came from the storage layer.
    pub fn is_storage(&self) -> bool {
        matches!(self, LimitdError::Storage { .. } | LimitdError::Corrupt { .. })
    }
}
