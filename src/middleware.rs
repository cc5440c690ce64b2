//! Tower admission control backed by a bucket type.
//!
//! [`AdmissionLayer`] wraps any service and TAKEs one token from a configured
//! bucket type before forwarding each request. The instance id is derived from
//! the request by a key extractor, e.g. the peer address or an API key.
//!
//! ```rust
//! use std::sync::Arc;
//! use limitd::{AdmissionLayer, Buckets, InMemoryKvStore, LimitdConfig};
//! use tower::{service_fn, Layer};
//!
//! let config = LimitdConfig::from_json_str(
//!     r#"{ "buckets": { "api": { "per_second": 10, "size": 20 } } }"#,
//! ).unwrap();
//! let buckets = Arc::new(Buckets::new(Arc::new(InMemoryKvStore::new()), &config).unwrap());
//!
//! let layer = AdmissionLayer::new(buckets, "api", |user: &String| user.clone());
//! let _svc = layer.layer(service_fn(|user: String| async move {
//!     Ok::<_, std::io::Error>(format!("hello {user}"))
//! }));
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower_layer::Layer;
use tower_service::Service;
use tracing::debug;

use crate::error::LimitdError;
use crate::registry::Buckets;
use crate::store::KvStore;

/// Error returned by [`AdmissionService`].
#[derive(Debug)]
pub enum AdmissionError<E> {
    /// The bucket had no token for this request.
    Limited {
        /// Tokens left in the bucket.
        remaining: u64,
        /// UNIX second at which the bucket is full again.
        reset: u64,
    },
    /// The limiter itself failed (unknown type, storage).
    Limiter(LimitdError),
    /// The wrapped service failed.
    Inner(E),
}

impl<E> AdmissionError<E> {
    /// Whether the request was turned away for lack of tokens.
    pub fn is_limited(&self) -> bool {
        matches!(self, AdmissionError::Limited { .. })
    }

    /// The wrapped service's error, if that is what failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            AdmissionError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionError::Limited { remaining, reset } => {
                write!(f, "rate limited: {remaining} remaining, full at {reset}")
            }
            AdmissionError::Limiter(e) => write!(f, "limiter failure: {e}"),
            AdmissionError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E> std::error::Error for AdmissionError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AdmissionError::Limiter(e) => Some(e),
            AdmissionError::Inner(e) => Some(e),
            AdmissionError::Limited { .. } => None,
        }
    }
}

/// A layer that admits requests only while the keyed bucket has tokens.
pub struct AdmissionLayer<S, K> {
    buckets: Arc<Buckets<S>>,
    bucket: Arc<str>,
    key: Arc<K>,
}

impl<S, K> Clone for AdmissionLayer<S, K> {
    fn clone(&self) -> Self {
        Self { buckets: self.buckets.clone(), bucket: self.bucket.clone(), key: self.key.clone() }
    }
}

impl<S, K> fmt::Debug for AdmissionLayer<S, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionLayer").field("bucket", &self.bucket).finish_non_exhaustive()
    }
}

impl<S, K> AdmissionLayer<S, K> {
    /// Admit against bucket type `bucket`, keying instances with `key`.
    pub fn new(buckets: Arc<Buckets<S>>, bucket: impl Into<Arc<str>>, key: K) -> Self {
        Self { buckets, bucket: bucket.into(), key: Arc::new(key) }
    }
}

impl<Svc, S, K> Layer<Svc> for AdmissionLayer<S, K> {
    type Service = AdmissionService<Svc, S, K>;

    fn layer(&self, service: Svc) -> Self::Service {
        AdmissionService {
            inner: service,
            buckets: self.buckets.clone(),
            bucket: self.bucket.clone(),
            key: self.key.clone(),
        }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
pub struct AdmissionService<Svc, S, K> {
    inner: Svc,
    buckets: Arc<Buckets<S>>,
    bucket: Arc<str>,
    key: Arc<K>,
}

impl<Svc: Clone, S, K> Clone for AdmissionService<Svc, S, K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            buckets: self.buckets.clone(),
            bucket: self.bucket.clone(),
            key: self.key.clone(),
        }
    }
}

impl<Svc: fmt::Debug, S, K> fmt::Debug for AdmissionService<Svc, S, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionService")
            .field("inner", &self.inner)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl<Svc, S, K, Req> Service<Req> for AdmissionService<Svc, S, K>
where
    Svc: Service<Req> + Clone + Send + 'static,
    Svc::Future: Send + 'static,
    Svc::Error: Send + 'static,
    S: KvStore,
    K: Fn(&Req) -> String + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = Svc::Response;
    type Error = AdmissionError<Svc::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let buckets = self.buckets.clone();
        let bucket = self.bucket.clone();
        let instance = (self.key)(&req);
        // Take the ready clone; leave a fresh one for the next poll_ready.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let take = buckets.take(&bucket, &instance, 1).await.map_err(AdmissionError::Limiter)?;
            if !take.conformant {
                debug!(target: "limitd::admission", bucket = %bucket, instance = %instance, "request limited");
                return Err(AdmissionError::Limited { remaining: take.remaining, reset: take.reset });
            }
            inner.call(req).await.map_err(AdmissionError::Inner)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LimitdConfig;
    use crate::store::InMemoryKvStore;
    use std::convert::Infallible;
    use tower::{service_fn, ServiceExt};

    fn buckets() -> Arc<Buckets<InMemoryKvStore>> {
        let config = LimitdConfig::from_json_str(
            r#"{ "buckets": { "api": { "per_minute": 1, "size": 2 } } }"#,
        )
        .unwrap();
        Arc::new(
            Buckets::with_clock(Arc::new(InMemoryKvStore::new()), &config, Arc::new(ManualClock::at_secs(10)))
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn admits_until_the_key_runs_dry() {
        let layer = AdmissionLayer::new(buckets(), "api", |user: &&'static str| user.to_string());
        let svc = layer.layer(service_fn(|user: &'static str| async move { Ok::<_, Infallible>(user.len()) }));

        assert_eq!(svc.clone().oneshot("alice").await.unwrap(), 5);
        assert_eq!(svc.clone().oneshot("alice").await.unwrap(), 5);
        let err = svc.clone().oneshot("alice").await.unwrap_err();
        assert!(err.is_limited());
        assert!(matches!(err, AdmissionError::Limited { remaining: 0, .. }));

        // Separate key, separate bucket.
        assert_eq!(svc.oneshot("bob").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn unknown_bucket_type_is_a_limiter_error() {
        let layer = AdmissionLayer::new(buckets(), "nope", |_: &()| "k".to_string());
        let svc = layer.layer(service_fn(|_: ()| async { Ok::<_, Infallible>(()) }));
        let err = svc.oneshot(()).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Limiter(e) if e.is_unknown_bucket_type()));
    }

    #[tokio::test]
    async fn inner_errors_pass_through() {
        let layer = AdmissionLayer::new(buckets(), "api", |_: &()| "k".to_string());
        let svc = layer.layer(service_fn(|_: ()| async {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        }));
        let err = svc.oneshot(()).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(err.into_inner().is_some());
    }
}
