//! Request front: dispatch of TAKE / WAIT / PUT / STATUS to the bucket registry.
//!
//! [`LimitdService`] is transport-agnostic. Servers decode frames with a
//! [`FrameCodec`], hand the [`Request`] to the service, and encode the
//! [`ReplyFrame`] it produces. It also implements [`tower::Service`] so it can be
//! stacked behind ordinary tower middleware.
//!
//! WAIT is the only method that holds a reply back: the engine reports how long
//! the caller must wait, and the front sleeps through a [`Sleeper`] and retries
//! until the tokens are granted or the accumulated wait would pass the bucket's
//! ceiling.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, trace};

use crate::bucket::WaitDecision;
use crate::error::LimitdError;
use crate::registry::Buckets;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::store::KvStore;

mod codec;
mod request;

pub use codec::{CodecError, ErrorBody, FrameCodec, JsonLines, ReplyFrame, RequestFrame};
pub use request::{Request, Response, WaitResponse};

/// Front-end service over a shared [`Buckets`] registry.
pub struct LimitdService<S> {
    buckets: Arc<Buckets<S>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<S> Clone for LimitdService<S> {
    fn clone(&self) -> Self {
        Self { buckets: self.buckets.clone(), sleeper: self.sleeper.clone() }
    }
}

impl<S> std::fmt::Debug for LimitdService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitdService")
            .field("buckets", &self.buckets)
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl<S: KvStore> LimitdService<S> {
    /// Serve `buckets`, sleeping on the tokio timer.
    pub fn new(buckets: Arc<Buckets<S>>) -> Self {
        Self { buckets, sleeper: Arc::new(TokioSleeper) }
    }

    /// Replace the sleeper used for WAIT delays.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// The registry this service dispatches to.
    pub fn buckets(&self) -> &Arc<Buckets<S>> {
        &self.buckets
    }

    /// Answer one request.
    pub async fn handle(&self, request: Request) -> Result<Response, LimitdError> {
        trace!(
            target: "limitd::front",
            method = request.method(),
            bucket = request.bucket(),
            instance = request.instance(),
            "request"
        );
        let result = match request {
            Request::Take { bucket, instance, count } => {
                self.buckets.take(&bucket, &instance, count).await.map(Response::Take)
            }
            Request::Wait { bucket, instance, count } => {
                self.wait(&bucket, &instance, count).await.map(Response::Wait)
            }
            Request::Put { bucket, instance, tokens } => {
                self.buckets.put(&bucket, &instance, tokens).await.map(Response::Put)
            }
            Request::Status { bucket, instance } => {
                self.buckets.status(&bucket, &instance).await.map(Response::Status)
            }
        };
        if let Err(err) = &result {
            debug!(target: "limitd::front", kind = err.kind(), error = %err, "request failed");
        }
        result
    }

    async fn wait(&self, bucket: &str, instance: &str, count: u64) -> Result<WaitResponse, LimitdError> {
        let engine = self.buckets.engine(bucket)?;
        let ceiling = engine.max_wait();
        let mut waited = Duration::ZERO;
        loop {
            match engine.wait(instance, count).await? {
                WaitDecision::Conformant(take) => {
                    return Ok(WaitResponse::from_take(take, !waited.is_zero()));
                }
                WaitDecision::RetryAfter { response, delay } => {
                    if waited + delay > ceiling {
                        debug!(
                            target: "limitd::front",
                            bucket,
                            instance,
                            waited_ms = waited.as_millis() as u64,
                            "wait ceiling reached"
                        );
                        return Ok(WaitResponse::from_take(response, !waited.is_zero()));
                    }
                    trace!(target: "limitd::front", bucket, instance, delay_ms = delay.as_millis() as u64, "waiting");
                    self.sleeper.sleep(delay).await;
                    waited += delay;
                }
                WaitDecision::Rejected(take) => {
                    return Ok(WaitResponse::from_take(take, !waited.is_zero()));
                }
            }
        }
    }

    /// Decode one raw frame with `codec`, answer it, and encode the reply.
    ///
    /// Never fails: undecodable frames produce a `malformed_request` reply.
    pub async fn handle_frame<C: FrameCodec>(&self, codec: &C, raw: &[u8]) -> Vec<u8> {
        let reply = match codec.decode(raw) {
            Ok(RequestFrame { id, request }) => ReplyFrame::from_result(id, self.handle(request).await),
            Err(err) => {
                debug!(target: "limitd::front", error = %err, "malformed frame");
                ReplyFrame::malformed(&err)
            }
        };
        codec.encode(&reply)
    }
}

impl<S: KvStore> tower::Service<Request> for LimitdService<S> {
    type Response = Response;
    type Error = LimitdError;
    type Future = BoxFuture<'static, Result<Response, LimitdError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.handle(request).await })
    }
}
