//! Tower middleware enforcing a per-client request budget.
//!
//! A pure policy layer: it resolves the client identity, spends one permit
//! through whatever [`Limiter`] it was given, and translates the outcome
//! into HTTP. Denials become `429 Too Many Requests` with a `Retry-After`
//! hint; allowed requests are forwarded with `X-RateLimit-Limit` and
//! `X-RateLimit-Remaining` attached to the response.
//!
//! A store failure is answered with `500` (fail closed): masking a limiter
//! outage with unmetered 2xx traffic would hide exactly the incident an
//! operator needs to see.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::{Request, Response, StatusCode};
use tower_layer::Layer;
use tower_service::Service;

use crate::limit::key::client_key;
use crate::limit::Limiter;

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Namespace prepended to every resolved client key, so the limiter's
/// store can be shared with other tenants without collisions.
pub const DEFAULT_NAMESPACE: &str = "api_rate_limit";

/// Layer that wraps a service with per-client rate limiting.
#[derive(Debug)]
pub struct RateLimitLayer<L> {
    limiter: Arc<L>,
    limit: u64,
    namespace: Arc<str>,
}

impl<L> RateLimitLayer<L> {
    /// `limit` is the advertised budget for the `X-RateLimit-Limit`
    /// header; it should match the engine's configured capacity (or the
    /// window's max requests).
    ///
    /// The middleware only ever spends a single permit per request, so the
    /// engine-level rule that asks above capacity are denied can never
    /// trigger here; no defensive clamping of `Retry-After` is performed.
    pub fn new(limiter: L, limit: u64) -> Self {
        Self { limiter: Arc::new(limiter), limit, namespace: Arc::from(DEFAULT_NAMESPACE) }
    }

    /// Override the key namespace (default [`DEFAULT_NAMESPACE`]).
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Arc::from(namespace.into());
        self
    }
}

impl<L> Clone for RateLimitLayer<L> {
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            limit: self.limit,
            namespace: Arc::clone(&self.namespace),
        }
    }
}

impl<S, L> Layer<S> for RateLimitLayer<L> {
    type Service = RateLimitService<S, L>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
            limit: self.limit,
            namespace: Arc::clone(&self.namespace),
        }
    }
}

/// Service produced by [`RateLimitLayer`].
#[derive(Debug)]
pub struct RateLimitService<S, L> {
    inner: S,
    limiter: Arc<L>,
    limit: u64,
    namespace: Arc<str>,
}

impl<S: Clone, L> Clone for RateLimitService<S, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            limit: self.limit,
            namespace: Arc::clone(&self.namespace),
        }
    }
}

impl<S, L, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S, L>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Send,
    L: Limiter + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let limiter = Arc::clone(&self.limiter);
        let limit = self.limit;
        let namespace = Arc::clone(&self.namespace);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let key = format!("{}:{}", namespace, client_key(&req));
            match limiter.take(&key, 1.0).await {
                Ok(take) if take.allowed => {
                    let mut response = inner.call(req).await?;
                    attach_budget_headers(&mut response, limit, take.remaining);
                    Ok(response)
                }
                Ok(take) => {
                    tracing::info!(
                        client = %key,
                        retry_after_secs = take.retry_after.as_secs_f64(),
                        "rate limit exceeded"
                    );
                    Ok(deny_response(limit, take.retry_after))
                }
                Err(error) => {
                    tracing::error!(client = %key, %error, "rate limiter unavailable");
                    Ok(unavailable_response())
                }
            }
        })
    }
}

fn attach_budget_headers<B>(response: &mut Response<B>, limit: u64, remaining: f64) {
    let headers = response.headers_mut();
    headers.insert(HeaderName::from_static(LIMIT_HEADER), HeaderValue::from(limit));
    headers.insert(
        HeaderName::from_static(REMAINING_HEADER),
        HeaderValue::from(remaining.max(0.0).floor() as u64),
    );
}

fn deny_response<B: Default>(limit: u64, retry_after: Duration) -> Response<B> {
    let mut response = Response::new(B::default());
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    attach_budget_headers(&mut response, limit, 0.0);
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from(retry_after.as_secs_f64().ceil() as u64));
    response
}

fn unavailable_response<B: Default>() -> Response<B> {
    let mut response = Response::new(B::default());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
