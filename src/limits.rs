//! Per-request limits of the `/v1` API: a deadline on every ledger call, a
//! cap on requests in flight and a per-IP request rate.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    /// Deadline of one request; its ledger transaction rolls back once passed
    pub timeout: Duration,
    /// Requests processed at once; the rest wait
    pub concurrency: NonZeroUsize,
    /// Requests accepted per client IP and minute
    pub per_ip_per_minute: NonZeroU32,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            concurrency: NonZeroUsize::new(30).unwrap_or(NonZeroUsize::MIN),
            per_ip_per_minute: NonZeroU32::new(1000).unwrap_or(NonZeroU32::MIN),
        }
    }
}

/// Cancellation scope of one request.
///
/// The token is a child of the shutdown token and is also cancelled when the
/// timeout elapses. Dropping the deadline cancels it and stops the timer.
pub struct RequestDeadline {
    token: CancellationToken,
    _guard: DropGuard,
}

impl RequestDeadline {
    /// A zero `timeout` is a deadline that has already passed.
    pub fn new(parent: &CancellationToken, timeout: Duration) -> Self {
        let token = parent.child_token();
        if timeout.is_zero() {
            token.cancel();
        } else {
            let timer = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        debug!(?timeout, "request deadline passed");
                        timer.cancel();
                    }
                    _ = timer.cancelled() => {}
                }
            });
        }
        let _guard = token.clone().drop_guard();
        Self { token, _guard }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Keyed token buckets, one per client IP
pub struct IpRateLimiter {
    limiter: DefaultKeyedRateLimiter<IpAddr>,
}

impl IpRateLimiter {
    pub fn new(per_minute: NonZeroU32) -> Self {
        Self {
            limiter: RateLimiter::keyed(Quota::per_minute(per_minute)),
        }
    }

    pub fn check(&self, ip: IpAddr) -> bool {
        self.limiter.check_key(&ip).is_ok()
    }
}

/// Rejects a request with 429 once its IP used up the quota.
///
/// Requests without connection info share one bucket.
pub async fn limit_by_ip<B>(
    State(limiter): State<Arc<IpRateLimiter>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request<B>,
    next: Next<B>,
) -> Response {
    let ip = connect
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    if !limiter.check(ip) {
        warn!(%ip, path = %request.uri().path(), "rate limit exceeded");
        return AppError::TooManyRequests.into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_cancels_after_timeout() {
        let shutdown = CancellationToken::new();
        let deadline = RequestDeadline::new(&shutdown, Duration::from_millis(20));
        assert!(!deadline.token().is_cancelled());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(deadline.token().is_cancelled());
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn zero_timeout_is_already_expired() {
        let deadline = RequestDeadline::new(&CancellationToken::new(), Duration::ZERO);
        assert!(deadline.token().is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_reaches_every_deadline() {
        let shutdown = CancellationToken::new();
        let deadline = RequestDeadline::new(&shutdown, Duration::from_secs(30));
        shutdown.cancel();
        assert!(deadline.token().is_cancelled());
    }

    #[tokio::test]
    async fn dropping_the_deadline_releases_the_timer() {
        let deadline = RequestDeadline::new(&CancellationToken::new(), Duration::from_secs(30));
        let token = deadline.token().clone();
        drop(deadline);
        assert!(token.is_cancelled());
    }

    #[test]
    fn rate_limit_is_per_ip() {
        let limiter = IpRateLimiter::new(NonZeroU32::new(2).unwrap());
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert!(limiter.check(a));
        assert!(limiter.check(a));
        assert!(!limiter.check(a));
        assert!(limiter.check(b));
    }
}
