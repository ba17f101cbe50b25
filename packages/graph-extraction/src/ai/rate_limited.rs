//! Rate-limited inference wrapper.
//!
//! Wraps any [`InferenceClient`] with a governor rate limiter. Each
//! `infer_batch` call takes one permit, so the quota is in calls per second
//! regardless of batch size.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::error::InferenceError;
use crate::traits::inference::{InferenceClient, InferenceReply, InferenceRequest};

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// An inference client that waits for a permit before every call.
pub struct RateLimitedInference<I> {
    inner: I,
    limiter: Arc<DirectRateLimiter>,
}

fn at_least_one(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).unwrap_or(nonzero!(1u32))
}

impl<I: InferenceClient> RateLimitedInference<I> {
    /// Allow `calls_per_second` calls (zero is treated as one).
    pub fn new(inner: I, calls_per_second: u32) -> Self {
        Self::with_quota(inner, Quota::per_second(at_least_one(calls_per_second)))
    }

    /// Sustained rate plus a burst allowance.
    pub fn with_burst(inner: I, calls_per_second: u32, burst: u32) -> Self {
        let quota = Quota::per_second(at_least_one(calls_per_second)).allow_burst(at_least_one(burst));
        Self::with_quota(inner, quota)
    }

    pub fn with_quota(inner: I, quota: Quota) -> Self {
        Self {
            inner,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }
}

#[async_trait]
impl<I: InferenceClient> InferenceClient for RateLimitedInference<I> {
    async fn infer_batch(&self, request: &InferenceRequest) -> Result<Vec<InferenceReply>, InferenceError> {
        self.limiter.until_ready().await;
        self.inner.infer_batch(request).await
    }
}

/// Extension trait for easy rate limiting.
pub trait InferenceClientExt: InferenceClient + Sized {
    fn rate_limited(self, calls_per_second: u32) -> RateLimitedInference<Self> {
        RateLimitedInference::new(self, calls_per_second)
    }
}

impl<I: InferenceClient + Sized> InferenceClientExt for I {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockInference;
    use crate::traits::inference::InferenceItem;
    use crate::types::document::Window;
    use std::time::Instant;
    use uuid::Uuid;

    fn request() -> InferenceRequest {
        InferenceRequest {
            items: vec![InferenceItem::from(&Window::new(Uuid::new_v4(), "text", 0))],
            schema: serde_json::Value::Null,
            temperature: 0.0,
        }
    }

    #[tokio::test]
    async fn test_rate_limiting() {
        let client = MockInference::new().rate_limited(2);
        let start = Instant::now();
        for _ in 0..3 {
            client.infer_batch(&request()).await.unwrap();
        }

        assert_eq!(client.inner().calls(), 3);
        // first call is immediate, the third waits for a refill
        assert!(start.elapsed().as_millis() >= 400, "not limited: {:?}", start.elapsed());
    }

    #[tokio::test]
    async fn test_zero_rate_still_allows_calls() {
        let client = RateLimitedInference::with_burst(MockInference::new(), 0, 0);
        client.infer_batch(&request()).await.unwrap();
        assert_eq!(client.inner().calls(), 1);
    }
}
