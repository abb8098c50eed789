//! Backend doubles shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::backend::{Acquisition, BucketState, MemoryBackend, RateLimitBackend};
use crate::clock::MockClock;
use crate::error::{RateLimitError, Result};

/// A backend whose every operation fails, as if the server were down.
pub struct FailingBackend;

#[async_trait]
impl RateLimitBackend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn now(&self) -> f64 {
        1_700_000_000.0
    }

    async fn get_usage(&self, _key: &str, _window_size: u64) -> Result<u64> {
        Err(RateLimitError::backend("failing", "connection refused"))
    }

    async fn increment(&self, _key: &str, _window_size: u64, _amount: u64) -> Result<u64> {
        Err(RateLimitError::backend("failing", "connection refused"))
    }

    async fn reset(&self, _key: &str) -> Result<bool> {
        Err(RateLimitError::backend("failing", "connection refused"))
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        Err(RateLimitError::backend("failing", "connection refused"))
    }

    async fn consume_token(&self, _key: &str, _capacity: u64, _rate: f64) -> Result<BucketState> {
        Err(RateLimitError::backend("failing", "connection refused"))
    }

    async fn peek_tokens(&self, _key: &str, _capacity: u64, _rate: f64) -> Result<f64> {
        Err(RateLimitError::backend("failing", "connection refused"))
    }
}

/// Wraps a memory backend and counts every call made to it.
pub struct CountingBackend {
    inner: MemoryBackend,
    calls: AtomicUsize,
}

impl CountingBackend {
    pub fn new(clock: Arc<MockClock>) -> Self {
        Self {
            inner: MemoryBackend::with_clock(clock),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RateLimitBackend for CountingBackend {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn now(&self) -> f64 {
        self.inner.now()
    }

    async fn get_usage(&self, key: &str, window_size: u64) -> Result<u64> {
        self.record();
        self.inner.get_usage(key, window_size).await
    }

    async fn increment(&self, key: &str, window_size: u64, amount: u64) -> Result<u64> {
        self.record();
        self.inner.increment(key, window_size, amount).await
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        self.record();
        self.inner.reset(key).await
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        self.record();
        self.inner.cleanup_expired().await
    }

    async fn try_acquire(
        &self,
        key: &str,
        window_size: u64,
        limit: u64,
        amount: u64,
    ) -> Result<Acquisition> {
        self.record();
        self.inner.try_acquire(key, window_size, limit, amount).await
    }

    async fn consume_token(&self, key: &str, capacity: u64, rate: f64) -> Result<BucketState> {
        self.record();
        self.inner.consume_token(key, capacity, rate).await
    }

    async fn peek_tokens(&self, key: &str, capacity: u64, rate: f64) -> Result<f64> {
        self.record();
        self.inner.peek_tokens(key, capacity, rate).await
    }
}
