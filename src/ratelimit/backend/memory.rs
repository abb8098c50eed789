//! In-process counter storage.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{refill, take_token, Acquisition, BucketState, RateLimitBackend};
use crate::clock::{system_clock, SharedClock};
use crate::error::Result;

/// Event timestamps recorded for one key.
struct WindowEntry {
    /// Window size used by the most recent write
    window_size: f64,
    events: VecDeque<f64>,
}

impl WindowEntry {
    /// Drop events at or before `now - window_size`.
    fn purge(&mut self, now: f64, window_size: f64) {
        let cutoff = now - window_size;
        while self.events.front().is_some_and(|&ts| ts <= cutoff) {
            self.events.pop_front();
        }
    }
}

struct BucketEntry {
    tokens: f64,
    last_refill: f64,
    capacity: f64,
    refill_rate: f64,
}

#[derive(Default)]
struct MemoryState {
    windows: HashMap<String, WindowEntry>,
    buckets: HashMap<String, BucketEntry>,
}

/// Counter storage held in process memory.
///
/// A single mutex guards every counter, so each operation is atomic with
/// respect to all others. State is lost on restart and not shared between
/// processes.
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    clock: SharedClock,
}

impl MemoryBackend {
    /// Create a backend driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create a backend driven by a custom clock.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
        }
    }

    /// Number of keys with sliding window state.
    pub fn key_count(&self) -> usize {
        self.state.lock().windows.len()
    }

    /// Number of keys with token bucket state.
    pub fn bucket_count(&self) -> usize {
        self.state.lock().buckets.len()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn now(&self) -> f64 {
        self.clock.now()
    }

    async fn get_usage(&self, key: &str, window_size: u64) -> Result<u64> {
        let now = self.now();
        let mut state = self.state.lock();
        let count = match state.windows.get_mut(key) {
            Some(entry) => {
                entry.purge(now, window_size as f64);
                entry.events.len() as u64
            }
            None => 0,
        };
        Ok(count)
    }

    async fn increment(&self, key: &str, window_size: u64, amount: u64) -> Result<u64> {
        let now = self.now();
        let mut state = self.state.lock();
        let entry = state
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry {
                window_size: window_size as f64,
                events: VecDeque::new(),
            });
        entry.window_size = window_size as f64;
        entry.purge(now, window_size as f64);
        entry.events.extend(std::iter::repeat(now).take(amount as usize));
        Ok(entry.events.len() as u64)
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let had_window = state.windows.remove(key).is_some();
        let had_bucket = state.buckets.remove(key).is_some();
        Ok(had_window || had_bucket)
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let now = self.now();
        let mut state = self.state.lock();

        let before = state.windows.len() + state.buckets.len();
        state.windows.retain(|_, entry| {
            let window = entry.window_size;
            entry.purge(now, window);
            !entry.events.is_empty()
        });
        // A bucket that has refilled completely is indistinguishable from a
        // missing one.
        state.buckets.retain(|_, b| {
            refill(b.tokens, b.last_refill, now, b.capacity, b.refill_rate) < b.capacity
        });
        let removed = (before - state.windows.len() - state.buckets.len()) as u64;

        trace!(removed, "Cleaned up in-memory rate limit state");
        Ok(removed)
    }

    async fn try_acquire(
        &self,
        key: &str,
        window_size: u64,
        limit: u64,
        amount: u64,
    ) -> Result<Acquisition> {
        let now = self.now();
        let mut state = self.state.lock();
        let entry = state
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry {
                window_size: window_size as f64,
                events: VecDeque::new(),
            });
        entry.window_size = window_size as f64;
        entry.purge(now, window_size as f64);

        let count = entry.events.len() as u64;
        if count + amount > limit {
            return Ok(Acquisition {
                allowed: false,
                count,
            });
        }
        entry.events.extend(std::iter::repeat(now).take(amount as usize));
        Ok(Acquisition {
            allowed: true,
            count: count + amount,
        })
    }

    async fn consume_token(
        &self,
        key: &str,
        capacity: u64,
        refill_per_sec: f64,
    ) -> Result<BucketState> {
        let now = self.now();
        let capacity = capacity as f64;
        let mut state = self.state.lock();
        let bucket = state
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketEntry {
                tokens: capacity,
                last_refill: now,
                capacity,
                refill_rate: refill_per_sec,
            });

        let tokens = refill(bucket.tokens, bucket.last_refill, now, capacity, refill_per_sec);
        let result = take_token(tokens, refill_per_sec);
        bucket.tokens = result.tokens;
        bucket.last_refill = now;
        bucket.capacity = capacity;
        bucket.refill_rate = refill_per_sec;
        Ok(result)
    }

    async fn peek_tokens(&self, key: &str, capacity: u64, refill_per_sec: f64) -> Result<f64> {
        let now = self.now();
        let capacity = capacity as f64;
        let state = self.state.lock();
        Ok(state.buckets.get(key).map_or(capacity, |b| {
            refill(b.tokens, b.last_refill, now, capacity, refill_per_sec)
        }))
    }
}
