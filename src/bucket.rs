//! Token Bucket Primitive
//!
//! Continuous-refill token bucket used by every tier of the admission
//! cascade. Tokens accrue as a pure function of elapsed wall-clock time,
//! capped at a burst ceiling, and are spent by admitted requests.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token bucket with continuous refill and a burst ceiling.
///
/// A fresh (or reset) bucket holds `capacity` tokens. Idle accrual may grow
/// the balance past `capacity` up to `burst_capacity`, bounding how much
/// saved-up throughput can be spent at once. Every operation refills before
/// reading or mutating, so the balance is always current.
///
/// All state sits behind a single mutex; no operation suspends, so the
/// bucket is safe to call from any number of concurrent tasks.
#[derive(Debug)]
pub struct TokenBucket {
    /// Tokens held after a reset; one second's worth of refill.
    capacity: f64,

    /// Tokens added per second.
    refill_rate: f64,

    /// Maximum tokens the bucket may ever hold.
    burst_capacity: f64,

    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket starting at `capacity` tokens.
    ///
    /// `burst_capacity` below `capacity` is clamped up so the starting
    /// balance never exceeds the ceiling.
    pub fn new(capacity: f64, refill_rate: f64, burst_capacity: f64) -> Self {
        Self::new_at(capacity, refill_rate, burst_capacity, Instant::now())
    }

    pub(crate) fn new_at(
        capacity: f64,
        refill_rate: f64,
        burst_capacity: f64,
        now: Instant,
    ) -> Self {
        Self {
            capacity,
            refill_rate,
            burst_capacity: burst_capacity.max(capacity),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    /// Try to consume `n` tokens.
    ///
    /// Returns true and subtracts `n` if the refilled balance covers it;
    /// returns false without partial consumption otherwise.
    pub fn try_consume(&self, n: u32) -> bool {
        self.try_consume_at(n, Instant::now())
    }

    /// Return `n` tokens after a successful `try_consume`, capped at
    /// `burst_capacity`.
    ///
    /// Only used to undo a prior consumption when a later stage of a
    /// multi-bucket check fails; it never manufactures headroom beyond the
    /// ceiling.
    pub fn release(&self, n: u32) {
        self.release_at(n, Instant::now());
    }

    /// Current token balance after refill.
    pub fn available(&self) -> f64 {
        self.available_at(Instant::now())
    }

    /// Time until `n` tokens will be available, rounded up to the next
    /// millisecond. Zero if the balance already covers `n`.
    pub fn time_until_available(&self, n: u32) -> Duration {
        self.time_until_available_at(n, Instant::now())
    }

    /// Restore the balance to `capacity` and restart the refill clock.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.tokens = self.capacity;
        state.last_refill = Instant::now();
    }

    pub(crate) fn try_consume_at(&self, n: u32, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state, now);

        let needed = f64::from(n);
        if state.tokens >= needed {
            state.tokens -= needed;
            true
        } else {
            false
        }
    }

    pub(crate) fn release_at(&self, n: u32, now: Instant) {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state, now);
        state.tokens = (state.tokens + f64::from(n)).min(self.burst_capacity);
    }

    pub(crate) fn available_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state, now);
        state.tokens
    }

    pub(crate) fn time_until_available_at(&self, n: u32, now: Instant) -> Duration {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state, now);

        let needed = f64::from(n);
        if state.tokens >= needed {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }

        let millis = ((needed - state.tokens) / self.refill_rate * 1000.0).ceil();
        Duration::from_millis(millis as u64)
    }

    /// Add tokens for the time elapsed since the last refill, capped at
    /// `burst_capacity`. Must hold the state lock.
    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }

        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.burst_capacity);
        state.last_refill = now;
    }
}
