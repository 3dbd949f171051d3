//! Token bucket byte-rate limiter.
//!
//! Caps the number of bytes the sender puts on the wire per second. Tokens
//! are bytes; they refill at the configured rate up to a burst capacity, and
//! a datagram that does not fit waits until enough tokens have accumulated.
//!
//! The limiter only delays. It never drops, splits or reorders datagrams, so
//! the sequence numbers stay contiguous.

use std::time::Duration;
use tokio::time::{self, Instant};

/// Burst window: the bucket holds at most this much time worth of bytes.
const BURST_WINDOW_DIVISOR: u64 = 10;

/// Smallest burst, so a single large datagram always fits once refilled.
const MIN_CAPACITY: u64 = 65_536;

/// Byte-rate limiter driven by the tokio clock.
///
/// # Examples
///
/// ```
/// use udpq::token_bucket::TokenBucket;
///
/// # async fn example() {
/// // 1 MB/s cap
/// let mut bucket = TokenBucket::new(1_000_000);
///
/// // Waits only when the burst allowance is used up.
/// bucket.acquire(1200).await;
/// # }
/// ```
#[derive(Debug)]
pub struct TokenBucket {
    bytes_per_sec: u64,
    /// Available bytes; negative while a datagram is being paid off
    tokens: i64,
    capacity: i64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket for `bytes_per_sec`. A rate of 0 is treated as 1.
    pub fn new(bytes_per_sec: u64) -> Self {
        let bytes_per_sec = bytes_per_sec.max(1);
        let capacity = (bytes_per_sec / BURST_WINDOW_DIVISOR).max(MIN_CAPACITY) as i64;

        Self {
            bytes_per_sec,
            tokens: capacity,
            capacity,
            last_refill: Instant::now(),
        }
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Takes `bytes` tokens, sleeping first if the bucket cannot cover them.
    pub async fn acquire(&mut self, bytes: usize) {
        let bytes = bytes as i64;
        self.refill();

        if self.tokens < bytes {
            let wait = self.time_for((bytes - self.tokens) as u64);
            if !wait.is_zero() {
                time::sleep(wait).await;
                self.refill();
            }
        }

        self.tokens -= bytes;
    }

    /// Time the configured rate needs to produce `bytes` tokens.
    fn time_for(&self, bytes: u64) -> Duration {
        let nanos = (bytes as u128 * 1_000_000_000).div_ceil(self.bytes_per_sec as u128);
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let earned = elapsed.as_nanos() * self.bytes_per_sec as u128 / 1_000_000_000;

        if earned > 0 {
            let earned = earned.min(self.capacity as u128) as i64;
            self.tokens = (self.tokens + earned).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Bytes that can be sent right now without waiting.
    pub fn available(&self) -> i64 {
        self.tokens
    }
}
