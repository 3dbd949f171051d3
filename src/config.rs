use crate::udp_packet::{MAX_PACKET_SIZE, MIN_PACKET_SIZE, REPLY_HEADER_SIZE};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How probes are spaced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Pacing {
    /// Fixed gap between consecutive probes
    Interval(Duration),
    /// Probes per second
    Rate(f64),
}

impl Pacing {
    /// The target gap between two probes.
    pub fn interval(&self) -> Duration {
        match *self {
            Pacing::Interval(interval) => interval,
            Pacing::Rate(rate) if rate > 0.0 => Duration::from_secs_f64(1.0 / rate),
            Pacing::Rate(_) => Duration::ZERO,
        }
    }
}

/// When the sender stops emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bound {
    /// After this many probes
    Count(u64),
    /// Once this much time has passed since the first probe
    Duration(Duration),
}

/// What the receiving side of the session observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementMode {
    /// Probes arrive from the peer's sender. Only loss, reorder and jitter
    /// are reported because the two clocks share no reference.
    OneWay,
    /// The peer echoes every probe back, so latency is measured as a true
    /// round trip on our own clock.
    RoundTrip,
}

/// Configuration for one measurement session.
///
/// Use the builder methods to customize the defaults.
///
/// # Examples
///
/// ```
/// use udpq::{Bound, MeasurementMode, SessionConfig};
/// use std::time::Duration;
///
/// let config = SessionConfig::new()
///     .with_interval(Duration::from_millis(100))
///     .with_count(10)
///     .with_packet_size(32)
///     .with_mode(MeasurementMode::RoundTrip);
///
/// assert_eq!(config.bound, Bound::Count(10));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Probe spacing
    pub pacing: Pacing,

    /// Count or duration limit for the sender
    pub bound: Bound,

    /// Total datagram size in bytes, header included
    pub packet_size: u32,

    /// One-way or round-trip measurement
    pub mode: MeasurementMode,

    /// Reorder window of the sequence tracker, in sequence numbers
    pub window_size: u64,

    /// Divisor of the smoothed jitter estimator (16 in RFC 3550)
    pub jitter_gain: u32,

    /// Number of recent latency samples kept for percentiles
    pub latency_samples: usize,

    /// How long the receiver keeps listening after the sender is done
    pub grace_period: Duration,

    /// Receiver gives up after this long without any datagram
    pub max_idle: Duration,

    /// Cadence of published statistics snapshots
    pub snapshot_interval: Duration,

    /// Extra attempts for a failed send before it is recorded as a failure
    pub send_retries: u32,

    /// Consecutive receive errors tolerated before a failure is recorded
    pub receive_retries: u32,

    /// Optional byte-rate cap on top of the probe pacing
    pub max_bytes_per_sec: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pacing: Pacing::Interval(Duration::from_millis(100)),
            bound: Bound::Count(10),
            packet_size: 64,
            mode: MeasurementMode::OneWay,
            window_size: 128,
            jitter_gain: 16,
            latency_samples: 1024,
            grace_period: Duration::from_secs(1),
            max_idle: Duration::from_secs(2),
            snapshot_interval: Duration::from_secs(1),
            send_retries: 2,
            receive_retries: 3,
            max_bytes_per_sec: None,
        }
    }
}

impl SessionConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spaces probes by a fixed interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.pacing = Pacing::Interval(interval);
        self
    }

    /// Spaces probes to reach `packets_per_sec`.
    pub fn with_rate(mut self, packets_per_sec: f64) -> Self {
        self.pacing = Pacing::Rate(packets_per_sec);
        self
    }

    /// Stops after `count` probes.
    pub fn with_count(mut self, count: u64) -> Self {
        self.bound = Bound::Count(count);
        self
    }

    /// Stops once `duration` has elapsed.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.bound = Bound::Duration(duration);
        self
    }

    pub fn with_packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    pub fn with_mode(mut self, mode: MeasurementMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_window_size(mut self, window_size: u64) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_jitter_gain(mut self, gain: u32) -> Self {
        self.jitter_gain = gain;
        self
    }

    pub fn with_latency_samples(mut self, samples: usize) -> Self {
        self.latency_samples = samples;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn with_send_retries(mut self, retries: u32) -> Self {
        self.send_retries = retries;
        self
    }

    pub fn with_receive_retries(mut self, retries: u32) -> Self {
        self.receive_retries = retries;
        self
    }

    /// Caps the byte rate on the wire.
    pub fn with_max_bytes_per_sec(mut self, bytes_per_sec: u64) -> Self {
        self.max_bytes_per_sec = Some(bytes_per_sec);
        self
    }

    /// Target gap between probes.
    pub fn interval(&self) -> Duration {
        self.pacing.interval()
    }

    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first offending field.
    pub fn validate(&self) -> Result<()> {
        let min_size = match self.mode {
            MeasurementMode::OneWay => MIN_PACKET_SIZE,
            MeasurementMode::RoundTrip => REPLY_HEADER_SIZE,
        };
        let size = self.packet_size as usize;
        if size < min_size || size > MAX_PACKET_SIZE {
            return Err(Error::Config(format!(
                "packet size {} outside {}..={} for {:?} mode",
                size, min_size, MAX_PACKET_SIZE, self.mode
            )));
        }

        match self.pacing {
            Pacing::Rate(rate) if !(rate.is_finite() && rate > 0.0) => {
                return Err(Error::Config(format!("probe rate must be positive, got {}", rate)));
            }
            Pacing::Interval(interval) if interval.is_zero() => {
                return Err(Error::Config("probe interval must be non-zero".to_string()));
            }
            _ => {}
        }

        if let Bound::Duration(duration) = self.bound {
            if duration.is_zero() {
                return Err(Error::Config("session duration must be non-zero".to_string()));
            }
        }

        if self.window_size == 0 {
            return Err(Error::Config("sequence window must hold at least one entry".to_string()));
        }
        if self.jitter_gain == 0 {
            return Err(Error::Config("jitter gain must be at least 1".to_string()));
        }
        if self.latency_samples == 0 {
            return Err(Error::Config("latency reservoir must hold at least one sample".to_string()));
        }
        if self.max_idle.is_zero() {
            return Err(Error::Config("max idle must be non-zero".to_string()));
        }
        if self.snapshot_interval.is_zero() {
            return Err(Error::Config("snapshot interval must be non-zero".to_string()));
        }
        if self.max_bytes_per_sec == Some(0) {
            return Err(Error::Config("byte-rate cap must be positive".to_string()));
        }

        Ok(())
    }
}

/// Parses a byte-size literal such as `"1000"`, `"1KB"`, `"1.5MB"` or `"256KiB"`.
///
/// Decimal units (`KB`, `MB`) are powers of 1000, binary units (`KiB`, `MiB`)
/// powers of 1024. Units are case-insensitive; a bare number is rounded up.
///
/// # Examples
///
/// ```
/// use udpq::config::parse_size_literal;
///
/// assert_eq!(parse_size_literal("1KB").unwrap(), 1000);
/// assert_eq!(parse_size_literal("1KiB").unwrap(), 1024);
/// assert_eq!(parse_size_literal("1.5MB").unwrap(), 1_500_000);
/// assert_eq!(parse_size_literal("1400").unwrap(), 1400);
/// ```
pub fn parse_size_literal(literal: &str) -> Result<u64> {
    let literal = literal.trim();
    let split = literal
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(literal.len());
    let (number, unit) = literal.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| Error::Config(format!("invalid size literal '{}'", literal)))?;

    let bytes = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => value.ceil(),
        "kb" => (value * 1000.0).round(),
        "kib" => (value * 1024.0).round(),
        "mb" => (value * 1000.0 * 1000.0).round(),
        "mib" => (value * 1024.0 * 1024.0).round(),
        other => {
            return Err(Error::Config(format!(
                "unknown size unit '{}' in '{}'",
                other, literal
            )))
        }
    };

    Ok(bytes as u64)
}
