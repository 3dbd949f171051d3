//! udpq - UDP network quality probing
//!
//! This library measures packet loss, reordering, duplication, jitter and
//! round-trip latency between two endpoints by exchanging timestamped,
//! sequenced UDP probes.
//!
//! # Features
//!
//! - Self-correcting probe pacing by interval or rate, bounded by count or duration
//! - Bounded-memory loss and reorder tracking over a sliding sequence window
//! - RFC 3550 jitter and round-trip latency with percentiles
//! - Periodic snapshots and progress callbacks
//! - Runs over any [`DatagramChannel`]; UDP sockets and an in-memory
//!   impaired link are provided
//!
//! # Example
//!
//! ```no_run
//! use udpq::channel::UdpChannel;
//! use udpq::{MeasurementMode, Session, SessionConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::new()
//!     .with_interval(Duration::from_millis(20))
//!     .with_duration(Duration::from_secs(10))
//!     .with_mode(MeasurementMode::RoundTrip);
//!
//! let channel = UdpChannel::connect("192.0.2.10:5300".parse()?).await?;
//! let report = Session::new(config, channel)?.run().await?;
//!
//! println!(
//!     "loss {:.2}%, jitter {:.3} ms",
//!     report.statistics.loss_percent(),
//!     report.statistics.jitter_ms()
//! );
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod interval_reporter;
pub mod measurements;
pub mod receiver;
pub mod reflector;
pub mod sender;
pub mod sequence;
pub mod session;
pub mod token_bucket;
pub mod udp_packet;

pub use channel::{DatagramChannel, UdpChannel};
pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use config::{Bound, MeasurementMode, Pacing, SessionConfig};
pub use error::{ChannelError, DecodeError, Error, Result};
pub use measurements::{LatencySummary, StatisticsAggregator, StatisticsSnapshot};
pub use receiver::{ArrivalRecord, StopReason};
pub use reflector::{Reflector, ReflectorStats};
pub use sender::SenderSummary;
pub use sequence::{Classification, MissingRange, SequenceTracker};
pub use session::{ProgressCallback, ProgressEvent, Session, SessionReport, SessionState};
pub use udp_packet::{EchoReply, ProbePacket};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
