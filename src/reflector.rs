//! Peer side of a measurement: answers every probe it receives.
//!
//! In round-trip mode each probe is answered with an [`EchoReply`] that
//! carries the original send timestamp unchanged, so the prober can compute
//! round-trip latency on its own clock. In one-way mode the probe is bounced
//! back as received.

use crate::channel::DatagramChannel;
use crate::clock::{MonotonicClock, SharedClock};
use crate::config::MeasurementMode;
use crate::error::ChannelError;
use crate::udp_packet::{decode, EchoReply, MAX_PACKET_SIZE};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Counters of a reflector run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectorStats {
    pub echoed: u64,
    pub decode_errors: u64,
    pub send_failures: u64,
}

/// Echo peer for round-trip sessions.
///
/// # Examples
///
/// ```no_run
/// use udpq::channel::UdpChannel;
/// use udpq::reflector::Reflector;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let channel = UdpChannel::bind("0.0.0.0:5300".parse()?).await?;
/// let reflector = Reflector::new(Arc::new(channel));
///
/// let stats = reflector.run().await;
/// println!("echoed {} probes", stats.echoed);
/// # Ok(())
/// # }
/// ```
pub struct Reflector<C> {
    channel: Arc<C>,
    clock: SharedClock,
    mode: MeasurementMode,
    cancellation_token: CancellationToken,
}

impl<C: DatagramChannel> Reflector<C> {
    pub fn new(channel: Arc<C>) -> Self {
        Self {
            channel,
            clock: Arc::new(MonotonicClock::new()),
            mode: MeasurementMode::RoundTrip,
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// `OneWay` bounces probes unchanged instead of answering with echo replies.
    pub fn with_mode(mut self, mode: MeasurementMode) -> Self {
        self.mode = mode;
        self
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Answers probes until cancelled or until the channel closes.
    pub async fn run(&self) -> ReflectorStats {
        let mut stats = ReflectorStats::default();
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let mut reply = Vec::with_capacity(MAX_PACKET_SIZE);

        info!("Reflector running in {:?} mode", self.mode);

        while !self.cancellation_token.is_cancelled() {
            let len = match self.channel.recv(&mut buf, POLL_INTERVAL).await {
                Ok(len) => len,
                Err(e) if e.is_timeout() => continue,
                Err(ChannelError::Closed) => {
                    debug!("Reflector channel closed");
                    break;
                }
                Err(e) => {
                    warn!("Reflector receive error: {}", e);
                    time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };
            let reflect_timestamp = self.clock.now();

            let probe = match decode(&buf[..len]) {
                Ok(probe) => probe,
                Err(e) => {
                    debug!("Reflector dropping {}-byte datagram: {}", len, e);
                    stats.decode_errors += 1;
                    continue;
                }
            };

            match self.mode {
                MeasurementMode::RoundTrip => {
                    EchoReply::answer(&probe, reflect_timestamp).encode_into(&mut reply);
                }
                MeasurementMode::OneWay => {
                    reply.clear();
                    reply.extend_from_slice(&buf[..len]);
                }
            }

            match self.channel.send(&reply).await {
                Ok(()) => stats.echoed += 1,
                Err(e) => {
                    debug!("Reflector could not answer probe {}: {}", probe.sequence, e);
                    stats.send_failures += 1;
                }
            }
        }

        info!(
            "Reflector stopped: {} echoed, {} invalid, {} send failures",
            stats.echoed, stats.decode_errors, stats.send_failures
        );
        stats
    }
}
