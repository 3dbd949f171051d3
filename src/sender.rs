//! Probe emission on a self-correcting schedule.

use crate::channel::DatagramChannel;
use crate::clock::SharedClock;
use crate::config::{Bound, SessionConfig};
use crate::interval_reporter::IntervalReporter;
use crate::session::ProgressEvent;
use crate::token_bucket::TokenBucket;
use crate::udp_packet::{encode_into, stamp_timestamp, ProbePacket};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// What the sender did over the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderSummary {
    /// Sequence numbers allocated, including those whose send failed
    pub sent: u64,
    /// Probes that could not be handed to the channel after all retries
    pub send_failures: u64,
}

/// Emits probes at the configured cadence until its bound is reached.
///
/// Probe `k` is due at `start + k * interval`, independent of when probe
/// `k - 1` actually went out, so one slow send does not shift the rest of
/// the schedule. The sender owns the sequence counter and never looks at
/// receiver state.
pub struct ProbeSender<C> {
    channel: Arc<C>,
    config: Arc<SessionConfig>,
    clock: SharedClock,
    cancel: CancellationToken,
    reporter: IntervalReporter,
}

impl<C: DatagramChannel> ProbeSender<C> {
    pub fn new(
        channel: Arc<C>,
        config: Arc<SessionConfig>,
        clock: SharedClock,
        cancel: CancellationToken,
        reporter: IntervalReporter,
    ) -> Self {
        Self {
            channel,
            config,
            clock,
            cancel,
            reporter,
        }
    }

    pub async fn run(self) -> SenderSummary {
        let interval = self.config.interval();
        let packet_size = self.config.packet_size as usize;
        let mut bucket = self.config.max_bytes_per_sec.map(TokenBucket::new);
        let mut buf = Vec::with_capacity(packet_size);
        let mut summary = SenderSummary::default();
        let mut sequence: u64 = 0;
        let start = Instant::now();

        loop {
            let offset = schedule_offset(interval, sequence);
            let done = match self.config.bound {
                Bound::Count(count) => sequence >= count,
                Bound::Duration(limit) => offset >= limit,
            };
            if done {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Sender cancelled after {} probes", sequence);
                    break;
                }
                _ = time::sleep_until(start + offset) => {}
            }

            if let Some(bucket) = bucket.as_mut() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = bucket.acquire(packet_size) => {}
                }
            }

            encode_into(&ProbePacket::sized(sequence, 0, packet_size), &mut buf);
            if !self.emit(&mut buf, sequence).await {
                summary.send_failures += 1;
            }
            sequence += 1;
        }

        summary.sent = sequence;
        debug!(
            "Sender finished: {} probes, {} send failures",
            summary.sent, summary.send_failures
        );
        summary
    }

    /// Stamps and sends one encoded probe, retrying transient failures.
    /// Returns `false` when every attempt failed.
    async fn emit(&self, buf: &mut [u8], sequence: u64) -> bool {
        let attempts = self.config.send_retries + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            stamp_timestamp(buf, self.clock.now());
            match self.channel.send(buf).await {
                Ok(()) => return true,
                Err(e) => {
                    debug!(
                        "Send of probe {} failed (attempt {}/{}): {}",
                        sequence, attempt, attempts, e
                    );
                    last_error = Some(e);
                }
            }
        }

        let error = last_error.map(|e| e.to_string()).unwrap_or_default();
        warn!("Giving up on probe {}: {}", sequence, error);
        self.reporter
            .emit(ProgressEvent::SendFailure { sequence, error });
        false
    }
}

/// `k * interval`, saturating instead of overflowing on absurd schedules.
fn schedule_offset(interval: Duration, k: u64) -> Duration {
    let nanos = interval.as_nanos().saturating_mul(k as u128);
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::{LinkConfig, MemoryChannel};
    use crate::clock::MonotonicClock;
    use crate::udp_packet::decode;

    fn sender(
        channel: Arc<MemoryChannel>,
        config: SessionConfig,
        cancel: CancellationToken,
    ) -> ProbeSender<MemoryChannel> {
        let (reporter, _rx) = IntervalReporter::new();
        ProbeSender::new(
            channel,
            Arc::new(config),
            Arc::new(MonotonicClock::new()),
            cancel,
            reporter,
        )
    }

    async fn collect(channel: &MemoryChannel) -> Vec<ProbePacket> {
        let mut buf = [0u8; 2048];
        let mut probes = Vec::new();
        while let Ok(len) = channel.recv(&mut buf, Duration::from_millis(10)).await {
            probes.push(decode(&buf[..len]).unwrap());
        }
        probes
    }

    #[test]
    fn test_schedule_offset() {
        let interval = Duration::from_millis(100);
        assert_eq!(schedule_offset(interval, 0), Duration::ZERO);
        assert_eq!(schedule_offset(interval, 7), Duration::from_millis(700));
        assert_eq!(
            schedule_offset(Duration::from_secs(u64::MAX), u64::MAX),
            Duration::from_nanos(u64::MAX)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_bound_and_cadence() {
        let channel = Arc::new(MemoryChannel::loopback(LinkConfig::new()));
        let config = SessionConfig::new()
            .with_interval(Duration::from_millis(100))
            .with_count(5)
            .with_packet_size(32);

        let start = Instant::now();
        let summary = sender(channel.clone(), config, CancellationToken::new())
            .run()
            .await;
        assert_eq!(summary, SenderSummary { sent: 5, send_failures: 0 });
        assert_eq!(start.elapsed(), Duration::from_millis(400));

        let probes = collect(&channel).await;
        let sequences: Vec<u64> = probes.iter().map(|p| p.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
        assert!(probes.iter().all(|p| p.encoded_len() == 32));
        assert!(probes.windows(2).all(|w| {
            w[1].send_timestamp - w[0].send_timestamp == 100_000_000
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_bound() {
        let channel = Arc::new(MemoryChannel::loopback(LinkConfig::new()));
        let config = SessionConfig::new()
            .with_rate(20.0)
            .with_duration(Duration::from_secs(1));

        let summary = sender(channel, config, CancellationToken::new())
            .run()
            .await;
        assert_eq!(summary.sent, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_promptly() {
        let channel = Arc::new(MemoryChannel::loopback(LinkConfig::new()));
        let config = SessionConfig::new()
            .with_interval(Duration::from_millis(100))
            .with_count(1_000);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(sender(channel, config, cancel.clone()).run());
        time::sleep(Duration::from_millis(450)).await;
        cancel.cancel();

        let summary = task.await.unwrap();
        assert_eq!(summary.sent, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_byte_cap_slows_emission() {
        let channel = Arc::new(MemoryChannel::loopback(LinkConfig::new()));
        // 1000-byte probes every millisecond would be 1 MB/s; cap at 200 KB/s.
        let config = SessionConfig::new()
            .with_interval(Duration::from_millis(1))
            .with_count(200)
            .with_packet_size(1000)
            .with_max_bytes_per_sec(200_000);

        let start = Instant::now();
        let summary = sender(channel, config, CancellationToken::new())
            .run()
            .await;
        assert_eq!(summary.sent, 200);
        // 65 KB burst allowance, the remaining 135 KB at 200 KB/s.
        assert!(start.elapsed() >= Duration::from_millis(600));
    }
}
