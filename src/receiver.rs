//! Probe collection: decode, timestamp, classify, aggregate.

use crate::channel::DatagramChannel;
use crate::clock::SharedClock;
use crate::config::{MeasurementMode, SessionConfig};
use crate::error::{ChannelError, DecodeError};
use crate::interval_reporter::IntervalReporter;
use crate::measurements::{StatisticsAggregator, StatisticsSnapshot};
use crate::sequence::SequenceTracker;
use crate::session::ProgressEvent;
use crate::udp_packet::{decode_sized, EchoReply, MAX_PACKET_SIZE};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Longest single wait on the channel, so stop and cancel are noticed promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause after a hard receive error before trying again.
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// One decoded arrival, handed straight to the tracker and aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrivalRecord {
    pub sequence: u64,
    /// Sender's timestamp carried in the probe (echoed back in round-trip mode)
    pub send_timestamp: u64,
    /// Our clock when the datagram was taken off the channel
    pub receive_timestamp: u64,
    /// Time since the previous decoded arrival, `None` for the first one.
    /// Informational only: jitter is computed from transit times.
    pub inter_arrival_delta: Option<u64>,
    /// `receive_timestamp - send_timestamp` in round-trip mode
    pub round_trip: Option<u64>,
    /// Datagram length
    pub bytes: usize,
}

impl ArrivalRecord {
    pub fn new(sequence: u64, send_timestamp: u64, receive_timestamp: u64, bytes: usize) -> Self {
        Self {
            sequence,
            send_timestamp,
            receive_timestamp,
            inter_arrival_delta: None,
            round_trip: None,
            bytes,
        }
    }

    pub fn with_inter_arrival(mut self, delta: u64) -> Self {
        self.inter_arrival_delta = Some(delta);
        self
    }

    pub fn with_round_trip(mut self, rtt: u64) -> Self {
        self.round_trip = Some(rtt);
        self
    }
}

/// Why the receiver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The session controller asked it to drain and stop
    Stopped,
    /// Nothing arrived for `max_idle` after the sender finished
    Idle,
    /// The session was aborted
    Cancelled,
    /// The channel reported that nothing more can arrive
    ChannelClosed,
}

/// Everything the receiver accumulated, handed back to the controller for
/// finalization.
#[derive(Debug)]
pub struct CollectorOutput {
    pub tracker: SequenceTracker,
    pub aggregator: StatisticsAggregator,
    pub receive_failures: u64,
    pub stop_reason: StopReason,
}

/// Consumes datagrams from the channel until stopped.
///
/// The idle exit is only armed once `sender_done` fires, and the idle clock
/// restarts at that moment, so probe intervals longer than `max_idle` never
/// end a session early.
///
/// The receiver is the only writer of the sequence tracker and aggregator.
/// Arrivals are folded in the order they come off the channel; reordering is
/// measured, not corrected.
pub struct ProbeReceiver<C> {
    channel: Arc<C>,
    config: Arc<SessionConfig>,
    clock: SharedClock,
    stop: CancellationToken,
    cancel: CancellationToken,
    sender_done: CancellationToken,
    reporter: IntervalReporter,
    snapshots: Arc<watch::Sender<StatisticsSnapshot>>,
}

impl<C: DatagramChannel> ProbeReceiver<C> {
    /// `stop` ends the receiver gracefully; `cancel` aborts it, even in the
    /// middle of a receive. `sender_done` arms the idle exit.
    pub fn new(
        channel: Arc<C>,
        config: Arc<SessionConfig>,
        clock: SharedClock,
        stop: CancellationToken,
        cancel: CancellationToken,
        sender_done: CancellationToken,
        reporter: IntervalReporter,
        snapshots: Arc<watch::Sender<StatisticsSnapshot>>,
    ) -> Self {
        Self {
            channel,
            config,
            clock,
            stop,
            cancel,
            sender_done,
            reporter,
            snapshots,
        }
    }

    pub async fn run(self) -> CollectorOutput {
        let mut tracker = SequenceTracker::new(self.config.window_size);
        let mut aggregator = StatisticsAggregator::new(&self.config);
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let mut last_arrival: Option<u64> = None;
        let mut consecutive_errors: u32 = 0;
        let mut receive_failures: u64 = 0;

        let snapshot_interval = self.config.snapshot_interval;
        let max_idle = self.config.max_idle;
        let mut last_traffic = Instant::now();
        let mut next_snapshot = last_traffic + snapshot_interval;
        let mut idle_armed = false;

        let stop_reason = loop {
            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if self.stop.is_cancelled() {
                break StopReason::Stopped;
            }

            let now = Instant::now();
            if now >= next_snapshot {
                self.publish(aggregator.snapshot(&tracker));
                while next_snapshot <= now {
                    next_snapshot += snapshot_interval;
                }
            }

            if !idle_armed && self.sender_done.is_cancelled() {
                idle_armed = true;
                last_traffic = last_traffic.max(now);
            }

            let mut wait = POLL_INTERVAL.min(next_snapshot.duration_since(now));
            if idle_armed {
                let idle = now.duration_since(last_traffic);
                if idle >= max_idle {
                    info!("No traffic for {:?}, receiver stopping", idle);
                    break StopReason::Idle;
                }
                wait = wait.min(max_idle - idle);
            }

            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break StopReason::Cancelled,
                result = self.channel.recv(&mut buf, wait) => result,
            };

            match received {
                Ok(len) => {
                    let receive_timestamp = self.clock.now();
                    consecutive_errors = 0;
                    last_traffic = Instant::now();
                    self.fold(
                        &buf[..len],
                        receive_timestamp,
                        &mut last_arrival,
                        &mut tracker,
                        &mut aggregator,
                    );
                }
                Err(e) if e.is_timeout() => {}
                Err(ChannelError::Closed) => {
                    debug!("Channel closed, receiver stopping");
                    break StopReason::ChannelClosed;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    debug!(
                        "Receive error ({}/{}): {}",
                        consecutive_errors, self.config.receive_retries, e
                    );
                    if consecutive_errors > self.config.receive_retries {
                        warn!("Receive failed after {} attempts: {}", consecutive_errors, e);
                        receive_failures += 1;
                        consecutive_errors = 0;
                        self.reporter.emit(ProgressEvent::ReceiveFailure {
                            error: e.to_string(),
                        });
                    }
                    time::sleep(ERROR_BACKOFF).await;
                }
            }
        };

        debug!(
            "Receiver stopped ({:?}) after {} probes",
            stop_reason,
            aggregator.snapshot(&tracker).received_count
        );

        CollectorOutput {
            tracker,
            aggregator,
            receive_failures,
            stop_reason,
        }
    }

    fn fold(
        &self,
        datagram: &[u8],
        receive_timestamp: u64,
        last_arrival: &mut Option<u64>,
        tracker: &mut SequenceTracker,
        aggregator: &mut StatisticsAggregator,
    ) {
        let (sequence, send_timestamp) = match self.decode(datagram) {
            Ok(fields) => fields,
            Err(error) => {
                debug!("Dropping {}-byte datagram: {}", datagram.len(), error);
                aggregator.record_decode_error();
                self.reporter.emit(ProgressEvent::DecodeFailure { error });
                return;
            }
        };

        let mut arrival =
            ArrivalRecord::new(sequence, send_timestamp, receive_timestamp, datagram.len());
        if let Some(previous) = last_arrival.replace(receive_timestamp) {
            arrival = arrival.with_inter_arrival(receive_timestamp.saturating_sub(previous));
        }
        if self.config.mode == MeasurementMode::RoundTrip {
            arrival = arrival.with_round_trip(receive_timestamp.saturating_sub(send_timestamp));
        }

        let class = tracker.observe(sequence);
        if let Err(e) = aggregator.record(&arrival, class) {
            warn!("Arrival of probe {} not recorded: {}", sequence, e);
        }
    }

    fn decode(&self, datagram: &[u8]) -> Result<(u64, u64), DecodeError> {
        let packet_size = self.config.packet_size as usize;
        match self.config.mode {
            MeasurementMode::OneWay => {
                decode_sized(datagram, packet_size).map(|p| (p.sequence, p.send_timestamp))
            }
            MeasurementMode::RoundTrip => {
                let reply = EchoReply::decode(datagram)?;
                if datagram.len() < packet_size {
                    return Err(DecodeError::TruncatedPayload {
                        expected: packet_size,
                        actual: datagram.len(),
                    });
                }
                Ok((reply.sequence, reply.send_timestamp))
            }
        }
    }

    fn publish(&self, snapshot: StatisticsSnapshot) {
        self.reporter.snapshot(snapshot.clone());
        self.snapshots.send_replace(snapshot);
    }
}
