//! Running statistics over the arrivals of one session.
//!
//! The aggregator is owned and mutated by the receiver task only. Every
//! `record` call is O(1): counters, a Welford accumulator for latency
//! mean/variance, the RFC 3550 jitter estimator and a fixed-size ring of
//! recent latency samples for percentiles.

use crate::config::{MeasurementMode, SessionConfig};
use crate::receiver::ArrivalRecord;
use crate::sequence::{Classification, SequenceTracker};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Round-trip latency distribution, all values in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: f64,
    pub stddev_ns: f64,
    /// Percentiles over the most recent samples only
    pub p50_ns: u64,
    pub p95_ns: u64,
    pub p99_ns: u64,
    pub samples: u64,
}

impl LatencySummary {
    pub fn mean_ms(&self) -> f64 {
        self.mean_ns / 1_000_000.0
    }
}

/// Point-in-time view of a session's statistics.
///
/// Published snapshots are plain values; later arrivals never modify one
/// that was already handed out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    /// Probes accounted for: the receiver's sequence span while running, the
    /// larger of span and sender count once finalized
    pub sent_count: u64,
    /// Distinct probes received in time (new or reordered)
    pub received_count: u64,
    pub lost_count: u64,
    /// `lost_count / sent_count`, 0 when nothing was sent
    pub loss_rate: f64,
    pub duplicate_count: u64,
    pub reorder_count: u64,
    /// Arrivals of probes already finalized as lost
    pub late_count: u64,
    pub decode_errors: u64,
    pub bytes_received: u64,
    /// Smoothed inter-arrival jitter in nanoseconds
    pub jitter_ns: f64,
    /// Only present in round-trip mode once a reply arrived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencySummary>,
    pub highest_sequence: Option<u64>,
    pub finalized: bool,
}

impl StatisticsSnapshot {
    pub fn jitter_ms(&self) -> f64 {
        self.jitter_ns / 1_000_000.0
    }

    pub fn loss_percent(&self) -> f64 {
        self.loss_rate * 100.0
    }
}

/// RFC 3550 interarrival jitter: `J += (|D| - J) / gain`, where `D` is the
/// change in transit time between consecutive counted arrivals.
#[derive(Debug, Clone)]
struct JitterEstimator {
    gain: f64,
    last_transit: Option<i128>,
    jitter: f64,
}

impl JitterEstimator {
    fn new(gain: u32) -> Self {
        Self {
            gain: gain.max(1) as f64,
            last_transit: None,
            jitter: 0.0,
        }
    }

    fn update(&mut self, send_timestamp: u64, receive_timestamp: u64) {
        let transit = receive_timestamp as i128 - send_timestamp as i128;
        if let Some(last) = self.last_transit {
            let d = (transit - last).unsigned_abs() as f64;
            self.jitter += (d - self.jitter) / self.gain;
        }
        self.last_transit = Some(transit);
    }
}

/// Latency accumulator: Welford mean/variance plus a bounded sample ring.
#[derive(Debug, Clone)]
struct LatencyStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: u64,
    max: u64,
    recent: VecDeque<u64>,
    capacity: usize,
}

impl LatencyStats {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: u64::MAX,
            max: 0,
            recent: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, sample: u64) {
        self.count += 1;
        let x = sample as f64;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);

        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(sample);
    }

    fn summary(&self) -> Option<LatencySummary> {
        if self.count == 0 {
            return None;
        }
        let mut sorted: Vec<u64> = self.recent.iter().copied().collect();
        sorted.sort_unstable();

        Some(LatencySummary {
            min_ns: self.min,
            max_ns: self.max,
            mean_ns: self.mean,
            stddev_ns: (self.m2 / self.count as f64).sqrt(),
            p50_ns: percentile(&sorted, 50.0),
            p95_ns: percentile(&sorted, 95.0),
            p99_ns: percentile(&sorted, 99.0),
            samples: self.count,
        })
    }
}

/// Nearest-rank percentile of an ascending, non-empty slice.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Folds arrival records into session statistics.
///
/// # Examples
///
/// ```
/// use udpq::measurements::StatisticsAggregator;
/// use udpq::receiver::ArrivalRecord;
/// use udpq::sequence::SequenceTracker;
/// use udpq::SessionConfig;
///
/// let config = SessionConfig::new();
/// let mut tracker = SequenceTracker::new(config.window_size);
/// let mut stats = StatisticsAggregator::new(&config);
///
/// for seq in [0, 1, 3] {
///     let arrival = ArrivalRecord::new(seq, seq * 100, seq * 100 + 10, 64);
///     let class = tracker.observe(seq);
///     stats.record(&arrival, class).unwrap();
/// }
///
/// let report = stats.finalize(&mut tracker, Some(4)).unwrap();
/// assert_eq!(report.received_count, 3);
/// assert_eq!(report.lost_count, 1);
/// assert_eq!(report.loss_rate, 0.25);
/// ```
#[derive(Debug, Clone)]
pub struct StatisticsAggregator {
    mode: MeasurementMode,
    received: u64,
    duplicates: u64,
    reordered: u64,
    late: u64,
    decode_errors: u64,
    bytes: u64,
    jitter: JitterEstimator,
    latency: LatencyStats,
    closed: bool,
}

impl StatisticsAggregator {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            mode: config.mode,
            received: 0,
            duplicates: 0,
            reordered: 0,
            late: 0,
            decode_errors: 0,
            bytes: 0,
            jitter: JitterEstimator::new(config.jitter_gain),
            latency: LatencyStats::new(config.latency_samples),
            closed: false,
        }
    }

    /// Folds one classified arrival into the running statistics.
    ///
    /// Duplicates and late arrivals only bump their own counters; they feed
    /// neither the jitter estimator nor the latency distribution.
    ///
    /// # Errors
    ///
    /// `Error::SessionClosed` once [`finalize`](Self::finalize) has run.
    pub fn record(&mut self, arrival: &ArrivalRecord, class: Classification) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }

        match class {
            Classification::Duplicate => {
                self.duplicates += 1;
                return Ok(());
            }
            Classification::LostThenLate => {
                self.late += 1;
                return Ok(());
            }
            Classification::Reordered => self.reordered += 1,
            Classification::New => {}
        }

        self.received += 1;
        self.bytes += arrival.bytes as u64;
        self.jitter
            .update(arrival.send_timestamp, arrival.receive_timestamp);

        if self.mode == MeasurementMode::RoundTrip {
            if let Some(rtt) = arrival.round_trip {
                self.latency.push(rtt);
            }
        }
        Ok(())
    }

    /// Counts a datagram that could not be decoded.
    pub fn record_decode_error(&mut self) {
        self.decode_errors += 1;
    }

    /// Consistent view of the current statistics. Never mutates.
    pub fn snapshot(&self, tracker: &SequenceTracker) -> StatisticsSnapshot {
        let sent = tracker.expected();
        let lost = sent.saturating_sub(self.received);
        let loss_rate = if sent > 0 {
            lost as f64 / sent as f64
        } else {
            0.0
        };

        StatisticsSnapshot {
            sent_count: sent,
            received_count: self.received,
            lost_count: lost,
            loss_rate,
            duplicate_count: self.duplicates,
            reorder_count: self.reordered,
            late_count: self.late,
            decode_errors: self.decode_errors,
            bytes_received: self.bytes,
            jitter_ns: self.jitter.jitter,
            latency: self.latency.summary(),
            highest_sequence: tracker.highest_seen(),
            finalized: self.closed,
        }
    }

    /// Closes the statistics and returns the final snapshot.
    ///
    /// Finalizes `tracker` with the sender's emitted count, so probes past the
    /// highest arrival are counted as lost too.
    ///
    /// # Errors
    ///
    /// `Error::SessionClosed` when called a second time.
    pub fn finalize(
        &mut self,
        tracker: &mut SequenceTracker,
        sent_count: Option<u64>,
    ) -> Result<StatisticsSnapshot> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        tracker.finalize(sent_count);
        self.closed = true;
        Ok(self.snapshot(tracker))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    fn arrival(seq: u64, send: u64, recv: u64) -> ArrivalRecord {
        ArrivalRecord::new(seq, send, recv, 32)
    }

    fn feed(
        stats: &mut StatisticsAggregator,
        tracker: &mut SequenceTracker,
        arrivals: &[ArrivalRecord],
    ) {
        for a in arrivals {
            let class = tracker.observe(a.sequence);
            stats.record(a, class).unwrap();
        }
    }

    #[test]
    fn test_uniform_stream_has_zero_jitter() {
        let config = SessionConfig::new();
        let mut tracker = SequenceTracker::new(128);
        let mut stats = StatisticsAggregator::new(&config);

        let arrivals: Vec<_> = (0..50)
            .map(|i| arrival(i, i * 100 * MS, i * 100 * MS + 7 * MS))
            .collect();
        feed(&mut stats, &mut tracker, &arrivals);

        let snap = stats.snapshot(&tracker);
        assert_eq!(snap.jitter_ns, 0.0);
        assert_eq!(snap.received_count, 50);
        assert_eq!(snap.loss_rate, 0.0);
        assert!(snap.latency.is_none(), "one-way mode reports no latency");
    }

    #[test]
    fn test_jitter_follows_rfc3550_step() {
        let config = SessionConfig::new();
        let mut tracker = SequenceTracker::new(128);
        let mut stats = StatisticsAggregator::new(&config);

        // Second probe takes 16ms longer in transit: J = 16ms / 16.
        feed(
            &mut stats,
            &mut tracker,
            &[arrival(0, 0, 10 * MS), arrival(1, 100 * MS, 126 * MS)],
        );
        assert_eq!(stats.snapshot(&tracker).jitter_ns, MS as f64);
    }

    #[test]
    fn test_jitter_converges_back_to_zero() {
        let config = SessionConfig::new();
        let mut tracker = SequenceTracker::new(128);
        let mut stats = StatisticsAggregator::new(&config);

        let mut arrivals = vec![arrival(0, 0, 5 * MS), arrival(1, 100 * MS, 150 * MS)];
        for i in 2..400 {
            arrivals.push(arrival(i, i * 100 * MS, i * 100 * MS + 50 * MS));
        }
        feed(&mut stats, &mut tracker, &arrivals);

        assert!(stats.snapshot(&tracker).jitter_ns < 1.0);
    }

    #[test]
    fn test_duplicates_and_reorders_counted() {
        let config = SessionConfig::new();
        let mut tracker = SequenceTracker::new(128);
        let mut stats = StatisticsAggregator::new(&config);

        feed(
            &mut stats,
            &mut tracker,
            &[
                arrival(0, 0, 1),
                arrival(2, 2, 3),
                arrival(1, 1, 4),
                arrival(2, 2, 5),
            ],
        );

        let snap = stats.snapshot(&tracker);
        assert_eq!(snap.received_count, 3);
        assert_eq!(snap.duplicate_count, 1);
        assert_eq!(snap.reorder_count, 1);
        assert_eq!(snap.bytes_received, 96);
    }

    #[test]
    fn test_round_trip_latency_summary() {
        let config = SessionConfig::new().with_mode(MeasurementMode::RoundTrip);
        let mut tracker = SequenceTracker::new(128);
        let mut stats = StatisticsAggregator::new(&config);

        for (seq, rtt) in [(0, 10), (1, 20), (2, 30), (3, 40)] {
            let record = arrival(seq, 0, rtt * MS).with_round_trip(rtt * MS);
            let class = tracker.observe(seq);
            stats.record(&record, class).unwrap();
        }

        let latency = stats.snapshot(&tracker).latency.unwrap();
        assert_eq!(latency.min_ns, 10 * MS);
        assert_eq!(latency.max_ns, 40 * MS);
        assert_eq!(latency.mean_ns, 25.0 * MS as f64);
        assert_eq!(latency.p50_ns, 20 * MS);
        assert_eq!(latency.p99_ns, 40 * MS);
        assert_eq!(latency.samples, 4);
        assert!((latency.stddev_ns - 11.180_339_887 * MS as f64).abs() < 1.0);
    }

    #[test]
    fn test_percentiles_use_recent_samples_only() {
        let config = SessionConfig::new()
            .with_mode(MeasurementMode::RoundTrip)
            .with_latency_samples(4);
        let mut tracker = SequenceTracker::new(128);
        let mut stats = StatisticsAggregator::new(&config);

        for seq in 0..8u64 {
            let rtt = if seq < 4 { 1_000 } else { 5_000 };
            let record = arrival(seq, 0, rtt).with_round_trip(rtt);
            let class = tracker.observe(seq);
            stats.record(&record, class).unwrap();
        }

        let latency = stats.snapshot(&tracker).latency.unwrap();
        assert_eq!(latency.min_ns, 1_000);
        assert_eq!(latency.p50_ns, 5_000);
        assert_eq!(latency.samples, 8);
    }

    #[test]
    fn test_finalize_counts_tail_loss_and_closes() {
        let config = SessionConfig::new();
        let mut tracker = SequenceTracker::new(128);
        let mut stats = StatisticsAggregator::new(&config);

        feed(
            &mut stats,
            &mut tracker,
            &[arrival(0, 0, 1), arrival(1, 1, 2), arrival(2, 2, 3)],
        );
        let snap = stats.finalize(&mut tracker, Some(4)).unwrap();
        assert!(snap.finalized);
        assert_eq!(snap.sent_count, 4);
        assert_eq!(snap.lost_count, 1);
        assert_eq!(snap.loss_rate, 0.25);

        assert!(stats.is_closed());
        assert!(matches!(
            stats.record(&arrival(3, 3, 4), Classification::New),
            Err(Error::SessionClosed)
        ));
        assert!(matches!(
            stats.finalize(&mut tracker, Some(4)),
            Err(Error::SessionClosed)
        ));
    }

    #[test]
    fn test_snapshot_is_a_pure_read() {
        let config = SessionConfig::new();
        let mut tracker = SequenceTracker::new(128);
        let mut stats = StatisticsAggregator::new(&config);
        feed(&mut stats, &mut tracker, &[arrival(0, 0, 1), arrival(3, 3, 4)]);

        let first = stats.snapshot(&tracker);
        let second = stats.snapshot(&tracker);
        assert_eq!(first, second);
        assert_eq!(first.sent_count, 4);
        assert_eq!(first.lost_count, 2);
        assert!(!first.finalized);
    }

    #[test]
    fn test_late_arrival_keeps_loss() {
        let config = SessionConfig::new();
        let mut tracker = SequenceTracker::new(2);
        let mut stats = StatisticsAggregator::new(&config);

        feed(
            &mut stats,
            &mut tracker,
            &[
                arrival(0, 0, 1),
                arrival(2, 2, 3),
                arrival(3, 3, 4),
                arrival(4, 4, 5),
                arrival(1, 1, 6),
            ],
        );

        let snap = stats.finalize(&mut tracker, Some(5)).unwrap();
        assert_eq!(snap.late_count, 1);
        assert_eq!(snap.received_count, 4);
        assert_eq!(snap.lost_count, 1);
        assert_eq!(snap.loss_rate, 0.2);
    }

    #[test]
    fn test_snapshot_json_has_expected_fields() {
        let snap = StatisticsSnapshot::default();
        let json = serde_json::to_value(&snap).unwrap();
        assert!(json.get("loss_rate").is_some());
        assert!(json.get("latency").is_none());
    }
}
