//! Event reporting on a separate task.
//!
//! The sender and receiver hand events to an unbounded channel and move on;
//! a dedicated task formats them for the log and invokes the user callback.
//! A slow callback therefore never delays probe emission or arrival
//! timestamps.

use crate::measurements::StatisticsSnapshot;
use crate::session::{ProgressCallback, ProgressEvent};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Message sent to the reporter task
#[derive(Debug, Clone)]
pub enum ReporterMessage {
    /// An event to log and forward to the callback
    Event(ProgressEvent),
    /// No more events will follow
    Complete,
}

/// Cloneable handle for emitting events from any task.
///
/// # Examples
///
/// ```
/// use udpq::interval_reporter::{IntervalReporter, ReporterMessage};
/// use udpq::ProgressEvent;
///
/// #[tokio::main]
/// async fn main() {
///     let (reporter, mut receiver) = IntervalReporter::new();
///     reporter.emit(ProgressEvent::SessionStarted { session_id: 7 });
///     reporter.complete();
///
///     assert!(matches!(
///         receiver.recv().await,
///         Some(ReporterMessage::Event(ProgressEvent::SessionStarted { session_id: 7 }))
///     ));
/// }
/// ```
#[derive(Clone)]
pub struct IntervalReporter {
    sender: mpsc::UnboundedSender<ReporterMessage>,
}

impl IntervalReporter {
    /// Creates a reporter handle and the receiving end for the reporter task.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReporterMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Queues an event. Never blocks; events after shutdown are discarded.
    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.sender.send(ReporterMessage::Event(event));
    }

    /// Queues a statistics snapshot.
    pub fn snapshot(&self, snapshot: StatisticsSnapshot) {
        self.emit(ProgressEvent::Snapshot(snapshot));
    }

    /// Signals that the session is over.
    pub fn complete(&self) {
        let _ = self.sender.send(ReporterMessage::Complete);
    }
}

/// Runs until [`IntervalReporter::complete`] is called or every handle is dropped.
pub async fn run_reporter_task(
    mut receiver: mpsc::UnboundedReceiver<ReporterMessage>,
    callback: Option<Arc<dyn ProgressCallback>>,
) {
    while let Some(msg) = receiver.recv().await {
        match msg {
            ReporterMessage::Event(event) => {
                log_event(&event);
                if let Some(ref cb) = callback {
                    cb.on_progress(event);
                }
            }
            ReporterMessage::Complete => break,
        }
    }
}

fn log_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::SessionStarted { session_id } => {
            info!("Session {:016x} started", session_id);
        }
        ProgressEvent::Snapshot(snapshot) => debug!("{}", format_snapshot_line(snapshot)),
        ProgressEvent::SendFailure { sequence, error } => {
            warn!("Probe {} could not be sent: {}", sequence, error);
        }
        ProgressEvent::ReceiveFailure { error } => warn!("Receive failed: {}", error),
        ProgressEvent::DecodeFailure { error } => debug!("Dropped datagram: {}", error),
        ProgressEvent::SessionCompleted(report) => {
            info!(
                "Session {:016x} completed: {}",
                report.session_id,
                format_snapshot_line(&report.statistics)
            );
        }
        ProgressEvent::SessionCancelled { session_id } => {
            info!("Session {:016x} cancelled", session_id);
        }
    }
}

/// One-line human readable summary of a snapshot.
///
/// ```
/// use udpq::interval_reporter::format_snapshot_line;
/// use udpq::StatisticsSnapshot;
///
/// let line = format_snapshot_line(&StatisticsSnapshot::default());
/// assert!(line.starts_with("sent 0"));
/// ```
pub fn format_snapshot_line(snapshot: &StatisticsSnapshot) -> String {
    let mut line = format!(
        "sent {} received {} lost {} ({:.2}%) dup {} reorder {} late {} jitter {:.3} ms",
        snapshot.sent_count,
        snapshot.received_count,
        snapshot.lost_count,
        snapshot.loss_percent(),
        snapshot.duplicate_count,
        snapshot.reorder_count,
        snapshot.late_count,
        snapshot.jitter_ms(),
    );

    if let Some(latency) = snapshot.latency {
        line.push_str(&format!(
            " rtt min/avg/max {:.3}/{:.3}/{:.3} ms p99 {:.3} ms",
            latency.min_ns as f64 / 1e6,
            latency.mean_ms(),
            latency.max_ns as f64 / 1e6,
            latency.p99_ns as f64 / 1e6,
        ));
    }
    if snapshot.decode_errors > 0 {
        line.push_str(&format!(" invalid {}", snapshot.decode_errors));
    }
    line
}
