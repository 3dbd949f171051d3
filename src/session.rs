//! Session lifecycle: `Idle -> Running -> Finalizing -> Closed`.

use crate::channel::DatagramChannel;
use crate::clock::{MonotonicClock, SharedClock};
use crate::config::{MeasurementMode, SessionConfig};
use crate::error::DecodeError;
use crate::interval_reporter::{run_reporter_task, IntervalReporter};
use crate::measurements::StatisticsSnapshot;
use crate::receiver::{CollectorOutput, ProbeReceiver, StopReason};
use crate::sender::{ProbeSender, SenderSummary};
use crate::sequence::MissingRange;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Running,
    Finalizing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Finalizing => "finalizing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Progress events reported while a session runs.
///
/// Events are delivered from a dedicated reporter task, in the order they
/// were raised, never from the sender or receiver loop itself.
///
/// # Examples
///
/// ```no_run
/// use udpq::channel::UdpChannel;
/// use udpq::{ProgressEvent, Session, SessionConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let channel = UdpChannel::connect("192.0.2.10:5300".parse()?).await?;
/// let session = Session::new(SessionConfig::new().with_count(100), channel)?
///     .with_callback(|event: ProgressEvent| match event {
///         ProgressEvent::Snapshot(snap) => {
///             println!("loss {:.1}%", snap.loss_percent());
///         }
///         ProgressEvent::SendFailure { sequence, error } => {
///             eprintln!("probe {} failed: {}", sequence, error);
///         }
///         _ => {}
///     });
///
/// let report = session.run().await?;
/// println!("{:?}", report.statistics);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// The sender and receiver have been spawned.
    SessionStarted { session_id: u64 },
    /// Periodic statistics, every `snapshot_interval`.
    Snapshot(StatisticsSnapshot),
    /// A probe could not be handed to the channel after all retries. Its
    /// sequence number still counts as sent.
    SendFailure { sequence: u64, error: String },
    /// The channel kept failing on receive beyond the retry budget.
    ReceiveFailure { error: String },
    /// A datagram was dropped because it did not decode.
    DecodeFailure { error: DecodeError },
    /// Final report of a session that ran to completion.
    SessionCompleted(Box<SessionReport>),
    /// The session was aborted with [`Session::cancel`].
    SessionCancelled { session_id: u64 },
}

/// Callback trait for receiving progress events.
///
/// Implemented for any `Fn(ProgressEvent) + Send + Sync` closure.
///
/// ```
/// use udpq::{ProgressCallback, ProgressEvent};
///
/// struct Logger;
///
/// impl ProgressCallback for Logger {
///     fn on_progress(&self, event: ProgressEvent) {
///         println!("{:?}", event);
///     }
/// }
/// ```
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

impl<F> ProgressCallback for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}

type CallbackRef = Arc<dyn ProgressCallback>;

/// Final result of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: u64,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub mode: MeasurementMode,
    /// Whether the session was aborted; statistics then cover only what was
    /// aggregated before the abort
    pub cancelled: bool,
    pub sender: SenderSummary,
    pub receive_failures: u64,
    pub stop_reason: StopReason,
    pub statistics: StatisticsSnapshot,
    /// Oldest gaps first, at most [`MAX_MISSING_RANGES`](crate::sequence::MAX_MISSING_RANGES)
    pub missing_ranges: Vec<MissingRange>,
    /// Gaps that did not fit in `missing_ranges`
    pub missing_ranges_truncated: u64,
}

struct RunningTasks {
    sender: JoinHandle<SenderSummary>,
    receiver: JoinHandle<CollectorOutput>,
    reporter: IntervalReporter,
    reporter_task: JoinHandle<()>,
    stop: CancellationToken,
    started_at: DateTime<Utc>,
    started: Instant,
}

/// One measurement run between two endpoints.
///
/// The session owns its state; the sender and receiver tasks only hold the
/// shared config, the channel and the tokens that signal them. Independent
/// sessions can run side by side.
///
/// # Examples
///
/// ```
/// use udpq::channel::memory::{LinkConfig, MemoryChannel};
/// use udpq::{Session, SessionConfig};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread", start_paused = true)]
/// # async fn main() -> udpq::Result<()> {
/// let config = SessionConfig::new()
///     .with_interval(Duration::from_millis(100))
///     .with_count(10)
///     .with_packet_size(32);
/// let channel = MemoryChannel::loopback(LinkConfig::new().drop(5));
///
/// let report = Session::new(config, channel)?.run().await?;
/// assert_eq!(report.statistics.sent_count, 10);
/// assert_eq!(report.statistics.received_count, 9);
/// # Ok(())
/// # }
/// ```
pub struct Session<C: DatagramChannel> {
    id: u64,
    config: Arc<SessionConfig>,
    channel: Arc<C>,
    clock: SharedClock,
    callback: Option<CallbackRef>,
    state: Arc<Mutex<SessionState>>,
    cancellation_token: CancellationToken,
    snapshot_tx: Arc<watch::Sender<StatisticsSnapshot>>,
    snapshot_rx: watch::Receiver<StatisticsSnapshot>,
    tasks: Mutex<Option<RunningTasks>>,
}

impl<C: DatagramChannel> Session<C> {
    /// Creates an idle session over `channel`.
    ///
    /// # Errors
    ///
    /// `Error::Config` when the configuration does not validate.
    pub fn new(config: SessionConfig, channel: C) -> Result<Self> {
        Self::with_shared_channel(config, Arc::new(channel))
    }

    /// Like [`new`](Self::new) for a channel that is also used elsewhere.
    pub fn with_shared_channel(config: SessionConfig, channel: Arc<C>) -> Result<Self> {
        config.validate()?;
        let (snapshot_tx, snapshot_rx) = watch::channel(StatisticsSnapshot::default());

        Ok(Self {
            id: rand::random(),
            config: Arc::new(config),
            channel,
            clock: Arc::new(MonotonicClock::new()),
            callback: None,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            cancellation_token: CancellationToken::new(),
            snapshot_tx: Arc::new(snapshot_tx),
            snapshot_rx,
            tasks: Mutex::new(None),
        })
    }

    /// Replaces the monotonic clock used to stamp probes and arrivals.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Sets a callback for progress events.
    pub fn with_callback<F: ProgressCallback + 'static>(mut self, callback: F) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Token that aborts the session when cancelled, same as [`cancel`](Self::cancel)
    /// but usable from anywhere.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Most recently published statistics. Default until the first snapshot.
    pub fn latest_snapshot(&self) -> StatisticsSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// A receiver that is notified whenever a new snapshot is published.
    pub fn subscribe(&self) -> watch::Receiver<StatisticsSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Spawns the sender, receiver and reporter tasks.
    ///
    /// # Errors
    ///
    /// `Error::Task` when called outside a tokio runtime, `Error::InvalidState`
    /// unless the session is `Idle`. The session stays `Idle` on either error.
    pub fn start(&self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|e| Error::Task(e.to_string()))?;
        self.transition("start", &[SessionState::Idle], SessionState::Running)?;

        let (reporter, reporter_rx) = IntervalReporter::new();
        let reporter_task = runtime.spawn(run_reporter_task(reporter_rx, self.callback.clone()));

        let stop = self.cancellation_token.child_token();
        let sender_done = CancellationToken::new();
        let receiver = ProbeReceiver::new(
            self.channel.clone(),
            self.config.clone(),
            self.clock.clone(),
            stop.clone(),
            self.cancellation_token.clone(),
            sender_done.clone(),
            reporter.clone(),
            self.snapshot_tx.clone(),
        );
        let sender = ProbeSender::new(
            self.channel.clone(),
            self.config.clone(),
            self.clock.clone(),
            self.cancellation_token.clone(),
            reporter.clone(),
        );

        // Receiver first, so the earliest probes find it listening.
        let receiver = runtime.spawn(receiver.run());
        let sender = runtime.spawn(async move {
            let summary = sender.run().await;
            sender_done.cancel();
            summary
        });

        info!(
            "Session {:016x} started: {:?}, one probe every {:?}, {} bytes, {:?}",
            self.id,
            self.config.bound,
            self.config.interval(),
            self.config.packet_size,
            self.config.mode
        );
        reporter.emit(ProgressEvent::SessionStarted {
            session_id: self.id,
        });

        *self.tasks.lock() = Some(RunningTasks {
            sender,
            receiver,
            reporter,
            reporter_task,
            stop,
            started_at: Utc::now(),
            started: Instant::now(),
        });
        Ok(())
    }

    /// Waits for the session to end and returns its report.
    ///
    /// After the sender is done the receiver keeps listening for
    /// `grace_period`, then drains and the statistics are finalized. A
    /// cancelled session still yields a report, flagged `cancelled`.
    ///
    /// # Errors
    ///
    /// `Error::InvalidState` if the session was never started or its report
    /// was already taken; `Error::Task` if a session task panicked.
    pub async fn wait(&self) -> Result<SessionReport> {
        let tasks = self.tasks.lock().take();
        let Some(tasks) = tasks else {
            return Err(Error::InvalidState {
                operation: "wait",
                state: self.state(),
            });
        };
        let RunningTasks {
            sender,
            receiver,
            reporter,
            reporter_task,
            stop,
            started_at,
            started,
        } = tasks;

        let sender_summary = sender.await.map_err(task_error)?;

        if !self.cancellation_token.is_cancelled() {
            debug!("Sender done, grace period {:?}", self.config.grace_period);
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {}
                _ = time::sleep(self.config.grace_period) => {}
            }
        }

        // A concurrent cancel() may already have closed the session.
        if let Err(e) =
            self.transition("finalize", &[SessionState::Running], SessionState::Finalizing)
        {
            debug!("Session {:016x}: {}", self.id, e);
        }
        stop.cancel();

        let CollectorOutput {
            mut tracker,
            mut aggregator,
            receive_failures,
            stop_reason,
        } = receiver.await.map_err(task_error)?;

        let statistics = aggregator.finalize(&mut tracker, Some(sender_summary.sent))?;
        self.snapshot_tx.send_replace(statistics.clone());
        *self.state.lock() = SessionState::Closed;

        let cancelled = self.cancellation_token.is_cancelled();
        let (missing, truncated) = tracker.missing_ranges();
        let report = SessionReport {
            session_id: self.id,
            started_at,
            duration: started.elapsed(),
            mode: self.config.mode,
            cancelled,
            sender: sender_summary,
            receive_failures,
            stop_reason,
            statistics,
            missing_ranges: missing.to_vec(),
            missing_ranges_truncated: truncated,
        };

        if cancelled {
            info!("Session {:016x} cancelled", self.id);
            reporter.emit(ProgressEvent::SessionCancelled {
                session_id: self.id,
            });
        } else {
            reporter.emit(ProgressEvent::SessionCompleted(Box::new(report.clone())));
        }
        reporter.complete();
        reporter_task.await.map_err(task_error)?;

        Ok(report)
    }

    /// Starts the session and waits for its report.
    pub async fn run(&self) -> Result<SessionReport> {
        self.start()?;
        self.wait().await
    }

    /// Aborts a running session. Arrivals not yet aggregated are discarded.
    ///
    /// # Errors
    ///
    /// `Error::InvalidState` unless the session is `Running` or `Finalizing`.
    pub fn cancel(&self) -> Result<()> {
        self.transition(
            "cancel",
            &[SessionState::Running, SessionState::Finalizing],
            SessionState::Closed,
        )?;
        info!("Cancelling session {:016x}", self.id);
        self.cancellation_token.cancel();
        Ok(())
    }

    fn transition(
        &self,
        operation: &'static str,
        from: &[SessionState],
        to: SessionState,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !from.contains(&*state) {
            return Err(Error::InvalidState {
                operation,
                state: *state,
            });
        }
        debug!("Session {:016x}: {} -> {}", self.id, *state, to);
        *state = to;
        Ok(())
    }
}

impl<C: DatagramChannel> Drop for Session<C> {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

fn task_error(e: tokio::task::JoinError) -> Error {
    Error::Task(e.to_string())
}
