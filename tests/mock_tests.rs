// Mock-based tests for sender/receiver fault handling
// A scripted channel fails sends and receives on demand, without any real network I/O

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use udpq::channel::memory::{LinkConfig, MemoryChannel};
use udpq::udp_packet::{decode, peek_sequence};
use udpq::{ChannelError, DatagramChannel, ManualClock, ProgressEvent, Session, SessionConfig};

/// Loopback channel that fails chosen sends and receives
struct FlakyChannel {
    inner: MemoryChannel,
    /// sequence -> number of send attempts that still fail
    send_faults: Mutex<HashMap<u64, u32>>,
    recv_faults: AtomicU32,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl FlakyChannel {
    fn new() -> Self {
        Self {
            inner: MemoryChannel::loopback(LinkConfig::new()),
            send_faults: Mutex::new(HashMap::new()),
            recv_faults: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn fail_send(self, sequence: u64, attempts: u32) -> Self {
        self.send_faults.lock().unwrap().insert(sequence, attempts);
        self
    }

    fn fail_recv(self, times: u32) -> Self {
        self.recv_faults.store(times, Ordering::SeqCst);
        self
    }

    fn should_fail_send(&self, datagram: &[u8]) -> bool {
        let Some(sequence) = peek_sequence(datagram) else {
            return false;
        };
        let mut faults = self.send_faults.lock().unwrap();
        match faults.get_mut(&sequence) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl DatagramChannel for FlakyChannel {
    async fn send(&self, datagram: &[u8]) -> Result<(), ChannelError> {
        if self.should_fail_send(datagram) {
            return Err(ChannelError::Io(io::Error::new(
                io::ErrorKind::WouldBlock,
                "send buffer full",
            )));
        }
        self.sent.lock().unwrap().push(datagram.to_vec());
        self.inner.send(datagram).await
    }

    async fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError> {
        let failed = self
            .recv_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ChannelError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "port unreachable",
            )));
        }
        self.inner.recv(buf, timeout).await
    }
}

fn config() -> SessionConfig {
    SessionConfig::new()
        .with_interval(Duration::from_millis(100))
        .with_count(10)
        .with_packet_size(32)
}

fn recorder() -> (Arc<Mutex<Vec<ProgressEvent>>>, impl Fn(ProgressEvent) + Send + Sync) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    (events, move |event: ProgressEvent| {
        sink.lock().unwrap().push(event)
    })
}

#[tokio::test(start_paused = true)]
async fn test_transient_send_failure_is_retried() {
    let channel = FlakyChannel::new().fail_send(3, 2);
    let (events, callback) = recorder();

    let session = Session::new(config().with_send_retries(2), channel)
        .unwrap()
        .with_callback(callback);
    let report = session.run().await.unwrap();

    assert_eq!(report.sender.sent, 10);
    assert_eq!(report.sender.send_failures, 0);
    assert_eq!(report.statistics.received_count, 10);
    assert!(!events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, ProgressEvent::SendFailure { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_permanent_send_failure_counts_as_loss() {
    let channel = FlakyChannel::new().fail_send(3, 5);
    let (events, callback) = recorder();

    let session = Session::new(config().with_send_retries(1), channel)
        .unwrap()
        .with_callback(callback);
    let report = session.run().await.unwrap();

    // The sequence number was consumed even though the probe never left.
    assert_eq!(report.sender.sent, 10);
    assert_eq!(report.sender.send_failures, 1);
    assert_eq!(report.statistics.sent_count, 10);
    assert_eq!(report.statistics.received_count, 9);
    assert_eq!(report.statistics.lost_count, 1);

    let events = events.lock().unwrap();
    let failed: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::SendFailure { sequence, .. } => Some(*sequence),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec![3]);
}

#[tokio::test(start_paused = true)]
async fn test_receive_errors_beyond_retries() {
    let channel = FlakyChannel::new().fail_recv(4);
    let (events, callback) = recorder();

    let session = Session::new(config().with_receive_retries(3), channel)
        .unwrap()
        .with_callback(callback);
    let report = session.run().await.unwrap();

    assert_eq!(report.receive_failures, 1);
    assert_eq!(report.statistics.received_count, 10);

    let events = events.lock().unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::ReceiveFailure { .. }))
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_receive_errors_within_retries_are_silent() {
    let channel = FlakyChannel::new().fail_recv(3);
    let report = Session::new(config().with_receive_retries(3), channel)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.receive_failures, 0);
    assert_eq!(report.statistics.received_count, 10);
}

#[tokio::test(start_paused = true)]
async fn test_probes_carry_injected_clock() {
    let channel = Arc::new(FlakyChannel::new());
    let clock = ManualClock::new(42_000);

    let session = Session::with_shared_channel(config().with_count(5), channel.clone())
        .unwrap()
        .with_clock(Arc::new(clock));
    let report = session.run().await.unwrap();

    let sent = channel.sent.lock().unwrap();
    assert_eq!(sent.len(), 5);
    for (i, datagram) in sent.iter().enumerate() {
        let probe = decode(datagram).unwrap();
        assert_eq!(probe.sequence, i as u64);
        assert_eq!(probe.send_timestamp, 42_000);
        assert_eq!(datagram.len(), 32);
    }

    // Every transit time is zero on a frozen clock.
    assert_eq!(report.statistics.jitter_ns, 0.0);
}
