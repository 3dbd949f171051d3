use std::sync::{Arc, Mutex};
use std::time::Duration;
use udpq::channel::memory::{LinkConfig, MemoryChannel};
use udpq::{DecodeError, ProgressCallback, ProgressEvent, Session, SessionConfig};

/// Custom callback implementation using a struct
struct TestCallback {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl TestCallback {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ProgressCallback for TestCallback {
    fn on_progress(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn config() -> SessionConfig {
    SessionConfig::new()
        .with_interval(Duration::from_millis(100))
        .with_count(10)
        .with_packet_size(32)
        .with_snapshot_interval(Duration::from_millis(250))
}

#[tokio::test(start_paused = true)]
async fn test_custom_callback_struct() {
    let callback = TestCallback::new();
    let events_ref = callback.events.clone();

    let session = Session::new(config(), MemoryChannel::loopback(LinkConfig::new()))
        .unwrap()
        .with_callback(callback);
    let report = session.run().await.unwrap();

    // Every event is delivered before run() returns
    let events = events_ref.lock().unwrap();
    assert!(events.len() > 2, "Should have received events");

    assert!(
        matches!(
            events.first(),
            Some(ProgressEvent::SessionStarted { session_id }) if *session_id == session.id()
        ),
        "First event should be SessionStarted"
    );
    match events.last() {
        Some(ProgressEvent::SessionCompleted(final_report)) => {
            assert_eq!(final_report.session_id, report.session_id);
            assert_eq!(final_report.statistics, report.statistics);
        }
        other => panic!("Last event should be SessionCompleted, got {:?}", other),
    }

    let snapshots: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Snapshot(s) => Some(s),
            _ => None,
        })
        .collect();
    assert!(!snapshots.is_empty(), "Should have received snapshots");
    assert!(snapshots.iter().all(|s| !s.finalized));
    assert!(
        snapshots
            .windows(2)
            .all(|w| w[0].received_count <= w[1].received_count),
        "Snapshots should arrive in order"
    );
}

#[tokio::test(start_paused = true)]
async fn test_closure_callback() {
    let counter = Arc::new(Mutex::new((0u32, 0u32)));
    let counter_clone = counter.clone();

    let session = Session::new(config(), MemoryChannel::loopback(LinkConfig::new()))
        .unwrap()
        .with_callback(move |event: ProgressEvent| {
            let mut counts = counter_clone.lock().unwrap();
            match event {
                ProgressEvent::Snapshot(_) => counts.0 += 1,
                ProgressEvent::SessionCompleted(_) => counts.1 += 1,
                _ => {}
            }
        });
    session.run().await.unwrap();

    let (snapshots, completed) = *counter.lock().unwrap();
    assert!(snapshots > 0);
    assert_eq!(completed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_decode_failure_event() {
    let callback = TestCallback::new();
    let events_ref = callback.events.clone();

    let session = Session::new(config(), MemoryChannel::loopback(LinkConfig::new().corrupt(2)))
        .unwrap()
        .with_callback(callback);
    session.run().await.unwrap();

    let events = events_ref.lock().unwrap();
    let failures: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::DecodeFailure { error } => Some(*error),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![DecodeError::CorruptPadding { offset: 31 }]);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_session_events() {
    let callback = TestCallback::new();
    let events_ref = callback.events.clone();

    let session = Session::new(config(), MemoryChannel::loopback(LinkConfig::new()))
        .unwrap()
        .with_callback(callback);
    session.start().unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    session.cancel().unwrap();

    let report = session.wait().await.unwrap();
    assert!(report.cancelled);

    let events = events_ref.lock().unwrap();
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::SessionCancelled { session_id }) if *session_id == report.session_id
    ));
    assert!(!events
        .iter()
        .any(|e| matches!(e, ProgressEvent::SessionCompleted(_))));
}
