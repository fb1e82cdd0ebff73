//! Integration tests for the live screening session protocol

use base64::Engine;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use imageproc::drawing::draw_filled_circle_mut;
use pupil_screen::auth::{AuthError, TokenRegistry};
use pupil_screen::core::{FrameAnalyzer, GazeClass, ScreeningRecord, UserId};
use pupil_screen::session::{
    run_session, FrameAck, FrameTransport, SessionContext, SessionEnd, SessionError,
    SessionStage, TransportError,
};
use pupil_screen::stats::create_shared_stats;
use pupil_screen::store::{MemoryStore, RecordStore, StoreError};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Transport that replays a fixed script of client messages, then hangs up.
struct ScriptedTransport {
    incoming: VecDeque<String>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl FrameTransport for ScriptedTransport {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.incoming.pop_front().map(Ok)
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct Harness {
    registry: Arc<TokenRegistry>,
    store: Arc<MemoryStore>,
    ctx: SessionContext,
    token: String,
}

impl Harness {
    fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    fn with_store(store: Arc<MemoryStore>) -> Self {
        let registry = Arc::new(TokenRegistry::new());
        let token = registry.issue(UserId::new("child-1"), None);
        let ctx = SessionContext {
            authenticator: registry.clone(),
            store: store.clone(),
            analyzer: Arc::new(FrameAnalyzer::default()),
            stats: create_shared_stats(),
        };
        Self {
            registry,
            store,
            ctx,
            token,
        }
    }

    fn auth_message(&self) -> String {
        serde_json::json!({ "token": self.token }).to_string()
    }

    async fn run(&self, messages: Vec<String>) -> Outcome {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let transport = ScriptedTransport {
            incoming: messages.into(),
            sent: sent.clone(),
            closed: closed.clone(),
        };

        let report = run_session(transport, self.ctx.clone()).await;

        let acks = sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str::<FrameAck>(s).expect("ack is valid json"))
            .collect();

        Outcome {
            report,
            acks,
            closed: closed.load(Ordering::SeqCst),
        }
    }

    fn history(&self) -> Vec<ScreeningRecord> {
        self.store.list_by_user(&UserId::new("child-1")).unwrap()
    }
}

struct Outcome {
    report: pupil_screen::SessionReport,
    acks: Vec<FrameAck>,
    closed: bool,
}

fn encode_png(discs: &[(i32, i32, i32)]) -> Vec<u8> {
    let mut img = GrayImage::from_pixel(160, 120, Luma([210u8]));
    for &(x, y, r) in discs {
        draw_filled_circle_mut(&mut img, (x, y), r, Luma([0u8]));
    }
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn frame_message(timestamp: &str, stimulus: &str, image: &[u8]) -> String {
    serde_json::json!({
        "timestamp": timestamp,
        "stimulus": stimulus,
        "frame": base64::engine::general_purpose::STANDARD.encode(image),
    })
    .to_string()
}

fn centered_frame(timestamp: &str, stimulus: &str) -> String {
    frame_message(timestamp, stimulus, &encode_png(&[(50, 60, 6), (110, 60, 6)]))
}

#[tokio::test]
async fn test_disconnect_keeps_only_flushed_stimulus() {
    let harness = Harness::new();
    let outcome = harness
        .run(vec![
            harness.auth_message(),
            centered_frame("2024-01-22T10:00:01Z", "S1"),
            centered_frame("2024-01-22T10:00:02Z", "S1"),
            centered_frame("2024-01-22T10:00:03Z", "S2"),
        ])
        .await;

    assert!(matches!(outcome.report.end, SessionEnd::Disconnected));
    assert_eq!(outcome.report.frames, 3);
    assert_eq!(outcome.report.records_flushed, 1);
    assert_eq!(outcome.report.discarded_samples, 1);
    assert_eq!(outcome.acks.len(), 3);
    assert!(outcome.acks.iter().all(|a| a.status == "ok" && a.asd == "..."));
    assert!(outcome.closed);

    let history = harness.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].stimulus, "S1");
    assert_eq!(history[0].gaze_direction, GazeClass::Center);
    // Stamped with the first S2 frame
    assert_eq!(history[0].timestamp.to_rfc3339(), "2024-01-22T10:00:03+00:00");

    let stats = harness.ctx.stats.snapshot();
    assert_eq!(stats.sessions_opened, 1);
    assert_eq!(stats.records_flushed, 1);
    assert_eq!(stats.buckets_discarded, 1);
}

#[tokio::test]
async fn test_revisited_stimulus_is_not_merged() {
    let harness = Harness::new();
    let outcome = harness
        .run(vec![
            harness.auth_message(),
            centered_frame("2024-01-22T10:00:01Z", "A"),
            centered_frame("2024-01-22T10:00:02Z", "A"),
            centered_frame("2024-01-22T10:00:03Z", "B"),
            centered_frame("2024-01-22T10:00:04Z", "A"),
        ])
        .await;

    assert_eq!(outcome.report.records_flushed, 2);

    // Newest first: B (flushed at t4), then A (flushed at t3)
    let stimuli: Vec<String> = harness.history().into_iter().map(|r| r.stimulus).collect();
    assert_eq!(stimuli, vec!["B".to_string(), "A".to_string()]);
}

#[tokio::test]
async fn test_undecodable_image_continues_with_unknown_gaze() {
    let harness = Harness::new();
    let outcome = harness
        .run(vec![
            harness.auth_message(),
            frame_message("2024-01-22T10:00:01Z", "A", b"not an image at all"),
            centered_frame("2024-01-22T10:00:02Z", "A"),
        ])
        .await;

    assert!(matches!(outcome.report.end, SessionEnd::Disconnected));
    assert_eq!(outcome.acks[0].gaze, GazeClass::Unknown);
    assert_eq!(outcome.acks[1].gaze, GazeClass::Center);
    assert_eq!(harness.ctx.stats.snapshot().frames_undecodable, 1);
}

#[tokio::test]
async fn test_invalid_token_closes_without_acks() {
    let harness = Harness::new();
    let outcome = harness
        .run(vec![
            serde_json::json!({ "token": "forged" }).to_string(),
            centered_frame("2024-01-22T10:00:01Z", "A"),
        ])
        .await;

    match &outcome.report.end {
        SessionEnd::Failed(SessionError::Auth(AuthError::Invalid)) => {}
        other => panic!("unexpected end: {other:?}"),
    }
    assert!(outcome.acks.is_empty());
    assert!(outcome.closed);
    assert!(outcome.report.user_id.is_none());
    assert_eq!(harness.ctx.stats.snapshot().sessions_rejected, 1);
}

#[tokio::test]
async fn test_missing_token_and_malformed_handshake() {
    let harness = Harness::new();

    let outcome = harness.run(vec!["{}".to_string()]).await;
    match &outcome.report.end {
        SessionEnd::Failed(err @ SessionError::Auth(AuthError::Missing)) => {
            assert_eq!(err.stage(), SessionStage::Handshake);
        }
        other => panic!("unexpected end: {other:?}"),
    }

    let outcome = harness.run(vec!["token please".to_string()]).await;
    match &outcome.report.end {
        SessionEnd::Failed(err @ SessionError::MalformedHandshake(_)) => {
            assert_eq!(err.stage(), SessionStage::Handshake);
        }
        other => panic!("unexpected end: {other:?}"),
    }
}

#[tokio::test]
async fn test_revoked_token_is_rejected() {
    let harness = Harness::new();
    assert!(harness.registry.revoke(&harness.token));

    let outcome = harness.run(vec![harness.auth_message()]).await;
    assert!(outcome.report.is_failure());
}

#[tokio::test]
async fn test_malformed_frame_discards_open_bucket() {
    let harness = Harness::new();
    let outcome = harness
        .run(vec![
            harness.auth_message(),
            centered_frame("2024-01-22T10:00:01Z", "A"),
            centered_frame("2024-01-22T10:00:02Z", "B"),
            r#"{"stimulus":"B","frame":""}"#.to_string(),
            centered_frame("2024-01-22T10:00:03Z", "C"),
        ])
        .await;

    match &outcome.report.end {
        SessionEnd::Failed(err) => assert_eq!(err.stage(), SessionStage::Parse),
        other => panic!("unexpected end: {other:?}"),
    }
    // Frames after the failure are never read.
    assert_eq!(outcome.acks.len(), 2);
    assert_eq!(outcome.report.discarded_samples, 1);

    let history = harness.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].stimulus, "A");
}

#[tokio::test]
async fn test_invalid_base64_fails_at_decode_stage() {
    let harness = Harness::new();
    let outcome = harness
        .run(vec![
            harness.auth_message(),
            serde_json::json!({
                "timestamp": "2024-01-22T10:00:01Z",
                "stimulus": "A",
                "frame": "%%% not base64 %%%",
            })
            .to_string(),
        ])
        .await;

    match &outcome.report.end {
        SessionEnd::Failed(err) => assert_eq!(err.stage(), SessionStage::Decode),
        other => panic!("unexpected end: {other:?}"),
    }
    assert!(outcome.acks.is_empty());
}

#[tokio::test]
async fn test_peer_leaving_before_handshake_is_not_a_rejection() {
    let harness = Harness::new();
    let outcome = harness.run(Vec::new()).await;

    assert!(matches!(outcome.report.end, SessionEnd::Disconnected));
    assert!(outcome.closed);
    assert_eq!(harness.ctx.stats.snapshot().sessions_rejected, 0);
}

/// Store that refuses every write.
struct BrokenStore;

impl RecordStore for BrokenStore {
    fn append(&self, _record: &ScreeningRecord) -> Result<(), StoreError> {
        Err(StoreError::Poisoned)
    }

    fn list_by_user(&self, _user_id: &UserId) -> Result<Vec<ScreeningRecord>, StoreError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_store_failure_closes_session_at_persist_stage() {
    let mut harness = Harness::new();
    harness.ctx.store = Arc::new(BrokenStore);

    let outcome = harness
        .run(vec![
            harness.auth_message(),
            centered_frame("2024-01-22T10:00:01Z", "A"),
            centered_frame("2024-01-22T10:00:02Z", "B"),
            centered_frame("2024-01-22T10:00:03Z", "B"),
        ])
        .await;

    match &outcome.report.end {
        SessionEnd::Failed(err) => assert_eq!(err.stage(), SessionStage::Persist),
        other => panic!("unexpected end: {other:?}"),
    }
    // The frame that triggered the failed flush is never acknowledged.
    assert_eq!(outcome.acks.len(), 1);
    assert_eq!(outcome.report.records_flushed, 0);
}

/// Store whose writes block the calling thread for a while.
struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
}

impl RecordStore for SlowStore {
    fn append(&self, record: &ScreeningRecord) -> Result<(), StoreError> {
        std::thread::sleep(self.delay);
        self.inner.append(record)
    }

    fn list_by_user(&self, user_id: &UserId) -> Result<Vec<ScreeningRecord>, StoreError> {
        self.inner.list_by_user(user_id)
    }
}

// Single-threaded runtime: a blocking write on the runtime thread would hold
// up every other session.
#[tokio::test]
async fn test_slow_store_does_not_stall_other_sessions() {
    let mut slow = Harness::new();
    slow.ctx.store = Arc::new(SlowStore {
        inner: MemoryStore::new(),
        delay: Duration::from_secs(1),
    });
    let fast = Harness::new();

    let slow_messages = vec![
        slow.auth_message(),
        centered_frame("2024-01-22T10:00:01Z", "A"),
        centered_frame("2024-01-22T10:00:02Z", "B"),
    ];
    let fast_messages = vec![
        fast.auth_message(),
        centered_frame("2024-01-22T10:00:01Z", "A"),
    ];

    let started = Instant::now();
    let slow_run = async {
        let outcome = slow.run(slow_messages).await;
        (outcome, started.elapsed())
    };
    let fast_run = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = fast.run(fast_messages).await;
        (outcome, started.elapsed())
    };
    let ((slow_outcome, slow_elapsed), (fast_outcome, fast_elapsed)) =
        tokio::join!(slow_run, fast_run);

    assert_eq!(slow_outcome.report.records_flushed, 1);
    assert_eq!(fast_outcome.acks.len(), 1);
    assert!(slow_elapsed >= Duration::from_secs(1));
    assert!(
        fast_elapsed < slow_elapsed,
        "fast session took {fast_elapsed:?}, slow one {slow_elapsed:?}"
    );
}

#[tokio::test]
async fn test_array_handshake_is_malformed() {
    let harness = Harness::new();
    let outcome = harness
        .run(vec![serde_json::json!([harness.token]).to_string()])
        .await;

    match &outcome.report.end {
        SessionEnd::Failed(err @ SessionError::MalformedHandshake(_)) => {
            assert_eq!(err.stage(), SessionStage::Handshake);
        }
        other => panic!("unexpected end: {other:?}"),
    }
    assert!(outcome.acks.is_empty());
}
