//! Live screening session over a message-oriented transport.
//!
//! One session owns one stream and runs through three states:
//!
//! ```text
//!  AwaitingAuth ──token ok──▶ Streaming ──disconnect / error──▶ Closed
//!        │                                                       ▲
//!        └──────────── missing / invalid token ──────────────────┘
//! ```
//!
//! Frames are handled strictly in order: a frame is parsed, analyzed,
//! aggregated (persisting a record on stimulus transitions) and acknowledged
//! before the next message is read. No error payload is ever sent; failures
//! are visible to the client only as the connection closing.

use crate::auth::{AuthError, Authenticator};
use crate::core::{FrameAnalyzer, GazeClass, StimulusAggregator, UserId};
use crate::stats::SharedPipelineStats;
use crate::store::{RecordStore, StoreError};
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Placeholder carried in every acknowledgment; no real-time verdict is made.
pub const ASD_PLACEHOLDER: &str = "...";

/// Failure reported by the underlying transport.
#[derive(Debug, Clone, Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// Message-oriented, text-framed duplex stream.
pub trait FrameTransport: Send {
    /// Next text message, or `None` once the peer has gone away.
    fn recv(&mut self) -> impl Future<Output = Option<Result<String, TransportError>>> + Send;

    fn send(&mut self, text: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close without any payload.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// First client message.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthMessage {
    #[serde(default)]
    pub token: Option<String>,
}

/// One inbound camera frame.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameMessage {
    #[serde(deserialize_with = "deserialize_iso_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub stimulus: String,
    /// Base64-encoded image
    pub frame: String,
}

/// Frame message that failed schema validation.
#[derive(Debug, Error)]
#[error("invalid frame message: {0}")]
pub struct FrameParseError(#[from] serde_json::Error);

impl FrameMessage {
    pub fn parse(text: &str) -> Result<Self, FrameParseError> {
        Ok(from_json_object(text)?)
    }

    pub fn decode_image(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(self.frame.trim())
    }
}

/// Deserialize a message that must be a JSON object. Arrays and scalars
/// are rejected even when their elements line up with the struct fields.
pub fn from_json_object<T: DeserializeOwned>(text: &str) -> Result<T, serde_json::Error> {
    match serde_json::from_str::<Value>(text)? {
        value @ Value::Object(_) => serde_json::from_value(value),
        other => Err(serde::de::Error::custom(format!(
            "expected a JSON object, found {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Per-frame acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameAck {
    pub status: String,
    pub gaze: GazeClass,
    pub asd: String,
}

impl FrameAck {
    pub fn ok(gaze: GazeClass) -> Self {
        Self {
            status: "ok".to_string(),
            gaze,
            asd: ASD_PLACEHOLDER.to_string(),
        }
    }
}

/// Parse an ISO-8601 instant. Values without an offset are taken as UTC.
pub fn parse_iso_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn deserialize_iso_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_iso_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid ISO-8601 timestamp '{raw}'")))
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingAuth,
    Streaming,
    Closed,
}

/// Pipeline stage a failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    Handshake,
    Parse,
    Decode,
    Analyze,
    Persist,
    Transport,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStage::Handshake => "handshake",
            SessionStage::Parse => "parse",
            SessionStage::Decode => "decode",
            SessionStage::Analyze => "analyze",
            SessionStage::Persist => "persist",
            SessionStage::Transport => "transport",
        };
        f.write_str(name)
    }
}

/// Unrecoverable session failure. Every variant closes the connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("handshake rejected: {0}")]
    Auth(#[from] AuthError),

    #[error("malformed handshake message: {0}")]
    MalformedHandshake(serde_json::Error),

    #[error(transparent)]
    MalformedFrame(#[from] FrameParseError),

    #[error("frame payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("frame analysis task failed: {0}")]
    Analyze(tokio::task::JoinError),

    #[error("failed to persist record: {0}")]
    Persist(#[from] StoreError),

    #[error("record persistence task failed: {0}")]
    PersistTask(tokio::task::JoinError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    pub fn stage(&self) -> SessionStage {
        match self {
            SessionError::Auth(_) | SessionError::MalformedHandshake(_) => SessionStage::Handshake,
            SessionError::MalformedFrame(_) => SessionStage::Parse,
            SessionError::Base64(_) => SessionStage::Decode,
            SessionError::Analyze(_) => SessionStage::Analyze,
            SessionError::Persist(_) | SessionError::PersistTask(_) => SessionStage::Persist,
            SessionError::Transport(_) => SessionStage::Transport,
        }
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The peer went away (before or after the handshake)
    Disconnected,
    Failed(SessionError),
}

/// What a finished session did.
#[derive(Debug)]
pub struct SessionReport {
    pub user_id: Option<UserId>,
    pub frames: u64,
    pub records_flushed: u64,
    /// Samples in the bucket that was still open at close
    pub discarded_samples: usize,
    pub end: SessionEnd,
}

impl SessionReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.end, SessionEnd::Failed(_))
    }
}

/// Shared collaborators a session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub authenticator: Arc<dyn Authenticator>,
    pub store: Arc<dyn RecordStore>,
    pub analyzer: Arc<FrameAnalyzer>,
    pub stats: SharedPipelineStats,
}

/// A single live stream.
pub struct ConnectionSession<T> {
    transport: T,
    ctx: SessionContext,
    state: SessionState,
    user_id: Option<UserId>,
    frames: u64,
    records_flushed: u64,
}

impl<T: FrameTransport> ConnectionSession<T> {
    pub fn new(transport: T, ctx: SessionContext) -> Self {
        Self {
            transport,
            ctx,
            state: SessionState::AwaitingAuth,
            user_id: None,
            frames: 0,
            records_flushed: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to completion.
    pub async fn run(mut self) -> SessionReport {
        let mut aggregator = None;
        let result = self.drive(&mut aggregator).await;

        let discarded_samples = aggregator
            .as_mut()
            .and_then(StimulusAggregator::discard)
            .map_or(0, |bucket| {
                self.ctx.stats.record_discard();
                tracing::info!(
                    stimulus = %bucket.stimulus,
                    samples = bucket.len(),
                    "Dropping unflushed stimulus bucket at session close"
                );
                bucket.len()
            });

        let end = match result {
            Ok(()) => SessionEnd::Disconnected,
            Err(e) => {
                tracing::warn!(stage = %e.stage(), error = %e, "Screening session failed");
                SessionEnd::Failed(e)
            }
        };

        self.transport.close().await;
        self.transition(SessionState::Closed);

        tracing::info!(
            user = self.user_id.as_ref().map(UserId::as_str).unwrap_or("-"),
            frames = self.frames,
            records = self.records_flushed,
            "Screening session closed"
        );

        SessionReport {
            user_id: self.user_id,
            frames: self.frames,
            records_flushed: self.records_flushed,
            discarded_samples,
            end,
        }
    }

    async fn drive(
        &mut self,
        aggregator: &mut Option<StimulusAggregator>,
    ) -> Result<(), SessionError> {
        let user_id = match self.handshake().await {
            Ok(Some(user_id)) => user_id,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.ctx.stats.record_session_rejected();
                return Err(e);
            }
        };

        self.ctx.stats.record_session_opened();
        tracing::info!(user = %user_id, "Screening session authenticated");
        self.user_id = Some(user_id.clone());
        self.transition(SessionState::Streaming);

        let aggregator = aggregator.insert(StimulusAggregator::new(user_id));
        while let Some(message) = self.transport.recv().await {
            let text = message?;
            self.handle_frame(&text, aggregator).await?;
        }
        Ok(())
    }

    /// Read and validate the credential message. `None` if the peer left.
    async fn handshake(&mut self) -> Result<Option<UserId>, SessionError> {
        let Some(message) = self.transport.recv().await else {
            return Ok(None);
        };
        let text = message?;
        let auth: AuthMessage =
            from_json_object(&text).map_err(SessionError::MalformedHandshake)?;
        let token = auth.token.ok_or(AuthError::Missing)?;

        // Token lookup may hit the database
        let authenticator = Arc::clone(&self.ctx.authenticator);
        let user_id = tokio::task::spawn_blocking(move || authenticator.validate(&token))
            .await
            .map_err(|e| AuthError::Backend(e.to_string()))??;
        Ok(Some(user_id))
    }

    async fn handle_frame(
        &mut self,
        text: &str,
        aggregator: &mut StimulusAggregator,
    ) -> Result<(), SessionError> {
        let frame = FrameMessage::parse(text)?;
        let image_bytes = frame.decode_image()?;

        let analyzer = Arc::clone(&self.ctx.analyzer);
        let analysis = tokio::task::spawn_blocking(move || analyzer.analyze(&image_bytes))
            .await
            .map_err(SessionError::Analyze)?;
        self.ctx.stats.record_frame(analysis.is_undecodable());
        if analysis.is_undecodable() {
            tracing::debug!(stimulus = %frame.stimulus, "Frame image did not decode; using neutral sample");
        }

        let sample = analysis.sample();
        if let Some(record) = aggregator.observe(&frame.stimulus, frame.timestamp, sample) {
            let store = Arc::clone(&self.ctx.store);
            let record = tokio::task::spawn_blocking(move || store.append(&record).map(|()| record))
                .await
                .map_err(SessionError::PersistTask)??;
            self.ctx.stats.record_flush();
            self.records_flushed += 1;
            tracing::info!(
                stimulus = %record.stimulus,
                gaze = %record.gaze_direction,
                left = record.left_pupil_size,
                right = record.right_pupil_size,
                asd_flag = %record.asd_flag,
                "Flushed stimulus record"
            );
        }
        self.frames += 1;

        let ack = serde_json::to_string(&FrameAck::ok(sample.gaze))
            .map_err(|e| TransportError(e.to_string()))?;
        self.transport.send(ack).await?;
        Ok(())
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(from = ?self.state, to = ?next, "Session state change");
        self.state = next;
    }
}

/// Run one session over `transport` to completion.
pub async fn run_session<T: FrameTransport>(transport: T, ctx: SessionContext) -> SessionReport {
    ConnectionSession::new(transport, ctx).run().await
}
