//! # Job/Comment Protocol
//!
//! The wire contract between a processing backend and its observers:
//! job phase enumeration, the closed tagged union of server messages,
//! and the client subscription message. Phases are informational - the
//! transport is at-least-once and consumers must stay idempotent, so no
//! message kind here is a guarantee of exactly-once or in-order
//! delivery across jobs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Analysis phase of a job.
///
/// Happy-path progression is `initializing -> fetching_data -> analyzing
/// -> creating_insights -> {completed | failed}` with no skipped phase,
/// but consumers must not assume delivery preserves this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Initializing,
    FetchingData,
    Analyzing,
    CreatingInsights,
    Completed,
    Failed,
}

impl JobPhase {
    /// Next phase on the happy path. Terminal phases stay put.
    pub fn advance(self) -> Self {
        match self {
            JobPhase::Initializing => JobPhase::FetchingData,
            JobPhase::FetchingData => JobPhase::Analyzing,
            JobPhase::Analyzing => JobPhase::CreatingInsights,
            JobPhase::CreatingInsights => JobPhase::Completed,
            JobPhase::Completed => JobPhase::Completed,
            JobPhase::Failed => JobPhase::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Completed | JobPhase::Failed)
    }
}

/// Payload of `job:started`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobStarted {
    pub job_id: String,
    pub comment_ids: Vec<String>,
}

/// Payload of the incremental `insight:created` / `insight:matched`
/// association events
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InsightEvent {
    pub comment_id: String,
    pub insight_id: i64,
}

/// Payload of `job:failed`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    pub error: String,
}

/// Payload of `subscription:confirmed`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionConfirmed {
    pub job_ids: Vec<String>,
}

/// One `(commentId, insightId)` association from a completion payload
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InsightRelationship {
    pub comment_id: String,
    pub insight_id: i64,
    /// Whether the insight was newly minted rather than matched
    pub is_new: bool,
}

/// Detail block carried only by terminal `state:changed` messages:
/// `relationships` on `completed`, `error` on `failed`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StateDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationships: Option<Vec<InsightRelationship>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StateDetails {
    pub fn completed(relationships: Vec<InsightRelationship>) -> Self {
        Self {
            relationships: Some(relationships),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            relationships: None,
            error: Some(error.into()),
        }
    }
}

/// Payload of `state:changed`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StateChanged {
    pub job_id: String,
    pub state: JobPhase,
    pub comment_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_comment_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_comments: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_to_process: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<StateDetails>,
}

impl StateChanged {
    /// Minimal phase notification without progress counters
    pub fn phase(job_id: impl Into<String>, state: JobPhase, comment_ids: Vec<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state,
            comment_ids,
            progress: None,
            current_comment_index: None,
            total_comments: None,
            processed_count: None,
            total_to_process: None,
            details: None,
        }
    }
}

/// Server-to-client messages, each on the wire as `{type, data}`.
///
/// Matched exhaustively by consumers; additions here are breaking
/// protocol changes by design.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// Transport is ready; no payload
    #[serde(rename = "connection:established")]
    ConnectionEstablished,

    /// Registers a new job and its comment membership
    #[serde(rename = "job:started")]
    JobStarted(JobStarted),

    /// Phase transition plus optional progress counters
    #[serde(rename = "state:changed")]
    StateChanged(StateChanged),

    /// Incremental association: a new insight was minted for a comment
    #[serde(rename = "insight:created")]
    InsightCreated(InsightEvent),

    /// Incremental association: an existing insight was matched
    #[serde(rename = "insight:matched")]
    InsightMatched(InsightEvent),

    /// Terminal job-level success signal (empty payload)
    #[serde(rename = "job:completed")]
    JobCompleted,

    /// Terminal job-level failure signal
    #[serde(rename = "job:failed")]
    JobFailed(JobFailure),

    /// Acknowledges a client's per-job subscription request
    #[serde(rename = "subscription:confirmed")]
    SubscriptionConfirmed(SubscriptionConfirmed),
}

impl ServerMessage {
    /// Wire tag of this message kind
    pub fn tag(&self) -> &'static str {
        match self {
            ServerMessage::ConnectionEstablished => "connection:established",
            ServerMessage::JobStarted(_) => "job:started",
            ServerMessage::StateChanged(_) => "state:changed",
            ServerMessage::InsightCreated(_) => "insight:created",
            ServerMessage::InsightMatched(_) => "insight:matched",
            ServerMessage::JobCompleted => "job:completed",
            ServerMessage::JobFailed(_) => "job:failed",
            ServerMessage::SubscriptionConfirmed(_) => "subscription:confirmed",
        }
    }

    /// Job this message is scoped to, if it is job-scoped rather than
    /// connection-scoped
    pub fn job_id(&self) -> Option<&str> {
        match self {
            ServerMessage::JobStarted(started) => Some(&started.job_id),
            ServerMessage::StateChanged(change) => Some(&change.job_id),
            _ => None,
        }
    }

    /// Decode one wire envelope. Malformed input is a boundary error the
    /// consumer logs and drops without crashing its loop.
    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Client-to-server messages, flat `{type, ...}` on the wire
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Request job-scoped updates for the listed jobs
    #[serde(rename = "subscribe:jobs")]
    #[serde(rename_all = "camelCase")]
    SubscribeJobs { job_ids: Vec<String> },
}

impl ClientMessage {
    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
