//! # Prism Models
//!
//! Domain entities shared by the protocol, the reconciliation store, and
//! the observing client. These are the client-side view of a job run:
//! association records, not the canonical definitions held by external
//! storage.

use serde::{Deserialize, Serialize};

/// Processing status of a single comment within a job run.
///
/// The status is a monotone lattice per job instance:
/// `Idle -> Processing -> {Completed, Failed}`. Once terminal it is never
/// overwritten for the same job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentStatus {
    Idle,
    Processing,
    Completed,
    Failed,
}

impl CommentStatus {
    /// Whether this status is terminal for the current job run
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommentStatus::Completed | CommentStatus::Failed)
    }
}

/// A comment travelling through the analysis pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    /// Stable comment ID (assigned at batch submission)
    pub id: String,
    /// Current processing status
    pub status: CommentStatus,
    /// Job this comment belongs to, once one has claimed it
    #[serde(default)]
    pub job_id: Option<String>,
    /// Insight associations, append-only until the comment is terminal
    #[serde(default)]
    pub insight_ids: Vec<i64>,
}

impl Comment {
    /// Create an idle comment not yet claimed by any job
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: CommentStatus::Idle,
            job_id: None,
            insight_ids: Vec::new(),
        }
    }
}

/// Partial update for a comment. Fields left `None` are preserved on merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentPatch {
    pub id: String,
    #[serde(default)]
    pub status: Option<CommentStatus>,
    #[serde(default)]
    pub job_id: Option<String>,
}

impl CommentPatch {
    /// Patch that only names the comment (pure upsert-if-missing)
    pub fn id_only(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: None,
            job_id: None,
        }
    }

    /// Patch that sets the status
    pub fn with_status(id: impl Into<String>, status: CommentStatus) -> Self {
        Self {
            id: id.into(),
            status: Some(status),
            job_id: None,
        }
    }
}

/// How an insight association came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightOrigin {
    /// No acceptable vocabulary entry existed; a new category was minted
    Created,
    /// The candidate resolved to an existing vocabulary entry
    Matched,
}

/// An insight-to-comment association as seen by this layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Insight {
    /// Canonical insight ID from external storage
    pub id: i64,
    /// Created vs. matched, mirrored from the wire
    #[serde(rename = "type")]
    pub origin: InsightOrigin,
    /// Owning comment (exactly one, in this layer's view)
    pub comment_id: String,
}

impl Insight {
    pub fn created(id: i64, comment_id: impl Into<String>) -> Self {
        Self {
            id,
            origin: InsightOrigin::Created,
            comment_id: comment_id.into(),
        }
    }

    pub fn matched(id: i64, comment_id: impl Into<String>) -> Self {
        Self {
            id,
            origin: InsightOrigin::Matched,
            comment_id: comment_id.into(),
        }
    }
}

/// Aggregate status of the current job run, derived by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    #[default]
    Idle,
    Processing,
    Completed,
    Error,
}

/// Per-status comment counts, computed live from the store maps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub idle: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}
