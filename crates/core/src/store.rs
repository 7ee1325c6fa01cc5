//! # Reconciliation Store
//!
//! Client-side normalized entity store fed by protocol messages. The
//! transport is at-least-once, so every mutation here is an idempotent
//! upsert: applying the same update twice leaves state identical to
//! applying it once, and duplicated `(commentId, insightId)` facts from
//! the incremental events and the completion details collapse to one
//! association.
//!
//! The store is a plain single-writer struct; the consumer loop owns it
//! behind an `Arc<RwLock<_>>` so readers never observe a partial update.

use std::collections::HashMap;

use serde::Serialize;

use crate::models::{AnalysisStatus, Comment, CommentPatch, CommentStatus, Insight, StatusCounts};

/// Normalized view of the current analysis run
#[derive(Debug, Default)]
pub struct ReconciliationStore {
    comments: HashMap<String, Comment>,
    insights: HashMap<i64, Insight>,
    /// All known comment IDs, insertion order
    comment_ids: Vec<String>,
    /// Comments still in flight for the current job
    active_comment_ids: Vec<String>,
    status: AnalysisStatus,
    job_id: Option<String>,
    error: Option<String>,
    /// Set on disconnect; all state is suspect until fresh job traffic
    stale: bool,
}

/// Point-in-time read view, computed live from the maps
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub status: AnalysisStatus,
    pub job_id: Option<String>,
    pub progress_percent: f32,
    pub counts: StatusCounts,
    pub error: Option<String>,
    pub stale: bool,
}

impl ReconciliationStore {
    pub fn new() -> Self {
        Self::default()
    }

    // === Read views ===

    pub fn comment(&self, id: &str) -> Option<&Comment> {
        self.comments.get(id)
    }

    pub fn insight(&self, id: i64) -> Option<&Insight> {
        self.insights.get(&id)
    }

    pub fn comment_ids(&self) -> &[String] {
        &self.comment_ids
    }

    pub fn active_comment_ids(&self) -> &[String] {
        &self.active_comment_ids
    }

    pub fn status(&self) -> AnalysisStatus {
        self.status
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Share of known comments that reached a terminal status, 0..=100
    pub fn progress_percent(&self) -> f32 {
        if self.comment_ids.is_empty() {
            return 0.0;
        }
        let terminal = self
            .comment_ids
            .iter()
            .filter_map(|id| self.comments.get(id))
            .filter(|comment| comment.status.is_terminal())
            .count();
        terminal as f32 / self.comment_ids.len() as f32 * 100.0
    }

    /// Comment counts by status, always computed from the live map
    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for comment in self.comments.values() {
            match comment.status {
                CommentStatus::Idle => counts.idle += 1,
                CommentStatus::Processing => counts.processing += 1,
                CommentStatus::Completed => counts.completed += 1,
                CommentStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            status: self.status,
            job_id: self.job_id.clone(),
            progress_percent: self.progress_percent(),
            counts: self.status_counts(),
            error: self.error.clone(),
            stale: self.stale,
        }
    }

    // === Mutations (all idempotent) ===

    /// Merge-insert comments. Fields absent from a patch are preserved,
    /// and a terminal status is never overwritten by a patch.
    pub fn upsert_comments(&mut self, patches: Vec<CommentPatch>) {
        for patch in patches {
            match self.comments.get_mut(&patch.id) {
                Some(existing) => {
                    if let Some(status) = patch.status {
                        if !existing.status.is_terminal() {
                            existing.status = status;
                        }
                    }
                    if let Some(job_id) = patch.job_id {
                        existing.job_id = Some(job_id);
                    }
                }
                None => {
                    let mut comment = Comment::new(patch.id.clone());
                    if let Some(status) = patch.status {
                        comment.status = status;
                    }
                    comment.job_id = patch.job_id;
                    self.comment_ids.push(patch.id.clone());
                    self.comments.insert(patch.id, comment);
                }
            }
        }
    }

    /// Begin a new job run over the given comments.
    ///
    /// A fresh `job:started` opens a new job instance, so every listed
    /// comment is (re)initialized to `Processing` regardless of its
    /// previous status. Existing insight associations are kept; pruning
    /// them is a storage-layer concern.
    pub fn start_processing(&mut self, comment_ids: &[String], job_id: &str) {
        self.job_id = Some(job_id.to_string());
        self.error = None;
        self.stale = false;
        self.active_comment_ids.clear();

        for id in comment_ids {
            match self.comments.get_mut(id) {
                Some(comment) => {
                    comment.status = CommentStatus::Processing;
                    comment.job_id = Some(job_id.to_string());
                }
                None => {
                    let mut comment = Comment::new(id.clone());
                    comment.status = CommentStatus::Processing;
                    comment.job_id = Some(job_id.to_string());
                    self.comment_ids.push(id.clone());
                    self.comments.insert(id.clone(), comment);
                }
            }
            if !self.active_comment_ids.contains(id) {
                self.active_comment_ids.push(id.clone());
            }
        }

        self.recompute_status();
    }

    /// Attach an insight to a comment.
    ///
    /// No-op when the comment is unknown (the store never invents
    /// membership) or already terminal (`insight_ids` is append-only
    /// until terminal). Duplicate `(comment, insight)` deliveries leave
    /// exactly one association.
    pub fn add_insight(&mut self, comment_id: &str, insight: Insight) {
        let Some(comment) = self.comments.get_mut(comment_id) else {
            tracing::warn!(comment_id, insight_id = insight.id, "insight for unknown comment, ignoring");
            return;
        };
        if comment.status.is_terminal() {
            tracing::debug!(comment_id, insight_id = insight.id, "comment already terminal, insight ignored");
            return;
        }
        if !comment.insight_ids.contains(&insight.id) {
            comment.insight_ids.push(insight.id);
        }
        self.insights.entry(insight.id).or_insert(insight);
    }

    /// Mark the listed comments completed
    pub fn complete_comments(&mut self, comment_ids: &[String]) {
        self.resolve_comments(comment_ids, CommentStatus::Completed);
    }

    /// Mark the listed comments failed
    pub fn fail_comments(&mut self, comment_ids: &[String]) {
        self.resolve_comments(comment_ids, CommentStatus::Failed);
    }

    /// Authoritative job-level success. Any comment the backend left
    /// unresolved is absorbed as completed so the aggregate can never
    /// wedge in `processing`.
    pub fn complete_job(&mut self) {
        if !self.active_comment_ids.is_empty() {
            tracing::warn!(
                remaining = self.active_comment_ids.len(),
                "job completed with comments still active, resolving them"
            );
            let remaining = self.active_comment_ids.clone();
            self.resolve_comments(&remaining, CommentStatus::Completed);
        }
        self.recompute_status();
    }

    /// Authoritative job-level failure: stores the error and fails every
    /// remaining active comment.
    pub fn fail_job(&mut self, error: &str) {
        self.error = Some(error.to_string());
        let remaining = self.active_comment_ids.clone();
        self.resolve_comments(&remaining, CommentStatus::Failed);
    }

    /// Flag all state as suspect after a transport loss. There is no
    /// resumption or replay; only fresh job traffic clears the flag.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Fresh job traffic arrived; state is live again
    pub fn clear_stale(&mut self) {
        self.stale = false;
    }

    fn resolve_comments(&mut self, comment_ids: &[String], terminal: CommentStatus) {
        for id in comment_ids {
            match self.comments.get_mut(id) {
                Some(comment) if comment.status.is_terminal() => {
                    // Duplicate delivery: terminal is never overwritten
                }
                Some(comment) => comment.status = terminal,
                None => {
                    tracing::warn!(comment_id = %id, "terminal signal for unknown comment, ignoring");
                }
            }
        }
        self.active_comment_ids.retain(|id| !comment_ids.contains(id));
        self.recompute_status();
    }

    fn recompute_status(&mut self) {
        self.status = if !self.active_comment_ids.is_empty() {
            AnalysisStatus::Processing
        } else if self.error.is_some() || self.any_failed() {
            AnalysisStatus::Error
        } else if self.job_id.is_some() {
            AnalysisStatus::Completed
        } else {
            AnalysisStatus::Idle
        };
    }

    fn any_failed(&self) -> bool {
        self.comments
            .values()
            .any(|comment| comment.status == CommentStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_aggregate_status_over_a_run() {
        let mut store = ReconciliationStore::new();
        store.start_processing(&ids(&["c1", "c2"]), "j1");
        assert_eq!(store.status(), AnalysisStatus::Processing);

        store.complete_comments(&ids(&["c1"]));
        assert_eq!(store.status(), AnalysisStatus::Processing);

        store.complete_comments(&ids(&["c2"]));
        assert_eq!(store.status(), AnalysisStatus::Completed);
        assert!(store.active_comment_ids().is_empty());
    }

    #[test]
    fn test_failure_wins_aggregate() {
        let mut store = ReconciliationStore::new();
        store.start_processing(&ids(&["c1", "c2"]), "j1");
        store.fail_comments(&ids(&["c1"]));
        store.complete_comments(&ids(&["c2"]));
        assert_eq!(store.status(), AnalysisStatus::Error);
    }

    #[test]
    fn test_terminal_status_is_never_overwritten() {
        let mut store = ReconciliationStore::new();
        store.start_processing(&ids(&["c1"]), "j1");
        store.fail_comments(&ids(&["c1"]));
        store.complete_comments(&ids(&["c1"]));
        assert_eq!(store.comment("c1").unwrap().status, CommentStatus::Failed);

        // Upserts cannot resurrect a terminal comment either
        store.upsert_comments(vec![CommentPatch::with_status("c1", CommentStatus::Processing)]);
        assert_eq!(store.comment("c1").unwrap().status, CommentStatus::Failed);
    }

    #[test]
    fn test_add_insight_is_set_like() {
        let mut store = ReconciliationStore::new();
        store.start_processing(&ids(&["c1"]), "j1");

        store.add_insight("c1", Insight::matched(7, "c1"));
        store.add_insight("c1", Insight::matched(7, "c1"));
        store.add_insight("c1", Insight::created(8, "c1"));

        let comment = store.comment("c1").unwrap();
        assert_eq!(comment.insight_ids, vec![7, 8]);
        assert!(store.insight(7).is_some());
    }

    #[test]
    fn test_add_insight_unknown_comment_is_noop() {
        let mut store = ReconciliationStore::new();
        store.add_insight("ghost", Insight::matched(1, "ghost"));
        assert!(store.insight(1).is_none());
        assert!(store.comment("ghost").is_none());
    }

    #[test]
    fn test_replay_with_duplicates_matches_deduplicated_replay() {
        let mut replayed = ReconciliationStore::new();
        replayed.start_processing(&ids(&["c1", "c2"]), "j1");
        replayed.start_processing(&ids(&["c1", "c2"]), "j1");
        replayed.add_insight("c1", Insight::matched(7, "c1"));
        replayed.add_insight("c1", Insight::matched(7, "c1"));
        replayed.complete_comments(&ids(&["c1"]));
        replayed.complete_comments(&ids(&["c1"]));
        replayed.complete_comments(&ids(&["c2"]));

        let mut clean = ReconciliationStore::new();
        clean.start_processing(&ids(&["c1", "c2"]), "j1");
        clean.add_insight("c1", Insight::matched(7, "c1"));
        clean.complete_comments(&ids(&["c1"]));
        clean.complete_comments(&ids(&["c2"]));

        assert_eq!(replayed.status(), clean.status());
        assert_eq!(replayed.comment_ids(), clean.comment_ids());
        assert_eq!(replayed.active_comment_ids(), clean.active_comment_ids());
        assert_eq!(
            replayed.comment("c1").unwrap().insight_ids,
            clean.comment("c1").unwrap().insight_ids
        );
        assert_eq!(replayed.status_counts(), clean.status_counts());
    }

    #[test]
    fn test_job_failure_fails_remaining_active() {
        let mut store = ReconciliationStore::new();
        store.start_processing(&ids(&["c1", "c2"]), "j1");
        store.complete_comments(&ids(&["c1"]));
        store.fail_job("agent pipeline crashed");

        assert_eq!(store.status(), AnalysisStatus::Error);
        assert_eq!(store.error(), Some("agent pipeline crashed"));
        assert_eq!(store.comment("c1").unwrap().status, CommentStatus::Completed);
        assert_eq!(store.comment("c2").unwrap().status, CommentStatus::Failed);
    }

    #[test]
    fn test_job_completed_resolves_stragglers() {
        let mut store = ReconciliationStore::new();
        store.start_processing(&ids(&["c1", "c2"]), "j1");
        store.complete_comments(&ids(&["c1"]));
        store.complete_job();

        assert_eq!(store.status(), AnalysisStatus::Completed);
        assert_eq!(store.comment("c2").unwrap().status, CommentStatus::Completed);
    }

    #[test]
    fn test_progress_and_counts_are_derived_live() {
        let mut store = ReconciliationStore::new();
        store.start_processing(&ids(&["c1", "c2", "c3", "c4"]), "j1");
        assert_eq!(store.progress_percent(), 0.0);

        store.complete_comments(&ids(&["c1", "c2"]));
        assert_eq!(store.progress_percent(), 50.0);
        let counts = store.status_counts();
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.processing, 2);

        store.fail_comments(&ids(&["c3"]));
        store.complete_comments(&ids(&["c4"]));
        assert_eq!(store.progress_percent(), 100.0);
    }

    #[test]
    fn test_new_job_reinitializes_terminal_comments() {
        let mut store = ReconciliationStore::new();
        store.start_processing(&ids(&["c1"]), "j1");
        store.complete_comments(&ids(&["c1"]));
        assert_eq!(store.status(), AnalysisStatus::Completed);

        store.start_processing(&ids(&["c1"]), "j2");
        assert_eq!(store.comment("c1").unwrap().status, CommentStatus::Processing);
        assert_eq!(store.comment("c1").unwrap().job_id.as_deref(), Some("j2"));
        assert_eq!(store.status(), AnalysisStatus::Processing);
    }

    #[test]
    fn test_staleness_cleared_by_fresh_job() {
        let mut store = ReconciliationStore::new();
        store.mark_stale();
        assert!(store.is_stale());
        store.start_processing(&ids(&["c1"]), "j1");
        assert!(!store.is_stale());
    }

    #[test]
    fn test_upsert_preserves_absent_fields() {
        let mut store = ReconciliationStore::new();
        store.start_processing(&ids(&["c1"]), "j1");
        store.add_insight("c1", Insight::matched(7, "c1"));

        store.upsert_comments(vec![CommentPatch::id_only("c1")]);
        let comment = store.comment("c1").unwrap();
        assert_eq!(comment.status, CommentStatus::Processing);
        assert_eq!(comment.job_id.as_deref(), Some("j1"));
        assert_eq!(comment.insight_ids, vec![7]);
    }
}
