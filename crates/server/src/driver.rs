//! # Analysis Driver
//!
//! Stand-in for the out-of-scope LLM classification agents. Walks a job
//! through the happy-path phases and emits the wire protocol exactly the
//! way the real backend does, including the deliberate dual emission of
//! insight facts (incremental `insight:*` events plus the completion
//! `details` list) that consumers must deduplicate.

use std::time::Duration;

use prism_core::matcher::{resolve, NO_INSIGHT};
use prism_core::protocol::{
    InsightEvent, InsightRelationship, JobPhase, JobStarted, ServerMessage, StateChanged,
    StateDetails,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// One comment submitted for analysis
#[derive(Debug, Clone)]
pub struct SubmittedComment {
    pub id: String,
    pub text: String,
}

/// A job handed to the driver
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub job_id: String,
    pub comments: Vec<SubmittedComment>,
}

/// Driver tuning
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Closed insight vocabulary, supplied out-of-band
    pub vocabulary: Vec<String>,
    /// Pause between phases so observers see the progression
    pub step_delay: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            vocabulary: Vec::new(),
            step_delay: Duration::from_millis(50),
        }
    }
}

/// Run one job asynchronously, emitting protocol messages on the stream.
///
/// Send failures mean nobody is listening; the driver keeps going, the
/// protocol is fire-and-forget from its side.
pub fn spawn_analysis(
    job: AnalysisJob,
    config: DriverConfig,
    stream: broadcast::Sender<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let comment_ids: Vec<String> = job.comments.iter().map(|c| c.id.clone()).collect();
        let total = comment_ids.len();

        tracing::info!(job_id = %job.job_id, comments = total, "analysis run starting");

        let _ = stream.send(ServerMessage::JobStarted(JobStarted {
            job_id: job.job_id.clone(),
            comment_ids: comment_ids.clone(),
        }));

        let mut phase = JobPhase::Initializing;
        for _ in 0..2 {
            let _ = stream.send(ServerMessage::StateChanged(StateChanged::phase(
                &job.job_id,
                phase,
                comment_ids.clone(),
            )));
            tokio::time::sleep(config.step_delay).await;
            phase = phase.advance();
        }

        // Analyzing: classify each comment, stream per-comment progress
        let mut relationships = Vec::with_capacity(total);
        let mut minted = 0i64;
        for (index, comment) in job.comments.iter().enumerate() {
            let _ = stream.send(ServerMessage::StateChanged(StateChanged {
                progress: Some(index as f32 / total.max(1) as f32 * 100.0),
                current_comment_index: Some(index),
                total_comments: Some(total),
                ..StateChanged::phase(&job.job_id, JobPhase::Analyzing, comment_ids.clone())
            }));

            let (insight_id, is_new) = classify(&comment.text, &config.vocabulary, &mut minted);
            let event = InsightEvent {
                comment_id: comment.id.clone(),
                insight_id,
            };
            let _ = stream.send(if is_new {
                ServerMessage::InsightCreated(event)
            } else {
                ServerMessage::InsightMatched(event)
            });
            relationships.push(InsightRelationship {
                comment_id: comment.id.clone(),
                insight_id,
                is_new,
            });
            tokio::time::sleep(config.step_delay).await;
        }

        let _ = stream.send(ServerMessage::StateChanged(StateChanged {
            processed_count: Some(total),
            total_to_process: Some(total),
            ..StateChanged::phase(&job.job_id, JobPhase::CreatingInsights, comment_ids.clone())
        }));
        tokio::time::sleep(config.step_delay).await;

        // Completion details intentionally repeat the incremental events
        let _ = stream.send(ServerMessage::StateChanged(StateChanged {
            progress: Some(100.0),
            details: Some(StateDetails::completed(relationships)),
            ..StateChanged::phase(&job.job_id, JobPhase::Completed, comment_ids.clone())
        }));
        let _ = stream.send(ServerMessage::JobCompleted);

        tracing::info!(job_id = %job.job_id, "analysis run completed");
    })
}

/// Toy classifier: the candidate label is the comment text itself,
/// repaired through the matcher. Unresolvable candidates mint a new
/// category; the sentinel means "no applicable category" and still gets
/// an association so the comment resolves.
fn classify(text: &str, vocabulary: &[String], minted: &mut i64) -> (i64, bool) {
    match resolve(text, vocabulary) {
        Some(label) if label != NO_INSIGHT => {
            let index = vocabulary
                .iter()
                .position(|entry| *entry == label)
                .unwrap_or(0);
            (index as i64 + 1, false)
        }
        _ => {
            *minted += 1;
            (1000 + *minted, true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vec<String> {
        vec![
            "Cannot schedule appointment".to_string(),
            "App crashes frequently".to_string(),
        ]
    }

    #[tokio::test]
    async fn test_driver_emits_full_happy_path() {
        let (tx, mut rx) = broadcast::channel(64);
        let job = AnalysisJob {
            job_id: "j1".to_string(),
            comments: vec![
                SubmittedComment {
                    id: "c1".to_string(),
                    text: "app crashes".to_string(),
                },
                SubmittedComment {
                    id: "c2".to_string(),
                    text: "something entirely new".to_string(),
                },
            ],
        };
        let config = DriverConfig {
            vocabulary: vocab(),
            step_delay: Duration::from_millis(1),
        };

        spawn_analysis(job, config, tx).await.unwrap();

        let mut tags = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            tags.push(msg.tag());
        }
        assert_eq!(tags.first(), Some(&"job:started"));
        assert_eq!(tags.last(), Some(&"job:completed"));
        assert!(tags.contains(&"insight:matched"));
        assert!(tags.contains(&"insight:created"));
    }

    #[test]
    fn test_classifier_matches_before_minting() {
        let mut minted = 0;
        let (id, is_new) = classify("App crashes", &vocab(), &mut minted);
        assert_eq!(id, 2);
        assert!(!is_new);

        let (id, is_new) = classify("totally unrelated", &vocab(), &mut minted);
        assert_eq!(id, 1001);
        assert!(is_new);
        assert_eq!(minted, 1);
    }
}
