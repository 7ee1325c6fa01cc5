//! # Observing Client
//!
//! Consumes the wire protocol from a transport, applies it to the
//! reconciliation store, and re-publishes every applied message on the
//! event bus so in-process components can react without polling.
//!
//! ## Architecture
//!
//! ```text
//! Transport ──raw envelope──▶ JobObserver ──▶ ReconciliationStore
//!                                  │
//!                                  └──▶ EventBus ("job:started", "insight:*", ...)
//! ```
//!
//! One logical consumer per connection: messages are processed strictly
//! in arrival order, one at a time. Idempotence lives in the store, so
//! duplicated or out-of-order delivery is absorbed rather than rejected.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use crate::bus::{EventBus, EventDef};
use crate::models::{AnalysisStatus, Insight};
use crate::protocol::{
    ClientMessage, InsightEvent, JobFailure, JobPhase, JobStarted, ServerMessage, StateChanged,
    SubscriptionConfirmed,
};
use crate::store::ReconciliationStore;

/// Bidirectional message stream to the processing backend.
///
/// There is no resumption or replay: when `next_message` returns `None`
/// the connection is gone and all job state must be treated as stale
/// until fresh job traffic arrives.
#[async_trait]
pub trait Transport: Send {
    /// Next raw envelope, or `None` once the stream is closed
    async fn next_message(&mut self) -> Option<String>;

    /// Send a client message upstream
    async fn send(&mut self, message: ClientMessage) -> anyhow::Result<()>;
}

/// Channel-backed transport, used by tests and in-process wiring
pub struct ChannelTransport {
    incoming: mpsc::Receiver<String>,
    outgoing: mpsc::Sender<ClientMessage>,
}

impl ChannelTransport {
    pub fn new(incoming: mpsc::Receiver<String>, outgoing: mpsc::Sender<ClientMessage>) -> Self {
        Self { incoming, outgoing }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn next_message(&mut self) -> Option<String> {
        self.incoming.recv().await
    }

    async fn send(&mut self, message: ClientMessage) -> anyhow::Result<()> {
        self.outgoing
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("transport closed"))
    }
}

/// Bus definitions for every wire message kind, registered once per
/// observer so in-process components can subscribe by wire tag.
pub struct ProtocolEvents {
    pub connection_established: EventDef<serde_json::Value>,
    pub job_started: EventDef<JobStarted>,
    pub state_changed: EventDef<StateChanged>,
    pub insight_created: EventDef<InsightEvent>,
    pub insight_matched: EventDef<InsightEvent>,
    pub job_completed: EventDef<serde_json::Value>,
    pub job_failed: EventDef<JobFailure>,
    pub subscription_confirmed: EventDef<SubscriptionConfirmed>,
}

impl ProtocolEvents {
    pub fn register(bus: &EventBus) -> Self {
        Self {
            connection_established: bus.define("connection:established"),
            job_started: bus.define("job:started"),
            state_changed: bus.define("state:changed"),
            insight_created: bus.define("insight:created"),
            insight_matched: bus.define("insight:matched"),
            job_completed: bus.define("job:completed"),
            job_failed: bus.define("job:failed"),
            subscription_confirmed: bus.define("subscription:confirmed"),
        }
    }
}

/// Outcome of observing a job run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveOutcome {
    pub status: AnalysisStatus,
    /// True when the wall-clock budget ran out before a terminal status.
    /// Best-effort UX timeout only; server-side work continues.
    pub timed_out: bool,
}

/// Protocol consumer for one client connection
pub struct JobObserver<T: Transport> {
    transport: T,
    store: Arc<RwLock<ReconciliationStore>>,
    bus: EventBus,
    events: ProtocolEvents,
}

impl<T: Transport> JobObserver<T> {
    pub fn new(transport: T, bus: EventBus) -> Self {
        let events = ProtocolEvents::register(&bus);
        Self {
            transport,
            store: Arc::new(RwLock::new(ReconciliationStore::new())),
            bus,
            events,
        }
    }

    /// Shared handle to the reconciliation store
    pub fn store(&self) -> Arc<RwLock<ReconciliationStore>> {
        Arc::clone(&self.store)
    }

    /// Bus definitions for the wire message kinds
    pub fn events(&self) -> &ProtocolEvents {
        &self.events
    }

    /// Consume the transport until it closes, then flag the store stale
    pub async fn run(&mut self) {
        while let Some(raw) = self.transport.next_message().await {
            self.handle_raw(&raw).await;
        }
        self.store.write().await.mark_stale();
        tracing::info!("transport closed, store marked stale");
    }

    /// Consume the transport until the aggregate status is terminal, the
    /// transport closes, or the wall-clock budget runs out (client-side
    /// abandonment - in-flight server work continues unaffected).
    pub async fn run_until_terminal(&mut self, budget: Duration) -> ObserveOutcome {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            {
                let store = self.store.read().await;
                let status = store.status();
                if matches!(status, AnalysisStatus::Completed | AnalysisStatus::Error) {
                    return ObserveOutcome {
                        status,
                        timed_out: false,
                    };
                }
            }

            match tokio::time::timeout_at(deadline, self.transport.next_message()).await {
                Ok(Some(raw)) => self.handle_raw(&raw).await,
                Ok(None) => {
                    let mut store = self.store.write().await;
                    store.mark_stale();
                    return ObserveOutcome {
                        status: store.status(),
                        timed_out: false,
                    };
                }
                Err(_) => {
                    let status = self.store.read().await.status();
                    tracing::warn!(?status, "gave up waiting for terminal state");
                    return ObserveOutcome {
                        status,
                        timed_out: true,
                    };
                }
            }
        }
    }

    /// Decode and apply one raw envelope. Malformed envelopes are logged
    /// and dropped; the consumer loop never crashes on a single message.
    pub async fn handle_raw(&mut self, raw: &str) {
        match ServerMessage::from_json(raw) {
            Ok(message) => self.apply(message).await,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed protocol envelope");
            }
        }
    }

    /// Apply one decoded message to the store and re-publish it on the bus
    pub async fn apply(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::ConnectionEstablished => {
                self.publish(&self.events.connection_established, serde_json::Value::Null)
                    .await;
            }
            ServerMessage::JobStarted(started) => {
                // Job-scoped updates are only pushed to explicit
                // subscribers, so subscribe before touching state.
                let subscribe = ClientMessage::SubscribeJobs {
                    job_ids: vec![started.job_id.clone()],
                };
                if let Err(e) = self.transport.send(subscribe).await {
                    tracing::warn!(job_id = %started.job_id, error = %e, "failed to subscribe to job updates");
                }

                self.store
                    .write()
                    .await
                    .start_processing(&started.comment_ids, &started.job_id);
                self.publish(&self.events.job_started, started).await;
            }
            ServerMessage::StateChanged(change) => {
                self.apply_state_change(&change).await;
                self.publish(&self.events.state_changed, change).await;
            }
            ServerMessage::InsightCreated(event) => {
                self.store
                    .write()
                    .await
                    .add_insight(&event.comment_id, Insight::created(event.insight_id, &event.comment_id));
                self.publish(&self.events.insight_created, event).await;
            }
            ServerMessage::InsightMatched(event) => {
                self.store
                    .write()
                    .await
                    .add_insight(&event.comment_id, Insight::matched(event.insight_id, &event.comment_id));
                self.publish(&self.events.insight_matched, event).await;
            }
            ServerMessage::JobCompleted => {
                self.store.write().await.complete_job();
                self.publish(&self.events.job_completed, serde_json::Value::Null)
                    .await;
            }
            ServerMessage::JobFailed(failure) => {
                self.store.write().await.fail_job(&failure.error);
                self.publish(&self.events.job_failed, failure).await;
            }
            ServerMessage::SubscriptionConfirmed(confirmed) => {
                tracing::debug!(jobs = ?confirmed.job_ids, "subscription confirmed");
                self.publish(&self.events.subscription_confirmed, confirmed)
                    .await;
            }
        }
    }

    async fn apply_state_change(&mut self, change: &StateChanged) {
        let mut store = self.store.write().await;

        // A state:changed for a job we never saw start is authoritative:
        // delivery order is not guaranteed, so absorb the membership.
        if store.job_id() != Some(change.job_id.as_str()) {
            tracing::warn!(job_id = %change.job_id, "state change for unstarted job, absorbing membership");
            store.start_processing(&change.comment_ids, &change.job_id);
        }
        store.clear_stale();

        match change.state {
            JobPhase::Completed => {
                // The completion details duplicate the incremental
                // insight events; add_insight collapses both sources.
                if let Some(details) = &change.details {
                    for rel in details.relationships.iter().flatten() {
                        let insight = if rel.is_new {
                            Insight::created(rel.insight_id, &rel.comment_id)
                        } else {
                            Insight::matched(rel.insight_id, &rel.comment_id)
                        };
                        store.add_insight(&rel.comment_id, insight);
                    }
                }
                store.complete_comments(&change.comment_ids);
            }
            JobPhase::Failed => {
                let error = change
                    .details
                    .as_ref()
                    .and_then(|details| details.error.as_deref())
                    .unwrap_or("job failed");
                store.fail_job(error);
            }
            _ => {
                // Non-terminal phases are informational
                tracing::debug!(job_id = %change.job_id, state = ?change.state, "job phase update");
            }
        }
    }

    async fn publish<P: serde::Serialize>(&self, def: &EventDef<P>, properties: P) {
        if let Err(e) = self.bus.publish(def, properties).await {
            tracing::warn!(event = %def.name(), error = %e, "failed to publish bus event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CommentStatus;
    use crate::models::InsightOrigin;
    use crate::protocol::{InsightRelationship, StateDetails};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wire(msg: &ServerMessage) -> String {
        msg.to_json().unwrap()
    }

    fn observer_pair() -> (
        JobObserver<ChannelTransport>,
        mpsc::Sender<String>,
        mpsc::Receiver<ClientMessage>,
    ) {
        let (in_tx, in_rx) = mpsc::channel(32);
        let (out_tx, out_rx) = mpsc::channel(32);
        let observer = JobObserver::new(ChannelTransport::new(in_rx, out_tx), EventBus::new());
        (observer, in_tx, out_rx)
    }

    #[tokio::test]
    async fn test_end_to_end_scenario_is_idempotent_across_dual_emission() {
        let (mut observer, tx, mut out_rx) = observer_pair();

        let completed = StateChanged {
            details: Some(StateDetails::completed(vec![InsightRelationship {
                comment_id: "c1".to_string(),
                insight_id: 7,
                is_new: false,
            }])),
            ..StateChanged::phase("j1", JobPhase::Completed, vec!["c1".to_string()])
        };

        tx.send(wire(&ServerMessage::JobStarted(JobStarted {
            job_id: "j1".to_string(),
            comment_ids: vec!["c1".to_string()],
        })))
        .await
        .unwrap();
        tx.send(wire(&ServerMessage::InsightMatched(InsightEvent {
            comment_id: "c1".to_string(),
            insight_id: 7,
        })))
        .await
        .unwrap();
        tx.send(wire(&ServerMessage::StateChanged(completed)))
            .await
            .unwrap();
        drop(tx);

        observer.run().await;

        let store = observer.store();
        let store = store.read().await;
        let comment = store.comment("c1").unwrap();
        assert_eq!(comment.status, CommentStatus::Completed);
        assert_eq!(comment.insight_ids, vec![7]);
        assert_eq!(store.insight(7).unwrap().origin, InsightOrigin::Matched);
        assert_eq!(store.status(), AnalysisStatus::Completed);

        // job:started must trigger an immediate job subscription
        let ClientMessage::SubscribeJobs { job_ids } = out_rx.recv().await.unwrap();
        assert_eq!(job_ids, vec!["j1".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_envelope_does_not_kill_the_loop() {
        let (mut observer, tx, _out_rx) = observer_pair();

        tx.send("{ definitely not a protocol envelope".to_string())
            .await
            .unwrap();
        tx.send(wire(&ServerMessage::JobStarted(JobStarted {
            job_id: "j1".to_string(),
            comment_ids: vec!["c1".to_string()],
        })))
        .await
        .unwrap();
        drop(tx);

        observer.run().await;

        let store = observer.store();
        let store = store.read().await;
        assert_eq!(store.comment("c1").unwrap().status, CommentStatus::Processing);
    }

    #[tokio::test]
    async fn test_state_change_before_job_started_is_absorbed() {
        let (mut observer, tx, _out_rx) = observer_pair();

        tx.send(wire(&ServerMessage::StateChanged(StateChanged::phase(
            "j1",
            JobPhase::Analyzing,
            vec!["c1".to_string(), "c2".to_string()],
        ))))
        .await
        .unwrap();
        drop(tx);

        observer.run().await;

        let store = observer.store();
        let store = store.read().await;
        assert_eq!(store.job_id(), Some("j1"));
        assert_eq!(store.active_comment_ids().len(), 2);
        assert_eq!(store.status(), AnalysisStatus::Processing);
    }

    #[tokio::test]
    async fn test_job_failed_surfaces_error_and_terminal_status() {
        let (mut observer, tx, _out_rx) = observer_pair();

        tx.send(wire(&ServerMessage::JobStarted(JobStarted {
            job_id: "j1".to_string(),
            comment_ids: vec!["c1".to_string()],
        })))
        .await
        .unwrap();
        tx.send(wire(&ServerMessage::JobFailed(JobFailure {
            error: "classifier unavailable".to_string(),
        })))
        .await
        .unwrap();

        let outcome = observer.run_until_terminal(Duration::from_secs(5)).await;
        assert_eq!(outcome.status, AnalysisStatus::Error);
        assert!(!outcome.timed_out);

        let store = observer.store();
        let store = store.read().await;
        assert_eq!(store.error(), Some("classifier unavailable"));
        assert_eq!(store.comment("c1").unwrap().status, CommentStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandonment_after_wall_clock_budget() {
        let (mut observer, tx, _out_rx) = observer_pair();

        tx.send(wire(&ServerMessage::JobStarted(JobStarted {
            job_id: "j1".to_string(),
            comment_ids: vec!["c1".to_string()],
        })))
        .await
        .unwrap();
        // Keep tx alive: the stream stays open but silent

        let outcome = observer.run_until_terminal(Duration::from_secs(30)).await;
        assert!(outcome.timed_out);
        assert_eq!(outcome.status, AnalysisStatus::Processing);
        drop(tx);
    }

    #[tokio::test]
    async fn test_applied_messages_are_republished_on_the_bus() {
        let (mut observer, tx, _out_rx) = observer_pair();

        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let sub = observer
            .events()
            .insight_matched
            .clone();
        let _subscription = {
            let bus = observer.bus.clone();
            bus.subscribe(&sub, move |event: InsightEvent| {
                let seen = seen.clone();
                async move {
                    assert_eq!(event.insight_id, 7);
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        tx.send(wire(&ServerMessage::JobStarted(JobStarted {
            job_id: "j1".to_string(),
            comment_ids: vec!["c1".to_string()],
        })))
        .await
        .unwrap();
        tx.send(wire(&ServerMessage::InsightMatched(InsightEvent {
            comment_id: "c1".to_string(),
            insight_id: 7,
        })))
        .await
        .unwrap();
        drop(tx);

        observer.run().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_close_marks_store_stale() {
        let (mut observer, tx, _out_rx) = observer_pair();
        drop(tx);
        observer.run().await;

        let store = observer.store();
        assert!(store.read().await.is_stale());
    }
}
