//! # Event Registry & Bus
//!
//! In-process typed publish/subscribe primitive. Producers and consumers
//! of domain events are decoupled through an explicitly constructed
//! [`EventBus`] value: there is no process-wide registry, so independent
//! buses can coexist and be tested in isolation.
//!
//! ## Architecture
//!
//! ```text
//! define::<T>("insight:created") ──▶ registry (name -> schema)
//!
//! publish(&def, props) ──▶ Envelope ──┬──▶ subscriber("insight:created")
//!                                     ├──▶ subscriber("insight:created")
//!                                     └──▶ subscriber("*")
//! ```
//!
//! Fan-out is independent per subscriber: callbacks run as concurrently
//! spawned tasks and are awaited as a group, so a failing or panicking
//! subscriber never blocks delivery to its siblings.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use schemars::{schema_for, JsonSchema, Schema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;

use crate::error::BusError;

/// Key under which `subscribe_all` callbacks are registered
pub const WILDCARD: &str = "*";

/// Tagged wrapper carrying one bus event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique envelope ID
    pub id: String,
    /// Publish timestamp
    pub timestamp: DateTime<Utc>,
    /// Registered event type
    #[serde(rename = "type")]
    pub event_type: String,
    /// Payload, validated against the registered schema at the
    /// subscriber boundary
    pub properties: Value,
}

/// Control value returned by subscriber callbacks.
///
/// Returning [`Flow::Done`] from a callback registered via
/// [`EventBus::once`] triggers self-unsubscription after that invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Done,
}

/// Handle to a registered event kind. The payload type is the schema.
pub struct EventDef<T> {
    name: String,
    _payload: PhantomData<fn(T) -> T>,
}

impl<T> EventDef<T> {
    /// Registered event type name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for EventDef<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _payload: PhantomData,
        }
    }
}

type BoxedFuture = Pin<Box<dyn Future<Output = anyhow::Result<Flow>> + Send>>;
type SubscriberFn = Arc<dyn Fn(Envelope) -> BoxedFuture + Send + Sync>;

struct Registration {
    id: u64,
    callback: SubscriberFn,
}

#[derive(Default)]
struct BusInner {
    schemas: HashMap<String, Schema>,
    subscribers: HashMap<String, Vec<Registration>>,
    next_id: u64,
}

/// Outcome of one publish: how many subscribers were invoked and which
/// of them failed. Failures are collected, never propagated.
#[derive(Debug, Default)]
pub struct FanoutSummary {
    /// Number of subscriber callbacks invoked
    pub delivered: usize,
    /// Error strings from failing or panicking subscribers
    pub errors: Vec<String>,
}

impl FanoutSummary {
    pub fn all_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// In-process typed publish/subscribe bus
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, BusInner> {
        // A poisoned lock only means a panic elsewhere; the registry
        // itself stays structurally valid.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a named event kind with its payload type as schema.
    ///
    /// Re-registering a name overwrites the entry (last writer wins).
    /// This is a known sharp edge, so the overwrite is logged.
    pub fn define<T: JsonSchema>(&self, name: impl Into<String>) -> EventDef<T> {
        let name = name.into();
        let schema = schema_for!(T);
        if self.locked().schemas.insert(name.clone(), schema).is_some() {
            tracing::warn!(event = %name, "event type redefined, previous registration overwritten");
        }
        EventDef {
            name,
            _payload: PhantomData,
        }
    }

    /// Schema registered for an event type, if any
    pub fn schema_of(&self, event_type: &str) -> Option<Schema> {
        self.locked().schemas.get(event_type).cloned()
    }

    /// Publish a typed event. Fan-out completes once every matched
    /// subscriber task has settled. Publishing with no subscribers is a
    /// no-op, never an error.
    pub async fn publish<T: Serialize>(
        &self,
        def: &EventDef<T>,
        properties: T,
    ) -> Result<FanoutSummary, BusError> {
        let value = serde_json::to_value(&properties).map_err(|source| BusError::Encode {
            event_type: def.name.clone(),
            source,
        })?;
        self.dispatch(def.name.clone(), value).await
    }

    /// Publish an untyped payload under a registered event type.
    ///
    /// Publishing an unregistered type is a programming error and is
    /// rejected rather than silently dropped.
    pub async fn publish_raw(
        &self,
        event_type: &str,
        properties: Value,
    ) -> Result<FanoutSummary, BusError> {
        if !self.locked().schemas.contains_key(event_type) {
            return Err(BusError::UnregisteredType(event_type.to_string()));
        }
        self.dispatch(event_type.to_string(), properties).await
    }

    async fn dispatch(
        &self,
        event_type: String,
        properties: Value,
    ) -> Result<FanoutSummary, BusError> {
        let envelope = Envelope {
            id: envelope_id(),
            timestamp: Utc::now(),
            event_type,
            properties,
        };

        // Snapshot matching registrations under the lock, run them outside it
        let targets: Vec<(String, u64, SubscriberFn)> = {
            let inner = self.locked();
            [envelope.event_type.as_str(), WILDCARD]
                .iter()
                .flat_map(|key| {
                    inner.subscribers.get(*key).into_iter().flatten().map(|reg| {
                        (key.to_string(), reg.id, Arc::clone(&reg.callback))
                    })
                })
                .collect()
        };

        let mut summary = FanoutSummary::default();
        if targets.is_empty() {
            return Ok(summary);
        }

        let mut tasks = JoinSet::new();
        for (key, id, callback) in targets {
            let env = envelope.clone();
            tasks.spawn(async move { (key, id, callback(env).await) });
        }

        let mut finished = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, id, Ok(Flow::Done))) => {
                    summary.delivered += 1;
                    finished.push((key, id));
                }
                Ok((_, _, Ok(Flow::Continue))) => summary.delivered += 1,
                Ok((_, _, Err(e))) => {
                    summary.delivered += 1;
                    summary.errors.push(e.to_string());
                }
                Err(e) => summary.errors.push(format!("subscriber task panicked: {e}")),
            }
        }

        for (key, id) in finished {
            remove_registration(&self.inner, &key, id);
        }

        if !summary.all_ok() {
            tracing::warn!(
                event = %envelope.event_type,
                failures = summary.errors.len(),
                "event fan-out had failing subscribers"
            );
        }

        Ok(summary)
    }

    /// Subscribe a typed callback keyed by the definition's type.
    ///
    /// Payloads that fail to decode against the registered schema are
    /// dropped with a warning; the subscriber is not invoked for them.
    pub fn subscribe<T, F, Fut>(&self, def: &EventDef<T>, callback: F) -> Subscription
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapper: SubscriberFn = Arc::new(move |envelope: Envelope| {
            let event_type = envelope.event_type;
            match serde_json::from_value::<T>(envelope.properties) {
                Ok(props) => {
                    let fut = callback(props);
                    Box::pin(async move { fut.await.map(|_| Flow::Continue) }) as BoxedFuture
                }
                Err(e) => {
                    tracing::warn!(event = %event_type, error = %e, "dropping event with invalid payload");
                    Box::pin(async { Ok(Flow::Continue) }) as BoxedFuture
                }
            }
        });
        self.register(def.name.clone(), wrapper)
    }

    /// Subscribe a callback to every event published on this bus
    pub fn subscribe_all<F, Fut>(&self, callback: F) -> Subscription
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapper: SubscriberFn = Arc::new(move |envelope: Envelope| {
            let fut = callback(envelope);
            Box::pin(async move { fut.await.map(|_| Flow::Continue) }) as BoxedFuture
        });
        self.register(WILDCARD.to_string(), wrapper)
    }

    /// Subscribe a callback that can end its own registration by
    /// returning [`Flow::Done`].
    pub fn once<T, F, Fut>(&self, def: &EventDef<T>, callback: F) -> Subscription
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Flow>> + Send + 'static,
    {
        let wrapper: SubscriberFn = Arc::new(move |envelope: Envelope| {
            let event_type = envelope.event_type;
            match serde_json::from_value::<T>(envelope.properties) {
                Ok(props) => Box::pin(callback(props)) as BoxedFuture,
                Err(e) => {
                    tracing::warn!(event = %event_type, error = %e, "dropping event with invalid payload");
                    Box::pin(async { Ok(Flow::Continue) }) as BoxedFuture
                }
            }
        });
        self.register(def.name.clone(), wrapper)
    }

    fn register(&self, key: String, callback: SubscriberFn) -> Subscription {
        let mut inner = self.locked();
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .subscribers
            .entry(key.clone())
            .or_default()
            .push(Registration { id, callback });
        Subscription {
            bus: Arc::downgrade(&self.inner),
            key,
            id,
        }
    }
}

/// Handle that removes exactly one registration instance when cancelled.
///
/// `cancel` is idempotent, and the same callback subscribed multiple
/// times yields independent handles without cross-cancellation. Dropping
/// the handle leaves the subscription active.
pub struct Subscription {
    bus: Weak<Mutex<BusInner>>,
    key: String,
    id: u64,
}

impl Subscription {
    /// Remove this registration. Cancelling an already-removed
    /// registration is a no-op.
    pub fn cancel(&self) {
        remove_registration_weak(&self.bus, &self.key, self.id);
    }
}

fn remove_registration_weak(bus: &Weak<Mutex<BusInner>>, key: &str, id: u64) {
    if let Some(inner) = bus.upgrade() {
        remove_registration(&inner, key, id);
    }
}

fn remove_registration(inner: &Arc<Mutex<BusInner>>, key: &str, id: u64) {
    let mut guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(entries) = guard.subscribers.get_mut(key) {
        entries.retain(|reg| reg.id != id);
        if entries.is_empty() {
            guard.subscribers.remove(key);
        }
    }
}

/// Generate a unique envelope ID (timestamp + random suffix)
fn envelope_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos();
    let salt = RandomState::new().build_hasher().finish() as u32;
    format!("{:x}-{:x}", nanos, salt)
}
