//! # Prism Core
//!
//! Coordination and consistency layer for the Prism comment analysis
//! pipeline: everything between the (out-of-scope) LLM classification
//! backend and the views that observe it.
//!
//! ## Architecture
//!
//! - `bus` - typed publish/subscribe event registry (dependency-injected,
//!   no global state)
//! - `matcher` - deterministic reconciliation of AI candidate labels
//!   against the closed insight vocabulary
//! - `protocol` - the job/comment wire contract: phases, message shapes,
//!   legal transitions
//! - `store` - idempotent client-side reconciliation store
//! - `client` - the observing consumer loop tying transport, store, and
//!   bus together
//!
//! ## Usage
//!
//! ```rust,ignore
//! use prism_core::bus::EventBus;
//! use prism_core::client::{ChannelTransport, JobObserver};
//!
//! let observer = JobObserver::new(transport, EventBus::new());
//! let outcome = observer.run_until_terminal(budget).await;
//! ```

pub mod bus;
pub mod client;
pub mod error;
pub mod matcher;
pub mod models;
pub mod protocol;
pub mod store;
