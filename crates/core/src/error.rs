//! # Error Types
//!
//! Typed errors for the library boundaries. Internal fan-out failures are
//! collected and logged, never propagated as hard errors (a failing
//! subscriber must not take down the publisher or its siblings).

use thiserror::Error;

/// Errors raised by the event registry and bus
#[derive(Debug, Error)]
pub enum BusError {
    /// The registry's type set is closed at definition time; publishing an
    /// unregistered type is a programming error surfaced to the caller.
    #[error("event type '{0}' is not registered")]
    UnregisteredType(String),

    /// Payload could not be serialized into an envelope
    #[error("failed to encode event payload for '{event_type}': {source}")]
    Encode {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised while decoding wire protocol envelopes
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope was not valid JSON or did not match any known message kind
    #[error("malformed protocol envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}
