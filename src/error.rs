//! Error taxonomy for tracing sessions and their event source
//!
//! Library code returns [`TraceError`]; the binary and the config/script
//! loaders wrap it with `anyhow` context at the edges.

use crate::event::EventKind;
use crate::source::SubscriptionId;
use thiserror::Error;

/// Failures reported by an event source when managing a subscription
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("enabled subscription limit reached ({limit})")]
    LimitReached { limit: usize },

    #[error("event source has been torn down")]
    TornDown,
}

/// The event source refused to enable a session's subscription
///
/// The session stays disabled and its call stack is untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to start tracing session: {source}")]
pub struct SessionStartError {
    #[source]
    pub source: SourceError,
}

/// A call-returned event arrived while the call stack was empty
///
/// Either a call-entered event was lost (filtered incorrectly) or the
/// stack was mutated outside of the session.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[error("call stack is empty; a return event has no matching call")]
pub struct UnbalancedStackError;

/// Errors that can occur while tracing
#[derive(Error, Debug)]
pub enum TraceError {
    #[error(transparent)]
    SessionStart(#[from] SessionStartError),

    #[error(transparent)]
    UnbalancedStack(#[from] UnbalancedStackError),

    #[error("failed to subscribe to event source: {0}")]
    Subscribe(#[source] SourceError),

    #[error("event source delivered an unsubscribed event kind: {kind:?}")]
    UnexpectedEvent { kind: EventKind },

    #[error("invalid event set: {0}")]
    InvalidEventSet(String),

    #[error("uninitialized constant {0}")]
    UnknownConstant(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Raised by user handlers or traced code; passed through as-is
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

/// Result type for tracing operations
pub type Result<T> = std::result::Result<T, TraceError>;
