//! diverdown - Method call tracer that reconstructs a live call stack
//!
//! A [`session::Session`] subscribes to call/return notifications of an
//! [`source::EventSource`], hands call events to a handler and pops the
//! caller-owned stack on returns. The [`tracer::Tracer`] builds on it to
//! record which modules call into which.

pub mod call_stack;
pub mod cli;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod event;
pub mod filter;
pub mod helper;
pub mod host;
pub mod ignored_method_ids;
pub mod module_set;
pub mod script;
pub mod session;
pub mod source;
pub mod tracer;

pub use error::{Result, SessionStartError, TraceError, UnbalancedStackError};
pub use session::{Session, SessionOptions};
