//! Event filtering for -e trace= expressions
//!
//! Supports:
//! - Individual event kinds: -e trace=call,return,c_call,c_return
//! - Event classes: -e trace=ruby, -e trace=c, -e trace=block, -e trace=all

use crate::event::{EventKind, EventSet};
use anyhow::{bail, Result};

/// Event filter that determines which call/return kinds to subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFilter {
    events: EventSet,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl EventFilter {
    /// Create a filter that includes every call/return kind
    pub fn all() -> Self {
        Self {
            events: EventSet::TRACER_DEFAULT,
        }
    }

    /// Parse a filter expression like "trace=call,return" or "trace=c"
    pub fn from_expr(expr: &str) -> Result<Self> {
        if let Some(trace_spec) = expr.strip_prefix("trace=") {
            Self::from_trace_spec(trace_spec)
        } else {
            bail!(
                "Invalid filter expression: {}. Expected format: trace=SPEC",
                expr
            );
        }
    }

    /// Parse a trace specification (the part after "trace=")
    fn from_trace_spec(spec: &str) -> Result<Self> {
        let mut events = EventSet::empty();

        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            match part {
                // Methods implemented in the managed language
                "ruby" => events |= EventSet::CALL | EventSet::RETURN,
                // Natively implemented methods
                "c" => events |= EventSet::C_CALL | EventSet::C_RETURN,
                "block" => events |= EventSet::B_CALL | EventSet::B_RETURN,
                "all" => events |= EventSet::TRACER_DEFAULT,
                name => match EventKind::from_name(name) {
                    Some(kind) if kind.is_call() || kind.is_return() => events |= kind.flag(),
                    Some(kind) => bail!("Event kind {} cannot be traced", kind.name()),
                    None => bail!("Unknown event kind: {}", name),
                },
            }
        }

        Ok(Self { events })
    }

    /// Selected kinds
    pub fn events(&self) -> EventSet {
        self.events
    }

    /// Check if an event kind should be traced
    pub fn should_trace(&self, kind: EventKind) -> bool {
        self.events.contains_kind(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_all_traces_every_call_kind() {
        let filter = EventFilter::all();
        assert!(filter.should_trace(EventKind::Call));
        assert!(filter.should_trace(EventKind::CReturn));
        assert!(filter.should_trace(EventKind::BlockCall));
        assert!(!filter.should_trace(EventKind::Line));
    }

    #[test]
    fn test_filter_individual_kinds() {
        let filter = EventFilter::from_expr("trace=call,return").unwrap();
        assert!(filter.should_trace(EventKind::Call));
        assert!(filter.should_trace(EventKind::Return));
        assert!(!filter.should_trace(EventKind::CCall));
        assert_eq!(filter.events(), EventSet::CALL | EventSet::RETURN);
    }

    #[test]
    fn test_filter_c_class() {
        let filter = EventFilter::from_expr("trace=c").unwrap();
        assert!(filter.should_trace(EventKind::CCall));
        assert!(filter.should_trace(EventKind::CReturn));
        assert!(!filter.should_trace(EventKind::Call));
    }

    #[test]
    fn test_filter_mixed() {
        let filter = EventFilter::from_expr("trace=ruby,c_call,c_return").unwrap();
        assert_eq!(filter.events(), EventSet::SESSION_DEFAULT);
    }

    #[test]
    fn test_filter_all_class() {
        let filter = EventFilter::from_expr("trace=all").unwrap();
        assert_eq!(filter.events(), EventSet::TRACER_DEFAULT);
        assert_eq!(filter, EventFilter::default());
    }

    #[test]
    fn test_filter_whitespace_is_trimmed() {
        let filter = EventFilter::from_expr("trace= block , ruby").unwrap();
        assert!(filter.should_trace(EventKind::BlockReturn));
        assert!(filter.should_trace(EventKind::Return));
    }

    #[test]
    fn test_invalid_expression() {
        assert!(EventFilter::from_expr("invalid").is_err());
        assert!(EventFilter::from_expr("signal=call").is_err());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = EventFilter::from_expr("trace=call,nope").unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_non_call_kind_is_rejected() {
        assert!(EventFilter::from_expr("trace=line").is_err());
        assert!(EventFilter::from_expr("trace=raise").is_err());
    }

    #[test]
    fn test_filter_empty_trace_spec() {
        let filter = EventFilter::from_expr("trace=").unwrap();
        assert!(filter.events().is_empty());
        assert!(!filter.should_trace(EventKind::Call));
    }
}
