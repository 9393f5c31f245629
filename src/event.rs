//! Instrumentation event kinds and the per-notification call event descriptor

use crate::host::{ModuleRef, ObjectSpace, Value};
use bitflags::bitflags;
use std::fmt;

/// Kind of a single instrumentation notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Method implemented in the managed language entered
    Call,
    /// Natively implemented method entered
    CCall,
    /// Block entered
    BlockCall,
    /// Method implemented in the managed language returned
    Return,
    /// Natively implemented method returned
    CReturn,
    /// Block returned
    BlockReturn,
    /// New line executed
    Line,
    /// Exception raised
    Raise,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::Call,
        EventKind::CCall,
        EventKind::BlockCall,
        EventKind::Return,
        EventKind::CReturn,
        EventKind::BlockReturn,
        EventKind::Line,
        EventKind::Raise,
    ];

    /// True for the call-entered kinds
    pub fn is_call(self) -> bool {
        matches!(self, EventKind::Call | EventKind::CCall | EventKind::BlockCall)
    }

    /// True for the call-returned kinds
    pub fn is_return(self) -> bool {
        matches!(
            self,
            EventKind::Return | EventKind::CReturn | EventKind::BlockReturn
        )
    }

    /// The return kind closing an invocation entered with this kind
    pub fn matching_return(self) -> Option<EventKind> {
        match self {
            EventKind::Call => Some(EventKind::Return),
            EventKind::CCall => Some(EventKind::CReturn),
            EventKind::BlockCall => Some(EventKind::BlockReturn),
            _ => None,
        }
    }

    /// Name used in `trace=` expressions
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Call => "call",
            EventKind::CCall => "c_call",
            EventKind::BlockCall => "b_call",
            EventKind::Return => "return",
            EventKind::CReturn => "c_return",
            EventKind::BlockReturn => "b_return",
            EventKind::Line => "line",
            EventKind::Raise => "raise",
        }
    }

    pub fn from_name(name: &str) -> Option<EventKind> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Single-bit set for this kind
    pub fn flag(self) -> EventSet {
        match self {
            EventKind::Call => EventSet::CALL,
            EventKind::CCall => EventSet::C_CALL,
            EventKind::BlockCall => EventSet::B_CALL,
            EventKind::Return => EventSet::RETURN,
            EventKind::CReturn => EventSet::C_RETURN,
            EventKind::BlockReturn => EventSet::B_RETURN,
            EventKind::Line => EventSet::LINE,
            EventKind::Raise => EventSet::RAISE,
        }
    }
}

bitflags! {
    /// Set of event kinds a subscription listens to
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventSet: u16 {
        const CALL = 0b0000_0001;
        const RETURN = 0b0000_0010;
        const C_CALL = 0b0000_0100;
        const C_RETURN = 0b0000_1000;
        const B_CALL = 0b0001_0000;
        const B_RETURN = 0b0010_0000;
        const LINE = 0b0100_0000;
        const RAISE = 0b1000_0000;

        const CALL_EVENTS = Self::CALL.bits() | Self::C_CALL.bits() | Self::B_CALL.bits();
        const RETURN_EVENTS = Self::RETURN.bits() | Self::C_RETURN.bits() | Self::B_RETURN.bits();

        /// Method call/return, both managed and native
        const SESSION_DEFAULT = Self::CALL.bits() | Self::RETURN.bits()
            | Self::C_CALL.bits() | Self::C_RETURN.bits();
        const TRACER_DEFAULT = Self::SESSION_DEFAULT.bits()
            | Self::B_CALL.bits() | Self::B_RETURN.bits();
    }
}

impl Default for EventSet {
    fn default() -> Self {
        EventSet::SESSION_DEFAULT
    }
}

impl EventSet {
    pub fn contains_kind(self, kind: EventKind) -> bool {
        self.contains(kind.flag())
    }

    /// Kinds in this set, in declaration order
    pub fn kinds(self) -> impl Iterator<Item = EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(move |kind| self.contains_kind(*kind))
    }
}

/// A source position: file path and line number
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    pub path: String,
    pub lineno: u32,
}

impl Location {
    pub fn new(path: impl Into<String>, lineno: u32) -> Self {
        Self {
            path: path.into(),
            lineno,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, self.lineno)
    }
}

/// Descriptor handed to hooks for one notification
///
/// Borrows engine state, so it cannot outlive the callback it was passed to.
#[derive(Debug, Clone, Copy)]
pub struct CallEvent<'a> {
    pub kind: EventKind,
    /// Type that defines the invoked method (`None` for blocks without owner)
    pub defined_class: Option<ModuleRef>,
    pub method_id: &'a str,
    pub receiver: Value,
    /// Where the invoked method is defined
    pub path: &'a str,
    pub lineno: u32,
    /// Caller locations, innermost first; `backtrace[0]` is the call site
    pub backtrace: &'a [Location],
    pub space: &'a ObjectSpace,
}

impl CallEvent<'_> {
    pub fn location(&self) -> Location {
        Location::new(self.path, self.lineno)
    }
}
