//! Inert event records: a handler plus a small fixed-size argument vector.
//!
//! In the reference (`nvim/event/defs.h`) `Event` is `{ argv_callback handler;
//! void *argv[10]; }` — completely untyped, with the pusher responsible for
//! keeping whatever `argv` points to alive until dispatch. Per DESIGN NOTES
//! §9 we replace the untyped slots with a small tagged union, [`Arg`], so a
//! handler can actually inspect its arguments without unsafe casts, and so
//! that purging a queue can run drop glue instead of silently leaking.

use crate::error::Error;
use std::any::Any;
use std::fmt;
use std::rc::Rc;

/// Number of argv slots in an [`Event`] — `EVENT_HANDLER_MAX_ARGC` in the
/// reference.
pub const EVENT_HANDLER_MAX_ARGC: usize = 10;

/// A typed argument slot.
///
/// `Boxed` is the escape hatch matching the reference's raw `void*`: any
/// caller-defined payload can ride along, at the cost of losing `Clone`.
pub enum Arg {
    Unit,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Bytes(Vec<u8>),
    Text(String),
    Status(Error),
    Boxed(Rc<dyn Any>),
}

impl Clone for Arg {
    fn clone(&self) -> Self {
        match self {
            Arg::Unit => Arg::Unit,
            Arg::Bool(b) => Arg::Bool(*b),
            Arg::Int(i) => Arg::Int(*i),
            Arg::UInt(u) => Arg::UInt(*u),
            Arg::Bytes(b) => Arg::Bytes(b.clone()),
            Arg::Text(s) => Arg::Text(s.clone()),
            Arg::Status(_) => Arg::Unit, // Error isn't Clone; drop the detail rather than panic.
            Arg::Boxed(b) => Arg::Boxed(Rc::clone(b)),
        }
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Unit => write!(f, "Unit"),
            Arg::Bool(b) => write!(f, "Bool({b})"),
            Arg::Int(i) => write!(f, "Int({i})"),
            Arg::UInt(u) => write!(f, "UInt({u})"),
            Arg::Bytes(b) => write!(f, "Bytes[{}]", b.len()),
            Arg::Text(s) => write!(f, "Text({s:?})"),
            Arg::Status(e) => write!(f, "Status({e})"),
            Arg::Boxed(_) => write!(f, "Boxed(..)"),
        }
    }
}

impl Arg {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Arg::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Arg::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Arg::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Arg::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn downcast<T: 'static>(&self) -> Option<Rc<T>> {
        match self {
            Arg::Boxed(b) => b.clone().downcast::<T>().ok(),
            _ => None,
        }
    }
}

/// An inert record until dispatched: a handler closure plus its argv.
///
/// Created at push, consumed exactly once at dispatch (or purge). Clonable
/// only when the handler and every argv slot is (i.e. no `Boxed` holding a
/// non-`Clone` payload is required — `Boxed` itself always clones, it's an
/// `Rc`).
#[derive(Clone)]
pub struct Event {
    handler: Rc<dyn Fn(&[Arg])>,
    argv: [Arg; EVENT_HANDLER_MAX_ARGC],
    nil: bool,
}

impl Event {
    /// The NIL event: a no-op handler with empty argv, returned by `get` on
    /// an empty queue.
    pub fn nil() -> Event {
        Event {
            handler: Rc::new(|_: &[Arg]| {}),
            argv: Default::default(),
            nil: true,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.nil
    }

    pub fn new(handler: impl Fn(&[Arg]) + 'static, argv: Vec<Arg>) -> Event {
        assert!(
            argv.len() <= EVENT_HANDLER_MAX_ARGC,
            "event argv exceeds EVENT_HANDLER_MAX_ARGC"
        );
        let mut slots: [Arg; EVENT_HANDLER_MAX_ARGC] = Default::default();
        for (slot, arg) in slots.iter_mut().zip(argv) {
            *slot = arg;
        }
        Event {
            handler: Rc::new(handler),
            argv: slots,
            nil: false,
        }
    }

    /// Invokes the handler with this event's argv, unless this is the NIL
    /// event (mirrors the reference's `if (event.handler) { ... }` guard in
    /// `multiqueue_process_events`). Consumes the event.
    pub fn dispatch(self) {
        if !self.nil {
            (self.handler)(&self.argv);
        }
    }

    pub fn argv(&self) -> &[Arg] {
        &self.argv
    }
}

impl Default for Arg {
    fn default() -> Self {
        Arg::Unit
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("argv", &self.argv).finish()
    }
}

/// Builds an [`Event`], filling unused argv slots with [`Arg::Unit`] —
/// mirrors the reference's `event_create(cb, ...)` macro.
#[macro_export]
macro_rules! event_create {
    ($handler:expr $(, $arg:expr)* $(,)?) => {
        $crate::event::Event::new($handler, vec![$($arg),*])
    };
}
