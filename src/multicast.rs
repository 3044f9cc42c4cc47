//! One-shot multicast event: pushed onto N queues, fires its inner handler
//! at most once (whichever queue dispatches first), and is reclaimed when
//! the last holding queue consumes or purges it.
//!
//! Ported from `event_create_oneshot`/`multiqueue_oneshot_event` in
//! `nvim/event/multiqueue.c`. The reference manually refcounts and `xfree`s
//! a heap-allocated `MulticastEvent`; here the envelope is an
//! `Rc<RefCell<OneshotEnvelope>>` captured by the dispatcher closure, so
//! `Event::clone` (one clone per target queue) is exactly "push onto N
//! queues", and the envelope is dropped by Rust once the last clone has
//! been dispatched or purged — no manual free.

use crate::event::{Arg, Event};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

struct OneshotEnvelope {
    inner: RefCell<Option<Event>>,
    fired: Cell<bool>,
    refcount: Cell<usize>,
}

/// Wraps `inner` in a dispatcher [`Event`] meant to be cloned onto exactly
/// `n` queues (via `Event::clone` — the reference's "push the same Event
/// onto N queues").
///
/// # Panics
/// In debug builds, panics if the returned event is dispatched or purged
/// more than `n` times total — this is the "pushing more corrupts refcount"
/// contract violation from spec §4.2, surfaced as a fail-fast assertion per
/// the programming-error policy in spec §7.
pub fn create_oneshot(inner: Event, n: usize) -> Event {
    assert!(n >= 1, "create_oneshot: n must be at least 1");
    let envelope = Rc::new(OneshotEnvelope {
        inner: RefCell::new(Some(inner)),
        fired: Cell::new(false),
        refcount: Cell::new(n),
    });

    Event::new(
        move |_argv: &[Arg]| {
            if !envelope.fired.get() {
                envelope.fired.set(true);
                if let Some(inner_ev) = envelope.inner.borrow_mut().take() {
                    inner_ev.dispatch();
                }
            }
            let remaining = envelope.refcount.get();
            debug_assert!(
                remaining > 0,
                "one-shot multicast event dispatched more times than its declared queue count \
                 — refcount underflow"
            );
            envelope.refcount.set(remaining.saturating_sub(1));
        },
        vec![],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MultiQueue;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn fires_exactly_once_across_two_queues() {
        let p = MultiQueue::new_parent(None::<fn(&MultiQueue)>);
        let c1 = MultiQueue::new_child(&p);
        let c2 = MultiQueue::new_child(&p);

        let calls = Rc::new(StdRefCell::new(0));
        let calls2 = calls.clone();
        let inner = Event::new(move |_| *calls2.borrow_mut() += 1, vec![]);

        let ev = create_oneshot(inner, 2);
        c1.put_event(ev.clone());
        c2.put_event(ev);

        c1.process_events();
        c2.process_events();

        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn fires_once_regardless_of_drain_order() {
        let p = MultiQueue::new_parent(None::<fn(&MultiQueue)>);
        let c1 = MultiQueue::new_child(&p);
        let c2 = MultiQueue::new_child(&p);

        let calls = Rc::new(StdRefCell::new(0));
        let calls2 = calls.clone();
        let inner = Event::new(move |_| *calls2.borrow_mut() += 1, vec![]);

        let ev = create_oneshot(inner, 2);
        c2.put_event(ev.clone());
        c1.put_event(ev);

        // Drain c2 first: it fires. c1's copy is then a no-op.
        c2.process_events();
        c1.process_events();

        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn purge_without_dispatch_still_releases_envelope() {
        let p = MultiQueue::new_parent(None::<fn(&MultiQueue)>);
        let c1 = MultiQueue::new_child(&p);
        let c2 = MultiQueue::new_child(&p);

        let calls = Rc::new(StdRefCell::new(0));
        let calls2 = calls.clone();
        let inner = Event::new(move |_| *calls2.borrow_mut() += 1, vec![]);

        let ev = create_oneshot(inner, 2);
        c1.put_event(ev.clone());
        c2.put_event(ev);

        c1.purge_events();
        c2.purge_events();

        assert_eq!(*calls.borrow(), 0);
    }
}
