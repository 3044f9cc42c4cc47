//! Multi-level event queue.
//!
//! Ported from `nvim/event/multiqueue.c`. A [`MultiQueue`] is either a
//! *root* (no parent) or a *child* of exactly one root — the reference
//! asserts a parent can't itself have a parent (`new_child` forbids
//! grandparents), so the hierarchy here is always exactly two levels deep.
//!
//! Pushing onto a child queue also inserts a *link* node into the parent at
//! the same relative position, so the parent observes the combined,
//! correctly-interleaved stream of every child's pushes (single-threaded, so
//! there is a total order to preserve). Popping either side removes the
//! paired node on the other side in O(1) — the reference does this with raw
//! cross-pointers between heap nodes; here each queue owns a `SlotMap` arena
//! and nodes reference each other by key (DESIGN NOTES §9).

use crate::event::Event;
use slotmap::{new_key_type, SlotMap};
use std::cell::RefCell;
use std::rc::Rc;

new_key_type! {
    struct ItemKey;
}

enum ItemKind {
    /// A real event, living in the queue it was pushed onto. If that queue
    /// has a parent, `link` names the paired Link node's queue and key so it
    /// can be removed in O(1) when this leaf is removed.
    Leaf {
        event: Option<Event>,
        link: Option<(MultiQueue, ItemKey)>,
    },
    /// Lives only in a parent queue; names the child whose head leaf is the
    /// "real" event.
    Link { child: MultiQueue, leaf_key: ItemKey },
}

struct Item {
    kind: ItemKind,
    prev: Option<ItemKey>,
    next: Option<ItemKey>,
}

struct QueueInner {
    parent: Option<MultiQueue>,
    items: SlotMap<ItemKey, Item>,
    head: Option<ItemKey>,
    tail: Option<ItemKey>,
    put_cb: Option<Box<dyn FnMut(&MultiQueue)>>,
    /// See [`MultiQueue::size`] — preserves a quirk of the reference
    /// implementation verbatim; it is *not* a live count of reachable
    /// events.
    size: usize,
    /// Number of child queues created off this queue that have not yet been
    /// fully reclaimed. Only meaningful on a root queue.
    child_count: usize,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        if let Some(parent) = self.parent.take() {
            debug_assert!(
                self.items.is_empty(),
                "a child MultiQueue can only be deallocated once it is fully drained; the \
                 parent holds a strong reference to it for as long as any leaf remains, so this \
                 should be unreachable"
            );
            if let Ok(mut p) = parent.0.try_borrow_mut() {
                p.child_count = p.child_count.saturating_sub(1);
            }
        } else {
            debug_assert_eq!(
                self.child_count, 0,
                "freeing a parent MultiQueue that still has registered children"
            );
        }
        // Dropping `self.items` here purges any remaining leaves without
        // invoking their handlers — the same behavior as
        // `multiqueue_purge_events`, for free.
    }
}

/// A handle to a multi-level event queue. Cheap to clone (an `Rc` clone);
/// clones refer to the same underlying queue.
///
/// Not `Send`/`Sync`: the reference is explicitly single-threaded and
/// unsynchronized (spec §5); giving this type thread-safety bounds would be
/// a lie about what it actually guarantees.
#[derive(Clone)]
pub struct MultiQueue(Rc<RefCell<QueueInner>>);

impl PartialEq for MultiQueue {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for MultiQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("MultiQueue")
            .field("is_root", &inner.parent.is_none())
            .field("size", &inner.size)
            .field("empty", &inner.head.is_none())
            .finish()
    }
}

impl MultiQueue {
    fn new_inner(parent: Option<MultiQueue>, put_cb: Option<Box<dyn FnMut(&MultiQueue)>>) -> MultiQueue {
        MultiQueue(Rc::new(RefCell::new(QueueInner {
            parent,
            items: SlotMap::with_key(),
            head: None,
            tail: None,
            put_cb,
            size: 0,
            child_count: 0,
        })))
    }

    /// Creates an empty root queue. `put_cb`, when given, is invoked after
    /// any push onto this queue or any of its children — it should be
    /// cheap, typically waking a reactor (see [`crate::reactor::EventLoop`]).
    pub fn new_parent(put_cb: Option<impl FnMut(&MultiQueue) + 'static>) -> MultiQueue {
        let put_cb = put_cb.map(|f| Box::new(f) as Box<dyn FnMut(&MultiQueue)>);
        Self::new_inner(None, put_cb)
    }

    /// Creates an empty child queue linked to `parent`.
    ///
    /// `parent` must itself be a root (no parent of its own) — mirrors the
    /// reference's `assert(!parent->parent)`. Bumps `parent`'s `size` by one,
    /// permanently, as a reservation (see [`MultiQueue::size`]).
    pub fn new_child(parent: &MultiQueue) -> MultiQueue {
        {
            let p = parent.0.borrow();
            assert!(
                p.parent.is_none(),
                "new_child: parent must be a root queue (a parent cannot itself have a parent)"
            );
        }
        let child = Self::new_inner(Some(parent.clone()), None);
        {
            let mut p = parent.0.borrow_mut();
            p.size += 1;
            p.child_count += 1;
        }
        child
    }

    fn is_child(&self) -> bool {
        self.0.borrow().parent.is_some()
    }

    fn list_push_back(inner: &mut QueueInner, key: ItemKey) {
        if let Some(tail) = inner.tail {
            if let Some(tail_item) = inner.items.get_mut(tail) {
                tail_item.next = Some(key);
            }
            if let Some(item) = inner.items.get_mut(key) {
                item.prev = Some(tail);
            }
            inner.tail = Some(key);
        } else {
            inner.head = Some(key);
            inner.tail = Some(key);
        }
    }

    /// Removes `key` from the list and arena, returning its `Item`. Does
    /// *not* touch `size` — callers adjust that per the quirky accounting
    /// described on [`MultiQueue::size`].
    fn unlink_remove(inner: &mut QueueInner, key: ItemKey) -> Option<Item> {
        let item = inner.items.remove(key)?;
        match (item.prev, item.next) {
            (Some(prev), Some(next)) => {
                if let Some(p) = inner.items.get_mut(prev) {
                    p.next = Some(next);
                }
                if let Some(n) = inner.items.get_mut(next) {
                    n.prev = Some(prev);
                }
            }
            (Some(prev), None) => {
                if let Some(p) = inner.items.get_mut(prev) {
                    p.next = None;
                }
                inner.tail = Some(prev);
            }
            (None, Some(next)) => {
                if let Some(n) = inner.items.get_mut(next) {
                    n.prev = None;
                }
                inner.head = Some(next);
            }
            (None, None) => {
                inner.head = None;
                inner.tail = None;
            }
        }
        Some(item)
    }

    /// Pushes `ev` at the tail. See module docs for the child/parent linking
    /// protocol.
    pub fn put_event(&self, ev: Event) {
        if self.is_child() {
            let leaf_key = {
                let mut inner = self.0.borrow_mut();
                let key = inner.items.insert(Item {
                    kind: ItemKind::Leaf { event: Some(ev), link: None },
                    prev: None,
                    next: None,
                });
                Self::list_push_back(&mut inner, key);
                inner.size += 1;
                key
            };

            let parent = self.0.borrow().parent.clone().expect("checked is_child");
            let link_key = {
                let mut p = parent.0.borrow_mut();
                let key = p.items.insert(Item {
                    kind: ItemKind::Link { child: self.clone(), leaf_key },
                    prev: None,
                    next: None,
                });
                Self::list_push_back(&mut p, key);
                key
            };

            {
                let mut inner = self.0.borrow_mut();
                if let Some(item) = inner.items.get_mut(leaf_key) {
                    if let ItemKind::Leaf { link, .. } = &mut item.kind {
                        *link = Some((parent.clone(), link_key));
                    }
                }
            }

            Self::fire_put_cb(&parent);
            tracing::trace!(target: "uv_multiqueue::queue", "pushed onto child, linked into parent");
        } else {
            {
                let mut inner = self.0.borrow_mut();
                let key = inner.items.insert(Item {
                    kind: ItemKind::Leaf { event: Some(ev), link: None },
                    prev: None,
                    next: None,
                });
                Self::list_push_back(&mut inner, key);
                inner.size += 1;
            }
            Self::fire_put_cb(self);
            tracing::trace!(target: "uv_multiqueue::queue", "pushed directly onto root");
        }
    }

    fn fire_put_cb(q: &MultiQueue) {
        let cb = q.0.borrow_mut().put_cb.take();
        if let Some(mut cb) = cb {
            cb(q);
            q.0.borrow_mut().put_cb = Some(cb);
        }
    }

    /// Removes and returns the head event, or [`Event::nil`] if empty.
    pub fn get(&self) -> Event {
        if self.empty() {
            return Event::nil();
        }
        if self.is_child() {
            self.remove_as_child()
        } else {
            self.remove_as_root()
        }
    }

    fn remove_as_child(&self) -> Event {
        let mut inner = self.0.borrow_mut();
        let head = inner.head.expect("checked non-empty");
        let item = Self::unlink_remove(&mut inner, head).expect("head key must exist");
        inner.size = inner.size.saturating_sub(1);
        let (event, link) = match item.kind {
            ItemKind::Leaf { event, link } => (event, link),
            ItemKind::Link { .. } => unreachable!("child queues never hold link nodes"),
        };
        drop(inner);
        if let Some((parent, link_key)) = link {
            let mut p = parent.0.borrow_mut();
            Self::unlink_remove(&mut p, link_key);
        }
        event.unwrap_or_else(Event::nil)
    }

    fn remove_as_root(&self) -> Event {
        let kind = {
            let mut inner = self.0.borrow_mut();
            let head = inner.head.expect("checked non-empty");
            let item = Self::unlink_remove(&mut inner, head).expect("head key must exist");
            inner.size = inner.size.saturating_sub(1);
            item.kind
        };
        match kind {
            ItemKind::Leaf { event, .. } => event.unwrap_or_else(Event::nil),
            ItemKind::Link { child, leaf_key } => {
                let mut c = child.0.borrow_mut();
                let leaf = Self::unlink_remove(&mut c, leaf_key);
                drop(c);
                match leaf.map(|i| i.kind) {
                    Some(ItemKind::Leaf { event, .. }) => event.unwrap_or_else(Event::nil),
                    _ => Event::nil(),
                }
            }
        }
    }

    /// Drains the queue, invoking each event's handler synchronously.
    /// Reentrant: a handler pushing onto `self` is processed before this
    /// call returns.
    pub fn process_events(&self) {
        while !self.empty() {
            let ev = self.get();
            ev.dispatch();
        }
    }

    /// Drains the queue without invoking handlers — used at shutdown.
    pub fn purge_events(&self) {
        while !self.empty() {
            let _ = self.get();
        }
    }

    pub fn empty(&self) -> bool {
        self.0.borrow().head.is_none()
    }

    /// The reference's `size` counter, preserved verbatim including its
    /// documented quirk: it is bumped by one, permanently, for every
    /// [`MultiQueue::new_child`] call (a "reservation"), and decremented on
    /// every [`MultiQueue::get`] call made *directly on this queue* — even
    /// when that `get` actually removed an event from a linked child.
    /// Popping a child's event through its parent does **not** decrement the
    /// child's own `size`. Whether this reservation/accounting scheme is
    /// load-bearing elsewhere or a latent bug in the original is
    /// undocumented upstream (see DESIGN.md); callers that want an accurate
    /// count of reachable events should not rely on this. Decrements
    /// saturate at zero rather than panicking/wrapping, since the
    /// accounting is known to be able to go "negative" in the original.
    pub fn size(&self) -> usize {
        self.0.borrow().size
    }

    /// Rebinds an **empty** child queue to a new parent (also a root).
    pub fn replace_parent(&self, new_parent: &MultiQueue) {
        assert!(self.empty(), "replace_parent: queue must be empty");
        assert!(
            self.0.borrow().parent.is_some(),
            "replace_parent: queue must already be a child"
        );
        {
            let p = new_parent.0.borrow();
            assert!(p.parent.is_none(), "replace_parent: new parent must be a root queue");
        }
        let old_parent = self.0.borrow_mut().parent.replace(new_parent.clone());
        if let Some(old) = &old_parent {
            old.0.borrow_mut().child_count = old.0.borrow().child_count.saturating_sub(1);
        }
        new_parent.0.borrow_mut().child_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Arg;
    use std::cell::RefCell as StdRefCell;

    fn counting_handler(counter: Rc<StdRefCell<Vec<i32>>>, value: i32) -> impl Fn(&[Arg]) {
        move |_| counter.borrow_mut().push(value)
    }

    #[test]
    fn fifo_within_single_queue() {
        let p = MultiQueue::new_parent(None::<fn(&MultiQueue)>);
        let c = MultiQueue::new_child(&p);
        let order = Rc::new(StdRefCell::new(Vec::new()));

        c.put_event(Event::new(counting_handler(order.clone(), 1), vec![]));
        c.put_event(Event::new(counting_handler(order.clone(), 2), vec![]));
        c.put_event(Event::new(counting_handler(order.clone(), 3), vec![]));

        c.process_events();

        assert_eq!(*order.borrow(), vec![1, 2, 3]);
        assert_eq!(c.size(), 0);
        assert_eq!(p.size(), 1); // reservation from new_child, untouched
        assert!(c.empty());
    }

    #[test]
    fn parent_drain_returns_same_order_and_cleans_links() {
        let p = MultiQueue::new_parent(None::<fn(&MultiQueue)>);
        let c = MultiQueue::new_child(&p);
        let order = Rc::new(StdRefCell::new(Vec::new()));

        c.put_event(Event::new(counting_handler(order.clone(), 1), vec![]));
        c.put_event(Event::new(counting_handler(order.clone(), 2), vec![]));
        c.put_event(Event::new(counting_handler(order.clone(), 3), vec![]));

        p.get().dispatch();
        p.get().dispatch();
        p.get().dispatch();

        assert_eq!(*order.borrow(), vec![1, 2, 3]);
        assert!(c.empty());
        assert!(p.empty());
    }

    #[test]
    fn interleaved_child_and_parent_gets_preserve_order() {
        let p = MultiQueue::new_parent(None::<fn(&MultiQueue)>);
        let c1 = MultiQueue::new_child(&p);
        let c2 = MultiQueue::new_child(&p);
        let order = Rc::new(StdRefCell::new(Vec::new()));

        c1.put_event(Event::new(counting_handler(order.clone(), 1), vec![]));
        c2.put_event(Event::new(counting_handler(order.clone(), 2), vec![]));
        c1.put_event(Event::new(counting_handler(order.clone(), 3), vec![]));

        p.get().dispatch();
        p.get().dispatch();
        p.get().dispatch();

        assert_eq!(*order.borrow(), vec![1, 2, 3]);
        assert!(c1.empty());
        assert!(c2.empty());
        assert!(p.empty());
    }

    #[test]
    fn reentrant_push_during_drain_is_processed_in_same_call() {
        let p = MultiQueue::new_parent(None::<fn(&MultiQueue)>);
        let c = MultiQueue::new_child(&p);
        let order = Rc::new(StdRefCell::new(Vec::new()));

        let c2 = c.clone();
        let order2 = order.clone();
        c.put_event(Event::new(
            move |_| {
                order2.borrow_mut().push(1);
                c2.put_event(Event::new(counting_handler(order2.clone(), 2), vec![]));
            },
            vec![],
        ));

        c.process_events();

        assert_eq!(*order.borrow(), vec![1, 2]);
        assert!(c.empty());
    }

    #[test]
    fn get_on_empty_queue_returns_nil() {
        let p = MultiQueue::new_parent(None::<fn(&MultiQueue)>);
        let ev = p.get();
        assert!(ev.is_nil());
    }

    #[test]
    fn put_cb_fires_on_child_push_and_direct_root_push() {
        let fired = Rc::new(StdRefCell::new(0));
        let fired2 = fired.clone();
        let p = MultiQueue::new_parent(Some(move |_q: &MultiQueue| {
            *fired2.borrow_mut() += 1;
        }));
        let c = MultiQueue::new_child(&p);

        c.put_event(Event::new(|_| {}, vec![]));
        assert_eq!(*fired.borrow(), 1);

        p.put_event(Event::new(|_| {}, vec![]));
        assert_eq!(*fired.borrow(), 2);
    }

    #[test]
    #[should_panic(expected = "parent must be a root queue")]
    fn new_child_rejects_non_root_parent() {
        let p = MultiQueue::new_parent(None::<fn(&MultiQueue)>);
        let c = MultiQueue::new_child(&p);
        let _grandchild = MultiQueue::new_child(&c);
    }

    #[test]
    fn replace_parent_moves_an_empty_child() {
        let p1 = MultiQueue::new_parent(None::<fn(&MultiQueue)>);
        let p2 = MultiQueue::new_parent(None::<fn(&MultiQueue)>);
        let c = MultiQueue::new_child(&p1);
        c.replace_parent(&p2);

        let order = Rc::new(StdRefCell::new(Vec::new()));
        c.put_event(Event::new(counting_handler(order.clone(), 42), vec![]));
        p2.get().dispatch();
        assert_eq!(*order.borrow(), vec![42]);
        assert!(p1.empty());
    }
}
