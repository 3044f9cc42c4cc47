//! Unix-style per-loop signal watcher. Ported from `Icemic-libuv-rs`'s
//! `handles/signal.rs`, generalized to push onto a [`MultiQueue`] instead of
//! invoking a user closure directly, and to carry the two-phase close state
//! from [`WatcherState`].

use crate::error::{uvret, Error, Result};
use crate::event::{Arg, Event};
use crate::queue::MultiQueue;
use crate::reactor::EventLoop;
use crate::watcher::WatcherState;
use std::cell::RefCell;
use std::rc::Rc;
use uv::{uv_signal_init, uv_signal_start, uv_signal_start_oneshot, uv_signal_stop, uv_signal_t};

struct Shared {
    queue: MultiQueue,
    state: WatcherState,
}

/// Watches a single Unix signal on a loop and pushes a `SignalEvent` for
/// every delivery.
pub struct SignalWatcher {
    handle: *mut uv_signal_t,
    shared: Rc<RefCell<Shared>>,
}

/// Argument payload pushed for each signal delivery — `Arg::Int(signum)`.
pub fn signum_of(ev: &[Arg]) -> Option<i32> {
    ev.first().and_then(Arg::as_int).map(|n| n as i32)
}

extern "C" fn uv_signal_cb(handle: *mut uv_signal_t, signum: std::os::raw::c_int) {
    unsafe {
        let data = (*handle).data as *const RefCell<Shared>;
        if data.is_null() {
            return;
        }
        let shared = &*data;
        let queue = shared.borrow().queue.clone();
        queue.put_event(Event::new(
            move |_| {},
            vec![Arg::Int(signum as i64)],
        ));
    }
}

impl SignalWatcher {
    /// `init`: allocates and binds to `loop_`, pushing every future signal
    /// onto `queue`.
    pub fn new(loop_: &EventLoop, queue: MultiQueue) -> Result<SignalWatcher> {
        let layout = std::alloc::Layout::new::<uv_signal_t>();
        let handle = unsafe { std::alloc::alloc(layout) as *mut uv_signal_t };
        if handle.is_null() {
            return Err(Error::ResourceExhausted("uv_signal_t alloc"));
        }
        let ret = unsafe { uv_signal_init(loop_.raw(), handle) };
        if ret < 0 {
            unsafe { std::alloc::dealloc(handle as _, layout) };
            return Err(Error::from_code(ret));
        }

        let shared = Rc::new(RefCell::new(Shared {
            queue,
            state: WatcherState::Inactive,
        }));
        unsafe {
            (*handle).data = Rc::into_raw(shared.clone()) as *mut _;
        }

        Ok(SignalWatcher { handle, shared })
    }

    pub fn state(&self) -> WatcherState {
        self.shared.borrow().state
    }

    /// `start`: registers with the reactor, watching for `signum`.
    pub fn start(&mut self, signum: i32) -> Result<()> {
        self.shared.borrow().state.assert_can_start();
        let ret = unsafe { uv_signal_start(self.handle, Some(uv_signal_cb), signum) };
        uvret(ret)?;
        self.shared.borrow_mut().state = WatcherState::Active;
        Ok(())
    }

    /// Like `start`, but the watcher resets to `Inactive` the moment the
    /// signal is received (mirrors `uv_signal_start_oneshot`).
    pub fn start_oneshot(&mut self, signum: i32) -> Result<()> {
        self.shared.borrow().state.assert_can_start();
        let ret = unsafe { uv_signal_start_oneshot(self.handle, Some(uv_signal_cb), signum) };
        uvret(ret)?;
        self.shared.borrow_mut().state = WatcherState::Active;
        Ok(())
    }

    /// `stop`: deregisters from the reactor. Already-queued events remain
    /// valid.
    pub fn stop(&mut self) -> Result<()> {
        self.shared.borrow().state.assert_can_stop();
        uvret(unsafe { uv_signal_stop(self.handle) })?;
        self.shared.borrow_mut().state = WatcherState::Stopping;
        Ok(())
    }

    /// `close`: requests the reactor deallocate the OS handle. The close
    /// callback reclaims the `Rc<RefCell<Shared>>` and the handle's memory;
    /// freeing before that callback fires is impossible here because this
    /// struct never frees `handle` itself.
    pub fn close(mut self) {
        self.shared.borrow().state.assert_can_close();
        self.shared.borrow_mut().state = WatcherState::Closed;
        unsafe {
            uv::uv_close(
                self.handle as *mut uv::uv_handle_t,
                Some(close_cb),
            );
        }
        self.handle = std::ptr::null_mut();
    }
}

extern "C" fn close_cb(handle: *mut uv::uv_handle_t) {
    unsafe {
        let data = (*handle).data as *const RefCell<Shared>;
        if !data.is_null() {
            drop(Rc::from_raw(data));
        }
        let layout = std::alloc::Layout::new::<uv_signal_t>();
        std::alloc::dealloc(handle as _, layout);
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        debug_assert!(
            self.handle.is_null() || self.shared.borrow().state == WatcherState::Closed,
            "SignalWatcher dropped without close() — the OS handle would leak"
        );
    }
}
