//! One-shot and repeating timers. Ported from `nvim/event/defs.h`'s
//! `time_watcher` and from `Icemic-libuv-rs`'s `idle.rs` handle idiom,
//! generalized from a zero-argument callback to pushing a `TimerEvent` onto a
//! [`MultiQueue`]. Used directly by callers and internally by
//! [`crate::watcher::process::ProcessSupervisor`]'s kill-escalation timer.

use crate::error::{uvret, Error, Result};
use crate::event::{Arg, Event};
use crate::queue::MultiQueue;
use crate::reactor::EventLoop;
use crate::watcher::WatcherState;
use std::cell::RefCell;
use std::rc::Rc;
use uv::{uv_timer_init, uv_timer_start, uv_timer_stop, uv_timer_t};

struct Shared {
    queue: MultiQueue,
    state: WatcherState,
}

/// A `uv_timer_t`-backed watcher. Pushes a nil-argv [`Event`] onto its queue
/// every time it fires.
pub struct TimerWatcher {
    handle: *mut uv_timer_t,
    shared: Rc<RefCell<Shared>>,
}

extern "C" fn timer_cb(handle: *mut uv_timer_t) {
    unsafe {
        let data = (*handle).data as *const RefCell<Shared>;
        if data.is_null() {
            return;
        }
        let queue = (*data).borrow().queue.clone();
        queue.put_event(Event::new(|_| {}, vec![Arg::Unit]));
    }
}

impl TimerWatcher {
    pub fn new(loop_: &EventLoop, queue: MultiQueue) -> Result<TimerWatcher> {
        let layout = std::alloc::Layout::new::<uv_timer_t>();
        let handle = unsafe { std::alloc::alloc(layout) as *mut uv_timer_t };
        if handle.is_null() {
            return Err(Error::ResourceExhausted("uv_timer_t alloc"));
        }
        let ret = unsafe { uv_timer_init(loop_.raw(), handle) };
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

        Ok(TimerWatcher { handle, shared })
    }

    pub fn state(&self) -> WatcherState {
        self.shared.borrow().state
    }

    /// `timeout_ms`: delay before the first firing. `repeat_ms == 0` means
    /// one-shot; otherwise the timer re-arms itself every `repeat_ms`.
    pub fn start(&mut self, timeout_ms: u64, repeat_ms: u64) -> Result<()> {
        self.shared.borrow().state.assert_can_start();
        uvret(unsafe { uv_timer_start(self.handle, Some(timer_cb), timeout_ms, repeat_ms) })?;
        self.shared.borrow_mut().state = WatcherState::Active;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        self.shared.borrow().state.assert_can_stop();
        uvret(unsafe { uv_timer_stop(self.handle) })?;
        self.shared.borrow_mut().state = WatcherState::Stopping;
        Ok(())
    }

    pub fn close(mut self) {
        self.shared.borrow().state.assert_can_close();
        self.shared.borrow_mut().state = WatcherState::Closed;
        unsafe {
            uv::uv_close(self.handle as *mut uv::uv_handle_t, Some(close_cb));
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
        let layout = std::alloc::Layout::new::<uv_timer_t>();
        std::alloc::dealloc(handle as _, layout);
    }
}

impl Drop for TimerWatcher {
    fn drop(&mut self) {
        debug_assert!(
            self.handle.is_null() || self.shared.borrow().state == WatcherState::Closed,
            "TimerWatcher dropped without close() — the OS handle would leak"
        );
    }
}
