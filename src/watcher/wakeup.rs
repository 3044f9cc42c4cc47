//! Cross-thread wake-up handle: the one escape hatch from the
//! single-threaded model (spec §5's "another OS thread may call
//! `WakeupWatcher::send`, and nothing else").
//!
//! Ported from `Icemic-libuv-rs`'s handle-allocation idiom applied to
//! `uv_async_t`, the only libuv handle whose trigger function
//! (`uv_async_send`) is itself thread-safe.

use crate::error::{Error, Result};
use crate::event::Event;
use crate::queue::MultiQueue;
use crate::reactor::EventLoop;
use crate::watcher::WatcherState;
use std::cell::RefCell;
use std::rc::Rc;
use uv::{uv_async_init, uv_async_send, uv_async_t};

struct Shared {
    queue: MultiQueue,
    state: WatcherState,
}

/// A `uv_async_t` wrapper. [`WakeupWatcher::sender`] hands out a
/// [`WakeupSender`] that is safe to move to another OS thread and call
/// `send` from, even though `WakeupWatcher` itself is not `Send`.
pub struct WakeupWatcher {
    handle: *mut uv_async_t,
    shared: Rc<RefCell<Shared>>,
}

/// The thread-safe half of a [`WakeupWatcher`]: a raw pointer plus
/// `uv_async_send`, which libuv documents as callable from any thread.
pub struct WakeupSender {
    handle: *mut uv_async_t,
}

// SAFETY: `uv_async_send` is documented by libuv as safe to call
// concurrently with the loop running on another thread — that's the
// entire purpose of `uv_async_t`.
unsafe impl Send for WakeupSender {}

impl WakeupSender {
    pub fn send(&self) {
        unsafe { uv_async_send(self.handle) };
    }
}

extern "C" fn async_cb(handle: *mut uv_async_t) {
    unsafe {
        let data = (*handle).data as *const RefCell<Shared>;
        if data.is_null() {
            return;
        }
        let queue = (*data).borrow().queue.clone();
        queue.put_event(Event::new(|_| {}, vec![]));
    }
}

impl WakeupWatcher {
    pub fn new(loop_: &EventLoop, queue: MultiQueue) -> Result<WakeupWatcher> {
        let layout = std::alloc::Layout::new::<uv_async_t>();
        let handle = unsafe { std::alloc::alloc(layout) as *mut uv_async_t };
        if handle.is_null() {
            return Err(Error::ResourceExhausted("uv_async_t alloc"));
        }
        let ret = unsafe { uv_async_init(loop_.raw(), handle, Some(async_cb)) };
        if ret < 0 {
            unsafe { std::alloc::dealloc(handle as _, layout) };
            return Err(Error::from_code(ret));
        }

        let shared = Rc::new(RefCell::new(Shared {
            queue,
            state: WatcherState::Active, // async handles are active from init
        }));
        unsafe {
            (*handle).data = Rc::into_raw(shared.clone()) as *mut _;
        }

        Ok(WakeupWatcher { handle, shared })
    }

    pub fn state(&self) -> WatcherState {
        self.shared.borrow().state
    }

    /// Produces a `Send` handle usable from another OS thread.
    pub fn sender(&self) -> WakeupSender {
        WakeupSender { handle: self.handle }
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
        let layout = std::alloc::Layout::new::<uv_async_t>();
        std::alloc::dealloc(handle as _, layout);
    }
}

impl Drop for WakeupWatcher {
    fn drop(&mut self) {
        debug_assert!(
            self.handle.is_null() || self.shared.borrow().state == WatcherState::Closed,
            "WakeupWatcher dropped without close() — the OS handle would leak"
        );
    }
}
