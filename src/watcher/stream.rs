//! Pipe-backed byte stream watcher with ring-buffer backpressure.
//!
//! Ported from `nvim/event/defs.h`'s `struct stream` (a `uv_pipe_t`/`uv_tty_t`
//! union, an `RBuffer`, and a `did_eof` flag) and from `Icemic-libuv-rs`'s
//! `handles/streams/stream.rs` read/alloc callback idiom. Generalized: every
//! completed read pushes a `StreamEvent` onto the bound [`MultiQueue`] rather
//! than calling a C function pointer directly, and the `RBuffer` becomes
//! [`crate::ring_buffer::RingBuffer`].

use crate::error::{uvret, Error, Result};
use crate::event::{Arg, Event};
use crate::queue::MultiQueue;
use crate::reactor::EventLoop;
use crate::ring_buffer::RingBuffer;
use crate::watcher::WatcherState;
use std::cell::RefCell;
use std::os::raw::c_char;
use std::rc::Rc;
use uv::{
    uv_buf_t, uv_pipe_init, uv_pipe_open, uv_pipe_t, uv_read_start, uv_read_stop, uv_stream_t,
    uv_write, uv_write_t,
};

struct Shared {
    queue: MultiQueue,
    state: WatcherState,
    buffer: RingBuffer,
    eof: bool,
}

/// A `uv_pipe_t`-backed duplex stream. Reads accumulate into an internal
/// [`RingBuffer`]; once full, reading is paused (`uv_read_stop`) until the
/// caller drains it via [`StreamWatcher::take_buffered`] — the backpressure
/// policy from spec §4.4.
pub struct StreamWatcher {
    handle: *mut uv_pipe_t,
    shared: Rc<RefCell<Shared>>,
}

/// Was this a normal data delivery or the EOF notice? Carried as the first
/// argv slot of the pushed [`Event`], mirroring the reference's `eof` bool
/// parameter to `stream_read_cb`.
pub fn is_eof(argv: &[Arg]) -> bool {
    argv.first().and_then(Arg::as_bool).unwrap_or(false)
}

/// The error that ended the stream, if `is_eof(argv)` was true because
/// `uv_read_cb` reported something other than a clean `UV_EOF` (a broken
/// pipe, a reset connection, ...). Carried as the second argv slot; `None`
/// for a normal peer-closed EOF.
pub fn eof_error(argv: &[Arg]) -> Option<&Error> {
    match argv.get(1) {
        Some(Arg::Status(e)) => Some(e),
        _ => None,
    }
}

extern "C" fn alloc_cb(handle: *mut uv::uv_handle_t, suggested_size: usize, buf: *mut uv_buf_t) {
    unsafe {
        let data = (*handle).data as *const RefCell<Shared>;
        if data.is_null() {
            (*buf).base = std::ptr::null_mut();
            (*buf).len = 0;
            return;
        }
        let want = suggested_size.min((*data).borrow().buffer.space().max(1));
        let mut scratch = vec![0u8; want].into_boxed_slice();
        (*buf).base = scratch.as_mut_ptr() as *mut c_char;
        (*buf).len = want as _;
        // Leaked intentionally: reclaimed byte-for-byte in `read_cb` via
        // `Vec::from_raw_parts`, matching the alloc/read_cb pairing contract
        // libuv requires (the buffer must stay valid only until `read_cb`).
        std::mem::forget(scratch);
    }
}

extern "C" fn read_cb(stream: *mut uv_stream_t, nread: isize, buf: *const uv_buf_t) {
    unsafe {
        let handle = stream as *mut uv::uv_handle_t;
        let data = (*handle).data as *const RefCell<Shared>;
        let reclaim = || {
            if !(*buf).base.is_null() {
                drop(Vec::from_raw_parts(
                    (*buf).base as *mut u8,
                    0,
                    (*buf).len as usize,
                ));
            }
        };
        if data.is_null() {
            reclaim();
            return;
        }
        let shared = &*data;

        if nread > 0 {
            let slice = std::slice::from_raw_parts((*buf).base as *const u8, nread as usize);
            let written = shared.borrow_mut().buffer.write(slice);
            debug_assert_eq!(written, nread as usize, "alloc_cb must size bufs to available space");
            let is_full = shared.borrow().buffer.is_full();
            if is_full {
                let _ = uv_read_stop(stream);
                shared.borrow_mut().state = WatcherState::Stopping;
            }
            let queue = shared.borrow().queue.clone();
            queue.put_event(Event::new(|_| {}, vec![Arg::Bool(false)]));
        } else if nread < 0 {
            // UV_EOF (clean peer close) or a genuine read error — either way
            // no more data is coming, matching the reference's `did_eof =
            // true` for both, but the error detail rides along in the second
            // argv slot so callers can tell the two apart.
            shared.borrow_mut().eof = true;
            let queue = shared.borrow().queue.clone();
            let err = Error::from_code(nread as std::os::raw::c_int);
            queue.put_event(Event::new(|_| {}, vec![Arg::Bool(true), Arg::Status(err)]));
        }
        reclaim();
    }
}

extern "C" fn write_cb(req: *mut uv_write_t, status: std::os::raw::c_int) {
    unsafe {
        let layout = std::alloc::Layout::new::<uv_write_t>();
        let boxed_cb = (*req).data as *mut Box<dyn FnOnce(Result<()>)>;
        if !boxed_cb.is_null() {
            let cb = Box::from_raw(boxed_cb);
            cb(uvret(status));
        }
        std::alloc::dealloc(req as _, layout);
    }
}

impl StreamWatcher {
    /// Wraps an already-open OS file descriptor (`fd`) as a pipe — mirrors
    /// the reference's `stream_open` called on an inherited fd (a child
    /// process's stdout/stderr pipe, for instance).
    pub fn from_fd(loop_: &EventLoop, queue: MultiQueue, fd: i32, ring_capacity: usize) -> Result<StreamWatcher> {
        let layout = std::alloc::Layout::new::<uv_pipe_t>();
        let handle = unsafe { std::alloc::alloc(layout) as *mut uv_pipe_t };
        if handle.is_null() {
            return Err(Error::ResourceExhausted("uv_pipe_t alloc"));
        }
        let ret = unsafe { uv_pipe_init(loop_.raw(), handle, 0) };
        if ret < 0 {
            unsafe { std::alloc::dealloc(handle as _, layout) };
            return Err(Error::from_code(ret));
        }
        let ret = unsafe { uv_pipe_open(handle, fd) };
        if ret < 0 {
            unsafe { std::alloc::dealloc(handle as _, layout) };
            return Err(Error::from_code(ret));
        }

        let shared = Rc::new(RefCell::new(Shared {
            queue,
            state: WatcherState::Inactive,
            buffer: RingBuffer::with_capacity(ring_capacity),
            eof: false,
        }));
        unsafe {
            (*handle).data = Rc::into_raw(shared.clone()) as *mut _;
        }

        Ok(StreamWatcher { handle, shared })
    }

    /// Wraps a `uv_pipe_t` that a caller has already initialized and
    /// connected (used for the stdio pipes `uv_spawn` itself fills in, via
    /// [`crate::watcher::process::ProcessSupervisor::spawn`]'s
    /// `UV_CREATE_PIPE` stdio containers — the handle is live the moment
    /// `uv_spawn` returns successfully, with no separate open/connect step).
    pub(crate) fn from_initialized_pipe(
        handle: *mut uv_pipe_t,
        queue: MultiQueue,
        ring_capacity: usize,
    ) -> StreamWatcher {
        let shared = Rc::new(RefCell::new(Shared {
            queue,
            state: WatcherState::Inactive,
            buffer: RingBuffer::with_capacity(ring_capacity),
            eof: false,
        }));
        unsafe {
            (*handle).data = Rc::into_raw(shared.clone()) as *mut _;
        }
        StreamWatcher { handle, shared }
    }

    pub fn state(&self) -> WatcherState {
        self.shared.borrow().state
    }

    pub fn did_eof(&self) -> bool {
        self.shared.borrow().eof
    }

    /// Begins reading. Every delivered chunk (or the EOF notice) arrives as
    /// a pushed [`Event`]; call [`StreamWatcher::take_buffered`] from that
    /// event's handler to actually pull the bytes out.
    pub fn start(&mut self) -> Result<()> {
        self.shared.borrow().state.assert_can_start();
        uvret(unsafe {
            uv_read_start(
                self.handle as *mut uv_stream_t,
                Some(alloc_cb),
                Some(read_cb),
            )
        })?;
        self.shared.borrow_mut().state = WatcherState::Active;
        Ok(())
    }

    /// Resumes reading after backpressure paused it (the ring buffer had
    /// been drained below capacity).
    pub fn resume(&mut self) -> Result<()> {
        uvret(unsafe {
            uv_read_start(
                self.handle as *mut uv_stream_t,
                Some(alloc_cb),
                Some(read_cb),
            )
        })?;
        self.shared.borrow_mut().state = WatcherState::Active;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        self.shared.borrow().state.assert_can_stop();
        uvret(unsafe { uv_read_stop(self.handle as *mut uv_stream_t) })?;
        self.shared.borrow_mut().state = WatcherState::Stopping;
        Ok(())
    }

    /// Drains every byte currently buffered from completed reads.
    pub fn take_buffered(&self) -> Vec<u8> {
        self.shared.borrow_mut().buffer.drain_all()
    }

    pub fn buffered_len(&self) -> usize {
        self.shared.borrow().buffer.len()
    }

    /// Queues a write; `on_complete` runs once libuv reports the write's
    /// status.
    pub fn write(&mut self, data: &[u8], on_complete: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        let req_layout = std::alloc::Layout::new::<uv_write_t>();
        let req = unsafe { std::alloc::alloc(req_layout) as *mut uv_write_t };
        if req.is_null() {
            return Err(Error::ResourceExhausted("uv_write_t alloc"));
        }
        let buf = uv_buf_t {
            base: data.as_ptr() as *mut c_char,
            len: data.len() as _,
        };
        let boxed: Box<dyn FnOnce(Result<()>)> = Box::new(on_complete);
        unsafe {
            (*req).data = Box::into_raw(Box::new(boxed)) as *mut _;
        }
        let ret = unsafe {
            uv_write(
                req,
                self.handle as *mut uv_stream_t,
                &buf as *const uv_buf_t,
                1,
                Some(write_cb),
            )
        };
        if ret < 0 {
            unsafe { std::alloc::dealloc(req as _, req_layout) };
            return Err(Error::from_code(ret));
        }
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
        let layout = std::alloc::Layout::new::<uv_pipe_t>();
        std::alloc::dealloc(handle as _, layout);
    }
}

impl Drop for StreamWatcher {
    fn drop(&mut self) {
        debug_assert!(
            self.handle.is_null() || self.shared.borrow().state == WatcherState::Closed,
            "StreamWatcher dropped without close() — the OS handle would leak"
        );
    }
}
