//! Child process supervision: spawn, synchronous wait, and the
//! SIGTERM→(`KILL_TIMEOUT_MS`)→SIGKILL stop escalation.
//!
//! Ported from `nvim/event/proc.c`'s `proc_spawn`/`proc_wait`/`proc_stop`/
//! `children_kill_cb`/`proc_teardown`. The reference keeps every spawned
//! child in a process-wide `kv_t` vector on the `Loop` and refcounts each
//! `Proc` so its exit callback can't free it out from under a `proc_wait`
//! call in progress; here a [`ProcessSupervisor`] is a handle to one child
//! and that refcount becomes an ordinary `Rc` strong count shared between
//! the handle and the libuv exit callback.

use crate::error::{Error, Result};
use crate::queue::MultiQueue;
use crate::reactor::{EventLoop, PollOutcome};
use crate::watcher::stream::StreamWatcher;
use std::cell::Cell;
use std::ffi::CString;
use std::rc::Rc;
use std::time::Duration;
use uv::{
    uv_pid_t, uv_pipe_init, uv_pipe_t, uv_process_kill, uv_process_options_t, uv_process_t,
    uv_spawn, uv_stdio_container_t, uv_stdio_flags_UV_CREATE_PIPE, uv_stdio_flags_UV_READABLE_PIPE,
    uv_stdio_flags_UV_WRITABLE_PIPE, uv_timer_init, uv_timer_start, uv_timer_t,
};

/// Time a stopped process is given to exit cleanly before SIGKILL —
/// `KILL_TIMEOUT_MS` in the reference.
pub const KILL_TIMEOUT_MS: u64 = 2000;

/// Default ring buffer size for a spawned process's stdout/stderr pipes.
const DEFAULT_PIPE_RING_CAPACITY: usize = 64 * 1024;

// libuv forwards these straight to the OS signal number on Unix; named here
// rather than pulled from a signals crate, matching how small a surface this
// crate actually needs of them.
const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

/// Outcome of a child process, mirroring `proc_wait`'s three-way return:
/// a real exit status, a still-running timeout, or a user interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(i64),
    TimedOut,
    Interrupted,
}

impl From<ProcessExit> for i64 {
    /// The reference's raw encoding: -1 for timeout, -2 for interrupted,
    /// otherwise the real exit status.
    fn from(exit: ProcessExit) -> i64 {
        match exit {
            ProcessExit::Exited(status) => status,
            ProcessExit::TimedOut => -1,
            ProcessExit::Interrupted => -2,
        }
    }
}

struct Shared {
    status: Cell<Option<i64>>,
    stopped: Cell<bool>,
    pid: uv_pid_t,
    process_handle: *mut uv_process_t,
    events: MultiQueue,
    closed: Cell<bool>,
}

extern "C" fn exit_cb(handle: *mut uv_process_t, exit_status: i64, _term_signal: std::os::raw::c_int) {
    unsafe {
        let data = (*handle).data as *const Shared;
        if !data.is_null() {
            let shared = &*data;
            shared.status.set(Some(exit_status));
            // Deferred like `proc_close_handles`: let buffered stdout/stderr
            // drain through the queue before anything gets torn down.
            let events = shared.events.clone();
            events.put_event(crate::event::Event::new(|_| {}, vec![]));
        }
        uv::uv_close(handle as *mut uv::uv_handle_t, Some(process_close_cb));
    }
}

extern "C" fn process_close_cb(handle: *mut uv::uv_handle_t) {
    unsafe {
        let data = (*handle).data as *const Shared;
        if !data.is_null() {
            drop(Rc::from_raw(data));
        }
        let layout = std::alloc::Layout::new::<uv_process_t>();
        std::alloc::dealloc(handle as _, layout);
    }
}

/// Owns one spawned child process, its optional stdio pipes, and its
/// kill-escalation timer.
pub struct ProcessSupervisor {
    handle: *mut uv_process_t,
    shared: Rc<Shared>,
    kill_timer: *mut uv_timer_t,
    stdin: Option<StreamWatcher>,
    stdout: Option<StreamWatcher>,
    stderr: Option<StreamWatcher>,
}

fn alloc_pipe(loop_: &EventLoop) -> Result<*mut uv_pipe_t> {
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
    Ok(handle)
}

impl ProcessSupervisor {
    /// `args[0]` is the executable path. `stdin`/`stdout`/`stderr` request a
    /// `UV_CREATE_PIPE` stdio container for each stream — mirrors
    /// `proc_spawn`'s `in`/`out`/`err` bool parameters. On spawn failure,
    /// every pipe already initialized is closed before the error is
    /// returned (spec's "all handles closed").
    pub fn spawn(
        loop_: &EventLoop,
        events: MultiQueue,
        args: &[String],
        stdin: bool,
        stdout: bool,
        stderr: bool,
    ) -> Result<ProcessSupervisor> {
        assert!(!args.is_empty(), "spawn: args must contain at least the executable path");

        let layout = std::alloc::Layout::new::<uv_process_t>();
        let handle = unsafe { std::alloc::alloc(layout) as *mut uv_process_t };
        if handle.is_null() {
            return Err(Error::ResourceExhausted("uv_process_t alloc"));
        }

        let mut pipes: [Option<*mut uv_pipe_t>; 3] = [None, None, None];
        for (i, want) in [stdin, stdout, stderr].into_iter().enumerate() {
            if want {
                match alloc_pipe(loop_) {
                    Ok(p) => pipes[i] = Some(p),
                    Err(e) => {
                        for p in pipes.iter().flatten() {
                            unsafe { uv::uv_close(*p as *mut uv::uv_handle_t, None) };
                        }
                        unsafe { std::alloc::dealloc(handle as _, layout) };
                        return Err(e);
                    }
                }
            }
        }

        let mut stdio: [uv_stdio_container_t; 3] = unsafe { std::mem::zeroed() };
        for (i, pipe) in pipes.iter().enumerate() {
            if let Some(p) = pipe {
                stdio[i].flags = uv_stdio_flags_UV_CREATE_PIPE
                    | if i == 0 { uv_stdio_flags_UV_WRITABLE_PIPE } else { uv_stdio_flags_UV_READABLE_PIPE };
                stdio[i].data.stream = *p as *mut uv::uv_stream_t;
            } else {
                stdio[i].flags = 0;
            }
        }

        let cstrings: Vec<CString> = args.iter().map(|a| CString::new(a.as_str()).unwrap()).collect();
        let mut argv_ptrs: Vec<*mut std::os::raw::c_char> =
            cstrings.iter().map(|s| s.as_ptr() as *mut _).collect();
        argv_ptrs.push(std::ptr::null_mut());

        let mut options: uv_process_options_t = unsafe { std::mem::zeroed() };
        options.exit_cb = Some(exit_cb);
        options.file = cstrings[0].as_ptr();
        options.args = argv_ptrs.as_mut_ptr();
        options.stdio_count = 3;
        options.stdio = stdio.as_mut_ptr();

        let ret = unsafe { uv_spawn(loop_.raw(), handle, &options as *const _) };
        if ret < 0 {
            for p in pipes.iter().flatten() {
                unsafe { uv::uv_close(*p as *mut uv::uv_handle_t, None) };
            }
            unsafe { std::alloc::dealloc(handle as _, layout) };
            return Err(Error::from_code(ret));
        }

        let shared = Rc::new(Shared {
            status: Cell::new(None),
            stopped: Cell::new(false),
            pid: unsafe { (*handle).pid },
            process_handle: handle,
            events: events.clone(),
            closed: Cell::new(false),
        });
        unsafe {
            (*handle).data = Rc::into_raw(shared.clone()) as *mut _;
        }

        tracing::debug!(target: "uv_multiqueue::process", pid = shared.pid, "spawned child process");

        let wrap = |p: Option<*mut uv_pipe_t>| {
            p.map(|h| StreamWatcher::from_initialized_pipe(h, events.clone(), DEFAULT_PIPE_RING_CAPACITY))
        };

        Ok(ProcessSupervisor {
            handle,
            shared,
            kill_timer: std::ptr::null_mut(),
            stdin: wrap(pipes[0]),
            stdout: wrap(pipes[1]),
            stderr: wrap(pipes[2]),
        })
    }

    pub fn pid(&self) -> uv_pid_t {
        self.shared.pid
    }

    pub fn has_exited(&self) -> bool {
        self.shared.status.get().is_some()
    }

    pub fn stdin(&mut self) -> Option<&mut StreamWatcher> {
        self.stdin.as_mut()
    }

    pub fn stdout(&mut self) -> Option<&mut StreamWatcher> {
        self.stdout.as_mut()
    }

    pub fn stderr(&mut self) -> Option<&mut StreamWatcher> {
        self.stderr.as_mut()
    }

    /// Synchronously waits for this process to exit, pumping `events`
    /// (and, indirectly, the loop) to make progress. `timeout` of `None`
    /// blocks until exit or user interrupt; `interrupt_flag` is the same
    /// cell [`EventLoop::interrupt_flag`] returns, checked the way the
    /// reference checks its global `got_int`.
    pub fn wait(
        &mut self,
        loop_: &mut EventLoop,
        events: &MultiQueue,
        timeout: Option<Duration>,
        interrupt_flag: &Cell<bool>,
    ) -> ProcessExit {
        if let Some(status) = self.shared.status.get() {
            loop_.process_events(events, 0);
            return ProcessExit::Exited(status);
        }

        let outcome = loop_.process_events_until(events, timeout, || {
            interrupt_flag.get() || self.shared.status.get().is_some()
        });

        if interrupt_flag.get() {
            interrupt_flag.set(false);
            self.stop(loop_);
            loop_.process_events_until(events, None, || self.shared.status.get().is_some());
            return ProcessExit::Interrupted;
        }

        match (outcome, self.shared.status.get()) {
            (_, Some(status)) => ProcessExit::Exited(status),
            (PollOutcome::TimedOut, None) => ProcessExit::TimedOut,
            (PollOutcome::ConditionMet, None) => unreachable!("condition only met on exit or interrupt"),
        }
    }

    /// Sends SIGTERM immediately, arming a `KILL_TIMEOUT_MS` timer that
    /// escalates to SIGKILL if the process hasn't exited by the time it
    /// fires. Idempotent — a second call is a no-op, matching
    /// `proc_stop`'s `if (exited || proc->stopped_time) return;` guard.
    ///
    /// Unlike the reference, which arms one process-wide
    /// `children_kill_timer` shared by every child, each supervisor owns
    /// its own scratch timer — there's no process-wide child list here for
    /// a single timer to sweep.
    pub fn stop(&mut self, loop_: &mut EventLoop) {
        if self.has_exited() || self.shared.stopped.get() {
            return;
        }
        self.shared.stopped.set(true);

        unsafe { uv_process_kill(self.handle, SIGTERM) };
        tracing::debug!(target: "uv_multiqueue::process", pid = self.shared.pid, "sent SIGTERM");

        let layout = std::alloc::Layout::new::<uv_timer_t>();
        let timer = unsafe { std::alloc::alloc(layout) as *mut uv_timer_t };
        if timer.is_null() {
            return;
        }
        unsafe {
            if uv_timer_init(loop_.raw(), timer) < 0 {
                std::alloc::dealloc(timer as _, layout);
                return;
            }
            (*timer).data = Rc::into_raw(self.shared.clone()) as *mut _;
            uv_timer_start(timer, Some(kill_timer_cb), KILL_TIMEOUT_MS, 0);
        }
        self.kill_timer = timer;
    }

    /// Flushes buffered stdout/stderr and closes streams belonging to an
    /// already-exited process — `proc_close_handles` in the reference.
    /// Call once `has_exited()` is true and the exit event has been
    /// processed.
    pub fn close_handles(&mut self) {
        if self.shared.closed.get() {
            return;
        }
        self.shared.closed.set(true);
        if let Some(s) = self.stdin.take() {
            s.close();
        }
        if let Some(s) = self.stdout.take() {
            s.close();
        }
        if let Some(s) = self.stderr.take() {
            s.close();
        }
    }
}

extern "C" fn kill_timer_cb(handle: *mut uv_timer_t) {
    unsafe {
        let data = (*handle).data as *const Shared;
        if !data.is_null() {
            let shared = &*data;
            if shared.status.get().is_none() {
                uv_process_kill(shared.process_handle, SIGKILL);
                tracing::warn!(target: "uv_multiqueue::process", pid = shared.pid, "escalated to SIGKILL");
            }
        }
        uv::uv_close(handle as *mut uv::uv_handle_t, Some(free_timer_cb));
    }
}

extern "C" fn free_timer_cb(handle: *mut uv::uv_handle_t) {
    unsafe {
        let data = (*handle).data as *const Shared;
        if !data.is_null() {
            drop(Rc::from_raw(data));
        }
        let layout = std::alloc::Layout::new::<uv_timer_t>();
        std::alloc::dealloc(handle as _, layout);
    }
}

impl Drop for ProcessSupervisor {
    /// The `uv_process_t` itself is freed by [`process_close_cb`], which
    /// `exit_cb` arms via `uv_close` the moment the child exits — mirrors
    /// how `SignalWatcher`/`TimerWatcher` only own the handle's memory up
    /// until their own close callback fires. This only reclaims the
    /// `Rc<Shared>` strong reference held by this struct; the one handed to
    /// the C side via `Rc::into_raw` is reclaimed by `process_close_cb`.
    fn drop(&mut self) {
        debug_assert!(
            self.has_exited(),
            "ProcessSupervisor dropped while the child was still running — call stop() and wait()"
        );
        let _ = self.kill_timer;
    }
}

/// Stops (or, for already-detached children, just schedules cleanup of)
/// every supervisor in `children`, then drains `events` until all of them
/// have exited — `proc_teardown` in the reference.
pub fn teardown_all(loop_: &mut EventLoop, events: &MultiQueue, children: &mut [ProcessSupervisor]) {
    for proc in children.iter_mut() {
        proc.stop(loop_);
    }
    loop_.process_events_until(events, None, || {
        children.iter().all(ProcessSupervisor::has_exited) && events.empty()
    });
    for proc in children.iter_mut() {
        proc.close_handles();
    }
}
