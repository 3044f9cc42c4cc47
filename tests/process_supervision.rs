//! Spawns a real child process that ignores SIGTERM and verifies that
//! `stop()` escalates to SIGKILL after `KILL_TIMEOUT_MS`, matching
//! `proc_stop`/`children_kill_cb` in the reference.

#![cfg(unix)]

use std::time::{Duration, Instant};
use uv_multiqueue::watcher::process::{ProcessExit, ProcessSupervisor, KILL_TIMEOUT_MS};
use uv_multiqueue::{EventLoop, EventLoopConfig, MultiQueue};

#[test]
fn stop_escalates_to_sigkill_after_timeout() {
    let mut loop_ = EventLoop::new(EventLoopConfig::default()).expect("loop init");
    let events = MultiQueue::new_parent(None::<fn(&MultiQueue)>);
    let interrupt = std::cell::Cell::new(false);

    // `trap` ignores SIGTERM and sleeps well past the kill timeout, so only
    // SIGKILL (which cannot be trapped) can end it.
    let args: Vec<String> = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "trap '' TERM; sleep 30".to_string(),
    ];

    let mut proc =
        ProcessSupervisor::spawn(&loop_, events.clone(), &args, false, false, false).expect("spawn /bin/sh");

    let start = Instant::now();
    proc.stop(&mut loop_);

    let outcome = proc.wait(&mut loop_, &events, Some(Duration::from_millis(KILL_TIMEOUT_MS + 3000)), &interrupt);
    let elapsed = start.elapsed();

    assert!(
        matches!(outcome, ProcessExit::Exited(_)),
        "expected the process to exit after SIGKILL escalation, got {outcome:?}"
    );
    assert!(
        elapsed >= Duration::from_millis(KILL_TIMEOUT_MS),
        "process exited before the kill timeout elapsed: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(KILL_TIMEOUT_MS + 3000),
        "process took far longer than the kill timeout + escalation to exit: {elapsed:?}"
    );
}

#[test]
fn wait_returns_immediately_for_an_already_short_lived_process() {
    let mut loop_ = EventLoop::new(EventLoopConfig::default()).expect("loop init");
    let events = MultiQueue::new_parent(None::<fn(&MultiQueue)>);
    let interrupt = std::cell::Cell::new(false);

    let args: Vec<String> = vec!["/bin/true".to_string()];
    let mut proc =
        ProcessSupervisor::spawn(&loop_, events.clone(), &args, false, false, false).expect("spawn /bin/true");

    let outcome = proc.wait(&mut loop_, &events, Some(Duration::from_secs(5)), &interrupt);
    assert!(matches!(outcome, ProcessExit::Exited(0)), "expected clean exit, got {outcome:?}");
}
