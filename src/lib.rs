//! A single-threaded, libuv-backed multi-level event queue.
//!
//! [`queue::MultiQueue`] is the core data structure: a parent queue observes
//! every push made to any of its children, in a single interleaved FIFO
//! order, while each child can still be drained independently. Combined with
//! [`reactor::EventLoop`] (the libuv reactor driver) and the [`watcher`]
//! module's OS-readiness adapters, this gives an event-loop architecture in
//! the style of `nvim/event/*`: I/O and timers produce events, events get
//! queued, and a single-threaded drain loop dispatches them — never
//! concurrently, never out of FIFO order within a queue.
//!
//! Nothing in this crate is `Send`/`Sync` except [`watcher::wakeup::WakeupSender`];
//! see [`queue::MultiQueue`]'s docs for why that's a deliberate design choice
//! rather than an oversight.

extern crate libuv_sys2 as uv;

pub mod error;
pub use error::{Error, Result};

pub mod event;
pub use event::{Arg, Event};

pub mod queue;
pub use queue::MultiQueue;

pub mod multicast;
pub use multicast::create_oneshot;

pub mod reactor;
pub use reactor::{EventLoop, EventLoopConfig, PollOutcome};

pub mod ring_buffer;
pub use ring_buffer::RingBuffer;

pub mod watcher;
