// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! In-process event and task execution engine.
//!
//! Three pieces, leaves first:
//! - [`MpmcQueue`] — pooled lock-free MPMC queue, the one transport every
//!   task takes between threads
//! - [`Executor`] — prioritized, work-stealing worker pool that autoscales
//!   between configured bounds, with an optional batch-acquisition mode
//! - [`EventBus`] — maps event names to suspended handlers and reschedules
//!   them onto the executor when the event is emitted
//!
//! Handlers are `async` bodies that suspend at [`EventBus::await_event`]
//! and [`EventBus::switch_to_executor`]; between those points they run
//! start-to-suspension on one worker thread.
//!
//! ```
//! use strand_rt::{Config, EventBus};
//!
//! let bus = EventBus::new(Config::default());
//! bus.executor().start();
//!
//! let done = bus.spawn_handler({
//!     let bus = bus.clone();
//!     async move {
//!         let n: i32 = bus.await_event("job").await.unwrap();
//!         assert_eq!(n, 41);
//!     }
//! });
//!
//! bus.emit("job", 41_i32);
//! done.join();
//! bus.executor().stop();
//! ```
//!
//! Diagnostics (task panics, worker-spawn failures) go through the `log`
//! facade; install a logger to redirect them. A run with no faults logs
//! nothing.

pub mod bus;
pub mod error;
pub mod exec;
mod handler;

pub use bus::{await_event, EventAwaiter, EventBus, ExecutorHop};
pub use error::AwaitError;
pub use exec::queue::MpmcQueue;
pub use exec::{Config, Executor, Priority};
pub use handler::HandlerHandle;
