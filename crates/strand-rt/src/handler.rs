// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Suspendable handler continuations.
//!
//! A handler is a stackless coroutine: an `async` body boxed behind a
//! [`Continuation`] that the event bus parks between resumptions. Each
//! resumption polls the future from one await point to the next on an
//! executor worker. State transitions are CAS-driven so a wake that lands
//! mid-poll re-enqueues instead of getting lost.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use crate::exec::executor::panic_message;
use crate::exec::Executor;

/// Type-erased handler body. Handlers produce no value; anything they
/// compute flows out through their own captures.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Continuation lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerState {
    /// Enqueued for a poll (or about to receive its first one).
    Ready = 0,
    /// A worker is polling the body right now.
    Running = 1,
    /// Parked at an await point, registered with the bus.
    Waiting = 2,
    /// The body returned (or faulted); the future is gone.
    Complete = 3,
}

impl HandlerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Waiting,
            _ => Self::Complete,
        }
    }
}

/// A suspended handler's resumption point.
///
/// Owned by the bus while parked, handed to the executor on emission, and
/// polled by exactly one worker at a time (the future slot's mutex and the
/// state machine together enforce that).
pub(crate) struct Continuation {
    state: AtomicU8,
    future: Mutex<Option<BoxFuture>>,
    /// Signals [`HandlerHandle::join`] blocking on completion.
    complete_notify: (Mutex<bool>, Condvar),
    /// Re-enqueue path used by wakers and the executor hand-off.
    executor: Arc<Executor>,
}

impl Continuation {
    pub(crate) fn new(future: BoxFuture, executor: Arc<Executor>) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(HandlerState::Ready as u8),
            future: Mutex::new(Some(future)),
            complete_notify: (Mutex::new(false), Condvar::new()),
            executor,
        })
    }

    pub(crate) fn state(&self) -> HandlerState {
        HandlerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Poll the body once, from the current await point to the next.
    ///
    /// Runs on whichever thread calls it: the spawner for the first poll,
    /// an executor worker afterwards.
    pub(crate) fn run(self: &Arc<Self>) {
        if self.state() == HandlerState::Complete {
            return;
        }
        self.state
            .store(HandlerState::Running as u8, Ordering::Release);

        let completed = self.poll_once();
        if completed {
            self.mark_complete();
            return;
        }

        // Running → Waiting unless a wake landed mid-poll (the waker flips
        // Running → Ready, the CAS fails, and the poll is owed again).
        let parked = self.state.compare_exchange(
            HandlerState::Running as u8,
            HandlerState::Waiting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if parked.is_err() {
            self.reschedule();
        }
    }

    /// Resume a parked continuation on the calling thread. Used by emission
    /// tasks already running on an executor worker; a resumption that
    /// catches the continuation mid-poll leaves the poll debt with the
    /// in-flight worker instead.
    pub(crate) fn resume(self: &Arc<Self>) {
        self.transition(false);
    }

    /// Resume a parked continuation through the executor.
    pub(crate) fn wake(self: &Arc<Self>) {
        self.transition(true);
    }

    fn transition(self: &Arc<Self>, via_executor: bool) {
        loop {
            let state = HandlerState::from_u8(self.state.load(Ordering::Acquire));
            match state {
                HandlerState::Waiting => {
                    if self
                        .state
                        .compare_exchange(
                            HandlerState::Waiting as u8,
                            HandlerState::Ready as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        if via_executor {
                            self.reschedule();
                        } else {
                            self.run();
                        }
                        return;
                    }
                }
                HandlerState::Running => {
                    // Mid-poll wake: mark the poll debt; whoever is inside
                    // run() re-enqueues when its park CAS fails.
                    if self
                        .state
                        .compare_exchange(
                            HandlerState::Running as u8,
                            HandlerState::Ready as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                HandlerState::Ready | HandlerState::Complete => return,
            }
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state() == HandlerState::Complete
    }

    fn reschedule(self: &Arc<Self>) {
        let this = self.clone();
        self.executor.schedule(move || this.run());
    }

    fn poll_once(self: &Arc<Self>) -> bool {
        let waker = Waker::from(Arc::new(ContinuationWaker {
            continuation: self.clone(),
        }));
        let mut cx = Context::from_waker(&waker);

        let mut slot = self.future.lock().unwrap();
        let Some(future) = slot.as_mut() else {
            return true;
        };

        let _guard = CurrentGuard::enter(self.clone());
        match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Ready(())) => {
                *slot = None;
                true
            }
            Ok(Poll::Pending) => false,
            Err(payload) => {
                // A faulted handler is finished; the worker survives.
                log::error!("handler panicked: {}", panic_message(payload.as_ref()));
                *slot = None;
                true
            }
        }
    }

    fn mark_complete(&self) {
        self.state
            .store(HandlerState::Complete as u8, Ordering::Release);
        let (lock, cvar) = &self.complete_notify;
        let mut done = lock.lock().unwrap();
        *done = true;
        cvar.notify_all();
    }
}

/// Waker that routes through the continuation's state machine.
struct ContinuationWaker {
    continuation: Arc<Continuation>,
}

impl Wake for ContinuationWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.continuation.wake();
    }
}

thread_local! {
    /// The continuation being polled on this thread, if any. Bus awaiters
    /// read it to learn which handler is suspending.
    static CURRENT: std::cell::RefCell<Option<Arc<Continuation>>> =
        std::cell::RefCell::new(None);
}

/// Scoped set/restore of the current-continuation slot around a poll.
struct CurrentGuard {
    previous: Option<Arc<Continuation>>,
}

impl CurrentGuard {
    fn enter(cont: Arc<Continuation>) -> Self {
        let previous = CURRENT.with(|c| c.borrow_mut().replace(cont));
        Self { previous }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|c| *c.borrow_mut() = previous);
    }
}

/// The continuation currently being polled on this thread.
pub(crate) fn current_continuation() -> Option<Arc<Continuation>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Observation handle for a spawned handler.
///
/// Handlers are fire-and-forward; dropping the handle detaches. `join`
/// blocks the calling thread until the handler body returns.
pub struct HandlerHandle {
    raw: Arc<Continuation>,
}

impl HandlerHandle {
    pub(crate) fn new(raw: Arc<Continuation>) -> Self {
        Self { raw }
    }

    /// Block until the handler terminates.
    pub fn join(self) {
        let (lock, cvar) = &self.raw.complete_notify;
        let mut done = lock.lock().unwrap();
        while !*done {
            done = cvar.wait(done).unwrap();
        }
    }

    /// Non-blocking completion check.
    pub fn is_complete(&self) -> bool {
        self.raw.is_complete()
    }
}
