// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Event bus: named events multiplexed onto the executor through
//! suspendable handlers.
//!
//! Handlers park on [`EventBus::await_event`]; `emit` publishes a payload,
//! snapshots the waiting set for that name, and hands each continuation to
//! the executor. Publication is synchronous, resumption is not. Handlers
//! not registered at the moment of emission never see it; there is no
//! replay buffer.

use std::any::{self, Any};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use crate::error::AwaitError;
use crate::exec::{Config, Executor};
use crate::handler::{current_continuation, Continuation, HandlerHandle};

type Payload = Arc<dyn Any + Send + Sync>;

struct StoredPayload {
    value: Payload,
    /// Emission sequence number; the countdown of an older emission must
    /// not erase a newer payload published under the same name.
    seq: u64,
}

struct PendingEmission {
    event: String,
    value: Payload,
}

#[derive(Default)]
struct BusState {
    /// Parked continuations per event name, identity-deduped.
    handlers: HashMap<String, Vec<Arc<Continuation>>>,
    /// Live payloads, cleared by the last resumption of their emission.
    payloads: HashMap<String, StoredPayload>,
    /// Emissions awaiting hand-off, drained in arrival order.
    emissions: VecDeque<PendingEmission>,
    /// True while some thread runs the drain loop; others append and leave.
    draining: bool,
    next_seq: u64,
}

/// Multiplexer of named events onto an [`Executor`].
///
/// Obtain one with [`EventBus::new`] (isolated, e.g. per test) or
/// [`EventBus::global`] (process-wide).
pub struct EventBus {
    executor: Arc<Executor>,
    inner: Mutex<BusState>,
}

static GLOBAL: Mutex<Option<Arc<EventBus>>> = Mutex::new(None);

impl EventBus {
    /// Build an isolated bus owning a fresh executor. The executor is not
    /// started; call `bus.executor().start()` before emitting.
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_executor(Arc::new(Executor::new(config)))
    }

    /// Build a bus over an existing executor.
    pub fn with_executor(executor: Arc<Executor>) -> Arc<Self> {
        Arc::new(Self {
            executor,
            inner: Mutex::new(BusState::default()),
        })
    }

    /// The process-wide bus, lazily built with default configuration and a
    /// started executor.
    pub fn global() -> Arc<Self> {
        let mut global = GLOBAL.lock().unwrap();
        global
            .get_or_insert_with(|| {
                let bus = Self::new(Config::default());
                bus.executor().start();
                bus
            })
            .clone()
    }

    /// Tear down the process-wide bus so the next [`EventBus::global`]
    /// starts fresh. Intended for test isolation.
    pub fn reset_global() {
        let bus = GLOBAL.lock().unwrap().take();
        if let Some(bus) = bus {
            bus.executor().stop();
        }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Start a handler. The body runs eagerly on the calling thread until
    /// its first await point, so an `await_event` at the top of the body is
    /// registered before this returns.
    pub fn spawn_handler<F>(self: &Arc<Self>, body: F) -> HandlerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let continuation = Continuation::new(Box::pin(body), self.executor.clone());
        continuation.run();
        HandlerHandle::new(continuation)
    }

    /// Publish `payload` under `event` and hand every waiting continuation
    /// to the executor. Returns once the hand-off is queued; resumptions
    /// run asynchronously. Emissions posted while a drain is in progress
    /// (re-entrant or from another thread) are appended and processed by
    /// the draining thread in arrival order.
    pub fn emit<T>(self: &Arc<Self>, event: &str, payload: T)
    where
        T: Any + Send + Sync,
    {
        let mut state = self.inner.lock().unwrap();
        state.emissions.push_back(PendingEmission {
            event: event.to_string(),
            value: Arc::new(payload),
        });
        if state.draining {
            return;
        }
        state.draining = true;

        loop {
            let Some(emission) = state.emissions.pop_front() else {
                state.draining = false;
                return;
            };
            let seq = state.next_seq;
            state.next_seq += 1;
            state.payloads.insert(
                emission.event.clone(),
                StoredPayload {
                    value: emission.value,
                    seq,
                },
            );

            let waiting = state.handlers.remove(&emission.event).unwrap_or_default();
            if waiting.is_empty() {
                // Nobody to observe it; don't let the payload linger.
                state.payloads.remove(&emission.event);
                continue;
            }

            let remaining = Arc::new(AtomicUsize::new(waiting.len()));
            // Hand-off happens outside the bus lock.
            drop(state);
            for continuation in waiting {
                let bus = self.clone();
                let event = emission.event.clone();
                let remaining = remaining.clone();
                self.executor.schedule(move || {
                    continuation.resume();
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        bus.clear_payload(&event, seq);
                    }
                });
            }
            state = self.inner.lock().unwrap();
        }
    }

    /// Suspend the current handler until `event` is emitted, then yield the
    /// payload as a `T`.
    ///
    /// Fails with [`AwaitError::TypeMismatch`] when the published payload
    /// is not a `T`, and with [`AwaitError::MissingPayload`] when the
    /// payload was cleared before this resumption reached it.
    pub fn await_event<T>(self: &Arc<Self>, event: &str) -> EventAwaiter<T>
    where
        T: Any + Clone + Send + Sync,
    {
        EventAwaiter {
            bus: self.clone(),
            event: event.to_string(),
            registered: false,
            _marker: PhantomData,
        }
    }

    /// Suspend the current handler and reschedule it on the executor.
    /// Typically the first await in a handler body, so the body proper runs
    /// on a worker instead of the emitting or spawning thread.
    pub fn switch_to_executor(&self) -> ExecutorHop {
        ExecutorHop { hopped: false }
    }

    /// Park `continuation` under `event`. Registering a continuation that
    /// is already parked under that name is a no-op.
    pub(crate) fn register(&self, event: &str, continuation: Arc<Continuation>) {
        let mut state = self.inner.lock().unwrap();
        let waiting = state.handlers.entry(event.to_string()).or_default();
        if !waiting.iter().any(|c| Arc::ptr_eq(c, &continuation)) {
            waiting.push(continuation);
        }
    }

    /// Number of continuations parked under `event`.
    pub fn registered_handlers(&self, event: &str) -> usize {
        let state = self.inner.lock().unwrap();
        state.handlers.get(event).map_or(0, Vec::len)
    }

    fn read_payload<T>(&self, event: &str) -> Result<T, AwaitError>
    where
        T: Any + Clone + Send + Sync,
    {
        let state = self.inner.lock().unwrap();
        match state.payloads.get(event) {
            None => Err(AwaitError::MissingPayload {
                event: event.to_string(),
            }),
            Some(stored) => match stored.value.downcast_ref::<T>() {
                Some(value) => Ok(value.clone()),
                None => Err(AwaitError::TypeMismatch {
                    event: event.to_string(),
                    expected: any::type_name::<T>(),
                }),
            },
        }
    }

    fn clear_payload(&self, event: &str, seq: u64) {
        let mut state = self.inner.lock().unwrap();
        if state.payloads.get(event).is_some_and(|p| p.seq == seq) {
            state.payloads.remove(event);
        }
    }
}

/// Await a named event on the process-wide bus.
pub fn await_event<T>(event: &str) -> EventAwaiter<T>
where
    T: Any + Clone + Send + Sync,
{
    EventBus::global().await_event(event)
}

/// Future returned by [`EventBus::await_event`]. The first poll parks the
/// current continuation under the event name; the resumption poll reads the
/// published payload.
pub struct EventAwaiter<T> {
    bus: Arc<EventBus>,
    event: String,
    registered: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Future for EventAwaiter<T>
where
    T: Any + Clone + Send + Sync,
{
    type Output = Result<T, AwaitError>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.registered {
            let continuation =
                current_continuation().expect("await_event polled outside a handler");
            self.registered = true;
            self.bus.register(&self.event, continuation);
            return Poll::Pending;
        }
        Poll::Ready(self.bus.read_payload::<T>(&self.event))
    }
}

/// Future returned by [`EventBus::switch_to_executor`]: suspends once and
/// asks the waker to re-enqueue the handler on the executor.
pub struct ExecutorHop {
    hopped: bool,
}

impl Future for ExecutorHop {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.hopped {
            return Poll::Ready(());
        }
        self.hopped = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_bus() -> Arc<EventBus> {
        let bus = EventBus::new(Config {
            max_workers: 2,
            min_workers: 2,
            keep_alive: Duration::from_secs(5),
            ..Config::default()
        });
        bus.executor().start();
        bus
    }

    fn payload_count(bus: &EventBus) -> usize {
        bus.inner.lock().unwrap().payloads.len()
    }

    #[test]
    fn registration_is_idempotent() {
        let bus = test_bus();
        let continuation = Continuation::new(
            Box::pin(std::future::pending::<()>()),
            bus.executor().clone(),
        );

        bus.register("x", continuation.clone());
        bus.register("x", continuation.clone());
        assert_eq!(bus.registered_handlers("x"), 1);

        bus.register("y", continuation);
        assert_eq!(bus.registered_handlers("y"), 1);
        bus.executor().stop();
    }

    #[test]
    fn emission_without_handlers_leaves_no_payload() {
        let bus = test_bus();
        bus.emit("nobody-home", 5_i32);
        assert_eq!(payload_count(&bus), 0);
        bus.executor().stop();
    }

    #[test]
    fn payload_cleared_after_last_resumption() {
        let bus = test_bus();
        let handles: Vec<_> = (0..2)
            .map(|_| {
                bus.spawn_handler({
                    let bus = bus.clone();
                    async move {
                        let _ = bus.await_event::<i32>("x").await;
                    }
                })
            })
            .collect();
        assert_eq!(bus.registered_handlers("x"), 2);

        bus.emit("x", 7_i32);
        for handle in handles {
            handle.join();
        }
        // The countdown erases the payload with the final resumption.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while payload_count(&bus) != 0 && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(payload_count(&bus), 0);
        assert_eq!(bus.registered_handlers("x"), 0);
        bus.executor().stop();
    }

    #[test]
    fn type_mismatch_is_surfaced() {
        let bus = test_bus();
        let observed = Arc::new(Mutex::new(None));
        let handle = bus.spawn_handler({
            let bus = bus.clone();
            let observed = observed.clone();
            async move {
                let result = bus.await_event::<String>("typed").await;
                *observed.lock().unwrap() = Some(result);
            }
        });

        bus.emit("typed", 42_i32);
        handle.join();

        let result = observed.lock().unwrap().take();
        match result {
            Some(Err(AwaitError::TypeMismatch { event, .. })) => assert_eq!(event, "typed"),
            other => panic!("expected type mismatch, got {other:?}"),
        }
        bus.executor().stop();
    }

    #[test]
    fn reentrant_emission_reaches_other_handlers() {
        let bus = test_bus();
        let forwarded = Arc::new(Mutex::new(None));

        let sink = bus.spawn_handler({
            let bus = bus.clone();
            let forwarded = forwarded.clone();
            async move {
                let value = bus.await_event::<i32>("relayed").await;
                *forwarded.lock().unwrap() = Some(value);
            }
        });
        let relay = bus.spawn_handler({
            let bus = bus.clone();
            async move {
                if let Ok(value) = bus.await_event::<i32>("origin").await {
                    bus.emit("relayed", value * 2);
                }
            }
        });

        bus.emit("origin", 21_i32);
        relay.join();
        sink.join();

        assert_eq!(forwarded.lock().unwrap().take(), Some(Ok(42)));
        bus.executor().stop();
    }
}
