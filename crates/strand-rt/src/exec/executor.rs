// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Dynamically sized, prioritized, work-stealing executor.
//!
//! Workers each own a local queue and drain it first, then the global
//! priority queues High → Normal → Low, then steal from peers. A worker
//! that finds nothing re-checks under the scheduling mutex and parks on a
//! condition variable with the keep-alive timeout; timing out above the
//! worker floor retires the worker. Submissions couple the enqueue and the
//! upscale decision under that same mutex.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;

use super::config::Config;
use super::queue::MpmcQueue;
use super::task::{Priority, Task, PRIORITY_CLASSES};

thread_local! {
    /// Identity of the worker running on this thread: the owning executor's
    /// key plus the worker index. Lets `schedule` route to the caller's own
    /// local queue without claiming a foreign executor's queue.
    static CURRENT_WORKER: Cell<Option<(usize, usize)>> = Cell::new(None);
}

/// State shared between the executor handle and its worker threads.
struct Shared {
    config: Config,
    /// Global queues, one per priority class, indexed by `Priority`.
    global: Vec<MpmcQueue<Task>>,
    /// Per-worker local queues. Index = worker id. Grows on upscale and is
    /// never compacted; a retired worker's queue stays a valid steal victim.
    locals: RwLock<Vec<Arc<MpmcQueue<Task>>>>,
    /// Tasks enqueued but not yet handed to user code.
    pending: AtomicUsize,
    /// Workers alive and eligible to dequeue.
    active: AtomicUsize,
    stopped: AtomicBool,
    /// Guards worker bookkeeping and the submission/upscale couple.
    core: Mutex<Core>,
    work_available: Condvar,
}

struct Core {
    started: bool,
    next_worker_id: usize,
    workers: Vec<thread::JoinHandle<()>>,
    /// Current queue cell-pool size; doubled under submission pressure.
    task_pool_size: usize,
}

impl Shared {
    fn uses_locals(&self) -> bool {
        // Batch acquisition spills its remainder into the local queue, so
        // batch mode provisions one even with stealing disabled.
        self.config.work_stealing || self.config.batch_acquisition
    }

    fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

/// Prioritized work-stealing thread pool with autoscaling between
/// configured bounds.
///
/// The thread pool is created lazily by [`start`](Executor::start);
/// [`stop`](Executor::stop) is cooperative and leaves still-queued tasks
/// undispatched. Dropping the executor stops it.
pub struct Executor {
    shared: Arc<Shared>,
}

impl Executor {
    pub fn new(config: Config) -> Self {
        let global = (0..PRIORITY_CLASSES)
            .map(|_| MpmcQueue::new(config.initial_task_pool_size))
            .collect();
        let task_pool_size = config.initial_task_pool_size;
        Self {
            shared: Arc::new(Shared {
                config,
                global,
                locals: RwLock::new(Vec::new()),
                pending: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
                core: Mutex::new(Core {
                    started: false,
                    next_worker_id: 0,
                    workers: Vec::new(),
                    task_pool_size,
                }),
                work_available: Condvar::new(),
            }),
        }
    }

    /// Spawn the worker pool at the configured floor. Idempotent; a stopped
    /// executor does not restart.
    pub fn start(&self) {
        let mut core = self.shared.core.lock().unwrap();
        if core.started || self.shared.stopped.load(Ordering::Acquire) {
            return;
        }
        core.started = true;
        for _ in 0..self.shared.config.min_workers {
            spawn_worker(&self.shared, &mut core);
        }
    }

    /// Submit an action at [`Priority::Normal`].
    pub fn schedule<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_with(action, Priority::Normal);
    }

    /// Submit an action at the given priority class.
    ///
    /// From a worker thread with stealing enabled the task lands on that
    /// worker's local queue, otherwise on the global queue of its class.
    /// Submissions after shutdown are dropped silently.
    pub fn schedule_with<F>(&self, action: F, priority: Priority)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.stopped.load(Ordering::Acquire) {
            return;
        }
        let task = Task::new(action, priority);
        {
            let mut core = self.shared.core.lock().unwrap();
            if self.shared.stopped.load(Ordering::Acquire) {
                return;
            }
            grow_task_pools(&self.shared, &mut core);

            // Count the task before it becomes poppable, so a concurrent
            // dequeue can never drive `pending` below zero.
            self.shared.pending.fetch_add(1, Ordering::AcqRel);
            match caller_local_queue(&self.shared) {
                Some(queue) => queue.push(task),
                None => {
                    let class = task.priority().index();
                    self.shared.global[class].push(task);
                }
            }

            if should_scale_up(&self.shared, &core) {
                spawn_worker(&self.shared, &mut core);
            }
        }
        self.shared.work_available.notify_one();
    }

    /// Raise the shutdown flag, wake every worker, and join them. Tasks
    /// still queued are dropped undispatched.
    pub fn stop(&self) {
        let workers = {
            let mut core = self.shared.core.lock().unwrap();
            self.shared.stopped.store(true, Ordering::Release);
            std::mem::take(&mut core.workers)
        };
        self.shared.work_available.notify_all();
        for handle in workers {
            if handle.join().is_err() {
                log::error!("worker thread panicked during shutdown");
            }
        }
    }

    /// Tasks enqueued but not yet dispatched into user code. Weakly
    /// consistent; meant for autoscaling and idleness checks.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Workers alive and eligible to dequeue.
    pub fn active_workers(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if !self.shared.stopped.load(Ordering::Acquire) {
            self.stop();
        }
    }
}

/// The caller's own local queue, when the caller is a worker of this
/// executor and stealing is enabled.
fn caller_local_queue(shared: &Arc<Shared>) -> Option<Arc<MpmcQueue<Task>>> {
    if !shared.config.work_stealing {
        return None;
    }
    let (key, index) = CURRENT_WORKER.with(|w| w.get())?;
    if key != shared.key() {
        return None;
    }
    local_queue(shared, index)
}

fn local_queue(shared: &Shared, index: usize) -> Option<Arc<MpmcQueue<Task>>> {
    shared.locals.read().unwrap().get(index).cloned()
}

fn should_scale_up(shared: &Shared, core: &Core) -> bool {
    if !core.started {
        return false;
    }
    let active = shared.active.load(Ordering::Acquire);
    let pending = shared.pending.load(Ordering::Acquire);
    pending > 0
        && pending / (active + 1) > shared.config.tasks_per_worker_threshold
        && active < shared.config.max_workers
}

/// Double every queue's cell pool once pending crosses 80% of the current
/// pool size.
fn grow_task_pools(shared: &Shared, core: &mut Core) {
    let pending = shared.pending.load(Ordering::Acquire);
    if pending * 5 <= core.task_pool_size * 4 {
        return;
    }
    let new_size = core.task_pool_size * 2;
    for queue in &shared.global {
        queue.resize_pool(new_size);
    }
    let locals = shared.locals.read().unwrap();
    if !locals.is_empty() {
        let per_local = (new_size / locals.len()).max(1);
        for queue in locals.iter() {
            queue.resize_pool(per_local);
        }
    }
    core.task_pool_size = new_size;
}

/// Add one worker. A spawn refusal is logged and the upscale abandoned;
/// the pool keeps operating at its current size.
fn spawn_worker(shared: &Arc<Shared>, core: &mut Core) {
    let id = core.next_worker_id;
    if shared.uses_locals() {
        let mut locals = shared.locals.write().unwrap();
        locals.push(Arc::new(MpmcQueue::new(
            shared.config.initial_task_pool_size,
        )));
    }
    let worker_shared = shared.clone();
    let spawned = thread::Builder::new()
        .name(format!("strand-worker-{id}"))
        .spawn(move || worker_loop(id, &worker_shared));
    match spawned {
        Ok(handle) => {
            core.next_worker_id = id + 1;
            shared.active.fetch_add(1, Ordering::AcqRel);
            core.workers.push(handle);
        }
        Err(err) => {
            // Abandon the upscale; take back the queue provisioned for the
            // worker that never came up so ids and queues stay aligned.
            if shared.uses_locals() {
                shared.locals.write().unwrap().pop();
            }
            log::error!("failed to spawn worker {id}: {err}");
        }
    }
}

fn worker_loop(id: usize, shared: &Arc<Shared>) {
    CURRENT_WORKER.with(|w| w.set(Some((shared.key(), id))));

    loop {
        // Shutdown leaves still-queued tasks undispatched, so the flag is
        // observed before reaching for more work.
        if shared.stopped.load(Ordering::Acquire) {
            break;
        }
        if let Some(task) = next_task(shared, id) {
            execute(task);
            continue;
        }

        let core = shared.core.lock().unwrap();
        if shared.stopped.load(Ordering::Acquire) {
            break;
        }
        // Re-check with the mutex held: submissions enqueue under this
        // mutex, so work pushed since the unlocked probe is visible here
        // and the wakeup cannot be missed.
        if let Some(task) = next_task(shared, id) {
            drop(core);
            execute(task);
            continue;
        }

        let (core, timeout) = shared
            .work_available
            .wait_timeout(core, shared.config.keep_alive)
            .unwrap();
        drop(core);

        if shared.stopped.load(Ordering::Acquire) {
            break;
        }
        if timeout.timed_out() && try_retire_idle(shared) {
            return;
        }
    }
    shared.active.fetch_sub(1, Ordering::AcqRel);
}

/// Idle scale-down: give up this worker unless doing so would drop the
/// pool below its floor. The CAS keeps two simultaneous timeouts from both
/// retiring past the floor.
fn try_retire_idle(shared: &Shared) -> bool {
    loop {
        let active = shared.active.load(Ordering::Acquire);
        if active <= shared.config.min_workers {
            return false;
        }
        if shared
            .active
            .compare_exchange(active, active - 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return true;
        }
    }
}

/// Dispatch policy: own local queue, then the global queues in priority
/// order, then steal. `pending` drops when a task leaves a queue.
fn next_task(shared: &Shared, id: usize) -> Option<Task> {
    if shared.config.batch_acquisition {
        return next_task_batched(shared, id);
    }
    if shared.config.work_stealing {
        if let Some(task) = local_queue(shared, id).and_then(|q| q.try_pop()) {
            shared.pending.fetch_sub(1, Ordering::AcqRel);
            return Some(task);
        }
    }
    for queue in &shared.global {
        if let Some(task) = queue.try_pop() {
            shared.pending.fetch_sub(1, Ordering::AcqRel);
            return Some(task);
        }
    }
    if shared.config.work_stealing {
        steal(shared, id)
    } else {
        None
    }
}

/// Batch acquisition: drain up to `batch_size` tasks from the first
/// non-empty priority class, run the first here, spill the rest into the
/// local queue. One class per acquisition keeps the priority preference.
fn next_task_batched(shared: &Shared, id: usize) -> Option<Task> {
    if let Some(task) = local_queue(shared, id).and_then(|q| q.try_pop()) {
        shared.pending.fetch_sub(1, Ordering::AcqRel);
        return Some(task);
    }

    let mut batch = Vec::new();
    for queue in &shared.global {
        while batch.len() < shared.config.batch_size {
            match queue.try_pop() {
                Some(task) => {
                    shared.pending.fetch_sub(1, Ordering::AcqRel);
                    batch.push(task);
                }
                None => break,
            }
        }
        if !batch.is_empty() {
            break;
        }
    }
    if batch.is_empty() {
        return if shared.config.work_stealing {
            steal(shared, id)
        } else {
            None
        };
    }

    let mut rest = batch.into_iter();
    let first = rest.next()?;
    let spill = rest.len();
    if spill > 0 {
        // The remainder goes back into a queue; count it before it becomes
        // stealable so `pending` cannot underflow.
        shared.pending.fetch_add(spill, Ordering::AcqRel);
    }
    match local_queue(shared, id) {
        Some(queue) => {
            for task in rest {
                queue.push(task);
            }
        }
        None => {
            for task in rest {
                let class = task.priority().index();
                shared.global[class].push(task);
            }
        }
    }
    Some(first)
}

/// Rotate through every peer's local queue once, starting after ourselves.
fn steal(shared: &Shared, id: usize) -> Option<Task> {
    let locals = shared.locals.read().unwrap();
    let n = locals.len();
    if n == 0 {
        return None;
    }
    let start = (id + 1) % n;
    for i in 0..n {
        let victim = (start + i) % n;
        if victim == id {
            continue;
        }
        if let Some(task) = locals[victim].try_pop() {
            shared.pending.fetch_sub(1, Ordering::AcqRel);
            return Some(task);
        }
    }
    None
}

/// Run one task. Faults are contained: the panic is reported through the
/// log facade and the worker keeps dispatching.
fn execute(task: Task) {
    let action = task.into_action();
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(action)) {
        log::error!("task panicked: {}", panic_message(payload.as_ref()));
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn small_config(workers: usize) -> Config {
        Config {
            max_workers: workers,
            min_workers: workers,
            keep_alive: Duration::from_secs(5),
            ..Config::default()
        }
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    #[test]
    fn executes_scheduled_tasks() {
        let exec = Executor::new(small_config(2));
        exec.start();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            exec.schedule(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert!(wait_until(Duration::from_secs(5), || counter
            .load(Ordering::Relaxed)
            == 50));
        assert!(wait_until(Duration::from_secs(1), || exec.pending() == 0));
        exec.stop();
    }

    #[test]
    fn start_is_idempotent() {
        let exec = Executor::new(small_config(2));
        exec.start();
        exec.start();
        assert_eq!(exec.active_workers(), 2);
        exec.stop();
        assert_eq!(exec.active_workers(), 0);
    }

    #[test]
    fn submissions_after_stop_are_dropped() {
        let exec = Executor::new(small_config(1));
        exec.start();
        exec.stop();

        let hit = Arc::new(AtomicUsize::new(0));
        {
            let hit = hit.clone();
            exec.schedule(move || {
                hit.fetch_add(1, Ordering::Relaxed);
            });
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hit.load(Ordering::Relaxed), 0);
        assert_eq!(exec.pending(), 0);
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let exec = Executor::new(small_config(1));
        exec.start();

        exec.schedule(|| panic!("deliberate"));
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = counter.clone();
            exec.schedule(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert!(wait_until(Duration::from_secs(5), || counter
            .load(Ordering::Relaxed)
            == 1));
        exec.stop();
    }

    #[test]
    fn batch_acquisition_completes_everything() {
        let config = Config {
            max_workers: 2,
            min_workers: 2,
            batch_acquisition: true,
            batch_size: 16,
            keep_alive: Duration::from_secs(5),
            ..Config::default()
        };
        let exec = Executor::new(config);
        exec.start();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..500 {
            let counter = counter.clone();
            exec.schedule(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert!(wait_until(Duration::from_secs(10), || counter
            .load(Ordering::Relaxed)
            == 500));
        assert!(wait_until(Duration::from_secs(1), || exec.pending() == 0));
        exec.stop();
    }
}
