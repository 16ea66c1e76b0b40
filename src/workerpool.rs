//! Adaptive blocking worker pool — tier 2 of the two-tier dispatch
//! model. I/O threads (`io_loop.rs`) hand exchanges that need blocking work
//! off to this pool instead of doing it themselves, the way the teacher's
//! `worker.rs` hands accepted connections to a fixed-size thread set, except
//! this pool resizes itself between `core_pool_size` and `max_pool_size`.

use crate::metrics::WorkerPoolMetrics;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// How the pool hands work to its threads. Three modes: a bounded FIFO
/// (the default), a capacity-0 synchronous handoff, and per-worker
/// work-stealing deques.
enum Queue {
    Bounded { tx: SyncSender<Task>, rx: Arc<Mutex<Receiver<Task>>> },
    Synchronous { tx: SyncSender<Task>, rx: Arc<Mutex<Receiver<Task>>> },
    Stealing { global: Arc<crossbeam_style::Injector> },
}

/// A tiny work-stealing injector modeled as a mutex-protected deque — avoids
/// pulling in `crossbeam-deque` for a pool whose steal traffic is the rare
/// case, not the hot path the fast/ultra-fast paths already take care of.
mod crossbeam_style {
    use super::Task;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct Injector {
        queue: Mutex<VecDeque<Task>>,
    }

    impl Injector {
        pub fn push(&self, task: Task) {
            self.queue.lock().unwrap().push_back(task);
        }

        pub fn steal(&self) -> Option<Task> {
            self.queue.lock().unwrap().pop_front()
        }

        pub fn len(&self) -> usize {
            self.queue.lock().unwrap().len()
        }
    }
}

pub struct WorkerPoolConfig {
    pub core_pool_size: usize,
    pub max_pool_size: usize,
    pub queue_capacity: usize,
    pub keep_alive: Duration,
    pub use_synchronous_queue: bool,
    pub use_work_stealing: bool,
    pub caller_runs_when_rejected: bool,
    pub prestart_core_threads: bool,
    pub target_utilization: f64,
    pub scaling_check_interval: Duration,
    pub use_adaptive_queue: bool,
}

struct Shared {
    queue: Queue,
    active: AtomicUsize,
    live: AtomicUsize,
    shutdown: AtomicBool,
    metrics: WorkerPoolMetrics,
    parked: Condvar,
    parked_lock: Mutex<()>,
    /// Live, adjustable core-thread target. `config.core_pool_size` stays the
    /// fixed "initial" value used as the shrink floor; this is what
    /// `maybe_resize` actually grows and shrinks.
    core_size: AtomicUsize,
    /// Assigns each worker a stable id at spawn time so it can tell, on
    /// every loop iteration, whether it currently falls inside `core_size`.
    next_worker_id: AtomicUsize,
    /// Advisory only: `maybe_resize` updates this when the bounded queue's
    /// fill ratio crosses 80%, but the live `mpsc` channel is never resized
    /// in place. Takes effect the next time the pool is constructed.
    recommended_queue_capacity: AtomicUsize,
}

/// The tier-2 executor. Workers are plain OS threads pulled from (or pushed
/// into) `queue` depending on mode; a monitor thread periodically calls
/// `maybe_resize` to grow or shrink `live` toward `target_utilization`.
pub struct WorkerPool {
    shared: Arc<Shared>,
    config: WorkerPoolConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    QueueFull,
    ShuttingDown,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Arc<Self> {
        let queue = if config.use_work_stealing {
            Queue::Stealing { global: Arc::new(crossbeam_style::Injector::default()) }
        } else if config.use_synchronous_queue {
            let (tx, rx) = mpsc::sync_channel(0);
            Queue::Synchronous { tx, rx: Arc::new(Mutex::new(rx)) }
        } else {
            let (tx, rx) = mpsc::sync_channel(config.queue_capacity);
            Queue::Bounded { tx, rx: Arc::new(Mutex::new(rx)) }
        };

        let shared = Arc::new(Shared {
            queue,
            active: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            metrics: WorkerPoolMetrics::new(),
            parked: Condvar::new(),
            parked_lock: Mutex::new(()),
            core_size: AtomicUsize::new(config.core_pool_size),
            next_worker_id: AtomicUsize::new(0),
            recommended_queue_capacity: AtomicUsize::new(config.queue_capacity),
        });

        let pool = Arc::new(Self { shared, config, workers: Mutex::new(Vec::new()), monitor: Mutex::new(None) });

        if pool.config.prestart_core_threads {
            for _ in 0..pool.config.core_pool_size {
                pool.spawn_worker();
            }
        }

        let monitor_pool = Arc::downgrade(&pool);
        let tick = pool.config.scaling_check_interval;
        let handle = std::thread::Builder::new()
            .name("workerpool-monitor".into())
            .spawn(move || loop {
                std::thread::sleep(tick);
                match monitor_pool.upgrade() {
                    Some(pool) if !pool.shared.shutdown.load(Ordering::Acquire) => pool.maybe_resize(),
                    _ => break,
                }
            })
            .expect("failed to spawn workerpool monitor thread");
        *pool.monitor.lock().unwrap() = Some(handle);

        pool
    }

    pub fn metrics(&self) -> &WorkerPoolMetrics {
        &self.shared.metrics
    }

    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::Relaxed)
    }

    pub fn active_workers(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// The current adaptive core-thread target (distinct from
    /// `config.core_pool_size`, which stays the fixed initial value).
    pub fn core_size(&self) -> usize {
        self.shared.core_size.load(Ordering::Relaxed)
    }

    /// Advisory capacity the bounded queue would grow to at the next
    /// `listen()`, per the 80%-fill observer in `maybe_resize`. Only
    /// meaningful when the pool is not in work-stealing mode.
    pub fn recommended_queue_capacity(&self) -> usize {
        self.shared.recommended_queue_capacity.load(Ordering::Relaxed)
    }

    /// Fire-and-forget submission (`execute`). On rejection, either
    /// runs the task on the calling thread (`caller_runs_when_rejected`) or
    /// drops it and counts a rejection.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.shutdown.load(Ordering::Acquire) {
            self.shared.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.shared.metrics.submitted.fetch_add(1, Ordering::Relaxed);

        match self.try_enqueue(Box::new(task)) {
            Ok(()) => {}
            Err((reason, leftover)) => {
                self.shared.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                if reason == RejectReason::QueueFull && self.config.caller_runs_when_rejected {
                    run_timed(&self.shared.metrics, leftover);
                }
            }
        }
    }

    /// Blocking submission (`submit`): runs `f` on a worker thread and
    /// blocks the caller until the result is ready, mirroring a
    /// `Future<T>`'s `get()` without pulling in a futures executor this
    /// pool otherwise has no use for.
    pub fn submit<F, T>(&self, f: F) -> Result<T, RejectReason>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<T>();
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(RejectReason::ShuttingDown);
        }
        self.shared.metrics.submitted.fetch_add(1, Ordering::Relaxed);

        let wrapped: Task = Box::new(move || {
            let _ = tx.send(f());
        });
        match self.try_enqueue(wrapped) {
            Ok(()) => rx.recv().map_err(|_| RejectReason::ShuttingDown),
            Err((reason, leftover)) => {
                self.shared.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                if reason == RejectReason::QueueFull && self.config.caller_runs_when_rejected {
                    run_timed(&self.shared.metrics, leftover);
                    rx.recv().map_err(|_| RejectReason::ShuttingDown)
                } else {
                    Err(reason)
                }
            }
        }
    }

    fn try_enqueue(&self, task: Task) -> Result<(), (RejectReason, Task)> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err((RejectReason::ShuttingDown, task));
        }
        match &self.shared.queue {
            Queue::Bounded { tx, .. } | Queue::Synchronous { tx, .. } => match tx.try_send(task) {
                Ok(()) => {
                    self.shared.parked.notify_one();
                    Ok(())
                }
                Err(mpsc::TrySendError::Full(task)) => Err((RejectReason::QueueFull, task)),
                Err(mpsc::TrySendError::Disconnected(task)) => Err((RejectReason::ShuttingDown, task)),
            },
            Queue::Stealing { global } => {
                global.push(task);
                self.shared.parked.notify_one();
                Ok(())
            }
        }
    }

    fn spawn_worker(&self) {
        self.shared.live.fetch_add(1, Ordering::Relaxed);
        let worker_id = self.shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let shared = self.shared.clone();
        let keep_alive = self.config.keep_alive;
        let handle = std::thread::spawn(move || worker_loop(shared, keep_alive, worker_id));
        self.workers.lock().unwrap().push(handle);
    }

    /// Adaptive sizing, run on the monitor tick. Work-stealing mode disables
    /// the grow/shrink logic entirely (per-worker deques have no shared
    /// `utilization` signal worth acting on) and instead just warns when the
    /// backlog (submitted - completed) passes 1000. Otherwise: grow
    /// `core_size` by 2 (clamped at `max_pool_size`) when utilization is
    /// saturated, shrink it by 1 (clamped at the fixed `core_pool_size`
    /// floor) when utilization drops under half the target. Growing spawns
    /// workers immediately; shrinking just lowers the target and lets the
    /// workers above it time out via `keep_alive` on their own.
    fn maybe_resize(&self) {
        if matches!(self.shared.queue, Queue::Stealing { .. }) {
            let submitted = self.shared.metrics.submitted.load(Ordering::Relaxed);
            let completed = self.shared.metrics.completed.load(Ordering::Relaxed);
            if submitted.saturating_sub(completed) > 1000 {
                tracing::warn!(submitted, completed, "work-stealing pool backlog exceeds 1000");
            }
            return;
        }

        let live = self.shared.live.load(Ordering::Relaxed).max(1);
        let active = self.shared.active.load(Ordering::Relaxed);
        let utilization = active as f64 / live as f64;

        let core_size = self.shared.core_size.load(Ordering::Relaxed);
        if utilization > self.config.target_utilization && core_size < self.config.max_pool_size {
            let new_core = (core_size + 2).min(self.config.max_pool_size);
            let to_spawn = new_core.saturating_sub(core_size);
            self.shared.core_size.store(new_core, Ordering::Relaxed);
            for _ in 0..to_spawn {
                self.spawn_worker();
            }
            tracing::info!(core_size = new_core, "worker pool core size grown");
        } else if utilization < self.config.target_utilization / 2.0 && core_size > self.config.core_pool_size {
            let new_core = (core_size - 1).max(self.config.core_pool_size);
            self.shared.core_size.store(new_core, Ordering::Relaxed);
            tracing::info!(core_size = new_core, "worker pool core size shrunk");
        }

        if self.config.use_adaptive_queue {
            if let Queue::Bounded { .. } = &self.shared.queue {
                let in_flight = self.shared.metrics.submitted.load(Ordering::Relaxed)
                    - self.shared.metrics.completed.load(Ordering::Relaxed)
                    - self.shared.metrics.rejected.load(Ordering::Relaxed);
                let fill = in_flight as f64 / self.config.queue_capacity.max(1) as f64;
                if fill > 0.8 {
                    let current = self.shared.recommended_queue_capacity.load(Ordering::Relaxed);
                    let grown = ((current as f64) * 1.5).ceil() as usize;
                    if grown > current {
                        self.shared.recommended_queue_capacity.store(grown, Ordering::Relaxed);
                        tracing::info!(
                            recommended_capacity = grown,
                            "queue fill exceeds 80%, recommending larger capacity for next start"
                        );
                    }
                }
            }
        }
    }

    /// `shutdown`: stop admitting new tasks, let queued work drain.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.parked.notify_all();
    }

    /// `shutdown_now`: stop admitting and drop anything still queued.
    pub fn shutdown_now(&self) {
        self.shutdown();
        match &self.shared.queue {
            Queue::Bounded { rx, .. } | Queue::Synchronous { rx, .. } => {
                let rx = rx.lock().unwrap();
                while rx.try_recv().is_ok() {}
            }
            Queue::Stealing { global } => while global.steal().is_some() {},
        }
    }

    /// `await_termination`: blocks up to `timeout` for all worker
    /// threads to exit after a `shutdown`/`shutdown_now` call.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut workers = self.workers.lock().unwrap();
        let mut remaining = Vec::new();
        for handle in workers.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                remaining.push(handle);
            }
        }
        *workers = remaining;
        drop(workers);

        while Instant::now() < deadline {
            if self.shared.live.load(Ordering::Relaxed) == 0 {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.shared.live.load(Ordering::Relaxed) == 0
    }
}

fn run_timed(metrics: &WorkerPoolMetrics, task: Task) {
    let start = Instant::now();
    task();
    metrics.cumulative_exec_nanos.fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
    metrics.completed.fetch_add(1, Ordering::Relaxed);
}

/// A worker whose `worker_id` falls outside the live `core_size` exits after
/// sitting idle past `keep_alive`. `is_core` is recomputed every iteration
/// (not fixed at spawn time) so that `maybe_resize` raising or lowering
/// `core_size` actually changes a worker's behavior: growing immediately
/// exempts new workers from the timeout, shrinking lets existing workers
/// above the new target time out and self-exit on their own.
fn worker_loop(shared: Arc<Shared>, keep_alive: Duration, worker_id: usize) {
    loop {
        let is_core = worker_id < shared.core_size.load(Ordering::Relaxed);
        let task = match &shared.queue {
            Queue::Bounded { rx, .. } | Queue::Synchronous { rx, .. } => {
                let rx = rx.lock().unwrap();
                if is_core {
                    rx.recv().ok()
                } else {
                    match rx.recv_timeout(keep_alive) {
                        Ok(task) => Some(task),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => None,
                    }
                }
            }
            Queue::Stealing { global } => {
                if let Some(task) = global.steal() {
                    Some(task)
                } else {
                    let guard = shared.parked_lock.lock().unwrap();
                    let (_guard, timeout) = shared.parked.wait_timeout(guard, keep_alive).unwrap();
                    if timeout.timed_out() && !is_core {
                        None
                    } else {
                        continue;
                    }
                }
            }
        };

        let Some(task) = task else {
            if shared.shutdown.load(Ordering::Acquire) || !is_core {
                break;
            }
            continue;
        };

        shared.active.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task));
        if let Err(payload) = result {
            drop(payload);
            tracing::error!("worker pool task panicked");
        }
        shared.metrics.cumulative_exec_nanos.fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        shared.metrics.completed.fetch_add(1, Ordering::Relaxed);
        shared.active.fetch_sub(1, Ordering::Relaxed);

        if shared.shutdown.load(Ordering::Acquire) {
            let queue_empty = match &shared.queue {
                Queue::Bounded { rx, .. } | Queue::Synchronous { rx, .. } => rx.lock().unwrap().try_recv().is_err(),
                Queue::Stealing { global } => global.len() == 0,
            };
            if queue_empty {
                break;
            }
        }
    }
    shared.live.fetch_sub(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn small_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            core_pool_size: 2,
            max_pool_size: 4,
            queue_capacity: 8,
            keep_alive: Duration::from_millis(50),
            use_synchronous_queue: false,
            use_work_stealing: false,
            caller_runs_when_rejected: true,
            prestart_core_threads: true,
            target_utilization: 0.75,
            scaling_check_interval: Duration::from_millis(20),
            use_adaptive_queue: true,
        }
    }

    #[test]
    fn execute_runs_task_and_counts_completion() {
        let pool = WorkerPool::new(small_config());
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        pool.execute(move || d.store(true, Ordering::SeqCst));
        std::thread::sleep(Duration::from_millis(100));
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(pool.metrics().completed.load(Ordering::Relaxed), 1);
        pool.shutdown();
        pool.await_termination(Duration::from_secs(1));
    }

    #[test]
    fn submit_returns_the_computed_value() {
        let pool = WorkerPool::new(small_config());
        let result = pool.submit(|| 6 * 7).unwrap();
        assert_eq!(result, 42);
        pool.shutdown();
        pool.await_termination(Duration::from_secs(1));
    }

    #[test]
    fn panicking_task_does_not_kill_the_worker() {
        let pool = WorkerPool::new(small_config());
        pool.execute(|| panic!("boom"));
        std::thread::sleep(Duration::from_millis(50));
        let result = pool.submit(|| 1 + 1).unwrap();
        assert_eq!(result, 2);
        pool.shutdown();
        pool.await_termination(Duration::from_secs(1));
    }

    #[test]
    fn caller_runs_when_queue_is_full_and_rejection_configured() {
        let mut config = small_config();
        config.core_pool_size = 0;
        config.prestart_core_threads = false;
        config.queue_capacity = 0;
        config.use_synchronous_queue = true;
        config.caller_runs_when_rejected = true;
        let pool = WorkerPool::new(config);

        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        // No workers are listening, so the synchronous handoff rejects
        // immediately and the caller must run it inline.
        pool.execute(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[test]
    fn shutdown_then_await_termination_drains_workers() {
        let pool = WorkerPool::new(small_config());
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(2)));
    }
}
