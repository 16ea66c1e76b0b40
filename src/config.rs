//! The tunables table. A plain struct with a `Default` impl — no
//! env-var or file-loading surface is mandated, so no config crate is pulled
//! in for it.

/// WorkerPool and object-pool tunables, plus the circuit breaker and
/// middleware-execution toggles `App` exposes to user code.
#[derive(Debug, Clone)]
pub struct Config {
    /// Initial worker count. Default: `8 * num_cpus`.
    pub core_pool_size: usize,
    /// Upper bound on worker count. Default: `16 * num_cpus`.
    pub max_pool_size: usize,
    /// Bounded-queue capacity. Default: 200 000.
    pub queue_capacity: usize,
    /// Idle worker reclamation window.
    pub keep_alive: std::time::Duration,
    /// Use a capacity-0 synchronous handoff queue instead of the bounded FIFO.
    pub use_synchronous_queue: bool,
    /// Use per-worker deques instead of a central bounded queue.
    pub use_work_stealing: bool,
    /// On overflow, run the task on the submitting thread instead of rejecting.
    pub caller_runs_when_rejected: bool,
    /// Spawn `core_pool_size` threads eagerly instead of lazily.
    pub prestart_core_threads: bool,
    /// Adaptive-sizing scale-up threshold.
    pub target_utilization: f64,
    /// Adaptive-sizing monitor tick.
    pub scaling_check_interval: std::time::Duration,
    /// Grow `queue_capacity` when fill exceeds 80% (applied at next listen()).
    pub use_adaptive_queue: bool,
    /// Recycle Request/Response/Context through ObjectPool.
    pub use_object_pooling: bool,
    /// Initial per-pool capacity (hard ceiling 10 000).
    pub pool_size: usize,
    /// Run the 30s background observer that grows/shrinks the object pools'
    /// capacity based on miss rate and idle time.
    pub object_pool_adaptive: bool,
    /// Enable the CircuitBreaker around the worker path.
    pub enable_circuit_breaker: bool,
    /// Consecutive errors to trip the breaker.
    pub circuit_breaker_threshold: u32,
    /// open → half-open window.
    pub circuit_breaker_reset_timeout: std::time::Duration,
    /// Run the global middleware chain on the WorkerPool before the handler,
    /// rather than inline on the serving thread.
    pub async_middleware: bool,
    /// Number of I/O threads. Default: `max(4, 4 * num_cpus)`.
    pub io_threads: usize,
    /// Per-exchange request timeout.
    pub request_timeout: std::time::Duration,
    /// Per-connection idle timeout.
    pub idle_timeout: std::time::Duration,
}

impl Default for Config {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            core_pool_size: 8 * cpus,
            max_pool_size: 16 * cpus,
            queue_capacity: 200_000,
            keep_alive: std::time::Duration::from_secs(30),
            use_synchronous_queue: false,
            use_work_stealing: false,
            caller_runs_when_rejected: true,
            prestart_core_threads: true,
            target_utilization: 0.85,
            scaling_check_interval: std::time::Duration::from_millis(2000),
            use_adaptive_queue: true,
            use_object_pooling: true,
            pool_size: 1000,
            object_pool_adaptive: true,
            enable_circuit_breaker: false,
            circuit_breaker_threshold: 50,
            circuit_breaker_reset_timeout: std::time::Duration::from_millis(30_000),
            async_middleware: false,
            io_threads: (4 * cpus).max(4),
            request_timeout: std::time::Duration::from_secs(30),
            idle_timeout: std::time::Duration::from_secs(60),
        }
    }
}

pub const POOL_SIZE_CEILING: usize = 10_000;
pub const FAST_ROUTE_CACHE_CAPACITY: usize = 1024;
