//! The public facade. `App` owns the router builder,
//! the tuning knobs, and — once `listen()` is called — the live I/O threads
//! and worker pool. Mirrors the teacher's builder-style `App`/`Server` split,
//! collapsed into one type since this crate has no separate TLS/HTTP2
//! frontend to keep distinct from it.

use crate::config::Config;
use crate::context::Locals;
use crate::dispatch::DispatchEngine;
use crate::error::HandlerResult;
use crate::http::Method;
use crate::io_loop::{IoThread, IoThreadConfig};
use crate::metrics::IoMetrics;
use crate::middleware::{MiddlewareFn, handler_fn};
use crate::plugin::Plugin;
use crate::router::{Handler, Router};
use crate::workerpool::{WorkerPool, WorkerPoolConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

struct PendingRoute {
    method: Method,
    path: String,
    handler: Handler,
    middleware: Vec<MiddlewareFn>,
}

/// Before `listen()`, a build-time accumulator of routes/middleware/plugins
/// and tunables. After `listen()`, additionally owns the running server's
/// shutdown flag and thread handles.
pub struct App {
    host: String,
    port: u16,
    config: Config,
    routes: Mutex<Vec<PendingRoute>>,
    global_middleware: Mutex<Vec<MiddlewareFn>>,
    plugins: Vec<Arc<dyn Plugin>>,
    locals: Locals,

    dispatch: Mutex<Option<Arc<DispatchEngine>>>,
    worker_pool: Mutex<Option<Arc<WorkerPool>>>,
    io_metrics: Arc<IoMetrics>,
    shutdown: Arc<AtomicBool>,
    io_handles: Mutex<Vec<JoinHandle<crate::error::EngineResult<()>>>>,
}

impl App {
    pub fn new() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            config: Config::default(),
            routes: Mutex::new(Vec::new()),
            global_middleware: Mutex::new(Vec::new()),
            plugins: Vec::new(),
            locals: Locals::new(),
            dispatch: Mutex::new(None),
            worker_pool: Mutex::new(None),
            io_metrics: Arc::new(IoMetrics::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            io_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn r#use(&self, middleware: MiddlewareFn) -> &Self {
        self.global_middleware.lock().unwrap().push(middleware);
        self
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> &Self {
        plugin.register(self);
        self.plugins.push(plugin);
        self
    }

    pub fn route<F>(&self, method: Method, path: &str, handler: F) -> &Self
    where
        F: Fn(&mut crate::context::Context) -> HandlerResult<()> + Send + Sync + 'static,
    {
        self.routes.lock().unwrap().push(PendingRoute {
            method,
            path: path.to_string(),
            handler: handler_fn(handler),
            middleware: Vec::new(),
        });
        self
    }

    pub fn get<F>(&self, path: &str, handler: F) -> &Self
    where
        F: Fn(&mut crate::context::Context) -> HandlerResult<()> + Send + Sync + 'static,
    {
        self.route(Method::Get, path, handler)
    }

    pub fn post<F>(&self, path: &str, handler: F) -> &Self
    where
        F: Fn(&mut crate::context::Context) -> HandlerResult<()> + Send + Sync + 'static,
    {
        self.route(Method::Post, path, handler)
    }

    pub fn put<F>(&self, path: &str, handler: F) -> &Self
    where
        F: Fn(&mut crate::context::Context) -> HandlerResult<()> + Send + Sync + 'static,
    {
        self.route(Method::Put, path, handler)
    }

    pub fn delete<F>(&self, path: &str, handler: F) -> &Self
    where
        F: Fn(&mut crate::context::Context) -> HandlerResult<()> + Send + Sync + 'static,
    {
        self.route(Method::Delete, path, handler)
    }

    pub fn patch<F>(&self, path: &str, handler: F) -> &Self
    where
        F: Fn(&mut crate::context::Context) -> HandlerResult<()> + Send + Sync + 'static,
    {
        self.route(Method::Patch, path, handler)
    }

    pub fn head<F>(&self, path: &str, handler: F) -> &Self
    where
        F: Fn(&mut crate::context::Context) -> HandlerResult<()> + Send + Sync + 'static,
    {
        self.route(Method::Head, path, handler)
    }

    pub fn options<F>(&self, path: &str, handler: F) -> &Self
    where
        F: Fn(&mut crate::context::Context) -> HandlerResult<()> + Send + Sync + 'static,
    {
        self.route(Method::Options, path, handler)
    }

    pub fn trace<F>(&self, path: &str, handler: F) -> &Self
    where
        F: Fn(&mut crate::context::Context) -> HandlerResult<()> + Send + Sync + 'static,
    {
        self.route(Method::Trace, path, handler)
    }

    pub fn connect<F>(&self, path: &str, handler: F) -> &Self
    where
        F: Fn(&mut crate::context::Context) -> HandlerResult<()> + Send + Sync + 'static,
    {
        self.route(Method::Connect, path, handler)
    }

    // ---- Tuning ----

    pub fn async_middleware(mut self, enabled: bool) -> Self {
        self.config.async_middleware = enabled;
        self
    }

    pub fn circuit_breaker(mut self, enabled: bool) -> Self {
        self.config.enable_circuit_breaker = enabled;
        self
    }

    pub fn circuit_breaker_threshold(mut self, threshold: u32) -> Self {
        self.config.circuit_breaker_threshold = threshold;
        self
    }

    pub fn circuit_breaker_reset_timeout(mut self, millis: u64) -> Self {
        self.config.circuit_breaker_reset_timeout = Duration::from_millis(millis);
        self
    }

    pub fn reset_circuit_breaker(&self) {
        if let Some(dispatch) = self.dispatch.lock().unwrap().as_ref() {
            dispatch.reset_circuit_breaker();
        }
    }

    pub fn adaptive_pool_sizing(mut self, enabled: bool) -> Self {
        self.config.object_pool_adaptive = enabled;
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size.min(crate::config::POOL_SIZE_CEILING);
        self
    }

    pub fn io_threads(mut self, n: usize) -> Self {
        self.config.io_threads = n;
        self
    }

    pub fn core_pool_size(mut self, n: usize) -> Self {
        self.config.core_pool_size = n;
        self
    }

    pub fn max_pool_size(mut self, n: usize) -> Self {
        self.config.max_pool_size = n;
        self
    }

    /// Starts the listener: builds the `Router`, `DispatchEngine`, and
    /// `WorkerPool` from the accumulated build-time state, spawns one
    /// `IoThread` per configured I/O thread, then calls every registered
    /// plugin's `on_start`.
    pub fn listen(self: Arc<Self>) -> crate::error::EngineResult<()> {
        self.listen_with(|| {})
    }

    pub fn listen_with<F: FnOnce()>(self: Arc<Self>, after_bind: F) -> crate::error::EngineResult<()> {
        let mut router = Router::new();
        for pending in self.routes.lock().unwrap().drain(..) {
            router.add(pending.method, &pending.path, pending.handler, pending.middleware);
        }

        let mut dispatch = DispatchEngine::new(router, &self.config, self.locals.clone());
        for mw in self.global_middleware.lock().unwrap().iter() {
            dispatch.add_global_middleware(mw.clone());
        }

        let worker_pool = WorkerPool::new(WorkerPoolConfig {
            core_pool_size: self.config.core_pool_size,
            max_pool_size: self.config.max_pool_size,
            queue_capacity: self.config.queue_capacity,
            keep_alive: self.config.keep_alive,
            use_synchronous_queue: self.config.use_synchronous_queue,
            use_work_stealing: self.config.use_work_stealing,
            caller_runs_when_rejected: self.config.caller_runs_when_rejected,
            prestart_core_threads: self.config.prestart_core_threads,
            target_utilization: self.config.target_utilization,
            scaling_check_interval: self.config.scaling_check_interval,
            use_adaptive_queue: self.config.use_adaptive_queue,
        });
        *self.worker_pool.lock().unwrap() = Some(worker_pool.clone());

        if self.config.async_middleware {
            dispatch.set_worker_pool(worker_pool.clone());
        }
        let dispatch = Arc::new(dispatch);
        *self.dispatch.lock().unwrap() = Some(dispatch.clone());

        if self.config.object_pool_adaptive {
            let monitor_dispatch = Arc::downgrade(&dispatch);
            let shutdown = self.shutdown.clone();
            std::thread::Builder::new()
                .name("objectpool-monitor".into())
                .spawn(move || loop {
                    std::thread::sleep(Duration::from_secs(30));
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    match monitor_dispatch.upgrade() {
                        Some(dispatch) => dispatch.adaptive_pool_tick(),
                        None => break,
                    }
                })
                .expect("failed to spawn objectpool monitor thread");
        }

        let mut handles = Vec::with_capacity(self.config.io_threads);
        for core_id in 0..self.config.io_threads {
            let io_thread = IoThread::new(
                IoThreadConfig {
                    core_id,
                    host: self.host.clone(),
                    port: self.port,
                    slab_capacity: self.config.pool_size.max(1024),
                    request_timeout: self.config.request_timeout,
                },
                dispatch.clone(),
                worker_pool.clone(),
                self.io_metrics.clone(),
                self.shutdown.clone(),
            );
            handles.push(io_thread.spawn());
        }
        *self.io_handles.lock().unwrap() = handles;

        tracing::info!(host = %self.host, port = self.port, io_threads = self.config.io_threads, "listening");
        after_bind();
        for plugin in &self.plugins {
            plugin.on_start(&self);
        }

        Ok(())
    }

    /// `App::stop()`: notify plugins, stop the listener, shut the worker
    /// pool down with a 30s grace period.
    pub fn stop(&self) {
        for plugin in &self.plugins {
            plugin.on_stop(self);
        }
        self.shutdown.store(true, Ordering::Release);

        if let Some(pool) = self.worker_pool.lock().unwrap().as_ref() {
            pool.shutdown();
            pool.await_termination(Duration::from_secs(30));
        }

        for handle in self.io_handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }

    pub fn io_metrics(&self) -> &IoMetrics {
        &self.io_metrics
    }

    pub fn route_count(&self) -> usize {
        self.dispatch.lock().unwrap().as_ref().map(|d| d.router().route_count()).unwrap_or_else(|| {
            self.routes.lock().unwrap().len()
        })
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_routes_before_listen() {
        let app = App::new();
        app.get("/a", |ctx| {
            ctx.response.send("a");
            Ok(())
        });
        app.post("/b", |ctx| {
            ctx.response.send("b");
            Ok(())
        });
        assert_eq!(app.routes.lock().unwrap().len(), 2);
    }

    #[test]
    fn host_and_port_builder_methods_chain() {
        let app = App::new().host("127.0.0.1").port(9090);
        assert_eq!(app.host, "127.0.0.1");
        assert_eq!(app.port, 9090);
    }

    #[test]
    fn pool_size_is_clamped_to_ceiling() {
        let app = App::new().pool_size(50_000);
        assert_eq!(app.config.pool_size, crate::config::POOL_SIZE_CEILING);
    }
}
