//! DispatchEngine — turns an inbound exchange into a handler
//! invocation and a response, choosing among the fast path, ultra-fast
//! path, and worker path per request.

use crate::breaker::CircuitBreaker;
use crate::config::{Config, FAST_ROUTE_CACHE_CAPACITY};
use crate::context::{Context, Locals, Request, Response};
use crate::error::{DispatchError, HandlerError};
use crate::http::{Method, RawRequest};
use crate::metrics::DispatchMetrics;
use crate::middleware::{self, MiddlewareFn};
use crate::pool::ObjectPool;
use crate::router::{Handler, Route, Router};
use crate::workerpool::WorkerPool;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A fully rendered response, ready for the I/O layer to serialize onto the
/// wire. Keep-alive is decided by the caller from the request headers, not
/// here — it is a connection-level concern, not a response-content one.
pub struct FinishedResponse {
    pub status: u16,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl FinishedResponse {
    fn from_response(resp: &Response) -> Self {
        Self {
            status: resp.status_out(),
            content_type: resp.content_type_out().to_string(),
            headers: resp.headers_out().to_vec(),
            body: resp.body_out().to_vec(),
        }
    }

    fn plain(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self { status, content_type: "application/json".to_string(), headers: Vec::new(), body: body.into() }
    }
}

/// Bounded cache of previously resolved, middleware-free routes, keyed
/// `METHOD|path`. First-in-first-out eviction once full — the spec leaves
/// the eviction policy as an implementation choice (LRU or random); FIFO
/// avoids a timestamp/PRNG dependency the teacher's stack doesn't carry
/// while still bounding memory.
struct FastRouteCache {
    capacity: usize,
    entries: Mutex<(HashMap<String, Route>, VecDeque<String>)>,
}

impl FastRouteCache {
    fn new(capacity: usize) -> Self {
        Self { capacity, entries: Mutex::new((HashMap::new(), VecDeque::new())) }
    }

    fn get(&self, key: &str) -> Option<Route> {
        self.entries.lock().unwrap().0.get(key).cloned()
    }

    fn insert(&self, key: String, route: Route) {
        let mut guard = self.entries.lock().unwrap();
        if guard.0.contains_key(&key) {
            return;
        }
        if guard.0.len() >= self.capacity {
            if let Some(oldest) = guard.1.pop_front() {
                guard.0.remove(&oldest);
            }
        }
        guard.1.push_back(key.clone());
        guard.0.insert(key, route);
    }
}

fn cache_key(method: Method, path: &str) -> String {
    format!("{}|{}", method.as_str(), path)
}

/// Renders a `DispatchError` as the final response at the seam where the
/// engine itself (not a handler) decides the exchange is over.
fn error_response(err: DispatchError) -> FinishedResponse {
    let body = format!(r#"{{"error":"{err}"}}"#);
    FinishedResponse::plain(err.status(), body.into_bytes())
}

const HEALTH_PATHS: [&str; 3] = ["/health", "/ping", "/status"];

pub struct DispatchEngine {
    router: Router,
    global_middleware: Vec<MiddlewareFn>,
    breaker: CircuitBreaker,
    fast_cache: FastRouteCache,
    ctx_pool: ObjectPool<Context>,
    app_locals: Locals,
    pub metrics: DispatchMetrics,
    use_object_pooling: bool,
    async_middleware: bool,
    worker_pool: Option<Arc<WorkerPool>>,
    initial_pool_size: usize,
    last_pool_misses: AtomicUsize,
    pool_idle_ticks: AtomicU64,
}

impl DispatchEngine {
    pub fn new(router: Router, config: &Config, app_locals: Locals) -> Self {
        Self {
            router,
            global_middleware: Vec::new(),
            breaker: CircuitBreaker::new(
                config.enable_circuit_breaker,
                config.circuit_breaker_threshold,
                config.circuit_breaker_reset_timeout,
            ),
            fast_cache: FastRouteCache::new(FAST_ROUTE_CACHE_CAPACITY),
            ctx_pool: ObjectPool::new(config.pool_size),
            app_locals,
            metrics: DispatchMetrics::new(),
            use_object_pooling: config.use_object_pooling,
            async_middleware: config.async_middleware,
            worker_pool: None,
            initial_pool_size: config.pool_size,
            last_pool_misses: AtomicUsize::new(0),
            pool_idle_ticks: AtomicU64::new(0),
        }
    }

    pub fn add_global_middleware(&mut self, mw: MiddlewareFn) {
        self.global_middleware.push(mw);
    }

    /// Lets the global middleware chain run asynchronously on the
    /// `WorkerPool` (`Config::async_middleware`) instead of inline. Must be
    /// called before the engine is wrapped in an `Arc` and handed to I/O
    /// threads.
    pub fn set_worker_pool(&mut self, pool: Arc<WorkerPool>) {
        self.worker_pool = Some(pool);
    }

    pub fn reset_circuit_breaker(&self) {
        self.breaker.reset();
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Called every 30s by the object-pool adaptive-sizing monitor thread.
    /// Computes the miss delta since the last tick, tracks consecutive
    /// zero-miss ticks as the idle window, and feeds both to
    /// `ObjectPool::adjust_capacity`.
    pub fn adaptive_pool_tick(&self) {
        let misses_now = self.ctx_pool.misses();
        let last = self.last_pool_misses.swap(misses_now, Ordering::Relaxed);
        let delta = misses_now.saturating_sub(last);

        let idle_minutes = if delta == 0 {
            let ticks = self.pool_idle_ticks.fetch_add(1, Ordering::Relaxed) + 1;
            ticks / 2 // ticks are 30s apart
        } else {
            self.pool_idle_ticks.store(0, Ordering::Relaxed);
            0
        };

        self.ctx_pool.adjust_capacity(delta, idle_minutes, self.initial_pool_size, crate::config::POOL_SIZE_CEILING);
    }

    fn acquire_context(&self, raw: &RawRequest<'_>) -> Context {
        if self.use_object_pooling {
            self.ctx_pool.acquire(
                || Context::new(Request::from_raw(clone_raw_for_alloc(raw)), Response::new(), Some(&self.app_locals)),
                |ctx| ctx.reset(raw, Some(&self.app_locals)),
            )
        } else {
            Context::new(Request::from_raw(clone_raw_for_alloc(raw)), Response::new(), Some(&self.app_locals))
        }
    }

    fn release_context(&self, ctx: Context) {
        if self.use_object_pooling {
            self.ctx_pool.release(ctx);
        }
    }

    /// Fast-path classification. `on_io_thread` is `true` only when called from
    /// an I/O thread with no blocking already performed on this exchange.
    pub fn is_fast_path_eligible(&self, method: Method, on_io_thread: bool) -> bool {
        on_io_thread && method.is_fast_path_eligible() && self.global_middleware.is_empty()
    }

    /// Attempts the fast / ultra-fast path. Returns `None` if the request
    /// must be re-dispatched onto a worker thread — including on any
    /// internal failure ("fall through to the worker path
    /// without failing the request").
    pub fn try_fast_path(&self, raw: &RawRequest<'_>, on_io_thread: bool) -> Option<FinishedResponse> {
        if !self.is_fast_path_eligible(raw.method, on_io_thread) {
            return None;
        }

        if HEALTH_PATHS.contains(&raw.path) {
            self.metrics.fast_path_hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Some(FinishedResponse::plain(200, br#"{"status":"ok"}"#.to_vec()));
        }

        let key = cache_key(raw.method, raw.path);
        let route = match self.fast_cache.get(&key) {
            Some(route) => route,
            None => {
                let found = self.router.find(raw.method, raw.path)?;
                if found.route.middleware.is_empty() {
                    self.fast_cache.insert(key, found.route.clone());
                }
                if !found.route.middleware.is_empty() {
                    return None; // needs per-route middleware; not fast-pathable
                }
                return self.run_inline(raw, found.route, found.params, true);
            }
        };

        self.run_inline(raw, route, Vec::new(), false)
    }

    /// Runs the resolved route's handler directly on the calling thread,
    /// with no middleware. Resolves path params first if the cache entry
    /// carries none (cache hits never store params; a fresh `router.find`
    /// result does, and is routed through this same helper for the
    /// ultra-fast-vs-parametrized split).
    fn run_inline(
        &self,
        raw: &RawRequest<'_>,
        route: Route,
        params: Vec<(String, String)>,
        is_ultra_fast: bool,
    ) -> Option<FinishedResponse> {
        if is_ultra_fast && params.is_empty() {
            self.metrics.ultra_fast_path_hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        } else {
            self.metrics.fast_path_hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        let mut ctx = self.acquire_context(raw);
        ctx.request.set_path_params(params);

        let outcome = invoke_handler(&route.handler, &mut ctx);
        let finished = match outcome {
            Ok(()) => {
                finalize_unsent(&mut ctx.response);
                Some(FinishedResponse::from_response(&ctx.response))
            }
            Err(_panicked_or_failed) => None, // fall through to the worker path
        };
        self.release_context(ctx);
        finished
    }

    /// The full pipeline: breaker admission, global middleware, routing,
    /// per-route middleware, handler, guaranteed completion + release.
    pub fn dispatch_worker_path(&self, raw: RawRequest<'_>) -> FinishedResponse {
        self.metrics.worker_path_hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        if !self.breaker.allow_request() {
            self.metrics.breaker_rejections.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tracing::warn!("circuit breaker open; rejecting request");
            return error_response(DispatchError::BreakerOpen);
        }

        let mut ctx = self.acquire_context(&raw);

        let should_continue = if self.async_middleware {
            if let Some(pool) = &self.worker_pool {
                let chain = self.global_middleware.clone();
                match pool.submit(move || {
                    let cont = middleware::run_chain(&chain, &mut ctx);
                    (cont, ctx)
                }) {
                    Ok((cont, returned_ctx)) => {
                        ctx = returned_ctx;
                        cont
                    }
                    Err(_rejected) => {
                        // ctx was moved into the submitted closure and is gone
                        // with it; there is nothing left to release.
                        self.metrics.breaker_rejections.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        return error_response(DispatchError::Overload);
                    }
                }
            } else {
                middleware::run_chain(&self.global_middleware, &mut ctx)
            }
        } else {
            middleware::run_chain(&self.global_middleware, &mut ctx)
        };

        if !should_continue {
            finalize_unsent(&mut ctx.response);
            let finished = FinishedResponse::from_response(&ctx.response);
            self.release_context(ctx);
            return finished;
        }

        let found = self.router.find(raw.method, raw.path);
        let Some(found) = found else {
            self.metrics.not_found.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.release_context(ctx);
            return error_response(DispatchError::NotFound);
        };

        ctx.request.set_path_params(found.params);

        if !middleware::run_chain(&found.route.middleware, &mut ctx) {
            finalize_unsent(&mut ctx.response);
            let finished = FinishedResponse::from_response(&ctx.response);
            self.release_context(ctx);
            return finished;
        }

        match invoke_handler(&found.route.handler, &mut ctx) {
            Ok(()) => {
                self.breaker.record_success();
            }
            Err(err) => {
                self.metrics.handler_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::error!(error = %err, "handler failure");
                if !ctx.response.sent() {
                    ctx.response.error(err.status, err.message);
                }
                self.breaker.record_failure();
            }
        }

        finalize_unsent(&mut ctx.response);
        let finished = FinishedResponse::from_response(&ctx.response);
        self.release_context(ctx);
        finished
    }
}

/// Runs a handler, catching both its own `HandlerError` return and a panic
/// (turned into a `HandlerFailure`-shaped `HandlerError`). This is the seam
/// Replaces "throw to abort" with `Result` + a caught panic.
fn invoke_handler(handler: &Handler, ctx: &mut Context) -> Result<(), HandlerError> {
    match panic::catch_unwind(AssertUnwindSafe(|| handler(ctx))) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(&payload);
            Err(HandlerError::internal(format!("handler panicked: {message}")))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Ensure the exchange is completed even if the handler forgot to
/// send a body."
fn finalize_unsent(response: &mut Response) {
    if !response.sent() {
        response.send(Vec::new());
    }
}

fn clone_raw_for_alloc<'a>(raw: &RawRequest<'a>) -> RawRequest<'a> {
    RawRequest {
        method: raw.method,
        path: raw.path,
        query: raw.query,
        headers: raw.headers,
        header_count: raw.header_count,
        body: raw.body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{handler_fn, middleware_fn};

    fn empty_raw<'a>(method: Method, path: &'a str) -> RawRequest<'a> {
        RawRequest {
            method,
            path,
            query: None,
            headers: [("", ""); crate::http::MAX_HEADERS],
            header_count: 0,
            body: b"",
        }
    }

    fn engine_with(router: Router) -> DispatchEngine {
        DispatchEngine::new(router, &Config::default(), Locals::new())
    }

    #[test]
    fn health_short_circuits_without_touching_router() {
        let engine = engine_with(Router::new());
        let resp = engine.try_fast_path(&empty_raw(Method::Get, "/health"), true).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, br#"{"status":"ok"}"#);
    }

    #[test]
    fn static_route_hit_via_worker_path() {
        let mut router = Router::new();
        router.add(
            Method::Get,
            "/users",
            handler_fn(|ctx| {
                ctx.response.json(&serde_json::json!({"ok": true}));
                Ok(())
            }),
            vec![],
        );
        let engine = engine_with(router);

        let resp = engine.dispatch_worker_path(empty_raw(Method::Get, "/users"));
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, br#"{"ok":true}"#);

        let resp = engine.dispatch_worker_path(empty_raw(Method::Post, "/users"));
        assert_eq!(resp.status, 404);
    }

    #[test]
    fn global_middleware_short_circuit_blocks_handler() {
        let mut router = Router::new();
        router.add(Method::Get, "/secret", handler_fn(|_ctx| panic!("must not run")), vec![]);
        let mut engine = engine_with(router);
        engine.add_global_middleware(middleware_fn(|ctx| {
            ctx.response.status(403);
            ctx.response.send("denied");
            false
        }));

        let resp = engine.dispatch_worker_path(empty_raw(Method::Get, "/secret"));
        assert_eq!(resp.status, 403);
    }

    #[test]
    fn handler_panic_becomes_500_and_records_breaker_failure() {
        let mut router = Router::new();
        router.add(Method::Get, "/boom", handler_fn(|_ctx| panic!("kaboom")), vec![]);
        let mut config = Config::default();
        config.enable_circuit_breaker = true;
        config.circuit_breaker_threshold = 1;
        let engine = DispatchEngine::new(router, &config, Locals::new());

        let resp = engine.dispatch_worker_path(empty_raw(Method::Get, "/boom"));
        assert_eq!(resp.status, 500);

        let resp2 = engine.dispatch_worker_path(empty_raw(Method::Get, "/boom"));
        assert_eq!(resp2.status, 503, "breaker should now be open");
    }

    #[test]
    fn fast_path_ineligible_for_post_or_when_global_middleware_present() {
        let mut engine = engine_with(Router::new());
        assert!(!engine.is_fast_path_eligible(Method::Post, true));
        engine.add_global_middleware(middleware_fn(|_| true));
        assert!(!engine.is_fast_path_eligible(Method::Get, true));
    }

    #[test]
    fn not_found_on_fast_path_falls_through_to_worker() {
        let engine = engine_with(Router::new());
        assert!(engine.try_fast_path(&empty_raw(Method::Get, "/nope"), true).is_none());
    }

    #[test]
    fn handler_forgetting_to_send_gets_finalized() {
        let mut router = Router::new();
        router.add(Method::Get, "/noop", handler_fn(|_ctx| Ok(())), vec![]);
        let engine = engine_with(router);
        let resp = engine.dispatch_worker_path(empty_raw(Method::Get, "/noop"));
        assert_eq!(resp.status, 200);
    }
}
