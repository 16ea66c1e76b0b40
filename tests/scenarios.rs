//! End-to-end scenarios driven through `DispatchEngine` directly, the way
//! `dispatch.rs`'s own unit tests do, rather than through a real socket —
//! there's no listener to bind in a test binary, but the engine is the
//! seam every concrete request actually flows through regardless of which
//! tier accepted it.

use vireo::http::{Method, RawRequest};
use vireo::middleware::{handler_fn, middleware_fn};
use vireo::{App, Context};

fn empty_raw<'a>(method: Method, path: &'a str) -> RawRequest<'a> {
    RawRequest {
        method,
        path,
        query: None,
        headers: [("", ""); vireo::http::MAX_HEADERS],
        header_count: 0,
        body: b"",
    }
}

fn engine_with(router: vireo::router::Router) -> vireo::dispatch::DispatchEngine {
    vireo::dispatch::DispatchEngine::new(router, &vireo::config::Config::default(), vireo::context::Locals::new())
}

#[test]
fn static_route_hit_accepts_trailing_slash_rejects_wrong_method() {
    let mut router = vireo::router::Router::new();
    router.add(
        Method::Get,
        "/users",
        handler_fn(|ctx: &mut Context| {
            ctx.response.json(&serde_json::json!({"ok": true}));
            Ok(())
        }),
        vec![],
    );
    let engine = engine_with(router);

    let hit = engine.dispatch_worker_path(empty_raw(Method::Get, "/users"));
    assert_eq!(hit.status, 200);
    assert_eq!(hit.body, br#"{"ok":true}"#);

    let trailing = engine.dispatch_worker_path(empty_raw(Method::Get, "/users/"));
    assert_eq!(trailing.status, 200);
    assert_eq!(trailing.body, br#"{"ok":true}"#);

    let wrong_method = engine.dispatch_worker_path(empty_raw(Method::Post, "/users"));
    assert_eq!(wrong_method.status, 404);
}

#[test]
fn parameter_capture_rejects_empty_segment_and_traversal() {
    let mut router = vireo::router::Router::new();
    router.add(
        Method::Get,
        "/users/:id",
        handler_fn(|ctx: &mut Context| {
            let id = ctx.request.path_param("id").unwrap_or("missing").to_string();
            ctx.response.send(id);
            Ok(())
        }),
        vec![],
    );
    let engine = engine_with(router);

    let hit = engine.dispatch_worker_path(empty_raw(Method::Get, "/users/42"));
    assert_eq!(hit.status, 200);
    assert_eq!(hit.body, b"42");

    let empty_segment = engine.dispatch_worker_path(empty_raw(Method::Get, "/users/"));
    assert_eq!(empty_segment.status, 404);

    // `/users/../etc` resolves to three path segments against a one-segment
    // pattern, so it's a route miss regardless of sanitization.
    let traversal = engine.dispatch_worker_path(empty_raw(Method::Get, "/users/../etc"));
    assert_eq!(traversal.status, 404);
}

#[test]
fn static_route_wins_over_overlapping_dynamic_route() {
    let mut router = vireo::router::Router::new();
    router.add(
        Method::Get,
        "/users/:id",
        handler_fn(|ctx: &mut Context| {
            ctx.response.send("dynamic");
            Ok(())
        }),
        vec![],
    );
    router.add(
        Method::Get,
        "/users/special",
        handler_fn(|ctx: &mut Context| {
            ctx.response.send("static");
            Ok(())
        }),
        vec![],
    );
    let engine = engine_with(router);

    let resp = engine.dispatch_worker_path(empty_raw(Method::Get, "/users/special"));
    assert_eq!(resp.body, b"static");
}

#[test]
fn global_middleware_short_circuits_before_handler_runs() {
    let mut router = vireo::router::Router::new();
    router.add(Method::Get, "/admin", handler_fn(|_ctx: &mut Context| panic!("handler must not run")), vec![]);
    let mut engine = engine_with(router);
    engine.add_global_middleware(middleware_fn(|ctx: &mut Context| {
        ctx.response.status(401);
        ctx.response.send("unauthorized");
        false
    }));

    let resp = engine.dispatch_worker_path(empty_raw(Method::Get, "/admin"));
    assert_eq!(resp.status, 401);
    assert_eq!(resp.body, b"unauthorized");
}

#[test]
fn per_route_middleware_runs_after_global_and_can_short_circuit() {
    let mut router = vireo::router::Router::new();
    router.add(
        Method::Get,
        "/metered",
        handler_fn(|ctx: &mut Context| {
            ctx.response.send("ok");
            Ok(())
        }),
        vec![middleware_fn(|ctx: &mut Context| {
            ctx.response.status(429);
            ctx.response.send("slow down");
            false
        })],
    );
    let engine = engine_with(router);

    let resp = engine.dispatch_worker_path(empty_raw(Method::Get, "/metered"));
    assert_eq!(resp.status, 429);
    assert_eq!(resp.body, b"slow down");
}

#[test]
fn healthcheck_paths_never_reach_the_router() {
    // An empty router with no registered routes still answers every
    // healthcheck alias on the fast path.
    let engine = engine_with(vireo::router::Router::new());
    for path in ["/health", "/ping", "/status"] {
        let resp = engine.try_fast_path(&empty_raw(Method::Get, path), true).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, br#"{"status":"ok"}"#);
    }
}

#[test]
fn circuit_breaker_opens_after_threshold_and_recovers_on_reset() {
    let mut router = vireo::router::Router::new();
    router.add(Method::Get, "/flaky", handler_fn(|_ctx: &mut Context| panic!("boom")), vec![]);
    let mut config = vireo::config::Config::default();
    config.enable_circuit_breaker = true;
    config.circuit_breaker_threshold = 2;
    let engine = vireo::dispatch::DispatchEngine::new(router, &config, vireo::context::Locals::new());

    assert_eq!(engine.dispatch_worker_path(empty_raw(Method::Get, "/flaky")).status, 500);
    assert_eq!(engine.dispatch_worker_path(empty_raw(Method::Get, "/flaky")).status, 500);

    let rejected = engine.dispatch_worker_path(empty_raw(Method::Get, "/flaky"));
    assert_eq!(rejected.status, 503);

    engine.reset_circuit_breaker();
    let after_reset = engine.dispatch_worker_path(empty_raw(Method::Get, "/flaky"));
    assert_eq!(after_reset.status, 500, "reset should re-admit requests even though the handler still panics");
}

#[test]
fn error_response_uses_canonical_shape() {
    let mut router = vireo::router::Router::new();
    router.add(
        Method::Get,
        "/teapot",
        handler_fn(|ctx: &mut Context| {
            ctx.error(418, "I'm a teapot");
            Ok(())
        }),
        vec![],
    );
    let engine = engine_with(router);

    let resp = engine.dispatch_worker_path(empty_raw(Method::Get, "/teapot"));
    assert_eq!(resp.status, 418);
    let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(body["error"], serde_json::Value::Bool(true));
    assert_eq!(body["status"], 418);
    assert_eq!(body["message"], "I'm a teapot");
}

#[test]
fn app_builder_registers_routes_and_reports_count_before_listen() {
    let app = App::new().host("127.0.0.1").port(0);
    app.get("/a", |ctx: &mut Context| {
        ctx.response.send("a");
        Ok(())
    });
    app.post("/b", |ctx: &mut Context| {
        ctx.response.send("b");
        Ok(())
    });
    assert_eq!(app.route_count(), 2);
}
