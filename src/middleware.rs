//! Middleware and handler are type-erased callables ("Dynamic
//! dispatch") rather than an inheritance hierarchy: a handler is
//! `(Context) -> Response`, and middleware is `(Context) -> (bool, Context)`
//! — it returns whether the chain should continue, handing the (possibly
//! mutated) Context back since it owns it.

use crate::context::Context;
use crate::error::HandlerResult;
use std::sync::Arc;

/// `true` to continue the chain, `false` to short-circuit (the response the
/// middleware wrote, e.g. via `ctx.response.error(..)`, is final).
pub type MiddlewareFn = Arc<dyn Fn(&mut Context) -> bool + Send + Sync>;

/// Runs `chain` in insertion order against `ctx`. Stops at the first
/// middleware that returns `false` or that has already marked the response
/// sent. Returns `true` if the handler should still be invoked.
pub fn run_chain(chain: &[MiddlewareFn], ctx: &mut Context) -> bool {
    for mw in chain {
        let cont = mw(ctx);
        if !cont || ctx.response.sent() {
            return false;
        }
    }
    true
}

/// Wraps a plain `Fn(&mut Context) -> HandlerResult<()>` as the `Handler`
/// type the router stores.
pub fn handler_fn<F>(f: F) -> crate::router::Handler
where
    F: Fn(&mut Context) -> HandlerResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn middleware_fn<F>(f: F) -> MiddlewareFn
where
    F: Fn(&mut Context) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Request, Response};
    use crate::http::{Method, RawRequest};

    fn ctx() -> Context {
        let raw = RawRequest {
            method: Method::Get,
            path: "/x",
            query: None,
            headers: [("", ""); crate::http::MAX_HEADERS],
            header_count: 0,
            body: b"",
        };
        Context::new(Request::from_raw(raw), Response::new(), None)
    }

    #[test]
    fn chain_runs_in_order_and_stops_on_false() {
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let chain: Vec<MiddlewareFn> = vec![
            middleware_fn(move |_ctx| {
                o1.lock().unwrap().push(1);
                true
            }),
            middleware_fn(move |ctx| {
                o2.lock().unwrap().push(2);
                ctx.response.status(403);
                false
            }),
            middleware_fn(|_ctx| panic!("must not run after short-circuit")),
        ];

        let mut c = ctx();
        let should_invoke_handler = run_chain(&chain, &mut c);
        assert!(!should_invoke_handler);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert_eq!(c.response.status_code(), 403);
    }
}
