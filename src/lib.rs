//! A syscall-level HTTP application server core: two non-blocking I/O
//! threads classify and answer what they can inline, a variable-size
//! blocking worker pool handles the rest, and a small set of generalized
//! primitives (`ObjectPool`, `CircuitBreaker`, `PathSpec`/`Router`) do the
//! bookkeeping in between.
//!
//! The top-level entry point is [`App`]: build it, register routes and
//! middleware, then call [`App::listen`].

pub mod app;
pub mod breaker;
pub mod config;
pub mod conn;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod http;
pub mod io_loop;
pub mod metrics;
pub mod middleware;
pub mod parser;
pub mod pathspec;
pub mod plugin;
pub mod pool;
pub mod router;
pub mod slab;
pub mod syscalls;
pub mod workerpool;

pub use app::App;
pub use context::{Body, Context, Request, Response};
pub use error::{DispatchError, EngineError, EngineResult, HandlerError, HandlerResult};
pub use extract::{FromRequest, Json, Query};
pub use http::Method;
pub use middleware::{handler_fn, middleware_fn};
pub use plugin::Plugin;
pub use router::Router;

/// Installs a `ctrlc` handler that flips an `AtomicBool` shared with an
/// `App`'s I/O threads — the teacher wires its own signal handling the same
/// way rather than relying on a runtime's built-in signal future.
pub fn install_shutdown_handler(app: std::sync::Arc<App>) -> EngineResult<()> {
    ctrlc::set_handler(move || {
        tracing::info!("shutdown signal received");
        app.stop();
    })
    .map_err(|e| EngineError::Other(e.to_string()))
}
