//! The plugin lifecycle seam. Only the hook the core calls is
//! defined here — concrete plugins (CORS, compression, JWT, rate limiting,
//! monitoring) are out of scope and live outside this crate.

use crate::app::App;

/// Modeled as a trait object the `App` owns, rather than a plugin holding a
/// back-pointer to its `App` — the App is handed to
/// lifecycle methods by borrow instead).
pub trait Plugin: Send + Sync {
    /// Called once when the plugin is registered, before `on_start`.
    fn register(&self, _app: &App) {}

    /// Called after the listener has bound successfully.
    fn on_start(&self, _app: &App) {}

    /// Called during `App::stop()`, before the worker pool is drained.
    fn on_stop(&self, _app: &App) {}
}
