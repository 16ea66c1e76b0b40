//! Hybrid exact/pattern route resolver. The exact table serves every
//! static route in O(1); the pattern list is scanned linearly, first match
//! wins, for anything with a parameter or wildcard segment.

use crate::context::Context;
use crate::error::HandlerResult;
use crate::http::Method;
use crate::middleware::MiddlewareFn;
use crate::pathspec::PathSpec;
use std::collections::HashMap;
use std::sync::Arc;

/// A handler receives the Context and may fail; exceptions (panics) are
/// caught separately by the DispatchEngine via `catch_unwind`
/// "Exception-driven control flow").
pub type Handler = Arc<dyn Fn(&mut Context) -> HandlerResult<()> + Send + Sync>;

#[derive(Clone)]
pub struct Route {
    pub method: Method,
    pub original_path: String,
    pub spec: PathSpec,
    pub handler: Handler,
    pub middleware: Vec<MiddlewareFn>,
}

/// A resolved route plus the sanitized path-parameter captures.
pub struct RouteMatch {
    pub route: Route,
    pub params: Vec<(String, String)>,
}

#[derive(Default)]
pub struct Router {
    exact: HashMap<String, Route>,
    patterns: Vec<Route>,
    /// Mirrors `exact`, keyed by the route's original pattern text rather
    /// than its normalized path, so exact-table routes stay introspectable
    /// by the form they were registered with.
    by_pattern: HashMap<String, Route>,
}

fn exact_key(method: Method, normalized_path: &str) -> String {
    format!("{}|{}", method.as_str(), normalized_path)
}

fn pattern_key(method: Method, pattern: &str) -> String {
    format!("{}|{}", method.as_str(), pattern)
}

impl Router {
    pub fn new() -> Self {
        Self { exact: HashMap::new(), patterns: Vec::new(), by_pattern: HashMap::new() }
    }

    pub fn add(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Handler,
        middleware: Vec<MiddlewareFn>,
    ) {
        let spec = PathSpec::compile(pattern);
        let route = Route {
            method,
            original_path: pattern.to_string(),
            spec: spec.clone(),
            handler,
            middleware,
        };

        if !spec.has_params() && !spec.has_wildcard() {
            self.by_pattern.insert(pattern_key(method, pattern), route.clone());
            self.exact.insert(exact_key(method, spec.literal()), route);
        } else {
            self.patterns.push(route);
        }
    }

    /// Looks an exact-table route up by the pattern text it was registered
    /// with, for introspection (e.g. listing routes as the caller declared
    /// them rather than by their normalized form).
    pub fn find_by_pattern(&self, method: Method, pattern: &str) -> Option<&Route> {
        self.by_pattern.get(&pattern_key(method, pattern))
    }

    /// O(1) on static paths; falls through to a linear scan of pattern
    /// routes in insertion order on miss. Returns sanitized path params.
    pub fn find(&self, method: Method, path: &str) -> Option<RouteMatch> {
        let normalized = crate::pathspec::normalize(path);
        if let Some(route) = self.exact.get(&exact_key(method, &normalized)) {
            return Some(RouteMatch { route: route.clone(), params: Vec::new() });
        }

        for route in &self.patterns {
            if route.method != method {
                continue;
            }
            if let Some(captures) = route.spec.matches(path) {
                let params = sanitize_params(captures);
                return Some(RouteMatch { route: route.clone(), params });
            }
        }

        None
    }

    pub fn route_count(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }
}

/// Rejects any captured path-parameter value containing `/`, `\`, a `..`
/// segment/substring, control bytes, or a drive-letter prefix (`C:`). A
/// rejected capture is dropped from the map entirely — `path_param(name)`
/// on the Context then observes it as absent, matching "set to null and
/// record absence.
fn sanitize_params(captures: Vec<(String, &str)>) -> Vec<(String, String)> {
    captures
        .into_iter()
        .filter_map(|(name, value)| {
            if is_safe_param(value) {
                Some((name, value.to_string()))
            } else {
                None
            }
        })
        .collect()
}

fn is_safe_param(value: &str) -> bool {
    if value.contains('/') || value.contains('\\') || value.contains("..") {
        return false;
    }
    if value.bytes().any(|b| b < 0x20 || b == 0x7f) {
        return false;
    }
    let bytes = value.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return false; // drive-letter pattern, e.g. "C:"
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn h() -> Handler {
        Arc::new(|ctx: &mut Context| {
            ctx.response.send(ctx.request.path().to_string());
            Ok(())
        })
    }

    #[test]
    fn test_router_static() {
        let mut router = Router::new();
        router.add(Method::Get, "/hello/world", h(), vec![]);

        assert!(router.find(Method::Get, "/hello/world").is_some());
        assert!(router.find(Method::Get, "/hello").is_none());
        assert!(router.find(Method::Post, "/hello/world").is_none());
    }

    #[test]
    fn test_router_params() {
        let mut router = Router::new();
        router.add(Method::Get, "/users/:id", h(), vec![]);

        let m = router.find(Method::Get, "/users/123").unwrap();
        assert_eq!(m.params, vec![("id".to_string(), "123".to_string())]);
    }

    #[test]
    fn test_router_wildcard_remainder() {
        let mut router = Router::new();
        router.add(Method::Get, "/assets/*path", h(), vec![]);

        let m = router.find(Method::Get, "/assets/js/app.js").unwrap();
        assert_eq!(m.params, vec![("path".to_string(), "js/app.js".to_string())]);
    }

    #[test]
    fn test_static_beats_dynamic() {
        let mut router = Router::new();
        router.add(Method::Get, "/users/:id", h(), vec![]);
        router.add(Method::Get, "/users/special", h(), vec![]);

        let m = router.find(Method::Get, "/users/special").unwrap();
        assert!(m.params.is_empty(), "exact route must win, carrying no path params");
    }

    #[test]
    fn test_sanitization_rejects_traversal() {
        let mut router = Router::new();
        router.add(Method::Get, "/files/:name", h(), vec![]);

        // `..` cannot appear as a single segment capture here since `/` would
        // split it into a different route shape, but a crafted value inside
        // one segment (`..secrets`) must still be rejected.
        let m = router.find(Method::Get, "/files/..").unwrap();
        assert!(m.params.is_empty());
    }

    #[test]
    fn test_sanitization_rejects_drive_letter() {
        assert!(!is_safe_param("C:"));
        assert!(is_safe_param("c.txt"));
    }

    #[test]
    fn test_exact_route_indexable_by_pattern() {
        let mut router = Router::new();
        router.add(Method::Get, "/hello/world", h(), vec![]);

        assert!(router.find_by_pattern(Method::Get, "/hello/world").is_some());
        assert!(router.find_by_pattern(Method::Post, "/hello/world").is_none());
        assert!(router.find_by_pattern(Method::Get, "/nope").is_none());
    }
}
