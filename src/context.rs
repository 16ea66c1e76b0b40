//! Request / Response / Context — the pooled, per-request facades
//! user handlers see. Unlike the raw wire types in `http.rs`, these own
//! their data so they can be recycled across requests through
//! `ObjectPool<T>` without borrowing from a connection's read buffer.

use crate::http::{Method, RawRequest};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// A single query-string key's values, in appearance order (multi-value).
type QueryMap = HashMap<String, Vec<String>>;

pub struct Request {
    method: Method,
    path: String,
    raw_query: Option<String>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    query_params: Option<QueryMap>,
    path_params: HashMap<String, String>,
}

impl Request {
    pub fn from_raw(raw: RawRequest<'_>) -> Self {
        let mut req = Request {
            method: Method::Unknown,
            path: String::new(),
            raw_query: None,
            headers: Vec::new(),
            body: Vec::new(),
            query_params: None,
            path_params: HashMap::new(),
        };
        req.reset(&raw);
        req
    }

    /// Clears cached views and adopts a new underlying exchange. Reuses
    /// existing allocations where possible (the point of pooling).
    pub fn reset(&mut self, raw: &RawRequest<'_>) {
        self.method = raw.method;
        self.path.clear();
        self.path.push_str(raw.path);
        self.raw_query = raw.query.map(|q| q.to_string());
        self.headers.clear();
        self.headers.extend(raw.headers().map(|(k, v)| (k.to_string(), v.to_string())));
        self.body.clear();
        self.body.extend_from_slice(raw.body);
        self.query_params = None;
        self.path_params.clear();
    }

    pub fn set_path_params(&mut self, params: Vec<(String, String)>) {
        self.path_params.clear();
        self.path_params.extend(params);
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    fn query_map(&mut self) -> &QueryMap {
        if self.query_params.is_none() {
            self.query_params = Some(parse_query(self.raw_query.as_deref().unwrap_or("")));
        }
        self.query_params.as_ref().unwrap()
    }

    pub fn query(&mut self, name: &str) -> Option<String> {
        self.query_map().get(name).and_then(|v| v.first()).cloned()
    }

    pub fn query_values(&mut self, name: &str) -> Vec<String> {
        self.query_map().get(name).cloned().unwrap_or_default()
    }

    pub fn query_as_int(&mut self, name: &str) -> Option<i64> {
        self.query(name)?.parse().ok()
    }

    pub fn query_as_long(&mut self, name: &str) -> Option<i64> {
        self.query_as_int(name)
    }

    pub fn query_as_double(&mut self, name: &str) -> Option<f64> {
        self.query(name)?.parse().ok()
    }

    pub fn query_as_bool(&mut self, name: &str) -> Option<bool> {
        let v = self.query(name)?.to_ascii_lowercase();
        match v.as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        }
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(|s| s.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn json_body(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn parse_body<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn raw_query_string(&self) -> &str {
        self.raw_query.as_deref().unwrap_or("")
    }
}

/// Builds a JSON object out of a query string, one entry per first-seen
/// key (repeated keys keep their first value), for `extract::Query<T>`.
pub fn query_to_json_object(qs: &str) -> serde_json::Map<String, Value> {
    let mut obj = serde_json::Map::new();
    for (key, values) in parse_query(qs) {
        if let Some(first) = values.into_iter().next() {
            obj.entry(key).or_insert(Value::String(first));
        }
    }
    obj
}

fn parse_query(qs: &str) -> QueryMap {
    let mut map: QueryMap = HashMap::new();
    if qs.is_empty() {
        return map;
    }
    for pair in qs.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        let key = percent_decode(k);
        let value = percent_decode(v);
        map.entry(key).or_default().push(value);
    }
    map
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                if let Ok(b) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(b);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
}

pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    content_type: Option<String>,
    body: Body,
    sent: bool,
}

impl Response {
    pub fn new() -> Self {
        Self { status: 200, headers: Vec::new(), content_type: None, body: Body::Empty, sent: false }
    }

    pub fn reset(&mut self) {
        self.status = 200;
        self.headers.clear();
        self.content_type = None;
        self.body = Body::Empty;
        self.sent = false;
    }

    pub fn status(&mut self, code: u16) -> &mut Self {
        if self.guard_sent() {
            return self;
        }
        self.status = code;
        self
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        if self.guard_sent() {
            return self;
        }
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn content_type(&mut self, ct: impl Into<String>) -> &mut Self {
        if self.guard_sent() {
            return self;
        }
        self.content_type = Some(ct.into());
        self
    }

    pub fn send(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        if self.guard_sent() {
            return self;
        }
        if self.content_type.is_none() {
            self.content_type = Some("text/plain".to_string());
        }
        self.body = Body::Bytes(body.into());
        self.sent = true;
        self
    }

    /// Accepts either an already-serialized JSON string/bytes, or any
    /// `Serialize` value, and applies the `": " -> ":"` normalization once
    /// before emission — the only place a JSON body is ever formatted.
    pub fn json<T: Serialize>(&mut self, value: &T) -> &mut Self {
        if self.guard_sent() {
            return self;
        }
        let rendered = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
        let normalized = normalize_json(&rendered);
        self.content_type = Some("application/json".to_string());
        self.body = Body::Bytes(normalized.into_bytes());
        self.sent = true;
        self
    }

    /// For callers that already hold a JSON-encoded string or byte body.
    pub fn json_raw(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        if self.guard_sent() {
            return self;
        }
        let bytes = body.into();
        let text = String::from_utf8_lossy(&bytes);
        let normalized = normalize_json(&text);
        self.content_type = Some("application/json".to_string());
        self.body = Body::Bytes(normalized.into_bytes());
        self.sent = true;
        self
    }

    pub fn no_content(&mut self) -> &mut Self {
        if self.guard_sent() {
            return self;
        }
        self.status = 204;
        self.body = Body::Empty;
        self.sent = true;
        self
    }

    pub fn redirect(&mut self, url: impl Into<String>, permanent: bool) -> &mut Self {
        if self.guard_sent() {
            return self;
        }
        self.status = if permanent { 301 } else { 302 };
        self.headers.push(("Location".to_string(), url.into()));
        self.body = Body::Empty;
        self.sent = true;
        self
    }

    pub fn error(&mut self, code: u16, message: impl Into<String>) -> &mut Self {
        if self.guard_sent() {
            return self;
        }
        let message = message.into();
        let payload = serde_json::json!({
            "error": true,
            "status": code,
            "message": message,
        });
        self.status = code;
        self.json(&payload)
    }

    pub fn sent(&self) -> bool {
        self.sent
    }

    pub fn status_out(&self) -> u16 {
        self.status
    }

    pub fn content_type_out(&self) -> &str {
        self.content_type.as_deref().unwrap_or("text/plain")
    }

    pub fn headers_out(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body_out(&self) -> &[u8] {
        match &self.body {
            Body::Empty => &[],
            Body::Bytes(b) => b,
        }
    }

    /// If a mutation is attempted after `sent`, it is a logged no-op.
    fn guard_sent(&self) -> bool {
        if self.sent {
            tracing::warn!("response mutation attempted after body already sent; ignored");
        }
        self.sent
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_json(s: &str) -> String {
    s.replace(": ", ":")
}

/// Per-request locals, initialized from an optional application-level map.
pub type Locals = HashMap<String, Value>;

pub struct Context {
    pub request: Request,
    pub response: Response,
    locals: Locals,
}

impl Context {
    pub fn new(request: Request, response: Response, app_locals: Option<&Locals>) -> Self {
        Self { request, response, locals: app_locals.cloned().unwrap_or_default() }
    }

    pub fn reset(&mut self, raw: &RawRequest<'_>, app_locals: Option<&Locals>) {
        self.request.reset(raw);
        self.response.reset();
        self.locals = app_locals.cloned().unwrap_or_default();
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.locals.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.locals.get(key)
    }

    pub fn error(&mut self, code: u16, message: impl Into<String>) {
        self.response.error(code, message);
    }

    pub fn redirect(&mut self, url: impl Into<String>) {
        self.response.redirect(url, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw<'a>(path: &'a str, query: Option<&'a str>) -> RawRequest<'a> {
        RawRequest {
            method: Method::Get,
            path,
            query,
            headers: [("", ""); crate::http::MAX_HEADERS],
            header_count: 0,
            body: b"",
        }
    }

    #[test]
    fn query_accessors_parse_lazily_and_decode() {
        let mut req = Request::from_raw(raw("/s", Some("name=John%20Doe&tag=a&tag=b")));
        assert_eq!(req.query("name"), Some("John Doe".to_string()));
        assert_eq!(req.query_values("tag"), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn query_as_bool_recognizes_truthy_and_falsy_case_insensitively() {
        let mut req = Request::from_raw(raw("/s", Some("a=TRUE&b=No&c=nonsense")));
        assert_eq!(req.query_as_bool("a"), Some(true));
        assert_eq!(req.query_as_bool("b"), Some(false));
        assert_eq!(req.query_as_bool("c"), None);
    }

    #[test]
    fn response_sent_flag_blocks_further_mutation() {
        let mut resp = Response::new();
        resp.send("hello");
        assert!(resp.sent());
        resp.status(500); // must be a no-op
        assert_eq!(resp.status_out(), 200);
    }

    #[test]
    fn error_response_matches_canonical_json_shape() {
        let mut resp = Response::new();
        resp.error(404, "missing");
        let body = String::from_utf8(resp.body_out().to_vec()).unwrap();
        assert!(body.contains("\"error\":true"));
        assert!(body.contains("\"status\":404"));
        assert!(body.contains("\"message\":\"missing\""));
    }

    #[test]
    fn json_normalization_strips_space_after_colon() {
        let mut resp = Response::new();
        resp.json(&serde_json::json!({"a": 1}));
        let body = String::from_utf8(resp.body_out().to_vec()).unwrap();
        assert!(!body.contains(": "));
    }

    #[test]
    fn reset_reuses_allocations() {
        let mut req = Request::from_raw(raw("/first", None));
        req.reset(&raw("/second", Some("x=1")));
        assert_eq!(req.path(), "/second");
        assert_eq!(req.query("x"), Some("1".to_string()));
    }
}
