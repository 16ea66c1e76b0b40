//! Typed body/query extraction built on top of Context. The JSON codec
//! itself (`serde_json`) is an external collaborator per scope; this module
//! wires it to the dispatch seam the way the teacher's `Json` extractor
//! does, with `Query<T>` routed through the same deserializer.
use crate::context::Context;
use crate::error::HandlerError;
use serde::de::DeserializeOwned;

pub trait FromRequest: Sized {
    fn from_request(ctx: &mut Context) -> Result<Self, HandlerError>;
}

/// Parses the request body as JSON.
pub struct Json<T>(pub T);

impl<T: DeserializeOwned> FromRequest for Json<T> {
    fn from_request(ctx: &mut Context) -> Result<Self, HandlerError> {
        ctx.request
            .parse_body::<T>()
            .map(Json)
            .map_err(|e| HandlerError::bad_request(format!("invalid JSON body: {e}")))
    }
}

/// Parses the query string into `T` by treating each first-occurrence
/// key/value pair as a JSON object field, then running it through
/// `serde_json`'s deserializer — avoids hand-rolling a second derive-based
/// decoder for a format the core otherwise leaves untouched.
pub struct Query<T>(pub T);

impl<T: DeserializeOwned> FromRequest for Query<T> {
    fn from_request(ctx: &mut Context) -> Result<Self, HandlerError> {
        let raw = ctx.request.raw_query_string();
        let map = crate::context::query_to_json_object(raw);
        serde_json::from_value(serde_json::Value::Object(map))
            .map(Query)
            .map_err(|e| HandlerError::bad_request(format!("invalid query string: {e}")))
    }
}

impl Context {
    pub fn extract<T: FromRequest>(&mut self) -> Result<T, HandlerError> {
        T::from_request(self)
    }
}
