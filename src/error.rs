//! Error types for the core engine and the public dispatch seam.

use crate::parser::ParseError;
use std::io;

/// Internal engine error — I/O, slab exhaustion, thread spawn failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("request parse error: {0:?}")]
    Parse(#[from] ParseError),
    #[error("connection slab is full")]
    SlabFull,
    #[error("worker thread panicked: {0}")]
    WorkerPanic(String),
    #[error("{0}")]
    Other(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// The six error kinds a handler/middleware invocation can surface to the
/// DispatchEngine. Handlers return `HandlerResult<T>` instead of throwing;
/// the engine is the only place these are caught and turned into a response.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("not found")]
    NotFound,
    #[error("bad input: {0}")]
    BadInput(String),
    #[error("handler failure: {0}")]
    HandlerFailure(String),
    #[error("worker pool overloaded")]
    Overload,
    #[error("circuit breaker open")]
    BreakerOpen,
    #[error("I/O failure: {0}")]
    IoFailure(String),
}

impl DispatchError {
    /// Status code a bare `DispatchError`, surfaced without an explicit
    /// response already having been sent, maps to.
    pub fn status(&self) -> u16 {
        match self {
            DispatchError::NotFound => 404,
            DispatchError::BadInput(_) => 400,
            DispatchError::HandlerFailure(_) => 500,
            DispatchError::Overload => 500,
            DispatchError::BreakerOpen => 503,
            DispatchError::IoFailure(_) => 0, // exchange is aborted, nothing is written
        }
    }
}

/// Handlers and middleware return this instead of throwing.
pub type HandlerResult<T> = Result<T, HandlerError>;

/// The error a user handler or middleware function can return. Anything
/// else (a panic) is caught separately by the engine via `catch_unwind` and
/// folded into `HandlerFailure`.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub status: u16,
    pub message: String,
}

impl HandlerError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }
}
