// packages/engine/src/runtime/boundary.rs
//! Boundary guard for calls into embedded runtimes
//!
//! Errors and panics raised inside an instance belong to that instance's
//! runtime and must not travel further. Every public entry point that
//! reaches into an instance runs through [`guard`] (for calls returning the
//! runtime's own error type) or [`shield`] (for host code that may still
//! unwind from inside an instance). Both produce only [`EngineError`].

use crate::interpreter::NativeResult;
use crate::utils::errors::{EngineError, Result};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tracing::warn;

/// Prefix of a translated error that carried a message
pub const EXCEPTION_PREFIX: &str = "Exception caught inside embedded runtime: \n";

/// Message of a translated error that carried no message
pub const UNKNOWN_EXCEPTION: &str = "Unknown exception caught inside embedded runtime";

/// Run a call into an instance, translating its error or panic
pub fn guard<T, F>(op: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> NativeResult<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(translate(op, Some(err.to_string()))),
        Err(payload) => Err(translate(op, panic_message(payload.as_ref()))),
    }
}

/// Run host code that may unwind from inside an instance
///
/// Errors already owned by the host pass through unchanged.
pub fn shield<T, F>(op: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(translate(op, panic_message(payload.as_ref()))),
    }
}

fn translate(op: &'static str, message: Option<String>) -> EngineError {
    metrics::counter!("replica_engine_boundary_errors_total").increment(1);
    let text = match message {
        Some(message) => format!("{EXCEPTION_PREFIX}{message}"),
        None => UNKNOWN_EXCEPTION.to_string(),
    };
    warn!(operation = op, "{}", text);
    EngineError::Embedded(text)
}

fn panic_message(payload: &(dyn Any + Send)) -> Option<String> {
    if let Some(s) = payload.downcast_ref::<&str>() {
        Some((*s).to_string())
    } else {
        payload.downcast_ref::<String>().cloned()
    }
}
