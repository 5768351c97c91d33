// packages/engine/src/interpreter/mod.rs
//! Embedded runtime seam
//!
//! The pool never looks inside an execution environment. It drives one
//! through three traits:
//!
//! - **RuntimeLoader**: produces one fully isolated runtime per pool slot
//! - **InterpreterImpl**: a loaded runtime; hands out sessions
//! - **SessionImpl**: a lease on the runtime; resolves globals, converts
//!   values, calls, pickles and unpickles
//!
//! Every method returns [`NativeResult`]. The error inside is the runtime's
//! own type and must never leave the crate; the boundary guard in
//! `runtime::boundary` translates it (and any panic) into `EngineError`.
//!
//! A runtime must provide a `runtime.version` module namespace. The pool
//! stores each instance's ordinal there as the `interp` attribute.
//!
//! [`LocalRuntime`] is the in-process implementation shipped with the crate:
//! each instance owns a private heap, and only the immutable [`Library`] of
//! native definitions is shared.

pub mod host_value;
pub mod library;
pub mod local;

pub use host_value::HostValue;
pub use library::{CallArgs, Library, ModuleDef, NativeFn, Scope, Value};
pub use local::{LocalInterpreter, LocalRuntime};

use crate::archive::ArchiveReader;
use bytes::Bytes;
use std::sync::Arc;

/// Error type owned by an embedded runtime
pub type NativeError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a call into an embedded runtime
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Opaque handle to an environment-native value
///
/// Only meaningful inside the instance that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Obj {
    instance: usize,
    handle: u64,
}

impl Obj {
    /// Build a handle; called by runtime implementations
    pub fn new(instance: usize, handle: u64) -> Self {
        Self { instance, handle }
    }

    /// Ordinal of the instance owning the value
    pub fn instance(&self) -> usize {
        self.instance
    }

    /// Runtime-specific handle number
    pub fn handle(&self) -> u64 {
        self.handle
    }
}

/// Immutable serialized snapshot of an environment value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickledObject {
    payload: Bytes,
}

impl PickledObject {
    /// Wrap a serialized payload
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Serialized bytes
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Size of the snapshot in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Loads one isolated runtime per pool slot
pub trait RuntimeLoader: Send + Sync {
    /// Load the runtime that will serve `ordinal`
    fn load(&self, ordinal: usize) -> NativeResult<Box<dyn InterpreterImpl>>;
}

/// One loaded, isolated runtime
pub trait InterpreterImpl: Send + Sync {
    /// Start a session on this runtime
    fn acquire_session(&self) -> NativeResult<Box<dyn SessionImpl>>;
}

/// A lease on one runtime
///
/// Handles returned by a session stay valid for the session's lifetime.
/// Handles returned by `unpickle_or_get` and `create_package_importer` stay
/// valid until unloaded or released.
pub trait SessionImpl: Send {
    /// Resolve `module.name`
    fn global(&mut self, module: &str, name: &str) -> NativeResult<Obj>;

    /// Import a host value
    fn from_ivalue(&mut self, value: HostValue) -> NativeResult<Obj>;

    /// Export a value back to the host
    fn to_ivalue(&mut self, obj: Obj) -> NativeResult<HostValue>;

    /// Set an attribute on a namespace value
    fn set_attr(&mut self, target: Obj, name: &str, value: Obj) -> NativeResult<()>;

    /// Call a callable value
    fn call(&mut self, callee: Obj, args: &[Obj], kwargs: &[(String, Obj)]) -> NativeResult<Obj>;

    /// Call a method on a value
    fn call_method(
        &mut self,
        receiver: Obj,
        method: &str,
        args: &[Obj],
        kwargs: &[(String, Obj)],
    ) -> NativeResult<Obj>;

    /// Serialize a value
    fn pickle(&mut self, obj: Obj) -> NativeResult<PickledObject>;

    /// Materialize `object_id` from its snapshot, or return the existing copy
    fn unpickle_or_get(&mut self, object_id: u64, pickled: &PickledObject) -> NativeResult<Obj>;

    /// Drop the materialized copy of `object_id`, if any
    fn unload(&mut self, object_id: u64) -> NativeResult<()>;

    /// Create an importer bound to `archive`
    fn create_package_importer(&mut self, archive: Arc<dyn ArchiveReader>) -> NativeResult<Obj>;

    /// Release a persistent handle
    fn release(&mut self, obj: Obj) -> NativeResult<()>;
}
