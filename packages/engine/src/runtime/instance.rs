// packages/engine/src/runtime/instance.rs
//! One isolated runtime instance inside a pool
//!
//! An instance is created once when its pool is built and lives exactly as
//! long as the pool. It never moves: sessions borrow it.

use crate::interpreter::InterpreterImpl;
use crate::runtime::boundary::guard;
use crate::runtime::instance_pool::{InstancePool, PoolShared};
use crate::runtime::session::{Lease, Session};
use crate::utils::errors::{EngineError, Result};
use std::fmt;
use std::sync::{Arc, Weak};

/// One pool slot and the runtime loaded into it
pub struct Instance {
    /// Position in the pool, also exposed inside the runtime
    ordinal: usize,

    /// The loaded runtime
    runtime: Box<dyn InterpreterImpl>,

    /// Owning pool
    pool: Weak<PoolShared>,
}

impl Instance {
    pub(crate) fn new(ordinal: usize, runtime: Box<dyn InterpreterImpl>, pool: Weak<PoolShared>) -> Self {
        Self {
            ordinal,
            runtime,
            pool,
        }
    }

    /// Position of this instance in its pool
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Open a session pinned to this instance
    ///
    /// Pinned sessions bypass the load balancer: they neither count as a
    /// user of this instance nor release a slot when dropped.
    pub fn acquire_session(&self) -> Result<Session<'_>> {
        self.open_session(None)
    }

    pub(crate) fn open_session<'a>(&'a self, lease: Option<Lease<'a>>) -> Result<Session<'a>> {
        let inner = guard("Instance::acquire_session", || self.runtime.acquire_session())?;
        Ok(Session::new(self, inner, lease))
    }

    /// Handle to the owning pool
    pub(crate) fn pool(&self) -> Result<InstancePool> {
        self.pool
            .upgrade()
            .map(InstancePool::from_shared)
            .ok_or(EngineError::PoolClosed)
    }

    /// Whether this instance is one of `pool`'s
    pub(crate) fn belongs_to(&self, pool: &InstancePool) -> bool {
        std::ptr::eq(self.pool.as_ptr(), Arc::as_ptr(pool.shared()))
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("ordinal", &self.ordinal)
            .finish_non_exhaustive()
    }
}
