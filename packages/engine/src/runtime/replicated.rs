// packages/engine/src/runtime/replicated.rs
//! Objects replicated lazily across instances
//!
//! A replicated object is a serialized snapshot plus a pool-unique id. Each
//! instance materializes its own copy the first time the object is used
//! there; later uses on that instance reuse the copy.
//!
//! ```text
//! ReplicatedObj (clone = another holder of the same object)
//! └─ Arc<inner>
//!    ├─ object_id       unique within the pool
//!    ├─ pickled         immutable snapshot
//!    ├─ pool            keeps the instances alive
//!    └─ materialized    [bool; instances]
//! ```
//!
//! When the last holder goes away the object is unloaded from every
//! instance that materialized it.

use crate::interpreter::{HostValue, PickledObject};
use crate::runtime::boundary::shield;
use crate::runtime::instance::Instance;
use crate::runtime::instance_pool::InstancePool;
use crate::runtime::session::Session;
use crate::utils::errors::{EngineError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Handle to an object replicated across a pool's instances
#[derive(Clone)]
pub struct ReplicatedObj {
    inner: Arc<ReplicatedObjInner>,
}

struct ReplicatedObjInner {
    object_id: u64,
    pickled: PickledObject,
    pool: InstancePool,

    /// Whether each instance may hold a materialized copy
    materialized: Box<[AtomicBool]>,
}

impl ReplicatedObj {
    pub(crate) fn new(object_id: u64, pickled: PickledObject, pool: InstancePool) -> Self {
        let materialized = (0..pool.len()).map(|_| AtomicBool::new(false)).collect();
        Self {
            inner: Arc::new(ReplicatedObjInner {
                object_id,
                pickled,
                pool,
                materialized,
            }),
        }
    }

    /// Id of this object within its pool
    pub fn object_id(&self) -> u64 {
        self.inner.object_id
    }

    /// The serialized snapshot
    pub fn pickled(&self) -> &PickledObject {
        &self.inner.pickled
    }

    pub fn pool(&self) -> &InstancePool {
        &self.inner.pool
    }

    /// Whether instance `ordinal` currently holds a copy
    pub fn is_materialized_in(&self, ordinal: usize) -> bool {
        self.inner
            .materialized
            .get(ordinal)
            .map_or(false, |flag| flag.load(Ordering::Acquire))
    }

    /// Number of live handles to this object
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub(crate) fn mark_materialized(&self, ordinal: usize) {
        if let Some(flag) = self.inner.materialized.get(ordinal) {
            if !flag.swap(true, Ordering::AcqRel) {
                metrics::counter!("replica_engine_materializations_total").increment(1);
            }
        }
    }

    /// Open a session bound to this object
    ///
    /// With `on`, the session is pinned to that instance; otherwise the pool
    /// picks one. The object is materialized there if needed.
    pub fn acquire_session<'a>(&'a self, on: Option<&'a Instance>) -> Result<Session<'a>> {
        shield("ReplicatedObj::acquire_session", || {
            let mut session = match on {
                Some(instance) => {
                    self.inner.check_owner(instance)?;
                    instance.acquire_session()?
                }
                None => self.inner.pool.acquire_one()?,
            };
            let obj = session.from_movable(self)?;
            session.set_self(obj);
            Ok(session)
        })
    }

    /// Call the object with positional arguments
    pub fn call(&self, args: Vec<HostValue>) -> Result<HostValue> {
        self.call_kwargs(args, BTreeMap::new())
    }

    /// Call the object with positional and keyword arguments
    pub fn call_kwargs(
        &self,
        args: Vec<HostValue>,
        kwargs: BTreeMap<String, HostValue>,
    ) -> Result<HostValue> {
        shield("ReplicatedObj::call", || {
            let mut session = self.acquire_session(None)?;
            session.call_self(args, kwargs)
        })
    }

    /// Call the object with keyword arguments only
    pub fn call_kwargs_only(&self, kwargs: BTreeMap<String, HostValue>) -> Result<HostValue> {
        self.call_kwargs(Vec::new(), kwargs)
    }

    /// Drop materialized copies
    ///
    /// With `on`, only that instance's copy; otherwise every copy. The next
    /// use re-materializes from the snapshot.
    /// Sessions already bound to a copy keep using it until they end.
    pub fn unload(&self, on: Option<&Instance>) -> Result<()> {
        self.inner.unload(on)
    }
}

impl ReplicatedObjInner {
    fn check_owner(&self, instance: &Instance) -> Result<()> {
        if instance.belongs_to(&self.pool) {
            Ok(())
        } else {
            Err(EngineError::InvalidArgument(format!(
                "instance {} belongs to a different pool than replicated object {}",
                instance.ordinal(),
                self.object_id
            )))
        }
    }

    fn unload(&self, on: Option<&Instance>) -> Result<()> {
        shield("ReplicatedObj::unload", || match on {
            Some(instance) => {
                self.check_owner(instance)?;
                self.unload_from(instance)
            }
            None => {
                let mut first_error = None;
                for instance in self.pool.all_instances() {
                    if let Err(e) = self.unload_from(instance) {
                        first_error.get_or_insert(e);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
        })
    }

    fn unload_from(&self, instance: &Instance) -> Result<()> {
        if !self.materialized[instance.ordinal()].swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut session = instance.acquire_session()?;
        session.unload(self.object_id)?;
        debug!("Unloaded object {} from instance #{}", self.object_id, instance.ordinal());
        Ok(())
    }
}

impl Drop for ReplicatedObjInner {
    fn drop(&mut self) {
        if let Err(e) = self.unload(None) {
            warn!("Failed to unload replicated object {}: {}", self.object_id, e);
        }
    }
}

impl fmt::Debug for ReplicatedObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedObj")
            .field("object_id", &self.object_id())
            .field("bytes", &self.pickled().len())
            .finish()
    }
}
