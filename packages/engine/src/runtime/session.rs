// packages/engine/src/runtime/session.rs
//! Scoped lease on one instance
//!
//! A session is the unit of work: resolve globals, convert values, call
//! into the runtime, and move objects between instances. Sessions obtained
//! through [`InstancePool::acquire_one`](crate::InstancePool::acquire_one)
//! carry a [`Lease`] that returns their usage slot to the load balancer when
//! the session is dropped. The lease cannot be copied, so the slot is freed
//! exactly once.

use crate::archive::ArchiveReader;
use crate::interpreter::{HostValue, Obj, SessionImpl};
use crate::runtime::boundary::{guard, EXCEPTION_PREFIX};
use crate::runtime::instance::Instance;
use crate::runtime::load_balancer::LoadBalancer;
use crate::runtime::replicated::ReplicatedObj;
use crate::utils::errors::{EngineError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Obligation to free one load-balancer slot
pub(crate) struct Lease<'a> {
    balancer: &'a LoadBalancer,
    ordinal: usize,
}

impl<'a> Lease<'a> {
    pub(crate) fn new(balancer: &'a LoadBalancer, ordinal: usize) -> Self {
        Self { balancer, ordinal }
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.balancer.free(self.ordinal);
        metrics::gauge!("replica_engine_instance_usage", "instance" => self.ordinal.to_string())
            .set(self.balancer.usage(self.ordinal) as f64);
    }
}

/// A scoped lease on one instance
pub struct Session<'a> {
    instance: &'a Instance,

    /// Runtime-side session; dropped before the lease is released
    inner: Box<dyn SessionImpl>,

    /// Bound value when the session represents an importer or a replicated object
    self_obj: Option<Obj>,

    lease: Option<Lease<'a>>,
}

impl<'a> Session<'a> {
    pub(crate) fn new(instance: &'a Instance, inner: Box<dyn SessionImpl>, lease: Option<Lease<'a>>) -> Self {
        Self {
            instance,
            inner,
            self_obj: None,
            lease,
        }
    }

    /// Instance this session runs on
    pub fn instance(&self) -> &'a Instance {
        self.instance
    }

    pub fn ordinal(&self) -> usize {
        self.instance.ordinal()
    }

    /// Whether the session holds a load-balancer slot
    pub fn is_load_balanced(&self) -> bool {
        self.lease.is_some()
    }

    /// Bound value, if any
    pub fn self_obj(&self) -> Option<Obj> {
        self.self_obj
    }

    /// Bind a value to this session
    pub fn set_self(&mut self, obj: Obj) {
        self.self_obj = Some(obj);
    }

    fn bound(&self) -> Result<Obj> {
        self.self_obj
            .ok_or_else(|| EngineError::InvalidArgument("session has no bound object".to_string()))
    }

    /// Resolve `module.name` inside the instance
    pub fn global(&mut self, module: &str, name: &str) -> Result<Obj> {
        guard("Session::global", || self.inner.global(module, name))
    }

    /// Import a host value into the instance
    pub fn from_ivalue(&mut self, value: HostValue) -> Result<Obj> {
        guard("Session::from_ivalue", || self.inner.from_ivalue(value))
    }

    /// Export a value from the instance
    pub fn to_ivalue(&mut self, obj: Obj) -> Result<HostValue> {
        guard("Session::to_ivalue", || self.inner.to_ivalue(obj))
    }

    pub fn set_attr(&mut self, target: Obj, name: &str, value: Obj) -> Result<()> {
        guard("Session::set_attr", || self.inner.set_attr(target, name, value))
    }

    pub fn call(&mut self, callee: Obj, args: &[Obj]) -> Result<Obj> {
        self.call_kwargs(callee, args, &[])
    }

    pub fn call_kwargs(&mut self, callee: Obj, args: &[Obj], kwargs: &[(String, Obj)]) -> Result<Obj> {
        guard("Session::call", || self.inner.call(callee, args, kwargs))
    }

    pub fn call_method(&mut self, receiver: Obj, method: &str, args: &[Obj]) -> Result<Obj> {
        guard("Session::call_method", || {
            self.inner.call_method(receiver, method, args, &[])
        })
    }

    /// Call the bound value with host arguments and convert the result back
    pub fn call_self(
        &mut self,
        args: Vec<HostValue>,
        kwargs: BTreeMap<String, HostValue>,
    ) -> Result<HostValue> {
        let callee = self.bound()?;
        let args = args
            .into_iter()
            .map(|value| self.from_ivalue(value))
            .collect::<Result<Vec<_>>>()?;
        let kwargs = kwargs
            .into_iter()
            .map(|(name, value)| Ok((name, self.from_ivalue(value)?)))
            .collect::<Result<Vec<_>>>()?;
        let result = self.call_kwargs(callee, &args, &kwargs)?;
        self.to_ivalue(result)
    }

    /// Snapshot `obj` and register it as a new replicated object
    pub fn create_movable(&mut self, obj: Obj) -> Result<ReplicatedObj> {
        let pool = self.instance.pool()?;
        let pickled = guard("Session::create_movable", || self.inner.pickle(obj))?;
        let object_id = pool.next_object_id();
        debug!(
            "Instance {} created replicated object {} ({} bytes)",
            self.ordinal(),
            object_id,
            pickled.len()
        );
        Ok(ReplicatedObj::new(object_id, pickled, pool))
    }

    /// This instance's copy of `obj`, materializing it on first use
    pub fn from_movable(&mut self, obj: &ReplicatedObj) -> Result<Obj> {
        if !self.instance.belongs_to(obj.pool()) {
            return Err(EngineError::InvalidArgument(format!(
                "replicated object {} belongs to a different pool",
                obj.object_id()
            )));
        }
        let handle = guard("Session::from_movable", || {
            self.inner.unpickle_or_get(obj.object_id(), obj.pickled())
        })?;
        obj.mark_materialized(self.ordinal());
        Ok(handle)
    }

    pub(crate) fn unload(&mut self, object_id: u64) -> Result<()> {
        guard("Session::unload", || self.inner.unload(object_id))
    }

    pub(crate) fn create_package_importer(&mut self, archive: Arc<dyn ArchiveReader>) -> Result<Obj> {
        guard("Session::create_package_importer", || {
            self.inner.create_package_importer(archive)
        })
    }

    pub(crate) fn release(&mut self, obj: Obj) -> Result<()> {
        guard("Session::release", || self.inner.release(obj))
    }

    /// Call a method on the bound value with string arguments
    pub(crate) fn call_bound_method(&mut self, method: &str, args: &[&str]) -> Result<Obj> {
        let receiver = self.bound()?;
        let args = args
            .iter()
            .map(|arg| self.from_ivalue(HostValue::from(*arg)))
            .collect::<Result<Vec<_>>>()?;
        self.call_method(receiver, method, &args)
    }

    /// Export a value that must be text
    pub(crate) fn to_text(&mut self, obj: Obj) -> Result<String> {
        match self.to_ivalue(obj)? {
            HostValue::Str(text) => Ok(text),
            other => Err(EngineError::Embedded(format!(
                "{EXCEPTION_PREFIX}expected text, got {}",
                other.kind()
            ))),
        }
    }
}

impl fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("ordinal", &self.ordinal())
            .field("self_obj", &self.self_obj)
            .field("load_balanced", &self.is_load_balanced())
            .finish()
    }
}
