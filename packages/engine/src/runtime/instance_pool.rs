// packages/engine/src/runtime/instance_pool.rs
//! Pool of isolated runtime instances
//!
//! Instead of one runtime serialized behind a single lock, the pool loads N
//! independent copies and spreads sessions across them.
//!
//! # Architecture
//!
//! ```text
//! InstancePool (Arc, cheap to clone)
//! ├─ instances: [Instance 0, Instance 1, ...]  (fixed for the pool's life)
//! ├─ balancer:  [uses 0, uses 1, ...]          (approximate, lock-free)
//! └─ next_object_id                            (replicated object ids)
//! ```
//!
//! Every instance keeps a weak back-reference to the pool so sessions can
//! register replicated objects without owning the pool.

use crate::archive::{ArchiveReader, DirectoryArchive};
use crate::interpreter::library::{INTERP_ATTR, RUNTIME_MODULE};
use crate::interpreter::{HostValue, RuntimeLoader};
use crate::runtime::boundary::{guard, shield};
use crate::runtime::instance::Instance;
use crate::runtime::load_balancer::LoadBalancer;
use crate::runtime::package::Package;
use crate::runtime::session::{Lease, Session};
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Configuration for the instance pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstancePoolConfig {
    /// Number of instances to load (default: 2)
    pub instances: usize,

    /// Restrict load balancing to the first N instances (default: all)
    pub active_limit: Option<usize>,
}

impl Default for InstancePoolConfig {
    fn default() -> Self {
        Self {
            instances: 2,
            active_limit: None,
        }
    }
}

impl InstancePoolConfig {
    /// Reject configurations no pool can be built from
    pub fn validate(&self) -> Result<()> {
        if self.instances == 0 {
            return Err(EngineError::InvalidConfig(
                "pool needs at least one instance".to_string(),
            ));
        }
        if let Some(limit) = self.active_limit {
            if limit > self.instances {
                return Err(EngineError::InvalidConfig(format!(
                    "active limit {} exceeds instance count {}",
                    limit, self.instances
                )));
            }
        }
        Ok(())
    }
}

pub(crate) struct PoolShared {
    instances: Vec<Instance>,
    balancer: LoadBalancer,
    next_object_id: AtomicU64,
}

/// Fixed set of isolated instances behind a load balancer
#[derive(Clone)]
pub struct InstancePool {
    shared: Arc<PoolShared>,
}

impl InstancePool {
    /// Load `instances` runtimes with default settings
    pub fn new(instances: usize, loader: &dyn RuntimeLoader) -> Result<Self> {
        let config = InstancePoolConfig {
            instances,
            ..Default::default()
        };

        Self::with_config(config, loader)
    }

    /// Load a pool described by `config`
    pub fn with_config(config: InstancePoolConfig, loader: &dyn RuntimeLoader) -> Result<Self> {
        config.validate()?;
        info!("Initializing instance pool with {} instances", config.instances);

        let mut runtimes = Vec::with_capacity(config.instances);
        for ordinal in 0..config.instances {
            debug!("Loading runtime for instance #{}", ordinal);
            runtimes.push(guard("RuntimeLoader::load", || loader.load(ordinal))?);
        }

        let shared = Arc::new_cyclic(|pool| PoolShared {
            instances: runtimes
                .into_iter()
                .enumerate()
                .map(|(ordinal, runtime)| Instance::new(ordinal, runtime, pool.clone()))
                .collect(),
            balancer: LoadBalancer::new(config.instances),
            next_object_id: AtomicU64::new(0),
        });
        let pool = Self { shared };

        pool.tag_instances()?;

        if let Some(limit) = config.active_limit {
            pool.debug_limit_interpreters(limit);
        }

        metrics::gauge!("replica_engine_pool_instances").set(pool.len() as f64);
        info!("Instance pool initialized with {} instances", pool.len());
        Ok(pool)
    }

    pub(crate) fn from_shared(shared: Arc<PoolShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }

    /// Store each instance's ordinal as `runtime.version.interp`
    fn tag_instances(&self) -> Result<()> {
        for instance in self.all_instances() {
            let mut session = instance.acquire_session()?;
            let version = session.global(RUNTIME_MODULE, "version")?;
            let ordinal = session.from_ivalue(HostValue::Int(instance.ordinal() as i64))?;
            session.set_attr(version, INTERP_ATTR, ordinal)?;
        }
        Ok(())
    }

    /// Open a session on the least-used eligible instance
    ///
    /// The session holds a usage slot until it is dropped.
    pub fn acquire_one(&self) -> Result<Session<'_>> {
        shield("InstancePool::acquire_one", || {
            let ordinal = self.shared.balancer.acquire();
            let lease = Lease::new(&self.shared.balancer, ordinal);
            let session = self.shared.instances[ordinal].open_session(Some(lease))?;

            metrics::counter!("replica_engine_sessions_acquired_total").increment(1);
            metrics::gauge!("replica_engine_instance_usage", "instance" => ordinal.to_string())
                .set(self.shared.balancer.usage(ordinal) as f64);
            debug!("Acquired session on instance #{}", ordinal);
            Ok(session)
        })
    }

    /// Every instance, indexed by ordinal
    pub fn all_instances(&self) -> &[Instance] {
        &self.shared.instances
    }

    pub fn instance(&self, ordinal: usize) -> Option<&Instance> {
        self.shared.instances.get(ordinal)
    }

    pub fn len(&self) -> usize {
        self.shared.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.instances.is_empty()
    }

    /// Restrict load balancing to the first `n` instances
    ///
    /// Pinned sessions may still target any instance.
    ///
    /// # Panics
    ///
    /// If `n` exceeds the number of instances.
    pub fn debug_limit_interpreters(&self, n: usize) {
        self.shared.balancer.set_resource_limit(n);
        info!("Load balancing limited to {} of {} instances", n, self.len());
    }

    /// Number of instances eligible for load balancing
    pub fn active_limit(&self) -> usize {
        self.shared.balancer.resource_limit()
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_instances: self.len(),
            active_limit: self.active_limit(),
            usage: self.shared.balancer.usages(),
        }
    }

    /// Open a package stored as a directory (`file://` prefix allowed)
    pub fn load_package(&self, uri: &str) -> Result<Package> {
        let archive = DirectoryArchive::open(uri)?;
        info!("Opened package {}", archive.name());
        Ok(self.load_package_from_reader(Arc::new(archive)))
    }

    /// Wrap an already-open archive
    pub fn load_package_from_reader(&self, reader: Arc<dyn ArchiveReader>) -> Package {
        Package::new(self.clone(), reader)
    }

    pub(crate) fn next_object_id(&self) -> u64 {
        self.shared.next_object_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstancePool")
            .field("instances", &self.len())
            .field("active_limit", &self.active_limit())
            .finish()
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_instances: usize,
    pub active_limit: usize,
    /// Approximate load-balanced sessions per instance
    pub usage: Vec<u64>,
}

impl PoolStats {
    /// Instances with at least one load-balanced session
    pub fn busy_instances(&self) -> usize {
        self.usage.iter().filter(|&&u| u > 0).count()
    }

    pub fn total_sessions(&self) -> u64 {
        self.usage.iter().sum()
    }
}
