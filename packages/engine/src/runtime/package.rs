// packages/engine/src/runtime/package.rs
//! Packages of serialized objects and text resources
//!
//! A package wraps one archive. Each instance gets its own importer bound to
//! that archive, created the first time a session for the package lands on
//! the instance and reused afterwards.

use crate::archive::ArchiveReader;
use crate::interpreter::Obj;
use crate::runtime::boundary::shield;
use crate::runtime::instance_pool::InstancePool;
use crate::runtime::replicated::ReplicatedObj;
use crate::runtime::session::Session;
use crate::utils::errors::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Archive opened against a pool
pub struct Package {
    pool: InstancePool,
    archive: Arc<dyn ArchiveReader>,

    /// Importer per instance ordinal
    importers: DashMap<usize, Obj>,
}

impl Package {
    pub(crate) fn new(pool: InstancePool, archive: Arc<dyn ArchiveReader>) -> Self {
        Self {
            pool,
            archive,
            importers: DashMap::new(),
        }
    }

    pub fn archive(&self) -> &Arc<dyn ArchiveReader> {
        &self.archive
    }

    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    /// Instances that already have an importer for this package
    pub fn importer_count(&self) -> usize {
        self.importers.len()
    }

    /// Open a load-balanced session whose bound value is this package's importer
    pub fn acquire_session(&self) -> Result<Session<'_>> {
        shield("Package::acquire_session", || {
            let mut session = self.pool.acquire_one()?;
            let importer = self.importer_for(&mut session)?;
            session.set_self(importer);
            Ok(session)
        })
    }

    fn importer_for(&self, session: &mut Session<'_>) -> Result<Obj> {
        match self.importers.entry(session.ordinal()) {
            Entry::Occupied(entry) => Ok(*entry.get()),
            Entry::Vacant(entry) => {
                debug!(
                    "Creating importer for {} on instance #{}",
                    self.archive.name(),
                    session.ordinal()
                );
                let importer = session.create_package_importer(Arc::clone(&self.archive))?;
                entry.insert(importer);
                Ok(importer)
            }
        }
    }

    /// Load the serialized object `module/file` as a replicated object
    pub fn load_pickle(&self, module: &str, file: &str) -> Result<ReplicatedObj> {
        shield("Package::load_pickle", || {
            let mut session = self.acquire_session()?;
            let loaded = session.call_bound_method("load_pickle", &[module, file])?;
            session.create_movable(loaded)
        })
    }

    /// Read the text resource `module/file`
    pub fn load_text(&self, module: &str, file: &str) -> Result<String> {
        shield("Package::load_text", || {
            let mut session = self.acquire_session()?;
            let loaded = session.call_bound_method("load_text", &[module, file])?;
            session.to_text(loaded)
        })
    }
}

impl Drop for Package {
    fn drop(&mut self) {
        for entry in self.importers.iter() {
            let (ordinal, importer) = (*entry.key(), *entry.value());
            let Some(instance) = self.pool.instance(ordinal) else {
                continue;
            };
            let released = instance
                .acquire_session()
                .and_then(|mut session| session.release(importer));
            if let Err(e) = released {
                warn!("Failed to release importer on instance #{}: {}", ordinal, e);
            }
        }
    }
}

impl fmt::Debug for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Package")
            .field("archive", &self.archive.name())
            .field("importers", &self.importers.len())
            .finish()
    }
}
