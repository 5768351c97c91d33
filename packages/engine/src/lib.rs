// packages/engine/src/lib.rs
//! Replica Engine Library
//!
//! Multiplexes many host threads over several isolated instances of an
//! embedded runtime loaded into one process, so the instances never contend
//! on a single interpreter lock.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **runtime**: instance pool, load balancer, sessions, replicated objects, packages
//! - **interpreter**: the seam to an embedded runtime, plus the in-process implementation
//! - **archive**: package archives (directories, in-memory records)
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and errors
//!
//! # Example
//!
//! ```no_run
//! use replica_engine::interpreter::{Library, LocalRuntime};
//! use replica_engine::{HostValue, InstancePool};
//!
//! # fn main() -> replica_engine::Result<()> {
//! let pool = InstancePool::new(4, &LocalRuntime::new(Library::new()))?;
//! let package = pool.load_package("file:///srv/models/linear")?;
//! let model = package.load_pickle("model", "model.pkl")?;
//! let output = model.call(vec![HostValue::Int(3)])?;
//! # Ok(())
//! # }
//! ```

// Public module exports
pub mod archive;
pub mod interpreter;
pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use archive::{ArchiveReader, DirectoryArchive, MemoryArchive};
pub use interpreter::{HostValue, Obj, PickledObject};
pub use runtime::{Instance, InstancePool, InstancePoolConfig, Package, PoolStats, ReplicatedObj, Session};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
