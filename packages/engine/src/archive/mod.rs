// packages/engine/src/archive/mod.rs
//! Package archives
//!
//! An archive is an opaque provider of named byte records. Records are
//! addressed by a logical module path plus a file name; the module's dots
//! become path separators:
//!
//! ```text
//! ("models.linear", "weights.pkl")  →  "models/linear/weights.pkl"
//! ```
//!
//! - **DirectoryArchive**: records are files under a directory
//! - **MemoryArchive**: records held in memory (pre-opened readers, tests)

pub mod directory;
pub mod memory;

pub use directory::DirectoryArchive;
pub use memory::MemoryArchive;

use bytes::Bytes;
use std::io;

/// Read access to the records of one package
pub trait ArchiveReader: Send + Sync {
    /// Human-readable archive name (path or label)
    fn name(&self) -> &str;

    /// Read a whole record
    fn read_record(&self, name: &str) -> io::Result<Bytes>;

    /// Whether the record exists
    fn has_record(&self, name: &str) -> bool;

    /// Names of all records, sorted
    fn record_names(&self) -> io::Result<Vec<String>>;
}

/// Record name for `file` inside logical module `module`
pub fn record_name(module: &str, file: &str) -> String {
    let module = module.trim_matches('.');
    if module.is_empty() {
        file.to_string()
    } else {
        format!("{}/{}", module.replace('.', "/"), file)
    }
}

pub(crate) fn not_found(archive: &str, name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no record '{name}' in archive '{archive}'"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_name() {
        assert_eq!(record_name("models.linear", "weights.pkl"), "models/linear/weights.pkl");
        assert_eq!(record_name("model", "model.pkl"), "model/model.pkl");
        assert_eq!(record_name("", "top.txt"), "top.txt");
    }
}
