// packages/engine/src/archive/memory.rs
//! In-memory archive

use crate::archive::{not_found, ArchiveReader};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io;

/// Archive whose records live in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    name: String,
    records: BTreeMap<String, Bytes>,
}

impl MemoryArchive {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: BTreeMap::new(),
        }
    }

    /// Builder-style insert
    pub fn with_record(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.insert(name, data);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, data: impl Into<Bytes>) {
        self.records.insert(name.into(), data.into());
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl ArchiveReader for MemoryArchive {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_record(&self, name: &str) -> io::Result<Bytes> {
        self.records
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(&self.name, name))
    }

    fn has_record(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    fn record_names(&self) -> io::Result<Vec<String>> {
        Ok(self.records.keys().cloned().collect())
    }
}
