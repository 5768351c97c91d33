// packages/engine/src/archive/directory.rs
//! Archive backed by a directory tree

use crate::archive::{not_found, ArchiveReader};
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Archive whose records are files below a root directory
#[derive(Debug, Clone)]
pub struct DirectoryArchive {
    root: PathBuf,
    name: String,
}

impl DirectoryArchive {
    /// Open a directory given as a plain path or a `file://` URI
    pub fn open(uri: &str) -> Result<Self> {
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        let root = PathBuf::from(path);

        if !root.is_dir() {
            return Err(EngineError::ArchiveOpenFailed(format!(
                "'{}' is not a directory",
                root.display()
            )));
        }

        debug!("Opened directory archive at {:?}", root);
        Ok(Self {
            name: root.display().to_string(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a record name to a path, refusing anything outside the root
    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("record name '{name}' escapes the archive"),
            ));
        }
        Ok(self.root.join(relative))
    }

    fn collect(&self, dir: &Path, names: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.collect(&path, names)?;
            } else if let Ok(relative) = path.strip_prefix(&self.root) {
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                names.push(name);
            }
        }
        Ok(())
    }
}

impl ArchiveReader for DirectoryArchive {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_record(&self, name: &str) -> io::Result<Bytes> {
        let path = self.resolve(name)?;
        match fs::read(&path) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(not_found(&self.name, name)),
            Err(e) => Err(e),
        }
    }

    fn has_record(&self, name: &str) -> bool {
        self.resolve(name).map(|p| p.is_file()).unwrap_or(false)
    }

    fn record_names(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        self.collect(&self.root, &mut names)?;
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("models/linear")).unwrap();
        fs::write(dir.path().join("models/linear/weights.pkl"), b"{}").unwrap();
        fs::write(dir.path().join("README.txt"), b"readme").unwrap();
        dir
    }

    #[test]
    fn test_open_and_read() {
        let dir = fixture();
        let archive = DirectoryArchive::open(dir.path().to_str().unwrap()).unwrap();

        assert!(archive.has_record("models/linear/weights.pkl"));
        assert_eq!(&archive.read_record("README.txt").unwrap()[..], b"readme");
        assert_eq!(
            archive.record_names().unwrap(),
            vec!["README.txt".to_string(), "models/linear/weights.pkl".to_string()]
        );
    }

    #[test]
    fn test_file_uri() {
        let dir = fixture();
        let uri = format!("file://{}", dir.path().display());
        let archive = DirectoryArchive::open(&uri).unwrap();
        assert_eq!(archive.root(), dir.path());
    }

    #[test]
    fn test_open_missing_directory() {
        let result = DirectoryArchive::open("/definitely/not/here");
        assert!(matches!(result, Err(EngineError::ArchiveOpenFailed(_))));
    }

    #[test]
    fn test_rejects_escaping_names() {
        let dir = fixture();
        let archive = DirectoryArchive::open(dir.path().to_str().unwrap()).unwrap();
        let err = archive.read_record("../etc/passwd").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(!archive.has_record("/etc/passwd"));
    }

    #[test]
    fn test_missing_record() {
        let dir = fixture();
        let archive = DirectoryArchive::open(dir.path().to_str().unwrap()).unwrap();
        let err = archive.read_record("models/nope.pkl").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
