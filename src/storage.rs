//! Filesystem capability: an opaque blob namespace for persisted state.
//!
//! The core never touches paths directly; the transaction store and the
//! configuration registry go through this trait. Writes are atomic-replace
//! (temp + rename) so a crash mid-write leaves the previous blob intact.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::rc::Rc;

use tracing::debug;

/// Blob store consumed by the core. Names are flat (no directories) and
/// ASCII; `write` must replace atomically.
pub trait Filesystem {
    fn read(&self, name: &str) -> io::Result<Vec<u8>>;
    fn write(&self, name: &str, data: &[u8]) -> io::Result<()>;
    fn remove(&self, name: &str) -> io::Result<()>;
    fn list(&self) -> io::Result<Vec<String>>;
}

/// Blob store backed by a directory on the host filesystem.
pub struct DirFilesystem {
    root: PathBuf,
}

impl DirFilesystem {
    /// Opens (creating if needed) the backing directory. Failure here is the
    /// "filesystem wholly unavailable" case and should fail initialization.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<DirFilesystem> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(DirFilesystem { root })
    }
}

impl Filesystem for DirFilesystem {
    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.root.join(name))
    }

    fn write(&self, name: &str, data: &[u8]) -> io::Result<()> {
        let tmp = self.root.join(format!("{name}.tmp"));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, self.root.join(name))
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.root.join(name))
    }

    fn list(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Ok(name) = entry.file_name().into_string() {
                if !name.ends_with(".tmp") {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }
}

/// In-memory blob store. Cloning yields a handle onto the same blobs, which
/// is how tests keep "flash" contents alive across a deinit/reinit cycle.
#[derive(Clone, Default)]
pub struct MemFilesystem {
    blobs: Rc<RefCell<HashMap<String, Vec<u8>>>>,
}

impl MemFilesystem {
    pub fn new() -> MemFilesystem {
        MemFilesystem::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.blobs.borrow().contains_key(name)
    }

    pub fn clear(&self) {
        self.blobs.borrow_mut().clear();
    }
}

impl Filesystem for MemFilesystem {
    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        self.blobs
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }

    fn write(&self, name: &str, data: &[u8]) -> io::Result<()> {
        debug!(name, len = data.len(), "mem blob written");
        self.blobs.borrow_mut().insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        self.blobs
            .borrow_mut()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }

    fn list(&self) -> io::Result<Vec<String>> {
        Ok(self.blobs.borrow().keys().cloned().collect())
    }
}
