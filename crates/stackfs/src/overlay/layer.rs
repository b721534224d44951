// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! Overlay layers: a read-only filesystem view paired with a whiteout
//! store.

use std::sync::Arc;

use dashmap::DashSet;
use relative_path::RelativePathBuf;

use crate::vfs::Filesystem;
use crate::{ErrorKind, Result, path};

#[cfg(test)]
#[path = "./layer_test.rs"]
mod layer_test;

/// Records which names a layer considers deleted.
///
/// The store only promises the semantics of its three operations; the
/// engine does not prescribe any layout beyond that.
pub trait WhiteoutStore: Send + Sync {
    /// Is `path` whited out in this layer?
    fn query(&self, path: &str) -> Result<bool>;

    /// Mark `path` whited out.
    fn record(&self, path: &str) -> Result<()>;

    /// Clear any whiteout at `path`.
    fn remove(&self, path: &str) -> Result<()>;
}

/// An in-memory whiteout set.
#[derive(Default)]
pub struct MemWhiteoutStore {
    names: DashSet<String>,
}

impl MemWhiteoutStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WhiteoutStore for MemWhiteoutStore {
    fn query(&self, path: &str) -> Result<bool> {
        Ok(self.names.contains(&path::clean(path)))
    }

    fn record(&self, path: &str) -> Result<()> {
        self.names.insert(path::clean(path));
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.names.remove(&path::clean(path));
        Ok(())
    }
}

/// A file-per-whiteout store over any filesystem: a name is whited out
/// exactly when a file exists at the same path in the store; the file's
/// content is unspecified.
pub struct FsWhiteoutStore {
    fs: Arc<dyn Filesystem>,
}

impl FsWhiteoutStore {
    pub fn new(fs: Arc<dyn Filesystem>) -> Self {
        Self { fs }
    }
}

impl WhiteoutStore for FsWhiteoutStore {
    fn query(&self, path: &str) -> Result<bool> {
        match self.fs.lstat(&path::clean(path)) {
            Ok(_) => Ok(true),
            Err(err) if err.is(ErrorKind::NotExist) || err.is(ErrorKind::NotDir) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn record(&self, path: &str) -> Result<()> {
        let cleaned = path::clean(path);
        let parent = path::parent(&cleaned);
        if parent != path::ROOT {
            self.fs.mkdir_all(parent, 0o755)?;
        }
        // a whiteout on a directory covers its subtree; stale markers
        // below it are dropped
        self.fs.remove_all(&cleaned)?;
        crate::vfs::write_file(&*self.fs, &cleaned, b"", 0o644)
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.fs.remove_all(&path::clean(path))
    }
}

/// A store view rebased under a sub-root prefix, used when deriving
/// sub-root overlays.
pub(crate) struct ScopedStore {
    inner: Arc<dyn WhiteoutStore>,
    prefix: RelativePathBuf,
}

impl ScopedStore {
    pub fn new(inner: Arc<dyn WhiteoutStore>, prefix: &str) -> Self {
        Self {
            inner,
            prefix: RelativePathBuf::from(prefix),
        }
    }

    fn full(&self, path: &str) -> String {
        self.prefix
            .join_normalized(path::clean(path))
            .as_str()
            .to_string()
    }
}

impl WhiteoutStore for ScopedStore {
    fn query(&self, path: &str) -> Result<bool> {
        self.inner.query(&self.full(path))
    }

    fn record(&self, path: &str) -> Result<()> {
        self.inner.record(&self.full(path))
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.inner.remove(&self.full(path))
    }
}

/// One overlay layer: a filesystem plus the whiteouts recorded against
/// it.
#[derive(Clone)]
pub struct Layer {
    pub(crate) fs: Arc<dyn Filesystem>,
    pub(crate) meta: Arc<dyn WhiteoutStore>,
}

impl Layer {
    pub fn new(fs: Arc<dyn Filesystem>, meta: Arc<dyn WhiteoutStore>) -> Self {
        Self { fs, meta }
    }

    /// A layer with a fresh in-memory whiteout store.
    pub fn with_memory_meta(fs: Arc<dyn Filesystem>) -> Self {
        Self::new(fs, Arc::new(MemWhiteoutStore::new()))
    }

    /// Is `path` or any of its ancestors whited out in this layer?
    pub(crate) fn covered(&self, path: &str) -> Result<bool> {
        let cleaned = path::clean(path);
        if cleaned == path::ROOT {
            return Ok(false);
        }
        for prefix in path::ancestors(&cleaned) {
            if self.meta.query(prefix)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Derive the layer rebased at `dir`: the filesystem sub-rooted and
    /// the whiteout store rebased under the same prefix.
    pub(crate) fn derive(&self, dir: &str) -> Result<Layer> {
        let fs = self.fs.open_root(dir)?;
        let meta: Arc<dyn WhiteoutStore> =
            Arc::new(ScopedStore::new(Arc::clone(&self.meta), &path::clean(dir)));
        Ok(Layer { fs, meta })
    }
}
