// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! A blanket read-only adapter over any [`Filesystem`].

use std::io::SeekFrom;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{DirEntry, File, Filesystem, Metadata, OpenFlags};
use crate::{Error, ErrorKind, Result};

/// Wraps a filesystem and answers every mutator with
/// [`ErrorKind::ReadOnlyFs`] before touching the backing state. Handles
/// obtained through the wrapper reject write operations with
/// [`ErrorKind::Permission`].
pub struct ReadOnlyFs {
    inner: Arc<dyn Filesystem>,
}

impl ReadOnlyFs {
    pub fn new(inner: Arc<dyn Filesystem>) -> Self {
        Self { inner }
    }

    fn denied<T>(op: &'static str, path: &str) -> Result<T> {
        Err(Error::new(op, path.to_string(), ErrorKind::ReadOnlyFs))
    }
}

impl Filesystem for ReadOnlyFs {
    fn open_file(&self, path: &str, flags: OpenFlags, perm: u32) -> Result<Box<dyn File>> {
        if flags.writable() || flags.intersects(OpenFlags::CREATE | OpenFlags::TRUNC) {
            return Self::denied("open", path);
        }
        let inner = self.inner.open_file(path, flags, perm)?;
        Ok(Box::new(ReadOnlyFile { inner }))
    }

    fn stat(&self, path: &str) -> Result<Metadata> {
        self.inner.stat(path)
    }

    fn lstat(&self, path: &str) -> Result<Metadata> {
        self.inner.lstat(path)
    }

    fn read_link(&self, path: &str) -> Result<String> {
        self.inner.read_link(path)
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.inner.read_dir(path)
    }

    fn mkdir(&self, path: &str, _perm: u32) -> Result<()> {
        Self::denied("mkdir", path)
    }

    fn mkdir_all(&self, path: &str, _perm: u32) -> Result<()> {
        Self::denied("mkdir", path)
    }

    fn remove(&self, path: &str) -> Result<()> {
        Self::denied("remove", path)
    }

    fn remove_all(&self, path: &str) -> Result<()> {
        Self::denied("remove", path)
    }

    fn rename(&self, from: &str, _to: &str) -> Result<()> {
        Self::denied("rename", from)
    }

    fn link(&self, from: &str, _to: &str) -> Result<()> {
        Self::denied("link", from)
    }

    fn symlink(&self, _target: &str, link: &str) -> Result<()> {
        Self::denied("symlink", link)
    }

    fn chmod(&self, path: &str, _mode: u32) -> Result<()> {
        Self::denied("chmod", path)
    }

    fn chown(&self, path: &str, _uid: u32, _gid: u32) -> Result<()> {
        Self::denied("chown", path)
    }

    fn lchown(&self, path: &str, _uid: u32, _gid: u32) -> Result<()> {
        Self::denied("lchown", path)
    }

    fn chtimes(&self, path: &str, _mtime: DateTime<Utc>) -> Result<()> {
        Self::denied("chtimes", path)
    }

    fn sub(&self, path: &str) -> Result<Arc<dyn Filesystem>> {
        let inner = self.inner.sub(path)?;
        Ok(Arc::new(ReadOnlyFs { inner }))
    }

    fn open_root(&self, path: &str) -> Result<Arc<dyn Filesystem>> {
        let inner = self.inner.open_root(path)?;
        Ok(Arc::new(ReadOnlyFs { inner }))
    }
}

struct ReadOnlyFile {
    inner: Box<dyn File>,
}

impl ReadOnlyFile {
    fn denied<T>(&self, op: &'static str) -> Result<T> {
        let name = self.inner.stat().map(|m| m.name).unwrap_or_default();
        Err(Error::new(op, name, ErrorKind::Permission))
    }
}

impl File for ReadOnlyFile {
    fn stat(&self) -> Result<Metadata> {
        self.inner.stat()
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.inner.read_at(buf, offset)
    }

    fn seek(&self, pos: SeekFrom) -> Result<u64> {
        self.inner.seek(pos)
    }

    fn write(&self, _buf: &[u8]) -> Result<usize> {
        self.denied("write")
    }

    fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize> {
        self.denied("write")
    }

    fn truncate(&self, _size: u64) -> Result<()> {
        self.denied("truncate")
    }

    fn sync(&self) -> Result<()> {
        self.denied("sync")
    }

    fn read_dir(&self, n: i64) -> Result<Vec<DirEntry>> {
        self.inner.read_dir(n)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
