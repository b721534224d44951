// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! Pluggable file-content storage for [`SynthFs`](super::SynthFs).

use std::sync::{Arc, RwLock};

use crate::vfs::{File, OpenFlags};
use crate::{Error, ErrorKind, Result};

#[cfg(test)]
#[path = "./backend_test.rs"]
mod backend_test;

/// The content reference held by a file entry.
///
/// A view outlives any number of opens; [`FileView::close`] releases the
/// backing resources once the engine decides the content is gone for
/// good.
pub trait FileView: Send + Sync {
    /// Open the content for I/O under the given flags.
    fn open(&self, flags: OpenFlags) -> Result<Box<dyn Content>>;

    /// Release the backing resources.
    fn close(&self) -> Result<()>;

    /// The current content size in bytes.
    fn size(&self) -> u64;
}

/// Byte-level I/O over an opened content view.
pub trait Content: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;
    fn truncate(&self, size: u64) -> Result<()>;
    fn size(&self) -> u64;
    fn sync(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn Content {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Content").finish_non_exhaustive()
    }
}

/// Allocates content views for files created through the engine.
pub trait ViewAllocator: Send + Sync {
    fn allocate(&self, name: &str) -> Arc<dyn FileView>;
}

/// The default allocator: every file is an in-memory buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryAllocator;

impl ViewAllocator for MemoryAllocator {
    fn allocate(&self, _name: &str) -> Arc<dyn FileView> {
        Arc::new(MemoryView::new())
    }
}

/// An in-memory byte buffer with a single write lock.
pub struct MemoryView {
    buf: Arc<RwLock<Vec<u8>>>,
}

impl MemoryView {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn with_contents(data: Vec<u8>) -> Self {
        Self {
            buf: Arc::new(RwLock::new(data)),
        }
    }
}

impl Default for MemoryView {
    fn default() -> Self {
        Self::new()
    }
}

impl FileView for MemoryView {
    fn open(&self, _flags: OpenFlags) -> Result<Box<dyn Content>> {
        Ok(Box::new(MemoryContent {
            buf: Arc::clone(&self.buf),
        }))
    }

    fn close(&self) -> Result<()> {
        let mut buf = self.buf.write().expect("content lock poisoned");
        buf.clear();
        buf.shrink_to_fit();
        Ok(())
    }

    fn size(&self) -> u64 {
        self.buf.read().expect("content lock poisoned").len() as u64
    }
}

struct MemoryContent {
    buf: Arc<RwLock<Vec<u8>>>,
}

impl Content for MemoryContent {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.buf.read().expect("content lock poisoned");
        if offset >= data.len() as u64 {
            return Ok(0);
        }
        let avail = &data[offset as usize..];
        let n = avail.len().min(buf.len());
        buf[..n].copy_from_slice(&avail[..n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let mut data = self.buf.write().expect("content lock poisoned");
        let end = offset as usize + buf.len();
        if data.len() < end {
            // gaps left by a forward seek read back as zeros
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn truncate(&self, size: u64) -> Result<()> {
        let mut data = self.buf.write().expect("content lock poisoned");
        data.resize(size as usize, 0);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.buf.read().expect("content lock poisoned").len() as u64
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// A read-only view over a file owned by some other filesystem.
pub struct ExternalView {
    file: Arc<dyn File>,
}

impl ExternalView {
    pub fn new(file: Arc<dyn File>) -> Self {
        Self { file }
    }
}

impl FileView for ExternalView {
    fn open(&self, flags: OpenFlags) -> Result<Box<dyn Content>> {
        if flags.writable() {
            return Err(Error::new("open", "", ErrorKind::Permission));
        }
        Ok(Box::new(ExternalContent {
            file: Arc::clone(&self.file),
        }))
    }

    fn close(&self) -> Result<()> {
        self.file.close()
    }

    fn size(&self) -> u64 {
        self.file.stat().map(|meta| meta.size).unwrap_or(0)
    }
}

struct ExternalContent {
    file: Arc<dyn File>,
}

impl Content for ExternalContent {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.file.read_at(buf, offset)
    }

    fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize> {
        Err(Error::new("write", "", ErrorKind::Permission))
    }

    fn truncate(&self, _size: u64) -> Result<()> {
        Err(Error::new("truncate", "", ErrorKind::Permission))
    }

    fn size(&self) -> u64 {
        self.file.stat().map(|meta| meta.size).unwrap_or(0)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// A read-only byte window `[offset, offset + length)` over another view.
pub struct RangedView {
    inner: Arc<dyn FileView>,
    offset: u64,
    length: u64,
}

impl RangedView {
    pub fn new(inner: Arc<dyn FileView>, offset: u64, length: u64) -> Self {
        Self {
            inner,
            offset,
            length,
        }
    }
}

impl FileView for RangedView {
    fn open(&self, flags: OpenFlags) -> Result<Box<dyn Content>> {
        if flags.writable() {
            return Err(Error::new("open", "", ErrorKind::Permission));
        }
        Ok(Box::new(RangedContent {
            inner: self.inner.open(OpenFlags::READ)?,
            offset: self.offset,
            length: self.length,
        }))
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn size(&self) -> u64 {
        self.length
    }
}

struct RangedContent {
    inner: Box<dyn Content>,
    offset: u64,
    length: u64,
}

impl Content for RangedContent {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.length {
            return Ok(0);
        }
        let want = buf.len().min((self.length - offset) as usize);
        self.inner.read_at(&mut buf[..want], self.offset + offset)
    }

    fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize> {
        Err(Error::new("write", "", ErrorKind::Permission))
    }

    fn truncate(&self, _size: u64) -> Result<()> {
        Err(Error::new("truncate", "", ErrorKind::Permission))
    }

    fn size(&self) -> u64 {
        self.length
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
