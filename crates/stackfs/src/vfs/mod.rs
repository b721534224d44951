// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! The capability contract implemented by every filesystem engine.

use std::io::SeekFrom;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::{Error, ErrorKind, Result};

mod readonly;
pub use readonly::ReadOnlyFs;


/// Permission and special mode bits that survive a `chmod`.
pub(crate) const MODE_PERM_MASK: u32 = 0o7777;

bitflags::bitflags! {
    /// POSIX-like open flags accepted by [`Filesystem::open_file`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 0o0001;
        const WRITE = 0o0002;
        const APPEND = 0o0004;
        const CREATE = 0o0010;
        const EXCL = 0o0020;
        const TRUNC = 0o0040;
        const SYNC = 0o0100;
    }
}

impl OpenFlags {
    pub fn readable(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn writable(self) -> bool {
        self.intersects(Self::WRITE | Self::APPEND)
    }

    /// Flags equivalent to `O_RDWR`.
    pub fn read_write() -> Self {
        Self::READ | Self::WRITE
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self::READ
    }
}

/// The type of a filesystem entry, derived from the `S_IFMT` bits of its
/// mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum FileType {
    #[strum(serialize = "file")]
    Regular,
    #[strum(serialize = "directory")]
    Directory,
    #[strum(serialize = "symlink")]
    Symlink,
    #[strum(serialize = "char device")]
    CharDevice,
    #[strum(serialize = "block device")]
    BlockDevice,
    #[strum(serialize = "fifo")]
    Fifo,
    #[strum(serialize = "unknown")]
    Unknown,
}

impl FileType {
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFREG => Self::Regular,
            libc::S_IFDIR => Self::Directory,
            libc::S_IFLNK => Self::Symlink,
            libc::S_IFCHR => Self::CharDevice,
            libc::S_IFBLK => Self::BlockDevice,
            libc::S_IFIFO => Self::Fifo,
            _ => Self::Unknown,
        }
    }

    /// The `S_IFMT` bits for this type.
    pub fn mode_bits(self) -> u32 {
        match self {
            Self::Regular => libc::S_IFREG,
            Self::Directory => libc::S_IFDIR,
            Self::Symlink => libc::S_IFLNK,
            Self::CharDevice => libc::S_IFCHR,
            Self::BlockDevice => libc::S_IFBLK,
            Self::Fifo => libc::S_IFIFO,
            Self::Unknown => 0,
        }
    }
}

/// Metadata reported for a single filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// The base name of the entry as it was addressed.
    pub name: String,
    /// Full mode bits, type included.
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mtime: DateTime<Utc>,
}

impl Metadata {
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        (self.mode & libc::S_IFMT) == libc::S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        (self.mode & libc::S_IFMT) == libc::S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        (self.mode & libc::S_IFMT) == libc::S_IFLNK
    }

    /// Permission and special bits without the file type.
    pub fn permissions(&self) -> u32 {
        self.mode & MODE_PERM_MASK
    }
}

impl std::fmt::Display for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:>8} {}",
            unix_mode::to_string(self.mode),
            self.size,
            self.name
        )
    }
}

/// A single directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub meta: Metadata,
}

/// An open file or directory handle.
///
/// Handles are safe to share between threads. Sequential reads and seeks
/// serialise on the handle's cursor; positioned reads and writes do not
/// touch the cursor and take no handle-level lock. Closing is idempotent
/// and any operation on a closed handle fails with
/// [`ErrorKind::Closed`].
pub trait File: Send + Sync {
    fn stat(&self) -> Result<Metadata>;

    fn read(&self, buf: &mut [u8]) -> Result<usize>;
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
    fn seek(&self, pos: SeekFrom) -> Result<u64>;

    fn write(&self, buf: &[u8]) -> Result<usize>;
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;
    fn truncate(&self, size: u64) -> Result<()>;
    fn sync(&self) -> Result<()>;

    /// Read up to `n` directory entries from the handle's cursor, or all
    /// remaining entries when `n <= 0`. Fails with [`ErrorKind::NotDir`]
    /// for non-directory handles.
    fn read_dir(&self, n: i64) -> Result<Vec<DirEntry>>;

    fn close(&self) -> Result<()>;

    /// Read the handle's full contents from offset zero.
    fn read_all(&self) -> Result<Vec<u8>> {
        let size = self.stat()?.size as usize;
        let mut out = Vec::with_capacity(size);
        let mut buf = [0u8; 8192];
        let mut offset = 0u64;
        loop {
            let n = self.read_at(&mut buf, offset)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
            offset += n as u64;
        }
    }

    /// Write the whole buffer at the handle's cursor.
    fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(Error::new("write", "", ErrorKind::Io));
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}

impl std::fmt::Debug for dyn File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File").finish_non_exhaustive()
    }
}

/// The operations every filesystem engine provides.
///
/// Paths are slash-delimited and cleaned before use; `.` names the engine
/// root. Read-only engines answer every mutator with
/// [`ErrorKind::ReadOnlyFs`].
pub trait Filesystem: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn File>> {
        self.open_file(path, OpenFlags::READ, 0)
    }

    fn open_file(&self, path: &str, flags: OpenFlags, perm: u32) -> Result<Box<dyn File>>;

    /// Metadata for the entry at `path`, following symlinks.
    fn stat(&self, path: &str) -> Result<Metadata>;

    /// Metadata for the entry at `path` without dereferencing a final
    /// symlink.
    fn lstat(&self, path: &str) -> Result<Metadata>;

    /// The raw target of the symlink at `path`.
    fn read_link(&self, path: &str) -> Result<String>;

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let handle = self.open(path)?;
        let entries = handle.read_dir(0)?;
        handle.close()?;
        Ok(entries)
    }

    fn mkdir(&self, path: &str, perm: u32) -> Result<()>;

    fn mkdir_all(&self, path: &str, perm: u32) -> Result<()> {
        let cleaned = crate::path::clean(path);
        if cleaned == crate::path::ROOT {
            return Ok(());
        }
        for prefix in crate::path::ancestors(&cleaned) {
            match self.mkdir(prefix, perm) {
                Ok(()) => (),
                Err(err) if err.is(ErrorKind::Exist) => {
                    let meta = self.stat(prefix)?;
                    if !meta.is_dir() {
                        return Err(Error::new("mkdir", prefix, ErrorKind::NotDir));
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()>;

    fn remove_all(&self, path: &str) -> Result<()> {
        let meta = match self.lstat(path) {
            Err(err) if err.is(ErrorKind::NotExist) => return Ok(()),
            other => other?,
        };
        if meta.is_dir() {
            for entry in self.read_dir(path)? {
                let child = crate::path::join(&crate::path::clean(path), &entry.name);
                self.remove_all(&child)?;
            }
        }
        self.remove(path)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Bind `to` as an additional name for the file at `from`. Symlinks
    /// are never followed: linking a symlink links the symlink itself.
    fn link(&self, from: &str, to: &str) -> Result<()>;

    /// Create a symlink at `link` storing `target` verbatim.
    fn symlink(&self, target: &str, link: &str) -> Result<()>;

    fn chmod(&self, path: &str, mode: u32) -> Result<()>;
    fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()>;
    fn lchown(&self, path: &str, uid: u32, gid: u32) -> Result<()>;
    fn chtimes(&self, path: &str, mtime: DateTime<Utc>) -> Result<()>;

    /// Release any resources held by the engine. A no-op for the in-tree
    /// engines; idempotent.
    fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Derive an engine whose root is the directory at `path`, retaining
    /// the current outer root for symlink resolution when unrooted.
    fn sub(&self, path: &str) -> Result<std::sync::Arc<dyn Filesystem>>;

    /// Derive an engine pinned at the directory at `path`: the result is
    /// rooted and resolution cannot escape it.
    fn open_root(&self, path: &str) -> Result<std::sync::Arc<dyn Filesystem>>;
}

/// Read the full contents of the file at `path`.
pub fn read_file(fs: &dyn Filesystem, path: &str) -> Result<Vec<u8>> {
    let file = fs.open(path)?;
    let data = file.read_all()?;
    file.close()?;
    Ok(data)
}

/// Create or truncate the file at `path` with the given contents.
pub fn write_file(fs: &dyn Filesystem, path: &str, data: &[u8], perm: u32) -> Result<()> {
    let file = fs.open_file(
        path,
        OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNC,
        perm,
    )?;
    file.write_all(data)?;
    file.close()
}

/// Tracks the closed state shared by every handle implementation.
pub(crate) struct CloseFlag(AtomicBool);

impl CloseFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Fail with [`ErrorKind::Closed`] once the handle has been closed.
    pub fn check(&self, op: &'static str, name: &str) -> Result<()> {
        if self.0.load(Ordering::Acquire) {
            Err(Error::new(op, name.to_string(), ErrorKind::Closed))
        } else {
            Ok(())
        }
    }

    /// Mark closed; returns true the first time only.
    pub fn close(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

/// A directory handle over a listing snapshot taken at open time.
///
/// Shared by every engine: the entries are fixed, `read_dir` batches
/// advance a cursor, and `seek(Start(0))` rewinds.
pub(crate) struct DirHandle {
    name: String,
    meta: Metadata,
    entries: Vec<DirEntry>,
    cursor: Mutex<usize>,
    closed: CloseFlag,
}

impl DirHandle {
    pub fn new(name: String, meta: Metadata, entries: Vec<DirEntry>) -> Self {
        Self {
            name,
            meta,
            entries,
            cursor: Mutex::new(0),
            closed: CloseFlag::new(),
        }
    }
}

impl File for DirHandle {
    fn stat(&self) -> Result<Metadata> {
        self.closed.check("stat", &self.name)?;
        Ok(self.meta.clone())
    }

    fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        self.closed.check("read", &self.name)?;
        Err(Error::new("read", self.name.clone(), ErrorKind::IsDir))
    }

    fn read_at(&self, _buf: &mut [u8], _offset: u64) -> Result<usize> {
        self.closed.check("read", &self.name)?;
        Err(Error::new("read", self.name.clone(), ErrorKind::IsDir))
    }

    fn seek(&self, pos: SeekFrom) -> Result<u64> {
        self.closed.check("seek", &self.name)?;
        match pos {
            SeekFrom::Start(0) => {
                *self.cursor.lock().expect("cursor lock poisoned") = 0;
                Ok(0)
            }
            _ => Err(Error::new("seek", self.name.clone(), ErrorKind::Invalid)),
        }
    }

    fn write(&self, _buf: &[u8]) -> Result<usize> {
        self.closed.check("write", &self.name)?;
        Err(Error::new("write", self.name.clone(), ErrorKind::BadFd))
    }

    fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize> {
        self.closed.check("write", &self.name)?;
        Err(Error::new("write", self.name.clone(), ErrorKind::BadFd))
    }

    fn truncate(&self, _size: u64) -> Result<()> {
        self.closed.check("truncate", &self.name)?;
        Err(Error::new("truncate", self.name.clone(), ErrorKind::IsDir))
    }

    fn sync(&self) -> Result<()> {
        self.closed.check("sync", &self.name)
    }

    fn read_dir(&self, n: i64) -> Result<Vec<DirEntry>> {
        self.closed.check("readdir", &self.name)?;
        let mut cursor = self.cursor.lock().expect("cursor lock poisoned");
        let remaining = self.entries.len() - *cursor;
        let take = if n <= 0 {
            remaining
        } else {
            remaining.min(n as usize)
        };
        let batch = self.entries[*cursor..*cursor + take].to_vec();
        *cursor += take;
        Ok(batch)
    }

    fn close(&self) -> Result<()> {
        self.closed.close();
        Ok(())
    }
}
