// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! The in-memory read/write filesystem engine.

use std::io::SeekFrom;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use super::backend::{Content, MemoryAllocator, ViewAllocator};
use super::entry::{DirNode, FileNode, Node, SymlinkNode};
use crate::clock::{Clock, SystemClock};
use crate::resolve::Walk;
use crate::vfs::{
    CloseFlag, DirEntry, DirHandle, File, Filesystem, MODE_PERM_MASK, Metadata, OpenFlags,
};
use crate::{Error, ErrorKind, Result, path};

#[cfg(test)]
#[path = "./fs_test.rs"]
mod fs_test;

/// Behavioral switches for [`SynthFs`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SynthFsOptions {
    /// Reject resolution that escapes the engine root via `..` or
    /// absolute symlink targets.
    pub rooted: bool,
    /// Permission bits masked off every created entry.
    pub umask: u32,
    /// Keep removed file content alive while open handles reference it.
    /// When disabled, removal releases the content immediately and open
    /// handles observe a zero-length file.
    pub defer_open_removal: bool,
}

impl Default for SynthFsOptions {
    fn default() -> Self {
        Self {
            rooted: true,
            umask: 0o022,
            defer_open_removal: true,
        }
    }
}

/// An in-memory hierarchical filesystem with full read/write semantics
/// and pluggable file-content storage.
pub struct SynthFs {
    root: Arc<DirNode>,
    outer: Arc<DirNode>,
    opts: SynthFsOptions,
    clock: Arc<dyn Clock>,
    alloc: Arc<dyn ViewAllocator>,
    /// Serialises renames so that the two-directory lock acquisition can
    /// never deadlock against another rename.
    rename_lock: Arc<Mutex<()>>,
}

impl Default for SynthFs {
    fn default() -> Self {
        Self::new()
    }
}

impl SynthFs {
    pub fn new() -> Self {
        Self::with_options(SynthFsOptions::default())
    }

    pub fn with_options(opts: SynthFsOptions) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let root = DirNode::new(0o755, clock.now());
        Self {
            outer: Arc::clone(&root),
            root,
            opts,
            clock,
            alloc: Arc::new(MemoryAllocator),
            rename_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Replace the time source used for mtime stamping.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the content-view allocator used by file creation.
    pub fn with_allocator(mut self, alloc: Arc<dyn ViewAllocator>) -> Self {
        self.alloc = alloc;
        self
    }

    fn walk(&self) -> Walk<Node> {
        Walk {
            outer: Node::Dir(Arc::clone(&self.outer)),
            root: Node::Dir(Arc::clone(&self.root)),
            rooted: self.opts.rooted,
        }
    }

    fn resolve(&self, op: &'static str, path_: &str, skip_last: bool) -> Result<Node> {
        self.walk().resolve(op, path_, skip_last)
    }

    /// Resolve the directory holding the final component of `path_`,
    /// following symlinks everywhere but the final step.
    fn resolve_parent(&self, op: &'static str, path_: &str) -> Result<(Arc<DirNode>, String)> {
        let cleaned = path::clean(path_);
        if cleaned == path::ROOT {
            return Err(Error::new(op, path_.to_string(), ErrorKind::Invalid));
        }
        let name = path::base(&cleaned);
        if name == ".." {
            return Err(Error::new(op, path_.to_string(), ErrorKind::Invalid));
        }
        let dir_path = if path::is_abs(path_) {
            format!("/{}", path::parent(&cleaned))
        } else {
            path::parent(&cleaned).to_string()
        };
        let parent = self.resolve(op, &dir_path, false)?;
        match parent.as_dir() {
            Some(dir) => Ok((dir, name.to_string())),
            None => Err(Error::new(op, path_.to_string(), ErrorKind::NotDir)),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn touch_dir(&self, dir: &Arc<DirNode>) {
        dir.meta.write().expect("meta lock poisoned").mtime = self.now();
    }

    fn masked(&self, perm: u32) -> u32 {
        perm & MODE_PERM_MASK & !self.opts.umask
    }

    fn create_file(
        &self,
        path_: &str,
        flags: OpenFlags,
        perm: u32,
    ) -> Result<Box<dyn File>> {
        let (parent, name) = self.resolve_parent("open", path_)?;
        let mut children = parent.children.write().expect("children lock poisoned");
        if let Some(existing) = children.get(&name) {
            // lost a race with a concurrent create, or the final
            // component is a dangling symlink; creation through a
            // dangling symlink is not supported
            if matches!(existing, Node::Symlink(_)) {
                return Err(Error::new("open", path_.to_string(), ErrorKind::NotExist));
            }
            drop(children);
            return self.open_file(path_, flags, perm);
        }
        let view = self.alloc.allocate(&name);
        let file = FileNode::new(self.masked(perm), self.now(), Arc::clone(&view));
        children.insert(name.clone(), Node::File(Arc::clone(&file)));
        drop(children);
        self.touch_dir(&parent);
        let content = view.open(flags)?;
        Ok(Box::new(SynthFile::new(
            name,
            file,
            content,
            flags,
            Arc::clone(&self.clock),
        )))
    }
}

impl Filesystem for SynthFs {
    fn open_file(&self, path_: &str, flags: OpenFlags, perm: u32) -> Result<Box<dyn File>> {
        if !flags.readable() && !flags.writable() {
            return Err(Error::new("open", path_.to_string(), ErrorKind::Invalid));
        }
        match self.resolve("open", path_, false) {
            Ok(node) => {
                if flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) {
                    return Err(Error::new("open", path_.to_string(), ErrorKind::Exist));
                }
                match node {
                    Node::Dir(dir) => {
                        if flags.writable() || flags.contains(OpenFlags::TRUNC) {
                            return Err(Error::new("open", path_.to_string(), ErrorKind::IsDir));
                        }
                        let name = path::base(&path::clean(path_)).to_string();
                        let node = Node::Dir(Arc::clone(&dir));
                        let meta = node.metadata(&name);
                        let entries = list_dir(&dir);
                        Ok(Box::new(DirHandle::new(name, meta, entries)))
                    }
                    Node::File(file) => {
                        if flags.contains(OpenFlags::TRUNC) && !flags.writable() {
                            return Err(Error::new(
                                "open",
                                path_.to_string(),
                                ErrorKind::Invalid,
                            ));
                        }
                        let content = file.view.open(flags)?;
                        if flags.contains(OpenFlags::TRUNC) {
                            content.truncate(0)?;
                            file.touch(self.now());
                        }
                        let name = path::base(&path::clean(path_)).to_string();
                        Ok(Box::new(SynthFile::new(
                            name,
                            file,
                            content,
                            flags,
                            Arc::clone(&self.clock),
                        )))
                    }
                    Node::Symlink(_) => {
                        // unreachable in practice: the resolver always
                        // dereferences a final symlink when not skipped
                        Err(Error::new("open", path_.to_string(), ErrorKind::Invalid))
                    }
                }
            }
            Err(err) if err.is(ErrorKind::NotExist) && flags.contains(OpenFlags::CREATE) => {
                self.create_file(path_, flags, perm)
            }
            Err(err) => Err(err),
        }
    }

    fn stat(&self, path_: &str) -> Result<Metadata> {
        let node = self.resolve("stat", path_, false)?;
        Ok(node.metadata(path::base(&path::clean(path_))))
    }

    fn lstat(&self, path_: &str) -> Result<Metadata> {
        let node = self.resolve("lstat", path_, true)?;
        Ok(node.metadata(path::base(&path::clean(path_))))
    }

    fn read_link(&self, path_: &str) -> Result<String> {
        let node = self.resolve("readlink", path_, true)?;
        match node {
            Node::Symlink(link) => Ok(link.target.clone()),
            _ => Err(Error::new(
                "readlink",
                path_.to_string(),
                ErrorKind::Invalid,
            )),
        }
    }

    fn mkdir(&self, path_: &str, perm: u32) -> Result<()> {
        let (parent, name) = self.resolve_parent("mkdir", path_)?;
        let mut children = parent.children.write().expect("children lock poisoned");
        if children.contains_key(&name) {
            return Err(Error::new("mkdir", path_.to_string(), ErrorKind::Exist));
        }
        let dir = DirNode::new(self.masked(perm), self.now());
        dir.set_parent(&parent);
        children.insert(name, Node::Dir(dir));
        drop(children);
        self.touch_dir(&parent);
        Ok(())
    }

    fn remove(&self, path_: &str) -> Result<()> {
        let cleaned = path::clean(path_);
        if cleaned == path::ROOT {
            return Err(Error::new("remove", path_.to_string(), ErrorKind::Invalid));
        }
        let (parent, name) = self.resolve_parent("remove", path_)?;
        let mut children = parent.children.write().expect("children lock poisoned");
        let Some(node) = children.get(&name) else {
            return Err(Error::new("remove", path_.to_string(), ErrorKind::NotExist));
        };
        if let Node::Dir(dir) = node {
            if !dir
                .children
                .read()
                .expect("children lock poisoned")
                .is_empty()
            {
                return Err(Error::new(
                    "remove",
                    path_.to_string(),
                    ErrorKind::NotEmpty,
                ));
            }
        }
        let node = children
            .shift_remove(&name)
            .expect("checked binding must be removable");
        drop(children);
        self.touch_dir(&parent);
        if !self.opts.defer_open_removal {
            if let Node::File(file) = &node {
                // release content now; open handles see an empty file
                file.view.close()?;
            }
        }
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_clean = path::clean(from);
        let to_clean = path::clean(to);
        if from_clean == path::ROOT || to_clean == path::ROOT {
            return Err(Error::new("rename", from.to_string(), ErrorKind::Invalid));
        }
        if to_clean.starts_with(&format!("{from_clean}/")) {
            return Err(Error::new("rename", to.to_string(), ErrorKind::Invalid));
        }
        if from_clean == to_clean {
            return self.lstat(from).map(|_| ());
        }

        let _serial = self.rename_lock.lock().expect("rename lock poisoned");
        let (from_parent, from_name) = self.resolve_parent("rename", from)?;
        let (to_parent, to_name) = self.resolve_parent("rename", to)?;

        let same_parent = Arc::ptr_eq(&from_parent, &to_parent);
        // Ancestors lock before descendants; unrelated directories fall
        // back to address order. Renames are serialised above, and every
        // other structural operation locks a single directory, so this
        // cannot deadlock.
        let (first, second) = if same_parent {
            (Arc::clone(&from_parent), None)
        } else if is_ancestor(&to_parent, &from_parent) {
            (Arc::clone(&to_parent), Some(Arc::clone(&from_parent)))
        } else if is_ancestor(&from_parent, &to_parent) {
            (Arc::clone(&from_parent), Some(Arc::clone(&to_parent)))
        } else if Arc::as_ptr(&from_parent) < Arc::as_ptr(&to_parent) {
            (Arc::clone(&from_parent), Some(Arc::clone(&to_parent)))
        } else {
            (Arc::clone(&to_parent), Some(Arc::clone(&from_parent)))
        };
        let first_guard = first.children.write().expect("children lock poisoned");
        let second_guard = second
            .as_ref()
            .map(|dir| dir.children.write().expect("children lock poisoned"));

        let (mut from_children, mut to_children) = match second_guard {
            None => (first_guard, None),
            Some(second_guard) => {
                if Arc::ptr_eq(&first, &from_parent) {
                    (first_guard, Some(second_guard))
                } else {
                    (second_guard, Some(first_guard))
                }
            }
        };

        let Some(src) = from_children.get(&from_name).cloned() else {
            return Err(Error::new("rename", from.to_string(), ErrorKind::NotExist));
        };
        {
            let dst_children = to_children.as_deref().unwrap_or(&from_children);
            if let Some(dst) = dst_children.get(&to_name) {
                match (src.is_dir(), dst.is_dir()) {
                    (false, false) => (),
                    (true, true) => {
                        let Node::Dir(dst_dir) = dst else { unreachable!() };
                        if !dst_dir
                            .children
                            .read()
                            .expect("children lock poisoned")
                            .is_empty()
                        {
                            return Err(Error::new(
                                "rename",
                                to.to_string(),
                                ErrorKind::NotEmpty,
                            ));
                        }
                    }
                    _ => {
                        return Err(Error::new("rename", to.to_string(), ErrorKind::Exist));
                    }
                }
            }
        }

        from_children
            .shift_remove(&from_name)
            .expect("checked binding must be removable");
        match to_children.as_mut() {
            Some(to_children) => {
                to_children.insert(to_name, src.clone());
            }
            None => {
                from_children.insert(to_name, src.clone());
            }
        }
        if let Node::Dir(dir) = &src {
            dir.set_parent(&to_parent);
        }
        drop(to_children);
        drop(from_children);
        self.touch_dir(&from_parent);
        if !same_parent {
            self.touch_dir(&to_parent);
        }
        Ok(())
    }

    fn link(&self, from: &str, to: &str) -> Result<()> {
        let node = self.resolve("link", from, true)?;
        if node.is_dir() {
            return Err(Error::new("link", from.to_string(), ErrorKind::Permission));
        }
        let (parent, name) = self.resolve_parent("link", to)?;
        let mut children = parent.children.write().expect("children lock poisoned");
        if children.contains_key(&name) {
            return Err(Error::new("link", to.to_string(), ErrorKind::Exist));
        }
        children.insert(name, node);
        drop(children);
        self.touch_dir(&parent);
        Ok(())
    }

    fn symlink(&self, target: &str, link: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent("symlink", link)?;
        let mut children = parent.children.write().expect("children lock poisoned");
        if children.contains_key(&name) {
            return Err(Error::new("symlink", link.to_string(), ErrorKind::Exist));
        }
        let node = SymlinkNode::new(target.to_string(), self.now());
        children.insert(name, Node::Symlink(node));
        drop(children);
        self.touch_dir(&parent);
        Ok(())
    }

    fn chmod(&self, path_: &str, mode: u32) -> Result<()> {
        let node = self.resolve("chmod", path_, false)?;
        node.update_meta(|meta| {
            meta.mode = (meta.mode & libc::S_IFMT) | (mode & MODE_PERM_MASK);
        });
        Ok(())
    }

    fn chown(&self, path_: &str, uid: u32, gid: u32) -> Result<()> {
        let node = self.resolve("chown", path_, false)?;
        node.update_meta(|meta| {
            meta.uid = uid;
            meta.gid = gid;
        });
        Ok(())
    }

    fn lchown(&self, path_: &str, uid: u32, gid: u32) -> Result<()> {
        let node = self.resolve("lchown", path_, true)?;
        node.update_meta(|meta| {
            meta.uid = uid;
            meta.gid = gid;
        });
        Ok(())
    }

    fn chtimes(&self, path_: &str, mtime: DateTime<Utc>) -> Result<()> {
        let node = self.resolve("chtimes", path_, false)?;
        node.update_meta(|meta| meta.mtime = mtime);
        Ok(())
    }

    fn sub(&self, path_: &str) -> Result<Arc<dyn Filesystem>> {
        let node = self.resolve("sub", path_, false)?;
        let Some(dir) = node.as_dir() else {
            return Err(Error::new("sub", path_.to_string(), ErrorKind::NotDir));
        };
        Ok(Arc::new(Self {
            root: dir,
            outer: Arc::clone(&self.outer),
            opts: self.opts.clone(),
            clock: Arc::clone(&self.clock),
            alloc: Arc::clone(&self.alloc),
            rename_lock: Arc::clone(&self.rename_lock),
        }))
    }

    fn open_root(&self, path_: &str) -> Result<Arc<dyn Filesystem>> {
        let node = self.resolve("openroot", path_, false)?;
        let Some(dir) = node.as_dir() else {
            return Err(Error::new(
                "openroot",
                path_.to_string(),
                ErrorKind::NotDir,
            ));
        };
        Ok(Arc::new(Self {
            root: Arc::clone(&dir),
            outer: dir,
            opts: SynthFsOptions {
                rooted: true,
                ..self.opts.clone()
            },
            clock: Arc::clone(&self.clock),
            alloc: Arc::clone(&self.alloc),
            rename_lock: Arc::clone(&self.rename_lock),
        }))
    }
}

fn list_dir(dir: &Arc<DirNode>) -> Vec<DirEntry> {
    dir.children
        .read()
        .expect("children lock poisoned")
        .iter()
        .map(|(name, node)| DirEntry {
            name: name.clone(),
            meta: node.metadata(name),
        })
        .collect()
}

/// True when `candidate` lies on `dir`'s parent chain.
fn is_ancestor(candidate: &Arc<DirNode>, dir: &Arc<DirNode>) -> bool {
    let mut cur = Arc::clone(dir);
    loop {
        let parent = cur.parent.read().expect("parent lock poisoned").upgrade();
        match parent {
            Some(parent) => {
                if Arc::ptr_eq(&parent, candidate) {
                    return true;
                }
                cur = parent;
            }
            None => return false,
        }
    }
}

/// An open handle to a file entry.
struct SynthFile {
    name: String,
    node: Arc<FileNode>,
    content: Box<dyn Content>,
    flags: OpenFlags,
    pos: Mutex<u64>,
    closed: CloseFlag,
    clock: Arc<dyn Clock>,
}

impl SynthFile {
    fn new(
        name: String,
        node: Arc<FileNode>,
        content: Box<dyn Content>,
        flags: OpenFlags,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name,
            node,
            content,
            flags,
            pos: Mutex::new(0),
            closed: CloseFlag::new(),
            clock,
        }
    }

    fn want_read(&self, op: &'static str) -> Result<()> {
        self.closed.check(op, &self.name)?;
        if !self.flags.readable() {
            return Err(Error::new(op, self.name.clone(), ErrorKind::BadFd));
        }
        Ok(())
    }

    fn want_write(&self, op: &'static str) -> Result<()> {
        self.closed.check(op, &self.name)?;
        if !self.flags.writable() {
            return Err(Error::new(op, self.name.clone(), ErrorKind::BadFd));
        }
        Ok(())
    }

    fn touch(&self) {
        self.node.touch(self.clock.now());
    }
}

impl File for SynthFile {
    fn stat(&self) -> Result<Metadata> {
        self.closed.check("stat", &self.name)?;
        let node = Node::File(Arc::clone(&self.node));
        Ok(node.metadata(&self.name))
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.want_read("read")?;
        let mut pos = self.pos.lock().expect("cursor lock poisoned");
        let n = self.content.read_at(buf, *pos)?;
        *pos += n as u64;
        Ok(n)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.want_read("read")?;
        self.content.read_at(buf, offset)
    }

    fn seek(&self, seek: SeekFrom) -> Result<u64> {
        self.closed.check("seek", &self.name)?;
        let mut pos = self.pos.lock().expect("cursor lock poisoned");
        let next = match seek {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => *pos as i64 + delta,
            SeekFrom::End(delta) => self.content.size() as i64 + delta,
        };
        if next < 0 {
            return Err(Error::new("seek", self.name.clone(), ErrorKind::Invalid));
        }
        *pos = next as u64;
        Ok(*pos)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        self.want_write("write")?;
        let mut pos = self.pos.lock().expect("cursor lock poisoned");
        if self.flags.contains(OpenFlags::APPEND) {
            *pos = self.content.size();
        }
        let n = self.content.write_at(buf, *pos)?;
        *pos += n as u64;
        drop(pos);
        self.touch();
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.want_write("write")?;
        let n = self.content.write_at(buf, offset)?;
        self.touch();
        Ok(n)
    }

    fn truncate(&self, size: u64) -> Result<()> {
        self.want_write("truncate")?;
        self.content.truncate(size)?;
        self.touch();
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.closed.check("sync", &self.name)?;
        self.content.sync()
    }

    fn read_dir(&self, _n: i64) -> Result<Vec<DirEntry>> {
        self.closed.check("readdir", &self.name)?;
        Err(Error::new("readdir", self.name.clone(), ErrorKind::NotDir))
    }

    fn close(&self) -> Result<()> {
        self.closed.close();
        Ok(())
    }
}
