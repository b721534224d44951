// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! The union-mount engine: one writable top layer over read-only lowers.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use super::layer::Layer;
use crate::resolve::{Walk, WalkNode};
use crate::vfs::{DirEntry, DirHandle, File, Filesystem, Metadata, OpenFlags, ReadOnlyFs};
use crate::{Error, ErrorKind, Result, path};

#[cfg(test)]
#[path = "./fs_test.rs"]
mod fs_test;

/// Behavioral switches for [`OverlayFs`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OverlayOptions {
    /// Reject resolution that escapes the engine root via `..` or
    /// absolute symlink targets.
    pub rooted: bool,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self { rooted: true }
    }
}

/// Streams file contents during copy-on-write.
pub trait CopyPolicy: Send + Sync {
    fn copy_file(&self, src: &dyn File, dst: &dyn File) -> Result<u64>;
}

/// The default copy policy: fixed-size buffered streaming.
#[derive(Debug, Clone, Copy)]
pub struct BufferedCopy {
    pub chunk_size: usize,
}

impl Default for BufferedCopy {
    fn default() -> Self {
        Self {
            chunk_size: 64 << 10,
        }
    }
}

impl CopyPolicy for BufferedCopy {
    fn copy_file(&self, src: &dyn File, dst: &dyn File) -> Result<u64> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut total = 0u64;
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                return Ok(total);
            }
            dst.write_all(&buf[..n])?;
            total += n as u64;
        }
    }
}

/// Where a name resolved within the layer stack: `0` is the top layer,
/// `i + 1` is `lowers[i]`.
struct Located {
    layer: usize,
    meta: Metadata,
}

/// A union mount of one writable top layer over an ordered stack of
/// read-only lower layers, with copy-on-write and whiteout-based
/// deletion.
pub struct OverlayFs {
    top: Layer,
    lowers: Vec<Layer>,
    policy: Arc<dyn CopyPolicy>,
    /// Engine-wide structural lock, shared with every sub-root derived
    /// from this engine.
    lock: Arc<RwLock<()>>,
    opts: OverlayOptions,
}

impl OverlayFs {
    /// Build an overlay. Lower layers are forced read-only regardless of
    /// the filesystems behind them.
    pub fn new(top: Layer, lowers: Vec<Layer>) -> Self {
        Self::with_options(top, lowers, OverlayOptions::default())
    }

    pub fn with_options(top: Layer, lowers: Vec<Layer>, opts: OverlayOptions) -> Self {
        let lowers = lowers
            .into_iter()
            .map(|layer| Layer::new(Arc::new(ReadOnlyFs::new(layer.fs)), layer.meta))
            .collect();
        Self {
            top,
            lowers,
            policy: Arc::new(BufferedCopy::default()),
            lock: Arc::new(RwLock::new(())),
            opts,
        }
    }

    /// Replace the copy-on-write streaming policy.
    pub fn with_policy(mut self, policy: Arc<dyn CopyPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Is `path` currently whited out in the top layer?
    pub fn whited_out(&self, path: &str) -> Result<bool> {
        let _guard = self.lock.read().expect("overlay lock poisoned");
        self.top.meta.query(&path::clean(path))
    }

    fn layer(&self, idx: usize) -> &Layer {
        if idx == 0 {
            &self.top
        } else {
            &self.lowers[idx - 1]
        }
    }

    /// Primary lookup over the layer stack for an already-resolved path.
    fn locate(&self, rel: &str) -> Result<Located> {
        if self.top.meta.query(rel)? {
            return Err(Error::new("lookup", rel.to_string(), ErrorKind::WhitedOut));
        }
        match self.top.fs.lstat(rel) {
            Ok(meta) => return Ok(Located { layer: 0, meta }),
            Err(err) if err.is(ErrorKind::NotExist) => (),
            Err(err) => return Err(err),
        }
        for (i, layer) in self.lowers.iter().enumerate() {
            if layer.meta.query(rel)? {
                return Err(Error::new("lookup", rel.to_string(), ErrorKind::WhitedOut));
            }
            match layer.fs.lstat(rel) {
                Ok(meta) => return Ok(Located { layer: i + 1, meta }),
                Err(err) if err.is(ErrorKind::NotExist) => (),
                Err(err) => return Err(err),
            }
        }
        Err(Error::new("lookup", rel.to_string(), ErrorKind::NotExist))
    }

    /// A whiteout shadow is indistinguishable from absence at the public
    /// surface.
    fn public(op: &'static str, full: &str, err: Error) -> Error {
        if err.is(ErrorKind::WhitedOut) {
            Error::new(op, full.to_string(), ErrorKind::NotExist)
        } else {
            err
        }
    }

    fn walk(&self) -> Walk<OvlNode<'_>> {
        let root = OvlNode {
            ov: self,
            path: path::ROOT.to_string(),
        };
        Walk {
            outer: root.clone(),
            root,
            rooted: self.opts.rooted,
        }
    }

    /// Resolve a caller path to a canonical layer-stack path.
    fn resolve_path(&self, op: &'static str, full: &str, skip_last: bool) -> Result<String> {
        Ok(self.walk().resolve(op, full, skip_last)?.path)
    }

    /// The first lower layer that visibly owns `rel`, ignoring the top
    /// layer entirely.
    fn lower_owner(&self, rel: &str) -> Result<Option<(usize, Metadata)>> {
        for (i, layer) in self.lowers.iter().enumerate() {
            if layer.meta.query(rel)? {
                return Ok(None);
            }
            match layer.fs.lstat(rel) {
                Ok(meta) => return Ok(Some((i + 1, meta))),
                Err(err) if err.is(ErrorKind::NotExist) || err.is(ErrorKind::NotDir) => (),
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Merge directory listings across the stack: priority order, first
    /// occurrence of a name wins, names whited out by shallower layers
    /// are skipped.
    fn merged_entries(&self, rel: &str) -> Result<Vec<DirEntry>> {
        let mut out: Vec<DirEntry> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let layer_count = self.lowers.len() + 1;
        for idx in 0..layer_count {
            // a whiteout of the directory itself in any shallower layer
            // hides everything deeper
            if (0..idx).any(|k| {
                self.layer(k)
                    .meta
                    .query(rel)
                    .unwrap_or(true)
            }) {
                break;
            }
            let layer = self.layer(idx);
            let entries = match layer.fs.read_dir(rel) {
                Ok(entries) => entries,
                Err(err) if err.is(ErrorKind::NotExist) => continue,
                // a non-directory in this layer shadows deeper layers
                Err(err) if err.is(ErrorKind::NotDir) && idx > 0 => break,
                Err(err) => return Err(err),
            };
            for entry in entries {
                if seen.contains(&entry.name) {
                    continue;
                }
                let child = path::join(rel, &entry.name);
                let shadowed = (0..idx).any(|k| {
                    self.layer(k).meta.query(&child).unwrap_or(true)
                });
                if shadowed {
                    continue;
                }
                seen.insert(entry.name.clone());
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Materialise `rel` in the top layer, copying the owning lower
    /// entry. Parents are copied first. A failed copy leaves the top
    /// layer unchanged.
    fn copy_up(&self, rel: &str) -> Result<()> {
        if rel == path::ROOT || self.top.fs.lstat(rel).is_ok() {
            return Ok(());
        }
        let parent = path::parent(rel);
        if parent != path::ROOT {
            let ploc = self.locate(parent)?;
            if !ploc.meta.is_dir() {
                return Err(Error::new("copyup", rel.to_string(), ErrorKind::NotDir));
            }
            self.copy_up(parent)?;
        }
        let Some((owner_idx, meta)) = self.lower_owner(rel)? else {
            return Err(Error::new("copyup", rel.to_string(), ErrorKind::NotExist));
        };
        let owner = self.layer(owner_idx);
        match meta.file_type() {
            crate::vfs::FileType::Directory => {
                self.top.fs.mkdir(rel, meta.permissions())?;
                self.top.fs.chown(rel, meta.uid, meta.gid)?;
                self.top.fs.chtimes(rel, meta.mtime)?;
            }
            crate::vfs::FileType::Regular => {
                let name = path::base(rel);
                let tmp = path::join(parent, &format!(".{name}.cow-tmp"));
                let src = owner.fs.open(rel)?;
                let dst = self.top.fs.open_file(
                    &tmp,
                    OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCL | OpenFlags::TRUNC,
                    meta.permissions(),
                )?;
                let copied = self.policy.copy_file(&*src, &*dst);
                let _ = src.close();
                let _ = dst.close();
                if let Err(err) = copied {
                    let _ = self.top.fs.remove(&tmp);
                    return Err(err);
                }
                self.top.fs.rename(&tmp, rel)?;
                self.top.fs.chown(rel, meta.uid, meta.gid)?;
                self.top.fs.chtimes(rel, meta.mtime)?;
            }
            crate::vfs::FileType::Symlink => {
                let target = owner.fs.read_link(rel)?;
                self.top.fs.symlink(&target, rel)?;
            }
            _ => {
                return Err(Error::new(
                    "copyup",
                    rel.to_string(),
                    ErrorKind::TypeNotSupported,
                ));
            }
        }
        Ok(())
    }

    /// Create-or-open `full` for writing in the top layer, clearing any
    /// whiteout and copying parents up as needed.
    fn create_through(
        &self,
        op: &'static str,
        full: &str,
        flags: OpenFlags,
        perm: u32,
    ) -> Result<Box<dyn File>> {
        let cleaned = path::clean(full);
        if cleaned == path::ROOT {
            return Err(Error::new(op, full.to_string(), ErrorKind::IsDir));
        }
        let parent_input = if path::is_abs(full) {
            format!("/{}", path::parent(&cleaned))
        } else {
            path::parent(&cleaned).to_string()
        };
        let pdir = self.resolve_path(op, &parent_input, false)?;
        let ploc = self
            .locate(&pdir)
            .map_err(|err| Self::public(op, full, err))?;
        if !ploc.meta.is_dir() {
            return Err(Error::new(op, full.to_string(), ErrorKind::NotDir));
        }
        let target = path::join(&pdir, path::base(&cleaned));
        self.ensure_top_dir(&pdir)?;
        if self.top.meta.query(&target)? {
            self.top.meta.remove(&target)?;
        }
        self.top.fs.open_file(&target, flags, perm)
    }

    /// Make sure the directory path exists in the top layer.
    fn ensure_top_dir(&self, rel: &str) -> Result<()> {
        if rel == path::ROOT {
            return Ok(());
        }
        self.copy_up(rel)
    }

    /// Does any lower layer still visibly hold `rel`?
    fn lower_holds(&self, rel: &str) -> Result<bool> {
        Ok(self.lower_owner(rel)?.is_some())
    }
}

impl Filesystem for OverlayFs {
    fn open_file(&self, full: &str, flags: OpenFlags, perm: u32) -> Result<Box<dyn File>> {
        if !flags.readable() && !flags.writable() {
            return Err(Error::new("open", full.to_string(), ErrorKind::Invalid));
        }
        if !flags.writable() && !flags.intersects(OpenFlags::CREATE | OpenFlags::TRUNC) {
            // read path
            let _guard = self.lock.read().expect("overlay lock poisoned");
            let rel = self.resolve_path("open", full, false)?;
            let loc = self
                .locate(&rel)
                .map_err(|err| Self::public("open", full, err))?;
            if loc.meta.is_dir() {
                let entries = self.merged_entries(&rel)?;
                let name = path::base(&rel).to_string();
                let mut meta = loc.meta;
                meta.name = name.clone();
                return Ok(Box::new(DirHandle::new(name, meta, entries)));
            }
            return self.layer(loc.layer).fs.open_file(&rel, flags, perm);
        }

        // write path
        let _guard = self.lock.write().expect("overlay lock poisoned");
        match self.resolve_path("open", full, false) {
            Ok(rel) => match self.locate(&rel) {
                Ok(loc) => {
                    if flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) {
                        return Err(Error::new("open", full.to_string(), ErrorKind::Exist));
                    }
                    if loc.meta.is_dir() {
                        return Err(Error::new("open", full.to_string(), ErrorKind::IsDir));
                    }
                    if loc.layer != 0 {
                        self.copy_up(&rel)?;
                    }
                    self.top.fs.open_file(&rel, flags, perm)
                }
                Err(err) => {
                    if flags.contains(OpenFlags::CREATE) && err.is(ErrorKind::WhitedOut) {
                        return self.create_through("open", full, flags, perm);
                    }
                    Err(Self::public("open", full, err))
                }
            },
            Err(err) if err.is(ErrorKind::NotExist) && flags.contains(OpenFlags::CREATE) => {
                self.create_through("open", full, flags, perm)
            }
            Err(err) => Err(err),
        }
    }

    fn stat(&self, full: &str) -> Result<Metadata> {
        let _guard = self.lock.read().expect("overlay lock poisoned");
        let rel = self.resolve_path("stat", full, false)?;
        let loc = self
            .locate(&rel)
            .map_err(|err| Self::public("stat", full, err))?;
        Ok(loc.meta)
    }

    fn lstat(&self, full: &str) -> Result<Metadata> {
        let _guard = self.lock.read().expect("overlay lock poisoned");
        let rel = self.resolve_path("lstat", full, true)?;
        let loc = self
            .locate(&rel)
            .map_err(|err| Self::public("lstat", full, err))?;
        Ok(loc.meta)
    }

    fn read_link(&self, full: &str) -> Result<String> {
        let _guard = self.lock.read().expect("overlay lock poisoned");
        let rel = self.resolve_path("readlink", full, true)?;
        let loc = self
            .locate(&rel)
            .map_err(|err| Self::public("readlink", full, err))?;
        if !loc.meta.is_symlink() {
            return Err(Error::new("readlink", full.to_string(), ErrorKind::Invalid));
        }
        self.layer(loc.layer).fs.read_link(&rel)
    }

    fn mkdir(&self, full: &str, perm: u32) -> Result<()> {
        let _guard = self.lock.write().expect("overlay lock poisoned");
        let cleaned = path::clean(full);
        if cleaned == path::ROOT {
            return Err(Error::new("mkdir", full.to_string(), ErrorKind::Exist));
        }
        let parent_input = if path::is_abs(full) {
            format!("/{}", path::parent(&cleaned))
        } else {
            path::parent(&cleaned).to_string()
        };
        let pdir = self.resolve_path("mkdir", &parent_input, false)?;
        let ploc = self
            .locate(&pdir)
            .map_err(|err| Self::public("mkdir", full, err))?;
        if !ploc.meta.is_dir() {
            return Err(Error::new("mkdir", full.to_string(), ErrorKind::NotDir));
        }
        let target = path::join(&pdir, path::base(&cleaned));
        match self.locate(&target) {
            Ok(_) => return Err(Error::new("mkdir", full.to_string(), ErrorKind::Exist)),
            Err(err) if err.is(ErrorKind::NotExist) || err.is(ErrorKind::WhitedOut) => (),
            Err(err) => return Err(err),
        }
        self.ensure_top_dir(&pdir)?;
        if self.top.meta.query(&target)? {
            self.top.meta.remove(&target)?;
        }
        self.top.fs.mkdir(&target, perm)
    }

    fn remove(&self, full: &str) -> Result<()> {
        let _guard = self.lock.write().expect("overlay lock poisoned");
        let cleaned = path::clean(full);
        if cleaned == path::ROOT {
            return Err(Error::new("remove", full.to_string(), ErrorKind::Invalid));
        }
        let rel = self.resolve_path("remove", full, true)?;
        let loc = self
            .locate(&rel)
            .map_err(|err| Self::public("remove", full, err))?;
        if loc.meta.is_dir() && !self.merged_entries(&rel)?.is_empty() {
            return Err(Error::new("remove", full.to_string(), ErrorKind::NotEmpty));
        }
        if loc.layer == 0 {
            self.top.fs.remove(&rel)?;
        }
        if self.lower_holds(&rel)? {
            // the top-layer delete is not rolled back if this fails
            self.top.meta.record(&rel)?;
        }
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let _guard = self.lock.write().expect("overlay lock poisoned");
        let from_clean = path::clean(from);
        let to_clean = path::clean(to);
        if from_clean == path::ROOT || to_clean == path::ROOT {
            return Err(Error::new("rename", from.to_string(), ErrorKind::Invalid));
        }
        if to_clean.starts_with(&format!("{from_clean}/")) {
            return Err(Error::new("rename", to.to_string(), ErrorKind::Invalid));
        }
        let src_rel = self.resolve_path("rename", from, true)?;
        let src_loc = self
            .locate(&src_rel)
            .map_err(|err| Self::public("rename", from, err))?;

        let parent_input = if path::is_abs(to) {
            format!("/{}", path::parent(&to_clean))
        } else {
            path::parent(&to_clean).to_string()
        };
        let dst_parent = self.resolve_path("rename", &parent_input, false)?;
        let dst_ploc = self
            .locate(&dst_parent)
            .map_err(|err| Self::public("rename", to, err))?;
        if !dst_ploc.meta.is_dir() {
            return Err(Error::new("rename", to.to_string(), ErrorKind::NotDir));
        }
        let dst_rel = path::join(&dst_parent, path::base(&to_clean));
        if src_rel == dst_rel {
            return Ok(());
        }

        match self.locate(&dst_rel) {
            Ok(dst_loc) => match (src_loc.meta.is_dir(), dst_loc.meta.is_dir()) {
                (false, false) => (),
                (true, true) => {
                    if !self.merged_entries(&dst_rel)?.is_empty() {
                        return Err(Error::new("rename", to.to_string(), ErrorKind::NotEmpty));
                    }
                    // clear a lower-owned empty directory from the top
                    if dst_loc.layer == 0 {
                        self.top.fs.remove(&dst_rel)?;
                    }
                }
                _ => return Err(Error::new("rename", to.to_string(), ErrorKind::Exist)),
            },
            Err(err) if err.is(ErrorKind::NotExist) || err.is(ErrorKind::WhitedOut) => (),
            Err(err) => return Err(err),
        }

        self.copy_up(&src_rel)?;
        self.ensure_top_dir(&dst_parent)?;
        if self.top.meta.query(&dst_rel)? {
            self.top.meta.remove(&dst_rel)?;
        }
        self.top.fs.rename(&src_rel, &dst_rel)?;
        if self.lower_holds(&src_rel)? {
            // surfaced without rolling back the rename
            self.top.meta.record(&src_rel)?;
        }
        Ok(())
    }

    fn link(&self, from: &str, to: &str) -> Result<()> {
        let _guard = self.lock.write().expect("overlay lock poisoned");
        let src_rel = self.resolve_path("link", from, true)?;
        let src_loc = self
            .locate(&src_rel)
            .map_err(|err| Self::public("link", from, err))?;
        if src_loc.meta.is_dir() {
            return Err(Error::new("link", from.to_string(), ErrorKind::Permission));
        }
        let to_clean = path::clean(to);
        if to_clean == path::ROOT {
            return Err(Error::new("link", to.to_string(), ErrorKind::Exist));
        }
        let parent_input = path::parent(&to_clean).to_string();
        let dst_parent = self.resolve_path("link", &parent_input, false)?;
        let dst_rel = path::join(&dst_parent, path::base(&to_clean));
        match self.locate(&dst_rel) {
            Ok(_) => return Err(Error::new("link", to.to_string(), ErrorKind::Exist)),
            Err(err) if err.is(ErrorKind::NotExist) || err.is(ErrorKind::WhitedOut) => (),
            Err(err) => return Err(err),
        }
        self.copy_up(&src_rel)?;
        self.ensure_top_dir(&dst_parent)?;
        if self.top.meta.query(&dst_rel)? {
            self.top.meta.remove(&dst_rel)?;
        }
        self.top.fs.link(&src_rel, &dst_rel)
    }

    fn symlink(&self, target: &str, link: &str) -> Result<()> {
        let _guard = self.lock.write().expect("overlay lock poisoned");
        let link_clean = path::clean(link);
        if link_clean == path::ROOT {
            return Err(Error::new("symlink", link.to_string(), ErrorKind::Exist));
        }
        let parent_input = path::parent(&link_clean).to_string();
        let dst_parent = self.resolve_path("symlink", &parent_input, false)?;
        let dst_rel = path::join(&dst_parent, path::base(&link_clean));
        match self.locate(&dst_rel) {
            Ok(_) => return Err(Error::new("symlink", link.to_string(), ErrorKind::Exist)),
            Err(err) if err.is(ErrorKind::NotExist) || err.is(ErrorKind::WhitedOut) => (),
            Err(err) => return Err(err),
        }
        self.ensure_top_dir(&dst_parent)?;
        if self.top.meta.query(&dst_rel)? {
            self.top.meta.remove(&dst_rel)?;
        }
        self.top.fs.symlink(target, &dst_rel)
    }

    fn chmod(&self, full: &str, mode: u32) -> Result<()> {
        let _guard = self.lock.write().expect("overlay lock poisoned");
        let rel = self.resolve_path("chmod", full, false)?;
        self.locate(&rel)
            .map_err(|err| Self::public("chmod", full, err))?;
        self.copy_up(&rel)?;
        self.top.fs.chmod(&rel, mode)
    }

    fn chown(&self, full: &str, uid: u32, gid: u32) -> Result<()> {
        let _guard = self.lock.write().expect("overlay lock poisoned");
        let rel = self.resolve_path("chown", full, false)?;
        self.locate(&rel)
            .map_err(|err| Self::public("chown", full, err))?;
        self.copy_up(&rel)?;
        self.top.fs.chown(&rel, uid, gid)
    }

    fn lchown(&self, full: &str, uid: u32, gid: u32) -> Result<()> {
        let _guard = self.lock.write().expect("overlay lock poisoned");
        let rel = self.resolve_path("lchown", full, true)?;
        self.locate(&rel)
            .map_err(|err| Self::public("lchown", full, err))?;
        self.copy_up(&rel)?;
        self.top.fs.lchown(&rel, uid, gid)
    }

    fn chtimes(&self, full: &str, mtime: DateTime<Utc>) -> Result<()> {
        let _guard = self.lock.write().expect("overlay lock poisoned");
        let rel = self.resolve_path("chtimes", full, false)?;
        self.locate(&rel)
            .map_err(|err| Self::public("chtimes", full, err))?;
        self.copy_up(&rel)?;
        self.top.fs.chtimes(&rel, mtime)
    }

    fn sub(&self, full: &str) -> Result<Arc<dyn Filesystem>> {
        self.open_root(full)
    }

    fn open_root(&self, full: &str) -> Result<Arc<dyn Filesystem>> {
        let _guard = self.lock.write().expect("overlay lock poisoned");
        let rel = self.resolve_path("openroot", full, false)?;
        let loc = self
            .locate(&rel)
            .map_err(|err| Self::public("openroot", full, err))?;
        if !loc.meta.is_dir() {
            return Err(Error::new("openroot", full.to_string(), ErrorKind::NotDir));
        }
        // the top layer must hold the directory to derive its sub-root
        self.copy_up(&rel)?;
        let top = self.top.derive(&rel)?;
        let mut lowers = Vec::new();
        for layer in &self.lowers {
            if layer.covered(&rel)? {
                // a whited-out intermediate truncates the layer list
                break;
            }
            match layer.derive(&rel) {
                Ok(derived) => lowers.push(derived),
                // once a layer has no such directory, deeper layers are
                // not consulted
                Err(err)
                    if err.is(ErrorKind::NotExist)
                        || err.is(ErrorKind::NotDir)
                        || err.is(ErrorKind::WhitedOut) =>
                {
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Arc::new(Self {
            top,
            lowers,
            policy: Arc::clone(&self.policy),
            lock: Arc::clone(&self.lock),
            opts: OverlayOptions { rooted: true },
        }))
    }
}

/// A walker node addressing the merged view by canonical path.
#[derive(Clone)]
struct OvlNode<'a> {
    ov: &'a OverlayFs,
    path: String,
}

impl WalkNode for OvlNode<'_> {
    fn is_same(&self, other: &Self) -> bool {
        self.path == other.path
    }

    fn parent(&self) -> Result<Option<Self>> {
        if self.path == path::ROOT {
            return Ok(None);
        }
        Ok(Some(Self {
            ov: self.ov,
            path: path::parent(&self.path).to_string(),
        }))
    }

    fn child(&self, name: &str) -> Result<Option<Self>> {
        let child = path::join(&self.path, name);
        match self.ov.locate(&child) {
            Ok(_) => Ok(Some(Self {
                ov: self.ov,
                path: child,
            })),
            Err(err) if err.is(ErrorKind::NotExist) || err.is(ErrorKind::WhitedOut) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn symlink_target(&self) -> Option<String> {
        let loc = self.ov.locate(&self.path).ok()?;
        if !loc.meta.is_symlink() {
            return None;
        }
        self.ov.layer(loc.layer).fs.read_link(&self.path).ok()
    }

    fn descend(&self) -> Result<Option<Self>> {
        match self.ov.locate(&self.path) {
            Ok(loc) if loc.meta.is_dir() => Ok(Some(self.clone())),
            Ok(_) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
