// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! A read-only filesystem view over an indexed TAR archive.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use super::header::{EntryType, Header};
use super::index::{Section, SectionScanner};
use super::reader::{ReadAt, SectionReader};
use super::sparse::SparseHole;
use crate::clock::{Clock, SystemClock};
use crate::resolve::{LINK_BUDGET, Walk, WalkNode};
use crate::vfs::{CloseFlag, DirEntry, DirHandle, File, Filesystem, Metadata, OpenFlags};
use crate::{Error, ErrorKind, Result, path};

#[cfg(test)]
#[path = "./fs_test.rs"]
mod fs_test;

/// Behavioral switches for [`TarFs`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TarFsOptions {
    /// Reject resolution that escapes the engine root via `..` or
    /// absolute symlink targets.
    pub rooted: bool,
    /// Attach symlink entries from the archive.
    pub enable_symlinks: bool,
    /// Attach character/block device and FIFO entries.
    pub enable_devices: bool,
    /// Surface malformed sparse maps instead of degrading the entry.
    pub strict_sparse: bool,
}

impl Default for TarFsOptions {
    fn default() -> Self {
        Self {
            rooted: false,
            enable_symlinks: true,
            enable_devices: false,
            strict_sparse: false,
        }
    }
}

pub(crate) type NodeId = usize;

#[derive(Debug)]
enum NodeKind {
    Dir {
        children: IndexMap<String, NodeId>,
    },
    File {
        body_start: u64,
        size: u64,
        holes: Vec<SparseHole>,
    },
    Symlink {
        target: String,
    },
    HardLink {
        target: String,
    },
    /// Devices and FIFOs: metadata only, never openable.
    Special,
}

#[derive(Debug)]
struct TarNode {
    header: Header,
    parent: Option<NodeId>,
    kind: NodeKind,
}

#[derive(Debug)]
pub(crate) struct TarTree {
    nodes: Vec<TarNode>,
}

impl TarTree {
    fn node(&self, id: NodeId) -> &TarNode {
        &self.nodes[id]
    }

    fn metadata(&self, id: NodeId, name: &str) -> Metadata {
        let node = self.node(id);
        let mut meta = node.header.metadata();
        meta.name = name.to_string();
        if let NodeKind::Symlink { target } = &node.kind {
            meta.size = target.len() as u64;
        }
        meta
    }
}

fn synthetic_dir_header(name: &str, mtime: DateTime<Utc>) -> Header {
    Header {
        name: name.to_string(),
        entry_type: EntryType::Directory,
        mode: 0o755,
        uid: 0,
        gid: 0,
        size: 0,
        mtime,
        link_target: String::new(),
        dev_major: 0,
        dev_minor: 0,
        pax_records: Default::default(),
    }
}

fn build_tree(sections: Vec<Section>, opts: &TarFsOptions, clock: &dyn Clock) -> TarTree {
    // Collapse duplicate names, later entries winning, and drop names
    // that would land outside the archive root.
    let mut by_name: BTreeMap<String, Section> = BTreeMap::new();
    for section in sections {
        let name = section.header.name.clone();
        if !path::is_local(&name) {
            tracing::warn!(name = %name, "dropping entry that escapes the archive root");
            continue;
        }
        by_name.insert(name, section);
    }

    let root_header = match by_name.remove(path::ROOT) {
        Some(section) => section.header,
        None => synthetic_dir_header(path::ROOT, clock.now()),
    };
    let mut tree = TarTree {
        nodes: vec![TarNode {
            header: root_header,
            parent: None,
            kind: NodeKind::Dir {
                children: IndexMap::new(),
            },
        }],
    };

    for (name, section) in by_name {
        let kind = match section.header.entry_type {
            EntryType::Directory => NodeKind::Dir {
                children: IndexMap::new(),
            },
            EntryType::Symlink => {
                if !opts.enable_symlinks {
                    continue;
                }
                NodeKind::Symlink {
                    target: section.header.link_target.clone(),
                }
            }
            EntryType::HardLink => NodeKind::HardLink {
                target: section.header.link_target.clone(),
            },
            EntryType::CharDevice | EntryType::BlockDevice | EntryType::Fifo => {
                if !opts.enable_devices {
                    continue;
                }
                NodeKind::Special
            }
            EntryType::Regular | EntryType::GnuSparse => NodeKind::File {
                body_start: section.body_start(),
                size: section.header.size,
                holes: section.holes.clone(),
            },
            other => {
                tracing::debug!(name = %name, kind = ?other, "ignoring unsupported entry kind");
                continue;
            }
        };
        attach(&mut tree, clock, &name, section.header, kind);
    }
    tree
}

fn attach(tree: &mut TarTree, clock: &dyn Clock, name: &str, header: Header, kind: NodeKind) {
    let mut parent = 0;
    let mut walked = String::new();
    let (dir_path, base) = (path::parent(name), path::base(name));
    if dir_path != path::ROOT {
        for comp in dir_path.split('/') {
            walked = path::join(&walked, comp);
            parent = ensure_dir(tree, clock, parent, comp, &walked);
        }
    }

    let existing = match &tree.nodes[parent].kind {
        NodeKind::Dir { children } => children.get(base).copied(),
        _ => unreachable!("parent nodes are always directories"),
    };
    match existing {
        Some(id) if matches!(tree.nodes[id].kind, NodeKind::Dir { .. }) => {
            if matches!(kind, NodeKind::Dir { .. }) {
                // a later explicit entry upgrades the directory metadata
                tree.nodes[id].header = header;
            } else {
                tracing::warn!(name = %name, "replacing directory with non-directory entry");
                let id_new = push_node(tree, parent, header, kind);
                replace_child(tree, parent, base, id_new);
            }
        }
        Some(id) => {
            tree.nodes[id].header = header;
            tree.nodes[id].kind = kind;
        }
        None => {
            let id = push_node(tree, parent, header, kind);
            insert_child(tree, parent, base, id);
        }
    }
}

fn ensure_dir(
    tree: &mut TarTree,
    clock: &dyn Clock,
    parent: NodeId,
    comp: &str,
    full: &str,
) -> NodeId {
    let existing = match &tree.nodes[parent].kind {
        NodeKind::Dir { children } => children.get(comp).copied(),
        _ => unreachable!("parent nodes are always directories"),
    };
    match existing {
        Some(id) if matches!(tree.nodes[id].kind, NodeKind::Dir { .. }) => id,
        Some(_) => {
            tracing::warn!(
                path = full,
                "intermediate entry is not a directory, replacing it"
            );
            let header = synthetic_dir_header(full, clock.now());
            let id = push_node(
                tree,
                parent,
                header,
                NodeKind::Dir {
                    children: IndexMap::new(),
                },
            );
            replace_child(tree, parent, comp, id);
            id
        }
        None => {
            let header = synthetic_dir_header(full, clock.now());
            let id = push_node(
                tree,
                parent,
                header,
                NodeKind::Dir {
                    children: IndexMap::new(),
                },
            );
            insert_child(tree, parent, comp, id);
            id
        }
    }
}

fn push_node(tree: &mut TarTree, parent: NodeId, header: Header, kind: NodeKind) -> NodeId {
    let id = tree.nodes.len();
    tree.nodes.push(TarNode {
        header,
        parent: Some(parent),
        kind,
    });
    id
}

fn insert_child(tree: &mut TarTree, parent: NodeId, name: &str, id: NodeId) {
    match &mut tree.nodes[parent].kind {
        NodeKind::Dir { children } => {
            children.insert(name.to_string(), id);
        }
        _ => unreachable!("parent nodes are always directories"),
    }
}

fn replace_child(tree: &mut TarTree, parent: NodeId, name: &str, id: NodeId) {
    match &mut tree.nodes[parent].kind {
        NodeKind::Dir { children } => {
            // keep the original listing position of the name
            *children
                .get_mut(name)
                .expect("replaced child must be present") = id;
        }
        _ => unreachable!("parent nodes are always directories"),
    }
}

/// A cheap handle to one node of an immutable [`TarTree`].
#[derive(Clone)]
struct TarRef {
    tree: Arc<TarTree>,
    id: NodeId,
    outer: NodeId,
}

impl TarRef {
    fn kind(&self) -> &NodeKind {
        &self.tree.node(self.id).kind
    }
}

impl WalkNode for TarRef {
    fn is_same(&self, other: &Self) -> bool {
        self.id == other.id
    }

    fn parent(&self) -> Result<Option<Self>> {
        Ok(self.tree.node(self.id).parent.map(|id| Self {
            tree: Arc::clone(&self.tree),
            id,
            outer: self.outer,
        }))
    }

    fn child(&self, name: &str) -> Result<Option<Self>> {
        match self.kind() {
            NodeKind::Dir { children } => Ok(children.get(name).map(|&id| Self {
                tree: Arc::clone(&self.tree),
                id,
                outer: self.outer,
            })),
            _ => Ok(None),
        }
    }

    fn symlink_target(&self) -> Option<String> {
        match self.kind() {
            NodeKind::Symlink { target } => Some(target.clone()),
            _ => None,
        }
    }

    fn descend(&self) -> Result<Option<Self>> {
        match self.kind() {
            NodeKind::Dir { .. } => Ok(Some(self.clone())),
            NodeKind::HardLink { target } => {
                let resolved = resolve_hardlink(&self.tree, self.outer, target)?;
                match resolved.kind() {
                    NodeKind::Dir { .. } => Ok(Some(resolved)),
                    _ => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }
}

/// Chase a hardlink to its final non-link node. Targets are archive-wide
/// names and resolve from the outer root regardless of any sub-root.
fn resolve_hardlink(tree: &Arc<TarTree>, outer: NodeId, target: &str) -> Result<TarRef> {
    let outer_ref = TarRef {
        tree: Arc::clone(tree),
        id: outer,
        outer,
    };
    let walk = Walk {
        outer: outer_ref.clone(),
        root: outer_ref,
        rooted: false,
    };
    let mut target = target.to_string();
    for _ in 0..LINK_BUDGET {
        let node = walk.resolve("resolve", &target, false)?;
        match node.kind() {
            NodeKind::HardLink { target: next } => target = next.clone(),
            _ => return Ok(node),
        }
    }
    Err(Error::new(
        "resolve",
        target,
        ErrorKind::TooManyLinks,
    ))
}

/// An immutable TAR archive exposed as a read-only hierarchical
/// filesystem.
///
/// Sparse entries read back at their logical size with holes as zeros;
/// hardlinks serve their target's content under their own metadata;
/// symlinks resolve through the shared rooted resolver.
pub struct TarFs {
    tree: Arc<TarTree>,
    source: Arc<dyn ReadAt>,
    root: NodeId,
    outer: NodeId,
    opts: TarFsOptions,
}

impl TarFs {
    pub fn new(source: impl ReadAt + 'static) -> Result<Self> {
        Self::with_options(source, TarFsOptions::default())
    }

    pub fn with_options(source: impl ReadAt + 'static, opts: TarFsOptions) -> Result<Self> {
        Self::with_clock(source, opts, Arc::new(SystemClock))
    }

    /// Full constructor: the clock stamps directories fabricated for
    /// archives without explicit directory entries.
    pub fn with_clock(
        source: impl ReadAt + 'static,
        opts: TarFsOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let source: Arc<dyn ReadAt> = Arc::new(source);
        let scanner = SectionScanner::new(Arc::clone(&source)).strict_sparse(opts.strict_sparse);
        let sections = scanner.collect::<Result<Vec<_>>>()?;
        let tree = build_tree(sections, &opts, &*clock);
        Ok(Self {
            tree: Arc::new(tree),
            source,
            root: 0,
            outer: 0,
            opts,
        })
    }

    fn node_ref(&self, id: NodeId) -> TarRef {
        TarRef {
            tree: Arc::clone(&self.tree),
            id,
            outer: self.outer,
        }
    }

    fn walk(&self) -> Walk<TarRef> {
        Walk {
            outer: self.node_ref(self.outer),
            root: self.node_ref(self.root),
            rooted: self.opts.rooted,
        }
    }

    fn resolve(&self, op: &'static str, path: &str, skip_last: bool) -> Result<TarRef> {
        self.walk().resolve(op, path, skip_last)
    }

    fn read_only<T>(op: &'static str, path: &str) -> Result<T> {
        Err(Error::new(op, path.to_string(), ErrorKind::ReadOnlyFs))
    }

    /// Effective metadata for a node addressed as `name`: hardlinks
    /// report their own header but the target's size.
    fn effective_metadata(&self, node: &TarRef, name: &str) -> Result<Metadata> {
        match node.kind() {
            NodeKind::HardLink { target } => {
                let resolved = resolve_hardlink(&self.tree, self.outer, target)?;
                let mut meta = self.tree.metadata(node.id, name);
                meta.size = self.tree.metadata(resolved.id, name).size;
                Ok(meta)
            }
            _ => Ok(self.tree.metadata(node.id, name)),
        }
    }

    fn dir_entries(&self, dir: &TarRef) -> Result<Vec<DirEntry>> {
        let NodeKind::Dir { children } = dir.kind() else {
            return Err(Error::new("readdir", "", ErrorKind::NotDir));
        };
        let mut entries = Vec::with_capacity(children.len());
        for (name, &id) in children {
            let meta = self
                .effective_metadata(&self.node_ref(id), name)
                .unwrap_or_else(|_| self.tree.metadata(id, name));
            entries.push(DirEntry {
                name: name.clone(),
                meta,
            });
        }
        Ok(entries)
    }

    fn open_node(&self, node: TarRef, name: &str, full: &str) -> Result<Box<dyn File>> {
        match node.kind() {
            NodeKind::Dir { .. } => {
                let meta = self.tree.metadata(node.id, name);
                let entries = self.dir_entries(&node)?;
                Ok(Box::new(DirHandle::new(name.to_string(), meta, entries)))
            }
            NodeKind::File { .. } => {
                let meta = self.tree.metadata(node.id, name);
                Ok(Box::new(self.file_handle(node.id, meta)))
            }
            NodeKind::HardLink { target } => {
                // serve the target's content under the link's metadata
                let resolved = resolve_hardlink(&self.tree, self.outer, target)?;
                let meta = self.effective_metadata(&node, name)?;
                match resolved.kind() {
                    NodeKind::File { .. } => Ok(Box::new(self.file_handle(resolved.id, meta))),
                    NodeKind::Dir { .. } => {
                        let entries = self.dir_entries(&resolved)?;
                        Ok(Box::new(DirHandle::new(name.to_string(), meta, entries)))
                    }
                    _ => Err(Error::new(
                        "open",
                        full.to_string(),
                        ErrorKind::TypeNotSupported,
                    )),
                }
            }
            _ => Err(Error::new(
                "open",
                full.to_string(),
                ErrorKind::TypeNotSupported,
            )),
        }
    }

    fn file_handle(&self, id: NodeId, meta: Metadata) -> TarFileHandle {
        let NodeKind::File {
            body_start,
            size,
            holes,
        } = &self.tree.node(id).kind
        else {
            unreachable!("file handles are only built for file nodes");
        };
        let reader =
            SectionReader::from_parts(Arc::clone(&self.source), *body_start, *size, holes);
        TarFileHandle {
            name: meta.name.clone(),
            meta,
            reader,
            closed: CloseFlag::new(),
        }
    }
}

impl Filesystem for TarFs {
    fn open_file(&self, path_: &str, flags: OpenFlags, _perm: u32) -> Result<Box<dyn File>> {
        if flags.writable() || flags.intersects(OpenFlags::CREATE | OpenFlags::TRUNC) {
            return Self::read_only("open", path_);
        }
        let node = self.resolve("open", path_, false)?;
        let name = path::base(&path::clean(path_)).to_string();
        self.open_node(node, &name, path_)
    }

    fn stat(&self, path_: &str) -> Result<Metadata> {
        let node = self.resolve("stat", path_, false)?;
        self.effective_metadata(&node, path::base(&path::clean(path_)))
    }

    fn lstat(&self, path_: &str) -> Result<Metadata> {
        let node = self.resolve("lstat", path_, true)?;
        self.effective_metadata(&node, path::base(&path::clean(path_)))
    }

    fn read_link(&self, path_: &str) -> Result<String> {
        let node = self.resolve("readlink", path_, true)?;
        match node.kind() {
            NodeKind::Symlink { target } => Ok(target.clone()),
            _ => Err(Error::new(
                "readlink",
                path_.to_string(),
                ErrorKind::Invalid,
            )),
        }
    }

    fn mkdir(&self, path_: &str, _perm: u32) -> Result<()> {
        Self::read_only("mkdir", path_)
    }

    fn remove(&self, path_: &str) -> Result<()> {
        Self::read_only("remove", path_)
    }

    fn rename(&self, from: &str, _to: &str) -> Result<()> {
        Self::read_only("rename", from)
    }

    fn link(&self, from: &str, _to: &str) -> Result<()> {
        Self::read_only("link", from)
    }

    fn symlink(&self, _target: &str, link: &str) -> Result<()> {
        Self::read_only("symlink", link)
    }

    fn chmod(&self, path_: &str, _mode: u32) -> Result<()> {
        Self::read_only("chmod", path_)
    }

    fn chown(&self, path_: &str, _uid: u32, _gid: u32) -> Result<()> {
        Self::read_only("chown", path_)
    }

    fn lchown(&self, path_: &str, _uid: u32, _gid: u32) -> Result<()> {
        Self::read_only("lchown", path_)
    }

    fn chtimes(&self, path_: &str, _mtime: DateTime<Utc>) -> Result<()> {
        Self::read_only("chtimes", path_)
    }

    fn sub(&self, path_: &str) -> Result<Arc<dyn Filesystem>> {
        let node = self.resolve("sub", path_, false)?;
        let dir = node
            .descend()?
            .ok_or_else(|| Error::new("sub", path_.to_string(), ErrorKind::NotDir))?;
        Ok(Arc::new(Self {
            tree: Arc::clone(&self.tree),
            source: Arc::clone(&self.source),
            root: dir.id,
            outer: self.outer,
            opts: self.opts.clone(),
        }))
    }

    fn open_root(&self, path_: &str) -> Result<Arc<dyn Filesystem>> {
        let node = self.resolve("openroot", path_, false)?;
        let dir = node
            .descend()?
            .ok_or_else(|| Error::new("openroot", path_.to_string(), ErrorKind::NotDir))?;
        Ok(Arc::new(Self {
            tree: Arc::clone(&self.tree),
            source: Arc::clone(&self.source),
            root: dir.id,
            outer: dir.id,
            opts: TarFsOptions {
                rooted: true,
                ..self.opts.clone()
            },
        }))
    }
}

/// A read-only file handle over one archive entry.
struct TarFileHandle {
    name: String,
    meta: Metadata,
    reader: SectionReader,
    closed: CloseFlag,
}

impl File for TarFileHandle {
    fn stat(&self) -> Result<Metadata> {
        self.closed.check("stat", &self.name)?;
        Ok(self.meta.clone())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.closed.check("read", &self.name)?;
        self.reader
            .read(buf)
            .map_err(|err| Error::io("read", self.name.clone(), err))
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.closed.check("read", &self.name)?;
        self.reader
            .read_at(buf, offset)
            .map_err(|err| Error::io("read", self.name.clone(), err))
    }

    fn seek(&self, pos: SeekFrom) -> Result<u64> {
        self.closed.check("seek", &self.name)?;
        self.reader
            .seek(pos)
            .map_err(|err| Error::io("seek", self.name.clone(), err))
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
        Err(Error::new("truncate", self.name.clone(), ErrorKind::BadFd))
    }

    fn sync(&self) -> Result<()> {
        self.closed.check("sync", &self.name)
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
