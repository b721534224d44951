// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! The in-memory node types behind [`SynthFs`](super::SynthFs).

use std::sync::{Arc, RwLock, Weak};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use super::backend::FileView;
use crate::resolve::WalkNode;
use crate::vfs::Metadata;
use crate::Result;

/// Mutable per-entry metadata, guarded by the entry's own lock.
#[derive(Debug, Clone)]
pub(crate) struct Meta {
    /// Full mode bits, type included.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: DateTime<Utc>,
}

pub(crate) struct DirNode {
    pub meta: RwLock<Meta>,
    /// Back-reference for `..` traversal; empty at the outermost root.
    pub parent: RwLock<Weak<DirNode>>,
    /// Children in insertion order; the listing order of the directory.
    pub children: RwLock<IndexMap<String, Node>>,
}

impl DirNode {
    pub fn new(mode: u32, mtime: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            meta: RwLock::new(Meta {
                mode: libc::S_IFDIR | (mode & crate::vfs::MODE_PERM_MASK),
                uid: 0,
                gid: 0,
                mtime,
            }),
            parent: RwLock::new(Weak::new()),
            children: RwLock::new(IndexMap::new()),
        })
    }

    pub fn set_parent(&self, parent: &Arc<DirNode>) {
        *self.parent.write().expect("parent lock poisoned") = Arc::downgrade(parent);
    }
}

pub(crate) struct FileNode {
    pub meta: RwLock<Meta>,
    pub view: Arc<dyn FileView>,
}

impl FileNode {
    pub fn new(mode: u32, mtime: DateTime<Utc>, view: Arc<dyn FileView>) -> Arc<Self> {
        Arc::new(Self {
            meta: RwLock::new(Meta {
                mode: libc::S_IFREG | (mode & crate::vfs::MODE_PERM_MASK),
                uid: 0,
                gid: 0,
                mtime,
            }),
            view,
        })
    }

    pub fn touch(&self, mtime: DateTime<Utc>) {
        self.meta.write().expect("meta lock poisoned").mtime = mtime;
    }
}

pub(crate) struct SymlinkNode {
    pub meta: RwLock<Meta>,
    /// The target exactly as given; cleaned only at resolution time.
    pub target: String,
}

impl SymlinkNode {
    pub fn new(target: String, mtime: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            meta: RwLock::new(Meta {
                mode: libc::S_IFLNK | 0o777,
                uid: 0,
                gid: 0,
                mtime,
            }),
            target,
        })
    }
}

/// A reference to any entry in the tree. Hardlinks are additional name
/// bindings of the same `Arc<FileNode>`, so no dedicated variant exists;
/// symlinks are statically distinct and never openable without
/// resolution.
#[derive(Clone)]
pub(crate) enum Node {
    Dir(Arc<DirNode>),
    File(Arc<FileNode>),
    Symlink(Arc<SymlinkNode>),
}

impl Node {
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Dir(_))
    }

    pub fn as_dir(&self) -> Option<Arc<DirNode>> {
        match self {
            Self::Dir(dir) => Some(Arc::clone(dir)),
            _ => None,
        }
    }

    pub fn meta(&self) -> Meta {
        let lock = match self {
            Self::Dir(node) => &node.meta,
            Self::File(node) => &node.meta,
            Self::Symlink(node) => &node.meta,
        };
        lock.read().expect("meta lock poisoned").clone()
    }

    pub fn update_meta(&self, update: impl FnOnce(&mut Meta)) {
        let lock = match self {
            Self::Dir(node) => &node.meta,
            Self::File(node) => &node.meta,
            Self::Symlink(node) => &node.meta,
        };
        update(&mut lock.write().expect("meta lock poisoned"));
    }

    pub fn metadata(&self, name: &str) -> Metadata {
        let meta = self.meta();
        let size = match self {
            Self::Dir(dir) => dir.children.read().expect("children lock poisoned").len() as u64,
            Self::File(file) => file.view.size(),
            Self::Symlink(link) => link.target.len() as u64,
        };
        Metadata {
            name: name.to_string(),
            mode: meta.mode,
            size,
            uid: meta.uid,
            gid: meta.gid,
            mtime: meta.mtime,
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Dir(a), Self::Dir(b)) => Arc::ptr_eq(a, b),
            (Self::File(a), Self::File(b)) => Arc::ptr_eq(a, b),
            (Self::Symlink(a), Self::Symlink(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl WalkNode for Node {
    fn is_same(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }

    fn parent(&self) -> Result<Option<Self>> {
        match self {
            Self::Dir(dir) => Ok(dir
                .parent
                .read()
                .expect("parent lock poisoned")
                .upgrade()
                .map(Self::Dir)),
            _ => Ok(None),
        }
    }

    fn child(&self, name: &str) -> Result<Option<Self>> {
        match self {
            Self::Dir(dir) => Ok(dir
                .children
                .read()
                .expect("children lock poisoned")
                .get(name)
                .cloned()),
            _ => Ok(None),
        }
    }

    fn symlink_target(&self) -> Option<String> {
        match self {
            Self::Symlink(link) => Some(link.target.clone()),
            _ => None,
        }
    }

    fn descend(&self) -> Result<Option<Self>> {
        match self {
            Self::Dir(_) => Ok(Some(self.clone())),
            _ => Ok(None),
        }
    }
}
