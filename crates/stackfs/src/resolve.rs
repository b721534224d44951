// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! The symlink-following path walk shared by every engine.

use crate::{Error, ErrorKind, Result, path};

/// The maximum number of symlink dereferences allowed during a single
/// resolution.
pub(crate) const LINK_BUDGET: u32 = 40;

/// One step of the tree an engine exposes to the walker.
///
/// Implementations are cheap handles (an `Arc` or an arena index); the
/// walker clones them freely.
pub(crate) trait WalkNode: Clone {
    /// Identity comparison, used to detect the walk's root boundary.
    fn is_same(&self, other: &Self) -> bool;

    /// The parent directory, absent at the outermost root.
    fn parent(&self) -> Result<Option<Self>>;

    /// Look up a child of this directory node.
    fn child(&self, name: &str) -> Result<Option<Self>>;

    /// The raw target when this entry is a symlink.
    fn symlink_target(&self) -> Option<String>;

    /// The directory to continue the walk through when the path does not
    /// end here. `Ok(None)` when this entry cannot act as a directory;
    /// engines with hardlinks resolve link-to-directory entries here.
    fn descend(&self) -> Result<Option<Self>>;
}

/// A rooted (or unrooted) walk over some engine's node graph.
pub(crate) struct Walk<N> {
    /// The outermost root, used to restart at absolute symlink targets
    /// and to keep `..` traversal working across sub-tree boundaries.
    pub outer: N,
    /// The visible root of the engine performing the resolution.
    pub root: N,
    /// When set, any resolution that would leave `root` fails with
    /// [`ErrorKind::PathEscapes`].
    pub rooted: bool,
}

impl<N: WalkNode> Walk<N> {
    pub fn resolve(&self, op: &'static str, full: &str, skip_last: bool) -> Result<N> {
        let fail = |kind: ErrorKind| Error::new(op, full.to_string(), kind);

        let mut budget = LINK_BUDGET;
        let mut cur;
        let mut rest;
        if path::is_abs(full) {
            if self.rooted {
                return Err(fail(ErrorKind::PathEscapes));
            }
            cur = self.outer.clone();
            rest = path::clean(full);
        } else {
            cur = self.root.clone();
            rest = path::clean(full);
        }
        if rest == path::ROOT {
            rest.clear();
        }

        loop {
            if rest.is_empty() {
                return Ok(cur);
            }
            let (name, remainder) = path::split_first(&rest);
            let (name, remainder) = (name.to_string(), remainder.to_string());
            let last = remainder.is_empty();
            match name.as_str() {
                "." => rest = remainder,
                ".." => {
                    if self.rooted && cur.is_same(&self.root) {
                        return Err(fail(ErrorKind::PathEscapes));
                    }
                    match cur.parent()? {
                        Some(parent) => cur = parent,
                        None => return Err(fail(ErrorKind::NotExist)),
                    }
                    rest = remainder;
                }
                name => {
                    let Some(next) = cur.child(name)? else {
                        return Err(fail(ErrorKind::NotExist));
                    };
                    if let Some(target) = next.symlink_target() {
                        if last && skip_last {
                            return Ok(next);
                        }
                        if budget == 0 {
                            return Err(fail(ErrorKind::TooManyLinks));
                        }
                        budget -= 1;
                        if path::is_abs(&target) {
                            if self.rooted {
                                return Err(fail(ErrorKind::PathEscapes));
                            }
                            cur = self.outer.clone();
                        }
                        let cleaned = path::clean(&target);
                        rest = if last {
                            cleaned
                        } else if cleaned == path::ROOT {
                            remainder
                        } else {
                            format!("{cleaned}/{remainder}")
                        };
                        continue;
                    }
                    if last {
                        return Ok(next);
                    }
                    match next.descend()? {
                        Some(dir) => {
                            cur = dir;
                            rest = remainder;
                        }
                        None => return Err(fail(ErrorKind::NotDir)),
                    }
                }
            }
        }
    }
}
