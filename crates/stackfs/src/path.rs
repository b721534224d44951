// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! Slash-delimited path handling shared by every engine.
//!
//! All engine APIs take slash-delimited paths where `.` names the engine
//! root. Paths are cleaned before use; a cleaned path never contains empty
//! or `.` components and keeps only the `..` components that cannot be
//! resolved against an earlier component.

use relative_path::RelativePathBuf;

#[cfg(test)]
#[path = "./path_test.rs"]
mod path_test;

/// The cleaned name of the engine root.
pub const ROOT: &str = ".";

/// Clean a slash-delimited path.
///
/// Empty and `.` components are dropped and `..` components are resolved
/// lexically where possible, keeping any leading `..` that cannot be.
/// The empty path and any path that fully resolves away clean to
/// [`ROOT`]. Leading slashes are dropped; callers reject or redirect
/// absolute paths before cleaning.
pub fn clean(path: &str) -> String {
    let cleaned = RelativePathBuf::from(path.trim_start_matches('/')).normalize();
    if cleaned.as_str().is_empty() {
        ROOT.to_string()
    } else {
        cleaned.into_string()
    }
}

/// True if the path begins with a slash.
pub fn is_abs(path: &str) -> bool {
    path.starts_with('/')
}

/// True if the cleaned form of `path` stays below the root it is resolved
/// against: it is not absolute and does not begin with a `..` component.
pub fn is_local(path: &str) -> bool {
    if is_abs(path) {
        return false;
    }
    let cleaned = clean(path);
    cleaned != ".." && !cleaned.starts_with("../")
}

/// Split the first component off a cleaned path, returning the component
/// and the remainder (possibly empty).
pub fn split_first(path: &str) -> (&str, &str) {
    match path.find('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => (path, ""),
    }
}

/// The final component of a cleaned path; [`ROOT`] maps to itself.
pub fn base(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// The directory portion of a cleaned path, or [`ROOT`] when the path has
/// a single component.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => ROOT,
    }
}

/// Join a directory path and a child name, collapsing the root prefix.
pub fn join(dir: &str, name: &str) -> String {
    if dir == ROOT || dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Iterate the head prefixes of a cleaned path in ascending length:
/// `a/b/c` yields `a`, `a/b`, `a/b/c`. The root yields nothing.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let path = if path == ROOT { "" } else { path };
    path.char_indices()
        .filter(|&(_, c)| c == '/')
        .map(|(i, _)| &path[..i])
        .chain(if path.is_empty() { None } else { Some(path) })
}
