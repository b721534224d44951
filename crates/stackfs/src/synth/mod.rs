// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! An in-memory hierarchical filesystem with full read/write semantics.
//!
//! Entries live in a tree of insertion-ordered directories; file content
//! is supplied by pluggable [`FileView`] backends so that files can be
//! byte buffers, read-only views over another filesystem, or windows
//! into one.

mod backend;
mod entry;
mod fs;

pub use backend::{
    Content, ExternalView, FileView, MemoryAllocator, MemoryView, RangedView, ViewAllocator,
};
pub use fs::{SynthFs, SynthFsOptions};
