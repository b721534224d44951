// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! A union mount: one writable top layer over read-only lower layers.
//!
//! Lookups search the stack top-down, whiteouts shadow deeper layers,
//! directory listings merge across layers, and mutations copy lower
//! entries into the top layer before touching them.

mod fs;
mod layer;

pub use fs::{BufferedCopy, CopyPolicy, OverlayFs, OverlayOptions};
pub use layer::{FsWhiteoutStore, Layer, MemWhiteoutStore, WhiteoutStore};
