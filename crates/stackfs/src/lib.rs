// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! Virtual filesystem engines over alternative substrates.
//!
//! Three engines share one capability contract: [`tar::TarFs`] serves an
//! immutable TAR archive read-only, [`synth::SynthFs`] is an in-memory
//! read/write tree, and [`overlay::OverlayFs`] unions a writable top
//! layer over read-only lowers with copy-on-write and whiteouts.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
pub mod fixtures;

pub mod clock;
pub mod overlay;
pub mod path;
pub mod synth;
pub mod tar;
pub mod vfs;

mod error;
pub use error::{Error, ErrorKind, Result};

mod resolve;
