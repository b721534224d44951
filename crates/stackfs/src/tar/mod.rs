// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! An immutable TAR archive exposed as a read-only filesystem.
//!
//! The archive is indexed once into per-entry byte ranges ([`Section`])
//! over any positioned-read source, then served through the shared
//! filesystem contract. USTAR, old-GNU (including sparse), and PAX
//! (including sparse 0.0, 0.1, and 1.0) archives are supported; extended
//! headers and GNU long name/link records are traversed transparently.

mod fs;
mod header;
mod index;
mod reader;
mod sparse;

pub use fs::{TarFs, TarFsOptions};
pub use header::{BLOCK_SIZE, EntryType, Header, HeaderError};
pub use index::{Section, SectionScanner};
pub use reader::{ReadAt, SectionReader};
pub use sparse::SparseHole;
