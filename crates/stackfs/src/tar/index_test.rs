// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

use std::sync::Arc;

use rstest::rstest;

use super::{Section, SectionScanner};
use crate::fixtures::{ArchiveBuilder, init_logging};
use crate::tar::header::EntryType;
use crate::tar::sparse::SparseHole;
use crate::ErrorKind;

fn scan(bytes: Vec<u8>) -> Vec<Section> {
    SectionScanner::new(Arc::new(bytes))
        .collect::<crate::Result<Vec<_>>>()
        .expect("archive must scan")
}

#[rstest]
fn test_scan_basic_layout() {
    init_logging();
    let mut builder = ArchiveBuilder::new();
    builder
        .dir("aaa")
        .file("aaa/foo", b"hello")
        .file("bbb", b"x");
    let sections = scan(builder.finish());

    assert_eq!(sections.len(), 3);

    let dir = &sections[0];
    assert_eq!(dir.header.name, "aaa");
    assert_eq!(dir.header.entry_type, EntryType::Directory);
    assert_eq!(dir.header_start, 0);
    assert_eq!(dir.header_end, 512);
    assert_eq!(dir.body_end, 512);

    let foo = &sections[1];
    assert_eq!(foo.header.name, "aaa/foo");
    assert_eq!(foo.header_start, 512);
    assert_eq!(foo.header_end, 1024);
    assert_eq!(foo.body_end, 1029);
    assert_eq!(foo.header.size, 5);
    assert!(!foo.is_sparse());

    let bbb = &sections[2];
    assert_eq!(bbb.header_start, 1536);
    assert_eq!(bbb.header_end, 2048);
    assert_eq!(bbb.body_end, 2049);
}

#[rstest]
fn test_scan_header_start_alignment() {
    let mut builder = ArchiveBuilder::new();
    builder.file("a", b"abc").file("b", b"defg");
    let sections = scan(builder.finish());
    for section in &sections {
        assert_eq!(section.header_start % 512, 0);
        assert!(section.header_start <= section.header_end);
        assert!(section.header_end <= section.body_end);
    }
}

#[rstest]
fn test_scan_trailing_slash_is_directory() {
    let mut builder = ArchiveBuilder::new();
    builder.file("dir/", b"");
    let sections = scan(builder.finish());
    assert_eq!(sections[0].header.entry_type, EntryType::Directory);
    assert_eq!(sections[0].header.name, "dir");
}

#[rstest]
fn test_scan_duplicate_names_both_surface() {
    let mut builder = ArchiveBuilder::new();
    builder.file("same", b"old").file("same", b"newer");
    let sections = scan(builder.finish());
    assert_eq!(sections.len(), 2);
    assert_eq!(sections[0].header.name, sections[1].header.name);
}

#[rstest]
fn test_scan_pax_path_override() {
    let mut builder = ArchiveBuilder::new();
    builder
        .pax(&[("path", "deeply/nested/override.txt")])
        .file("short", b"data");
    let sections = scan(builder.finish());
    assert_eq!(sections.len(), 1);
    let section = &sections[0];
    assert_eq!(section.header.name, "deeply/nested/override.txt");
    // the prelude blocks belong to the entry's header range
    assert_eq!(section.header_start, 0);
    assert_eq!(section.header_end, 1536);
    assert_eq!(section.body_end, 1540);
}

#[rstest]
fn test_scan_global_pax_applies_to_following() {
    let mut builder = ArchiveBuilder::new();
    builder
        .global_pax(&[("uid", "4242")])
        .file("a", b"1")
        .file("b", b"2");
    let sections = scan(builder.finish());
    assert_eq!(sections.len(), 2);
    assert_eq!(sections[0].header.uid, 4242);
    assert_eq!(sections[1].header.uid, 4242);
}

#[rstest]
fn test_scan_pax_mtime_override() {
    let mut builder = ArchiveBuilder::new();
    builder
        .pax(&[("mtime", "1350244992.5")])
        .file("stamped", b"x");
    let sections = scan(builder.finish());
    assert_eq!(sections[0].header.mtime.timestamp(), 1350244992);
    assert_eq!(sections[0].header.mtime.timestamp_subsec_nanos(), 500_000_000);
}

#[rstest]
fn test_scan_old_gnu_sparse() {
    init_logging();
    let mut builder = ArchiveBuilder::new();
    builder.old_gnu_sparse("sparse.bin", 8, &[(0, 2), (4, 2)], b"abcd");
    let sections = scan(builder.finish());
    let section = &sections[0];

    assert_eq!(section.header.entry_type, EntryType::GnuSparse);
    assert_eq!(section.header.size, 8);
    assert_eq!(section.header_start, 0);
    assert_eq!(section.header_end, 512);
    assert_eq!(section.body_end, 516);
    assert_eq!(
        section.holes,
        vec![
            SparseHole {
                offset: 2,
                length: 2
            },
            SparseHole {
                offset: 6,
                length: 2
            },
        ]
    );
}

#[rstest]
fn test_scan_pax_1_0_sparse() {
    init_logging();
    let mut builder = ArchiveBuilder::new();
    builder.pax_sparse_1_0("big.img", 8, &[(2, 2), (6, 2)], b"abcd");
    let sections = scan(builder.finish());
    let section = &sections[0];

    assert_eq!(section.header.name, "big.img");
    assert_eq!(section.header.size, 8);
    // prelude (pax header + records) plus the in-body map are all
    // header-side: 2 blocks pax, 1 block header, 1 block map
    assert_eq!(section.header_start, 0);
    assert_eq!(section.header_end, 2048);
    assert_eq!(section.body_end, 2052);
    assert_eq!(
        section.holes,
        vec![
            SparseHole {
                offset: 0,
                length: 2
            },
            SparseHole {
                offset: 4,
                length: 2
            },
        ]
    );
}

#[rstest]
fn test_scan_pax_0_1_sparse() {
    let mut builder = ArchiveBuilder::new();
    builder.pax_sparse_0_1("zeroes.dat", 8, &[(0, 2), (4, 2)], b"abcd");
    let sections = scan(builder.finish());
    let section = &sections[0];
    assert_eq!(section.header.name, "zeroes.dat");
    assert_eq!(section.header.size, 8);
    assert_eq!(section.stored_size(), 4);
    assert_eq!(
        section.holes,
        vec![
            SparseHole {
                offset: 2,
                length: 2
            },
            SparseHole {
                offset: 6,
                length: 2
            },
        ]
    );
}

#[rstest]
fn test_scan_pax_0_0_sparse() {
    let mut builder = ArchiveBuilder::new();
    builder.pax_sparse_0_0("pairs.dat", 8, &[(0, 2), (4, 2)], b"abcd");
    let sections = scan(builder.finish());
    let section = &sections[0];
    assert_eq!(section.header.size, 8);
    assert_eq!(section.stored_size(), 4);
    assert_eq!(section.holes.len(), 2);
}

#[rstest]
fn test_scan_malformed_sparse_degrades_by_default() {
    init_logging();
    let mut builder = ArchiveBuilder::new();
    // overlapping data ranges cannot be complemented into holes
    builder.pax_sparse_0_1("broken.dat", 8, &[(0, 2), (1, 2)], b"abcd");
    let sections = scan(builder.finish());
    let section = &sections[0];
    assert!(section.holes.is_empty());
    assert_eq!(section.header.size, 4);
}

#[rstest]
fn test_scan_malformed_sparse_strict_mode() {
    let mut builder = ArchiveBuilder::new();
    builder.pax_sparse_0_1("broken.dat", 8, &[(0, 2), (1, 2)], b"abcd");
    let bytes = builder.finish();
    let result = SectionScanner::new(Arc::new(bytes))
        .strict_sparse(true)
        .collect::<crate::Result<Vec<_>>>();
    assert_eq!(result.unwrap_err().kind(), ErrorKind::BadTarHeader);
}

#[rstest]
fn test_scan_corrupt_checksum() {
    let mut builder = ArchiveBuilder::new();
    builder.file("fine", b"data");
    let mut bytes = builder.finish();
    bytes[0] ^= 0x7f;
    let result = SectionScanner::new(Arc::new(bytes)).collect::<crate::Result<Vec<_>>>();
    assert_eq!(result.unwrap_err().kind(), ErrorKind::BadTarHeader);
}

#[rstest]
fn test_scan_truncated_header_block() {
    let mut builder = ArchiveBuilder::new();
    builder.file("one", b"data").file("two", b"more");
    let mut bytes = builder.finish();
    bytes.truncate(1100);
    let result = SectionScanner::new(Arc::new(bytes)).collect::<crate::Result<Vec<_>>>();
    assert_eq!(result.unwrap_err().kind(), ErrorKind::BadTarHeader);
}

#[rstest]
fn test_scan_end_without_terminator() {
    let mut builder = ArchiveBuilder::new();
    builder.file("only", b"data");
    let mut bytes = builder.finish();
    bytes.truncate(1024);
    let sections = scan(bytes);
    assert_eq!(sections.len(), 1);
}
