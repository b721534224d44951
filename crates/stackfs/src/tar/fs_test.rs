// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

use std::io::{Cursor, Read};

use rstest::rstest;

use super::{TarFs, TarFsOptions};
use crate::fixtures::{ArchiveBuilder, assert_handle_discipline, assert_readlink_agrees, init_logging};
use crate::vfs::{FileType, Filesystem, read_file};
use crate::ErrorKind;

fn basic_archive() -> Vec<u8> {
    let mut builder = ArchiveBuilder::new();
    builder
        .dir("./")
        .dir("aaa")
        .file("aaa/foo", b"foo\n")
        .dir("bbb")
        .file("bbb/bar", b"bar\n");
    builder.finish()
}

fn symlink_archive() -> Vec<u8> {
    let mut builder = ArchiveBuilder::new();
    builder
        .dir("root")
        .dir("root/readable")
        .file("root/readable/file1.txt", b"foofoofoo")
        .symlink("root/readable/symlink_inner", "./file1.txt")
        .dir("root/readable/subdir")
        .symlink("root/readable/subdir/symlink_upward", "../symlink_inner")
        .symlink(
            "root/readable/symlink_escapes",
            "../../outside/outside_file.txt",
        )
        .dir("outside")
        .file("outside/outside_file.txt", b"outside!");
    builder.finish()
}

#[rstest]
fn test_open_and_list_basic() {
    init_logging();
    let fs = TarFs::new(basic_archive()).unwrap();

    assert_eq!(read_file(&fs, "aaa/foo").unwrap(), b"foo\n");
    assert_eq!(read_file(&fs, "bbb/bar").unwrap(), b"bar\n");

    let names: Vec<_> = fs
        .read_dir(".")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["aaa", "bbb"]);
}

#[rstest]
fn test_positioned_reads_and_seek() {
    let fs = TarFs::new(basic_archive()).unwrap();
    let file = fs.open("aaa/foo").unwrap();
    let mut buf = [0u8; 2];
    assert_eq!(file.read_at(&mut buf, 1).unwrap(), 2);
    assert_eq!(&buf, b"oo");
    assert_eq!(file.seek(std::io::SeekFrom::Start(2)).unwrap(), 2);
    assert_eq!(file.read(&mut buf).unwrap(), 2);
    assert_eq!(&buf, b"o\n");
    file.close().unwrap();
}

#[rstest]
fn test_dir_handle_batching() {
    let fs = TarFs::new(basic_archive()).unwrap();
    let dir = fs.open(".").unwrap();
    let first = dir.read_dir(1).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].name, "aaa");
    let rest = dir.read_dir(0).unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].name, "bbb");
    assert!(dir.read_dir(0).unwrap().is_empty());
    dir.close().unwrap();
}

#[rstest]
fn test_mutators_are_read_only() {
    let fs = TarFs::new(basic_archive()).unwrap();
    assert_eq!(fs.mkdir("zzz", 0o755).unwrap_err().kind(), ErrorKind::ReadOnlyFs);
    assert_eq!(fs.remove("aaa/foo").unwrap_err().kind(), ErrorKind::ReadOnlyFs);
    assert_eq!(
        fs.rename("aaa/foo", "aaa/moved").unwrap_err().kind(),
        ErrorKind::ReadOnlyFs
    );
    assert_eq!(
        fs.open_file(
            "aaa/foo",
            crate::vfs::OpenFlags::READ | crate::vfs::OpenFlags::WRITE,
            0,
        )
        .unwrap_err()
        .kind(),
        ErrorKind::ReadOnlyFs
    );
    // a read handle refuses writes with a bad-handle error
    let file = fs.open("aaa/foo").unwrap();
    assert_eq!(file.write(b"x").unwrap_err().kind(), ErrorKind::BadFd);
}

#[rstest]
fn test_common_handle_discipline() {
    let fs = TarFs::new(basic_archive()).unwrap();
    assert_handle_discipline(&fs, "aaa/foo", "aaa");
}

#[rstest]
fn test_symlink_resolution_upward() {
    init_logging();
    let fs = TarFs::new(symlink_archive()).unwrap();
    assert_eq!(
        read_file(&fs, "root/readable/subdir/symlink_upward").unwrap(),
        b"foofoofoo"
    );
    assert_readlink_agrees(&fs, "root/readable/symlink_inner");
    assert_readlink_agrees(&fs, "root/readable/file1.txt");
    assert_eq!(
        fs.read_link("root/readable/symlink_inner").unwrap(),
        "./file1.txt"
    );
}

#[rstest]
fn test_symlink_crossing_subtree_when_unrooted() {
    let fs = TarFs::new(symlink_archive()).unwrap();
    let sub = fs.sub("root/readable").unwrap();
    assert_eq!(read_file(&*sub, "symlink_escapes").unwrap(), b"outside!");
}

#[rstest]
fn test_symlink_escape_rejected_when_rooted() {
    let fs = TarFs::with_options(
        symlink_archive(),
        TarFsOptions {
            rooted: true,
            ..Default::default()
        },
    )
    .unwrap();
    let sub = fs.sub("root/readable").unwrap();
    assert_eq!(read_file(&*sub, "symlink_inner").unwrap(), b"foofoofoo");
    assert_eq!(
        read_file(&*sub, "symlink_escapes").unwrap_err().kind(),
        ErrorKind::PathEscapes
    );
}

#[rstest]
fn test_open_root_pins_subtree() {
    let fs = TarFs::new(symlink_archive()).unwrap();
    let pinned = fs.open_root("root/readable").unwrap();
    assert_eq!(read_file(&*pinned, "file1.txt").unwrap(), b"foofoofoo");
    assert_eq!(
        read_file(&*pinned, "symlink_escapes").unwrap_err().kind(),
        ErrorKind::PathEscapes
    );
    assert_eq!(
        pinned.lstat("../..").unwrap_err().kind(),
        ErrorKind::PathEscapes
    );
}

#[rstest]
fn test_lstat_does_not_follow() {
    let fs = TarFs::new(symlink_archive()).unwrap();
    let meta = fs.lstat("root/readable/symlink_inner").unwrap();
    assert!(meta.is_symlink());
    let meta = fs.stat("root/readable/symlink_inner").unwrap();
    assert!(meta.is_file());
    assert_eq!(meta.size, 9);
}

#[rstest]
fn test_symlink_loop_budget() {
    let mut builder = ArchiveBuilder::new();
    builder.symlink("a", "b").symlink("b", "a");
    let fs = TarFs::new(builder.finish()).unwrap();
    assert_eq!(
        fs.open("a").unwrap_err().kind(),
        ErrorKind::TooManyLinks
    );
}

#[rstest]
fn test_hardlinks_share_content() {
    init_logging();
    let mut builder = ArchiveBuilder::new();
    builder
        .file("foo.txt", b"shared bytes")
        .dir("sub")
        .hardlink("sub/link", "foo.txt")
        .dir("sub/sub")
        .hardlink("sub/sub/link", "foo.txt");
    let fs = TarFs::new(builder.finish()).unwrap();

    for path in ["foo.txt", "sub/link", "sub/sub/link"] {
        assert_eq!(read_file(&fs, path).unwrap(), b"shared bytes");
        let meta = fs.stat(path).unwrap();
        assert_eq!(meta.file_type(), FileType::Regular);
        assert_eq!(meta.size, 12);
    }
}

#[rstest]
fn test_hardlink_to_missing_target() {
    let mut builder = ArchiveBuilder::new();
    builder.hardlink("dangling", "no/such/file");
    let fs = TarFs::new(builder.finish()).unwrap();
    assert_eq!(fs.open("dangling").unwrap_err().kind(), ErrorKind::NotExist);
}

#[rstest]
fn test_symlinks_can_be_disabled() {
    let fs = TarFs::with_options(
        symlink_archive(),
        TarFsOptions {
            enable_symlinks: false,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(
        fs.lstat("root/readable/symlink_inner").unwrap_err().kind(),
        ErrorKind::NotExist
    );
    // regular entries are unaffected
    assert_eq!(read_file(&fs, "root/readable/file1.txt").unwrap(), b"foofoofoo");
}

#[rstest]
fn test_devices_gated_by_option() {
    let mut builder = ArchiveBuilder::new();
    builder.char_device("null0");
    let bytes = builder.finish();

    let fs = TarFs::new(bytes.clone()).unwrap();
    assert_eq!(fs.lstat("null0").unwrap_err().kind(), ErrorKind::NotExist);

    let fs = TarFs::with_options(
        bytes,
        TarFsOptions {
            enable_devices: true,
            ..Default::default()
        },
    )
    .unwrap();
    let meta = fs.lstat("null0").unwrap();
    assert_eq!(meta.file_type(), FileType::CharDevice);
    assert_eq!(
        fs.open("null0").unwrap_err().kind(),
        ErrorKind::TypeNotSupported
    );
}

#[rstest]
fn test_escaping_names_dropped() {
    init_logging();
    let mut builder = ArchiveBuilder::new();
    builder.file("../evil", b"nope").file("fine", b"ok");
    let fs = TarFs::new(builder.finish()).unwrap();
    assert_eq!(read_file(&fs, "fine").unwrap(), b"ok");
    assert_eq!(fs.lstat("../evil").unwrap_err().kind(), ErrorKind::NotExist);
    let names: Vec<_> = fs.read_dir(".").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["fine"]);
}

#[rstest]
fn test_later_entry_wins() {
    let mut builder = ArchiveBuilder::new();
    builder.file("config", b"v1").file("config", b"v2");
    let fs = TarFs::new(builder.finish()).unwrap();
    assert_eq!(read_file(&fs, "config").unwrap(), b"v2");
}

#[rstest]
fn test_sparse_file_reads_logical_contents() {
    init_logging();
    let mut builder = ArchiveBuilder::new();
    builder.old_gnu_sparse("sparse.bin", 8, &[(0, 2), (4, 2)], b"abcd");
    let fs = TarFs::new(builder.finish()).unwrap();

    assert_eq!(fs.stat("sparse.bin").unwrap().size, 8);
    assert_eq!(read_file(&fs, "sparse.bin").unwrap(), b"ab\0\0cd\0\0");

    let mut builder = ArchiveBuilder::new();
    builder.pax_sparse_1_0("big.img", 8, &[(2, 2), (6, 2)], b"abcd");
    let fs = TarFs::new(builder.finish()).unwrap();
    assert_eq!(read_file(&fs, "big.img").unwrap(), b"\0\0ab\0\0cd");
}

#[rstest]
fn test_reconstruction_matches_stock_reader() {
    // every regular entry read through the engine must equal the bytes a
    // stock TAR reader produces
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in [
        ("docs/readme.md", &b"hello from the readme"[..]),
        ("docs/deeper/data.bin", &[0u8, 1, 2, 3, 255][..]),
        ("top.txt", &b""[..]),
    ] {
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_mtime(1_600_000_000);
        header.set_size(data.len() as u64);
        builder.append_data(&mut header, path, data).unwrap();
    }
    let bytes = builder.into_inner().unwrap();

    let fs = TarFs::new(bytes.clone()).unwrap();
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    let mut checked = 0;
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let path = entry.path().unwrap().to_string_lossy().to_string();
        let mut expected = Vec::new();
        entry.read_to_end(&mut expected).unwrap();
        assert_eq!(read_file(&fs, &path).unwrap(), expected, "entry {path}");
        checked += 1;
    }
    assert_eq!(checked, 3);
}

#[rstest]
fn test_archive_backed_by_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("basic.tar");
    std::fs::write(&path, basic_archive()).unwrap();

    let fs = TarFs::new(std::fs::File::open(&path).unwrap()).unwrap();
    assert_eq!(read_file(&fs, "aaa/foo").unwrap(), b"foo\n");
    assert_eq!(read_file(&fs, "bbb/bar").unwrap(), b"bar\n");
}

#[rstest]
fn test_fabricated_root_metadata() {
    let clock = crate::fixtures::fixed_clock();
    let mut builder = ArchiveBuilder::new();
    builder.file("a", b"1");
    let fs = TarFs::with_clock(builder.finish(), TarFsOptions::default(), clock.clone()).unwrap();
    let meta = fs.lstat(".").unwrap();
    assert!(meta.is_dir());
    assert_eq!(meta.permissions(), 0o755);
    assert_eq!(meta.mtime, clock.0);
}

#[rstest]
fn test_intermediate_file_replaced_by_directory() {
    init_logging();
    let mut builder = ArchiveBuilder::new();
    builder.file("conflict", b"i am a file").file("conflict/child", b"nested");
    let fs = TarFs::new(builder.finish()).unwrap();
    // the file gave way to a materialised directory
    assert!(fs.lstat("conflict").unwrap().is_dir());
    assert_eq!(read_file(&fs, "conflict/child").unwrap(), b"nested");
}
