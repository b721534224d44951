// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

use std::sync::Arc;

use rstest::rstest;

use super::{FsWhiteoutStore, Layer, MemWhiteoutStore, WhiteoutStore};
use crate::synth::SynthFs;
use crate::vfs::{Filesystem, write_file};

#[rstest]
fn test_memory_store_lifecycle() {
    let store = MemWhiteoutStore::new();
    assert!(!store.query("a/b").unwrap());
    store.record("a/b").unwrap();
    assert!(store.query("a/b").unwrap());
    assert!(store.query("./a/b").unwrap());
    store.remove("a/b").unwrap();
    assert!(!store.query("a/b").unwrap());
    // removing an absent marker is a no-op
    store.remove("a/b").unwrap();
}

#[rstest]
fn test_fs_store_creates_markers() {
    let backing = Arc::new(SynthFs::new());
    let store = FsWhiteoutStore::new(Arc::clone(&backing) as Arc<dyn Filesystem>);

    store.record("deep/nested/name").unwrap();
    assert!(store.query("deep/nested/name").unwrap());
    // the marker is a plain file in the backing filesystem
    assert!(backing.lstat("deep/nested/name").unwrap().is_file());

    store.remove("deep/nested/name").unwrap();
    assert!(!store.query("deep/nested/name").unwrap());
}

#[rstest]
fn test_fs_store_record_replaces_stale_subtree() {
    let backing = Arc::new(SynthFs::new());
    let store = FsWhiteoutStore::new(Arc::clone(&backing) as Arc<dyn Filesystem>);
    // stale markers below the new whiteout are dropped with it
    store.record("dir/child").unwrap();
    store.record("dir").unwrap();
    assert!(store.query("dir").unwrap());
    assert!(backing.lstat("dir").unwrap().is_file());
}

#[rstest]
fn test_layer_covered_checks_ancestors() {
    let fs = Arc::new(SynthFs::new());
    write_file(&*fs, "kept", b"", 0o644).unwrap();
    let layer = Layer::with_memory_meta(fs);
    layer.meta.record("gone").unwrap();

    assert!(layer.covered("gone").unwrap());
    assert!(layer.covered("gone/child/grandchild").unwrap());
    assert!(!layer.covered("kept").unwrap());
    assert!(!layer.covered(".").unwrap());
}
