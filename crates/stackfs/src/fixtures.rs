// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! Shared test scaffolding: logging, deterministic time, hand-built TAR
//! archives, and the cross-engine property suite.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::vfs::Filesystem;
use crate::ErrorKind;

pub fn init_logging() {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::TRACE)
        .without_time()
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(sub);
}

/// A clock pinned to a single instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub fn fixed_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock(
        DateTime::from_timestamp(1_650_000_000, 0).expect("valid timestamp"),
    ))
}

const BLOCK: usize = 512;

fn write_octal(buf: &mut [u8], value: u64) {
    let digits = format!("{value:0width$o}", width = buf.len() - 1);
    buf[..digits.len()].copy_from_slice(digits.as_bytes());
    buf[digits.len()] = 0;
}

fn write_str(buf: &mut [u8], value: &str) {
    buf[..value.len()].copy_from_slice(value.as_bytes());
}

/// Hand-assembles archives block by block, covering the corners the
/// `tar` crate cannot produce (sparse formats, malformed headers).
pub struct ArchiveBuilder {
    data: Vec<u8>,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    fn push_block(&mut self, block: [u8; BLOCK]) {
        self.data.extend_from_slice(&block);
    }

    /// Append raw bytes padded out to whole blocks.
    pub fn push_padded(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        let rem = bytes.len() % BLOCK;
        if rem != 0 {
            self.data.extend(std::iter::repeat_n(0u8, BLOCK - rem));
        }
    }

    fn header_block_unsealed(
        name: &str,
        mode: u32,
        size: u64,
        mtime: u64,
        typeflag: u8,
        linkname: &str,
        gnu: bool,
    ) -> [u8; BLOCK] {
        let mut block = [0u8; BLOCK];
        write_str(&mut block[0..100], name);
        write_octal(&mut block[100..108], mode as u64);
        write_octal(&mut block[108..116], 0);
        write_octal(&mut block[116..124], 0);
        write_octal(&mut block[124..136], size);
        write_octal(&mut block[136..148], mtime);
        block[156] = typeflag;
        write_str(&mut block[157..257], linkname);
        if gnu {
            block[257..265].copy_from_slice(b"ustar  \x00");
        } else {
            block[257..265].copy_from_slice(b"ustar\x0000");
        }
        block
    }

    fn header_block(
        name: &str,
        mode: u32,
        size: u64,
        mtime: u64,
        typeflag: u8,
        linkname: &str,
        gnu: bool,
    ) -> [u8; BLOCK] {
        let mut block =
            Self::header_block_unsealed(name, mode, size, mtime, typeflag, linkname, gnu);
        Self::seal(&mut block);
        block
    }

    fn seal(block: &mut [u8; BLOCK]) {
        block[148..156].fill(b' ');
        let sum: u64 = block.iter().map(|&b| b as u64).sum();
        let digits = format!("{sum:06o}");
        block[148..154].copy_from_slice(digits.as_bytes());
        block[154] = 0;
        block[155] = b' ';
    }

    pub fn dir(&mut self, name: &str) -> &mut Self {
        let block = Self::header_block(name, 0o755, 0, 1_600_000_000, b'5', "", false);
        self.push_block(block);
        self
    }

    pub fn file(&mut self, name: &str, content: &[u8]) -> &mut Self {
        self.file_with_mode(name, content, 0o644)
    }

    pub fn file_with_mode(&mut self, name: &str, content: &[u8], mode: u32) -> &mut Self {
        let block = Self::header_block(
            name,
            mode,
            content.len() as u64,
            1_600_000_000,
            b'0',
            "",
            false,
        );
        self.push_block(block);
        self.push_padded(content);
        self
    }

    pub fn symlink(&mut self, name: &str, target: &str) -> &mut Self {
        let block = Self::header_block(name, 0o777, 0, 1_600_000_000, b'2', target, false);
        self.push_block(block);
        self
    }

    pub fn hardlink(&mut self, name: &str, target: &str) -> &mut Self {
        let block = Self::header_block(name, 0o644, 0, 1_600_000_000, b'1', target, false);
        self.push_block(block);
        self
    }

    pub fn char_device(&mut self, name: &str) -> &mut Self {
        let block = Self::header_block(name, 0o600, 0, 1_600_000_000, b'3', "", false);
        self.push_block(block);
        self
    }

    fn pax_payload(records: &[(&str, &str)]) -> Vec<u8> {
        let mut payload = Vec::new();
        for (key, value) in records {
            let base = format!(" {key}={value}\n");
            let mut size = base.len() + 1;
            let record = loop {
                let attempt = format!("{size}{base}");
                if attempt.len() == size {
                    break attempt;
                }
                size = attempt.len();
            };
            payload.extend_from_slice(record.as_bytes());
        }
        payload
    }

    /// Append a PAX extended header applying to the next entry.
    pub fn pax(&mut self, records: &[(&str, &str)]) -> &mut Self {
        let payload = Self::pax_payload(records);
        let block = Self::header_block(
            "PaxHeaders.0/next",
            0o644,
            payload.len() as u64,
            1_600_000_000,
            b'x',
            "",
            false,
        );
        self.push_block(block);
        self.push_padded(&payload);
        self
    }

    /// Append a PAX global extended header.
    pub fn global_pax(&mut self, records: &[(&str, &str)]) -> &mut Self {
        let payload = Self::pax_payload(records);
        let block = Self::header_block(
            "PaxHeaders.0/global",
            0o644,
            payload.len() as u64,
            1_600_000_000,
            b'g',
            "",
            false,
        );
        self.push_block(block);
        self.push_padded(&payload);
        self
    }

    /// Append an old-GNU sparse entry. `datas` are the stored logical
    /// ranges; `stored` is their concatenated bytes.
    pub fn old_gnu_sparse(
        &mut self,
        name: &str,
        realsize: u64,
        datas: &[(u64, u64)],
        stored: &[u8],
    ) -> &mut Self {
        assert!(datas.len() <= 25, "test builder supports one extension block");
        let mut block = Self::header_block_unsealed(
            name,
            0o644,
            stored.len() as u64,
            1_600_000_000,
            b'S',
            "",
            true,
        );
        for (i, &(offset, length)) in datas.iter().take(4).enumerate() {
            let at = 386 + i * 24;
            write_octal(&mut block[at..at + 12], offset);
            write_octal(&mut block[at + 12..at + 24], length);
        }
        let extended = datas.len() > 4;
        if extended {
            block[482] = 1;
        }
        write_octal(&mut block[483..495], realsize);
        Self::seal(&mut block);
        self.push_block(block);
        if extended {
            let mut ext = [0u8; BLOCK];
            for (i, &(offset, length)) in datas.iter().skip(4).enumerate() {
                let at = i * 24;
                write_octal(&mut ext[at..at + 12], offset);
                write_octal(&mut ext[at + 12..at + 24], length);
            }
            self.push_block(ext);
        }
        self.push_padded(stored);
        self
    }

    /// Append a PAX 1.0 sparse entry: records, then the in-body map,
    /// then the stored data.
    pub fn pax_sparse_1_0(
        &mut self,
        name: &str,
        realsize: u64,
        datas: &[(u64, u64)],
        stored: &[u8],
    ) -> &mut Self {
        let realsize_s = realsize.to_string();
        self.pax(&[
            ("GNU.sparse.major", "1"),
            ("GNU.sparse.minor", "0"),
            ("GNU.sparse.name", name),
            ("GNU.sparse.realsize", &realsize_s),
        ]);
        let mut map = format!("{}\n", datas.len());
        for &(offset, length) in datas {
            map.push_str(&format!("{offset}\n{length}\n"));
        }
        let map_padded = {
            let mut bytes = map.into_bytes();
            let rem = bytes.len() % BLOCK;
            if rem != 0 {
                bytes.extend(std::iter::repeat_n(0u8, BLOCK - rem));
            }
            bytes
        };
        let size = (map_padded.len() + stored.len()) as u64;
        let mangled = format!("GNUSparseFile.0/{name}");
        let block = Self::header_block(&mangled, 0o644, size, 1_600_000_000, b'0', "", false);
        self.push_block(block);
        self.push_padded(&map_padded);
        self.push_padded(stored);
        self
    }

    /// Append a PAX 0.1 sparse entry: the map lives in the records.
    pub fn pax_sparse_0_1(
        &mut self,
        name: &str,
        realsize: u64,
        datas: &[(u64, u64)],
        stored: &[u8],
    ) -> &mut Self {
        let map = datas
            .iter()
            .map(|&(offset, length)| format!("{offset},{length}"))
            .collect::<Vec<_>>()
            .join(",");
        let numblocks = datas.len().to_string();
        let realsize_s = realsize.to_string();
        self.pax(&[
            ("GNU.sparse.major", "0"),
            ("GNU.sparse.minor", "1"),
            ("GNU.sparse.name", name),
            ("GNU.sparse.size", &realsize_s),
            ("GNU.sparse.numblocks", &numblocks),
            ("GNU.sparse.map", &map),
        ]);
        let block = Self::header_block(
            name,
            0o644,
            stored.len() as u64,
            1_600_000_000,
            b'0',
            "",
            false,
        );
        self.push_block(block);
        self.push_padded(stored);
        self
    }

    /// Append a PAX 0.0 sparse entry: repeated offset/numbytes records.
    pub fn pax_sparse_0_0(
        &mut self,
        name: &str,
        realsize: u64,
        datas: &[(u64, u64)],
        stored: &[u8],
    ) -> &mut Self {
        let realsize_s = realsize.to_string();
        let numblocks = datas.len().to_string();
        let mut records: Vec<(String, String)> = vec![
            ("GNU.sparse.size".to_string(), realsize_s),
            ("GNU.sparse.numblocks".to_string(), numblocks),
        ];
        for &(offset, length) in datas {
            records.push(("GNU.sparse.offset".to_string(), offset.to_string()));
            records.push(("GNU.sparse.numbytes".to_string(), length.to_string()));
        }
        let borrowed: Vec<(&str, &str)> = records
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        self.pax(&borrowed);
        let block = Self::header_block(
            name,
            0o644,
            stored.len() as u64,
            1_600_000_000,
            b'0',
            "",
            false,
        );
        self.push_block(block);
        self.push_padded(stored);
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.data);
        data.extend(std::iter::repeat_n(0u8, BLOCK * 2));
        data
    }
}

/// Invariants every engine honors for an existing file and directory:
/// listing agrees with `lstat`, directories refuse byte reads, close is
/// idempotent, and closed handles fail with `Closed`.
pub fn assert_handle_discipline(fs: &dyn Filesystem, file_path: &str, dir_path: &str) {
    let dir_meta = fs.lstat(dir_path).expect("dir must lstat");
    assert!(dir_meta.is_dir());
    fs.read_dir(dir_path).expect("dir must list");

    let file_meta = fs.lstat(file_path).expect("file must lstat");
    assert!(!file_meta.is_dir());
    let err = fs.read_dir(file_path).expect_err("file must not list");
    assert_eq!(err.kind(), ErrorKind::NotDir);

    let dir = fs.open(dir_path).expect("dir must open");
    let mut buf = [0u8; 8];
    let err = dir.read(&mut buf).expect_err("reading a dir must fail");
    assert_eq!(err.kind(), ErrorKind::IsDir);
    dir.close().expect("first close");
    dir.close().expect("second close is a no-op");
    let err = dir.read_dir(0).expect_err("closed handle must fail");
    assert_eq!(err.kind(), ErrorKind::Closed);

    let file = fs.open(file_path).expect("file must open");
    file.close().expect("first close");
    file.close().expect("second close is a no-op");
    let err = file.read(&mut buf).expect_err("closed handle must fail");
    assert_eq!(err.kind(), ErrorKind::Closed);
}

/// `read_link` succeeds exactly when `lstat` reports a symlink.
pub fn assert_readlink_agrees(fs: &dyn Filesystem, path: &str) {
    let meta = fs.lstat(path).expect("entry must lstat");
    if meta.is_symlink() {
        fs.read_link(path).expect("symlink must read_link");
    } else {
        fs.read_link(path)
            .expect_err("non-symlink must not read_link");
    }
}
