// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! Raw TAR header blocks: field slicing, numeric formats, and PAX records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::vfs::{FileType, Metadata};
use crate::path;

#[cfg(test)]
#[path = "./header_test.rs"]
mod header_test;

/// TAR archives are framed in 512-byte blocks.
pub const BLOCK_SIZE: u64 = 512;

pub(crate) const BLOCK_LEN: usize = BLOCK_SIZE as usize;

/// Well-known PAX record keys.
pub(crate) mod pax {
    pub const PATH: &str = "path";
    pub const LINKPATH: &str = "linkpath";
    pub const SIZE: &str = "size";
    pub const UID: &str = "uid";
    pub const GID: &str = "gid";
    pub const MTIME: &str = "mtime";

    pub const GNU_SPARSE_NAME: &str = "GNU.sparse.name";
    pub const GNU_SPARSE_MAJOR: &str = "GNU.sparse.major";
    pub const GNU_SPARSE_MINOR: &str = "GNU.sparse.minor";
    pub const GNU_SPARSE_SIZE: &str = "GNU.sparse.size";
    pub const GNU_SPARSE_REALSIZE: &str = "GNU.sparse.realsize";
    pub const GNU_SPARSE_NUMBLOCKS: &str = "GNU.sparse.numblocks";
    pub const GNU_SPARSE_MAP: &str = "GNU.sparse.map";
    pub const GNU_SPARSE_OFFSET: &str = "GNU.sparse.offset";
    pub const GNU_SPARSE_NUMBYTES: &str = "GNU.sparse.numbytes";
}

/// A malformed header block or metadata record.
#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("header checksum mismatch")]
    Checksum,
    #[error("invalid numeric field")]
    Numeric,
    #[error("numeric field overflows")]
    Overflow,
    #[error("invalid utf-8 in header field")]
    Utf8,
    #[error("malformed extended header record")]
    PaxRecord,
    #[error("malformed sparse map")]
    SparseMap,
    #[error("archive ends inside an entry")]
    Truncated,
}

/// The logical kind of a TAR entry, decoded from its typeflag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    Regular,
    HardLink,
    Symlink,
    CharDevice,
    BlockDevice,
    Directory,
    Fifo,
    /// Old-GNU sparse regular file (`S`).
    GnuSparse,
    /// PAX extended header (`x`), applies to the next entry.
    ExtendedHeader,
    /// PAX global extended header (`g`).
    GlobalExtendedHeader,
    /// GNU long name (`L`), payload replaces the next entry's name.
    GnuLongName,
    /// GNU long link (`K`), payload replaces the next entry's link target.
    GnuLongLink,
    Other(u8),
}

impl EntryType {
    pub fn from_flag(flag: u8) -> Self {
        match flag {
            b'\0' | b'0' | b'7' => Self::Regular,
            b'1' => Self::HardLink,
            b'2' => Self::Symlink,
            b'3' => Self::CharDevice,
            b'4' => Self::BlockDevice,
            b'5' => Self::Directory,
            b'6' => Self::Fifo,
            b'S' => Self::GnuSparse,
            b'x' => Self::ExtendedHeader,
            b'g' => Self::GlobalExtendedHeader,
            b'L' => Self::GnuLongName,
            b'K' => Self::GnuLongLink,
            other => Self::Other(other),
        }
    }

    /// True for kinds that carry stored file data in the archive body.
    pub fn has_body(self) -> bool {
        matches!(self, Self::Regular | Self::GnuSparse)
    }

    /// The file type this entry presents through the filesystem surface.
    /// Hardlinks stat as the regular files they alias.
    pub fn file_type(self) -> FileType {
        match self {
            Self::Regular | Self::GnuSparse | Self::HardLink => FileType::Regular,
            Self::Symlink => FileType::Symlink,
            Self::CharDevice => FileType::CharDevice,
            Self::BlockDevice => FileType::BlockDevice,
            Self::Directory => FileType::Directory,
            Self::Fifo => FileType::Fifo,
            _ => FileType::Unknown,
        }
    }
}

/// Which header family wrote a block, judged from the magic/version field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Magic {
    Ustar,
    Gnu,
    V7,
}

/// A single raw 512-byte header block.
pub(crate) struct Block {
    buf: [u8; BLOCK_LEN],
}

impl Block {
    pub fn new() -> Self {
        Self {
            buf: [0; BLOCK_LEN],
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn raw(&self) -> &[u8; BLOCK_LEN] {
        &self.buf
    }

    pub fn is_zero(&self) -> bool {
        self.buf.iter().all(|&b| b == 0)
    }

    pub fn name(&self) -> &[u8] {
        &self.buf[0..100]
    }
    pub fn mode(&self) -> &[u8] {
        &self.buf[100..108]
    }
    pub fn uid(&self) -> &[u8] {
        &self.buf[108..116]
    }
    pub fn gid(&self) -> &[u8] {
        &self.buf[116..124]
    }
    pub fn size(&self) -> &[u8] {
        &self.buf[124..136]
    }
    pub fn mtime(&self) -> &[u8] {
        &self.buf[136..148]
    }
    pub fn checksum(&self) -> &[u8] {
        &self.buf[148..156]
    }
    pub fn typeflag(&self) -> u8 {
        self.buf[156]
    }
    pub fn linkname(&self) -> &[u8] {
        &self.buf[157..257]
    }
    pub fn dev_major(&self) -> &[u8] {
        &self.buf[329..337]
    }
    pub fn dev_minor(&self) -> &[u8] {
        &self.buf[337..345]
    }
    pub fn prefix(&self) -> &[u8] {
        &self.buf[345..500]
    }

    // Old-GNU layout: the region shared with the USTAR prefix instead
    // holds times, the in-header sparse array, and the real size.
    pub fn gnu_sparse_array(&self) -> &[u8] {
        &self.buf[386..482]
    }
    pub fn gnu_is_extended(&self) -> bool {
        self.buf[482] != 0
    }
    pub fn gnu_real_size(&self) -> &[u8] {
        &self.buf[483..495]
    }

    pub fn magic(&self) -> Magic {
        match &self.buf[257..265] {
            b"ustar\x0000" => Magic::Ustar,
            b"ustar  \x00" => Magic::Gnu,
            _ => Magic::V7,
        }
    }

    /// Validate the header checksum. The checksum field itself is summed
    /// as ASCII spaces; both unsigned and signed byte sums are accepted.
    pub fn verify_checksum(&self) -> Result<(), HeaderError> {
        let recorded = parse_octal(self.checksum()).map_err(|_| HeaderError::Checksum)?;
        let mut unsigned: u64 = 0;
        let mut signed: i64 = 0;
        for (i, &b) in self.buf.iter().enumerate() {
            let b = if (148..156).contains(&i) { b' ' } else { b };
            unsigned += b as u64;
            signed += (b as i8) as i64;
        }
        if recorded == unsigned as i64 || recorded == signed {
            Ok(())
        } else {
            Err(HeaderError::Checksum)
        }
    }
}

/// Parse a NUL/space-padded octal field. An empty field reads as zero.
pub(crate) fn parse_octal(field: &[u8]) -> Result<i64, HeaderError> {
    let trimmed: Vec<u8> = field
        .iter()
        .copied()
        .filter(|&b| b != 0 && b != b' ')
        .collect();
    if trimmed.is_empty() {
        return Ok(0);
    }
    let mut value: i64 = 0;
    for b in trimmed {
        if !(b'0'..=b'7').contains(&b) {
            return Err(HeaderError::Numeric);
        }
        value = value
            .checked_mul(8)
            .and_then(|v| v.checked_add((b - b'0') as i64))
            .ok_or(HeaderError::Overflow)?;
    }
    Ok(value)
}

/// Parse a numeric field that is either octal or, when the high bit of
/// the first byte is set, big-endian two's-complement base-256 with the
/// sign carried in the next bit down.
pub(crate) fn parse_numeric(field: &[u8]) -> Result<i64, HeaderError> {
    if field.is_empty() || field[0] & 0x80 == 0 {
        return parse_octal(field);
    }
    let negative = field[0] & 0x40 != 0;
    let inv: u8 = if negative { 0xff } else { 0x00 };
    let mut value: u64 = 0;
    for (i, &b) in field.iter().enumerate() {
        let mut b = b ^ inv;
        if i == 0 {
            b &= 0x7f;
        }
        if value >> 56 > 0 {
            return Err(HeaderError::Overflow);
        }
        value = value << 8 | b as u64;
    }
    if value >> 63 > 0 {
        return Err(HeaderError::Overflow);
    }
    if negative {
        Ok(!(value as i64))
    } else {
        Ok(value as i64)
    }
}

fn trim_nul(field: &[u8]) -> &[u8] {
    match field.iter().position(|&b| b == 0) {
        Some(end) => &field[..end],
        None => field,
    }
}

pub(crate) fn parse_string(field: &[u8]) -> Result<String, HeaderError> {
    std::str::from_utf8(trim_nul(field))
        .map(str::to_string)
        .map_err(|_| HeaderError::Utf8)
}

/// Parse a PAX timestamp: decimal seconds with an optional fractional
/// part, e.g. `1651234567.123456789`.
pub(crate) fn parse_pax_time(value: &str) -> Result<DateTime<Utc>, HeaderError> {
    let (secs_str, frac_str) = match value.split_once('.') {
        Some((s, f)) => (s, f),
        None => (value, ""),
    };
    let secs: i64 = secs_str.parse().map_err(|_| HeaderError::Numeric)?;
    let mut nanos: u32 = 0;
    if !frac_str.is_empty() {
        let digits: String = frac_str.chars().take(9).collect();
        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(HeaderError::Numeric);
        }
        let padded = format!("{digits:0<9}");
        nanos = padded.parse().map_err(|_| HeaderError::Numeric)?;
    }
    DateTime::from_timestamp(secs, nanos).ok_or(HeaderError::Numeric)
}

/// Parse the records of a PAX extended header payload, in order.
///
/// Each record reads `"%d key=value\n"` where the leading decimal length
/// counts the entire record, length digits included.
pub(crate) fn parse_pax_records(data: &[u8]) -> Result<Vec<(String, String)>, HeaderError> {
    let mut records = Vec::new();
    let mut rest = data;
    // The payload is block padded; everything after the final record
    // must be NUL.
    while !rest.is_empty() && rest[0] != 0 {
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or(HeaderError::PaxRecord)?;
        let len: usize = std::str::from_utf8(&rest[..space])
            .map_err(|_| HeaderError::PaxRecord)?
            .parse()
            .map_err(|_| HeaderError::PaxRecord)?;
        if len <= space + 1 || len > rest.len() {
            return Err(HeaderError::PaxRecord);
        }
        let record = &rest[space + 1..len];
        if record.last() != Some(&b'\n') {
            return Err(HeaderError::PaxRecord);
        }
        let record = &record[..record.len() - 1];
        let eq = record
            .iter()
            .position(|&b| b == b'=')
            .ok_or(HeaderError::PaxRecord)?;
        if eq == 0 {
            return Err(HeaderError::PaxRecord);
        }
        let key = std::str::from_utf8(&record[..eq]).map_err(|_| HeaderError::Utf8)?;
        let value = std::str::from_utf8(&record[eq + 1..]).map_err(|_| HeaderError::Utf8)?;
        records.push((key.to_string(), value.to_string()));
        rest = &rest[len..];
    }
    if !rest.iter().all(|&b| b == 0) {
        return Err(HeaderError::PaxRecord);
    }
    Ok(records)
}

/// Collapse ordered PAX records into a key map.
///
/// Sparse 0.0 archives encode their map as repeated
/// `GNU.sparse.offset`/`GNU.sparse.numbytes` pairs; those are folded, in
/// record order, into a synthetic comma-separated `GNU.sparse.map` so the
/// 0.1 map reader serves both variants.
pub(crate) fn fold_pax_records(
    records: Vec<(String, String)>,
) -> Result<HashMap<String, String>, HeaderError> {
    let mut map = HashMap::new();
    let mut sparse_pairs: Vec<String> = Vec::new();
    for (key, value) in records {
        match key.as_str() {
            pax::GNU_SPARSE_OFFSET | pax::GNU_SPARSE_NUMBYTES => {
                if value.contains(',') {
                    return Err(HeaderError::SparseMap);
                }
                sparse_pairs.push(value);
            }
            _ => {
                map.insert(key, value);
            }
        }
    }
    if !sparse_pairs.is_empty() {
        map.insert(pax::GNU_SPARSE_MAP.to_string(), sparse_pairs.join(","));
    }
    Ok(map)
}

/// The decoded metadata of one archive entry, with PAX and GNU long-name
/// overrides already applied.
#[derive(Debug, Clone)]
pub struct Header {
    /// The cleaned entry name.
    pub name: String,
    pub entry_type: EntryType,
    /// Permission and special bits; the file type lives in `entry_type`.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Logical file size. For sparse entries this is the reconstructed
    /// size, not the stored byte count.
    pub size: u64,
    pub mtime: DateTime<Utc>,
    /// Raw link target for symlinks and hardlinks.
    pub link_target: String,
    pub dev_major: u32,
    pub dev_minor: u32,
    /// All PAX records that applied to this entry.
    pub pax_records: HashMap<String, String>,
}

impl Header {
    /// The metadata this entry presents through the filesystem surface.
    pub fn metadata(&self) -> Metadata {
        Metadata {
            name: path::base(&self.name).to_string(),
            mode: self.entry_type.file_type().mode_bits() | (self.mode & crate::vfs::MODE_PERM_MASK),
            size: self.size,
            uid: self.uid,
            gid: self.gid,
            mtime: self.mtime,
        }
    }
}
