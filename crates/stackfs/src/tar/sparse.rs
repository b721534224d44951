// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! Sparse map readers for the old-GNU and PAX sparse formats.
//!
//! Every format ultimately yields a list of *data* ranges: the logical
//! regions whose bytes are stored in the archive. The complement against
//! the logical file size gives the holes that read as zero.

use std::collections::HashMap;

use super::header::{HeaderError, pax, parse_numeric};

#[cfg(test)]
#[path = "./sparse_test.rs"]
mod sparse_test;

/// A logical byte range of a sparse file that is not stored in the
/// archive and reads as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseHole {
    pub offset: u64,
    pub length: u64,
}

/// A stored data range: `(logical_offset, length)`.
pub(crate) type SparseData = (u64, u64);

/// Which sparse format an entry uses, judged from its typeflag and PAX
/// records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SparseFormat {
    OldGnu,
    /// PAX 0.0 and 0.1, both served by the comma map after record
    /// folding.
    PaxMap,
    /// PAX 1.0: the map is stored at the head of the entry body.
    PaxBody,
}

impl SparseFormat {
    /// Detect the sparse format for an entry, if any.
    pub fn detect(is_old_gnu: bool, records: &HashMap<String, String>) -> Option<Self> {
        if is_old_gnu {
            return Some(Self::OldGnu);
        }
        let major = records.get(pax::GNU_SPARSE_MAJOR);
        let minor = records.get(pax::GNU_SPARSE_MINOR);
        match (major.map(String::as_str), minor.map(String::as_str)) {
            (Some("1"), Some("0")) => Some(Self::PaxBody),
            (Some(_), _) | (_, Some(_)) => Some(Self::PaxMap),
            (None, None) if records.contains_key(pax::GNU_SPARSE_MAP) => Some(Self::PaxMap),
            _ => None,
        }
    }
}

/// Parse up to `max` 24-byte `(offset, length)` pairs from an old-GNU
/// sparse region. Returns the pairs and whether an all-NUL terminator was
/// seen.
pub(crate) fn parse_gnu_pairs(
    region: &[u8],
    max: usize,
) -> Result<(Vec<SparseData>, bool), HeaderError> {
    let mut pairs = Vec::new();
    for i in 0..max {
        let entry = &region[i * 24..(i + 1) * 24];
        if entry.iter().all(|&b| b == 0) {
            return Ok((pairs, true));
        }
        let offset = parse_numeric(&entry[..12])?;
        let length = parse_numeric(&entry[12..])?;
        if offset < 0 || length < 0 {
            return Err(HeaderError::SparseMap);
        }
        pairs.push((offset as u64, length as u64));
    }
    Ok((pairs, false))
}

/// Read the 0.1-style comma map (also carrying folded 0.0 records) from
/// an entry's PAX records. Returns `None` when the records hold no map.
pub(crate) fn parse_pax_map(
    records: &HashMap<String, String>,
) -> Result<Option<Vec<SparseData>>, HeaderError> {
    let Some(map) = records.get(pax::GNU_SPARSE_MAP) else {
        return Ok(None);
    };
    let numbers: Vec<u64> = map
        .split(',')
        .map(|tok| tok.parse().map_err(|_| HeaderError::SparseMap))
        .collect::<Result<_, _>>()?;
    if numbers.len() % 2 != 0 {
        return Err(HeaderError::SparseMap);
    }
    if let Some(count) = records.get(pax::GNU_SPARSE_NUMBLOCKS) {
        let count: usize = count.parse().map_err(|_| HeaderError::SparseMap)?;
        if count != numbers.len() / 2 {
            return Err(HeaderError::SparseMap);
        }
    }
    Ok(Some(
        numbers.chunks(2).map(|pair| (pair[0], pair[1])).collect(),
    ))
}

/// Try to parse a PAX 1.0 in-body sparse map from the blocks read so far.
///
/// The payload is a run of newline-terminated decimal tokens: the pair
/// count first, then alternating offset and length. Returns `None` when
/// `data` does not yet hold the full map; the caller reads another block
/// and retries.
pub(crate) fn parse_body_map(data: &[u8]) -> Option<Result<Vec<SparseData>, HeaderError>> {
    let mut tokens: Vec<u64> = Vec::new();
    let mut rest = data;
    let count = loop {
        match next_token(&mut rest) {
            None => return None,
            Some(Err(err)) => return Some(Err(err)),
            Some(Ok(count)) => break count as usize,
        }
    };
    if count > data.len() {
        // A count this large cannot be backed by a well-formed map; give
        // up rather than reading forever.
        return Some(Err(HeaderError::SparseMap));
    }
    while tokens.len() < count * 2 {
        match next_token(&mut rest) {
            None => return None,
            Some(Err(err)) => return Some(Err(err)),
            Some(Ok(tok)) => tokens.push(tok),
        }
    }
    Some(Ok(tokens.chunks(2).map(|pair| (pair[0], pair[1])).collect()))
}

fn next_token(rest: &mut &[u8]) -> Option<Result<u64, HeaderError>> {
    let nl = rest.iter().position(|&b| b == b'\n')?;
    let tok = &rest[..nl];
    *rest = &rest[nl + 1..];
    let parsed = std::str::from_utf8(tok)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(HeaderError::SparseMap);
    Some(parsed)
}

/// Validate data ranges and complement them against the logical size to
/// produce the hole list.
pub(crate) fn holes_from_datas(
    datas: &[SparseData],
    size: u64,
) -> Result<Vec<SparseHole>, HeaderError> {
    let mut holes = Vec::new();
    let mut pos = 0u64;
    for &(offset, length) in datas {
        let end = offset.checked_add(length).ok_or(HeaderError::SparseMap)?;
        if offset < pos || end > size {
            return Err(HeaderError::SparseMap);
        }
        if offset > pos {
            holes.push(SparseHole {
                offset: pos,
                length: offset - pos,
            });
        }
        pos = end;
    }
    if pos < size {
        holes.push(SparseHole {
            offset: pos,
            length: size - pos,
        });
    }
    Ok(holes)
}

/// Total bytes stored in the archive for the given data ranges.
pub(crate) fn stored_size(datas: &[SparseData]) -> u64 {
    datas.iter().map(|&(_, len)| len).sum()
}
