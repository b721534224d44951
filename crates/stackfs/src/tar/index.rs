// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! Streaming index over a TAR archive: per-entry byte ranges and sparse
//! maps, computed in one forward pass of header blocks.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;

use super::header::{
    BLOCK_LEN, BLOCK_SIZE, Block, EntryType, Header, HeaderError, Magic, fold_pax_records,
    parse_numeric, parse_pax_records, parse_pax_time, parse_string, pax,
};
use super::reader::{ReadAt, read_full_at};
use super::sparse::{
    SparseData, SparseFormat, SparseHole, holes_from_datas, parse_body_map, parse_gnu_pairs,
    parse_pax_map, stored_size,
};
use crate::{Error, ErrorKind, Result, path};

#[cfg(test)]
#[path = "./index_test.rs"]
mod index_test;

/// One archive entry's byte ranges within the archive.
///
/// `header_start` is 512-aligned and covers every header-side block of
/// the entry: PAX and GNU long-name preludes, the header block itself,
/// old-GNU sparse extension blocks, and a PAX-1.0 in-body sparse map.
/// `header_end` doubles as the body start; `body_end - header_end` is the
/// stored byte count, which for sparse entries is smaller than the
/// logical size by the sum of the holes.
#[derive(Debug, Clone)]
pub struct Section {
    pub header: Header,
    pub header_start: u64,
    pub header_end: u64,
    pub body_end: u64,
    /// Zero-filled ranges of the logical file, disjoint and sorted.
    pub holes: Vec<SparseHole>,
}

impl Section {
    pub fn body_start(&self) -> u64 {
        self.header_end
    }

    pub fn is_sparse(&self) -> bool {
        !self.holes.is_empty()
    }

    /// Bytes of this entry actually stored in the archive body.
    pub fn stored_size(&self) -> u64 {
        self.body_end - self.header_end
    }
}

fn round_up(value: u64) -> Option<u64> {
    value
        .checked_add(BLOCK_SIZE - 1)
        .map(|v| v / BLOCK_SIZE * BLOCK_SIZE)
}

/// Format-level sparse results: recoverable in lenient mode, unlike the
/// archive-level failures carried by the outer [`Result`].
type SparseResult = std::result::Result<(Vec<SparseData>, u64), HeaderError>;

/// A lazy pass over an archive yielding [`Section`]s in archive order.
///
/// Duplicate names are permitted and surface as separate sections; later
/// entries win when a tree is built from them (incremental archives rely
/// on this). Unknown entry kinds are yielded as-is for the consumer to
/// gate.
pub struct SectionScanner {
    source: Arc<dyn ReadAt>,
    pos: u64,
    global_pax: HashMap<String, String>,
    strict_sparse: bool,
    done: bool,
}

impl SectionScanner {
    pub fn new(source: Arc<dyn ReadAt>) -> Self {
        Self {
            source,
            pos: 0,
            global_pax: HashMap::new(),
            strict_sparse: false,
            done: false,
        }
    }

    /// Surface malformed sparse maps as errors instead of degrading the
    /// entry to its stored bytes.
    pub fn strict_sparse(mut self, strict: bool) -> Self {
        self.strict_sparse = strict;
        self
    }

    fn bad_header(&self, err: HeaderError) -> Error {
        Error::new("next", format!("@{}", self.pos), ErrorKind::BadTarHeader).with_source(err)
    }

    fn overflow(&self) -> Error {
        self.bad_header(HeaderError::Overflow)
    }

    /// Read the 512-byte block at the cursor. `Ok(None)` at a clean end
    /// of the source.
    fn read_block(&mut self) -> Result<Option<Block>> {
        let mut block = Block::new();
        let n = read_full_at(&*self.source, block.bytes_mut(), self.pos)
            .map_err(|err| Error::io("next", format!("@{}", self.pos), err))?;
        if n == 0 {
            return Ok(None);
        }
        if n < BLOCK_LEN {
            return Err(self.bad_header(HeaderError::Truncated));
        }
        self.pos += BLOCK_SIZE;
        Ok(Some(block))
    }

    /// Read a size-prefixed metadata payload, consuming whole blocks.
    fn read_payload(&mut self, size: u64) -> Result<Vec<u8>> {
        let padded = round_up(size).ok_or_else(|| self.overflow())?;
        let mut data = vec![0u8; padded as usize];
        let n = read_full_at(&*self.source, &mut data, self.pos)
            .map_err(|err| Error::io("next", format!("@{}", self.pos), err))?;
        if (n as u64) < padded {
            return Err(self.bad_header(HeaderError::Truncated));
        }
        self.pos += padded;
        data.truncate(size as usize);
        Ok(data)
    }

    /// Collect the in-header sparse array of an old-GNU sparse entry,
    /// chasing extension blocks, and its real (logical) size.
    fn read_old_gnu_sparse(&mut self, block: &Block) -> Result<SparseResult> {
        let mut datas = match parse_gnu_pairs(block.gnu_sparse_array(), 4) {
            Ok((pairs, _)) => pairs,
            Err(err) => return Ok(Err(err)),
        };
        let mut extended = block.gnu_is_extended();
        while extended {
            let Some(ext) = self.read_block()? else {
                return Err(self.bad_header(HeaderError::Truncated));
            };
            match parse_gnu_pairs(&ext.raw()[..504], 21) {
                Ok((pairs, _)) => datas.extend(pairs),
                Err(err) => return Ok(Err(err)),
            }
            extended = ext.raw()[504] != 0;
        }
        match parse_numeric(block.gnu_real_size()) {
            Ok(real) if real >= 0 => Ok(Ok((datas, real as u64))),
            _ => Ok(Err(HeaderError::Numeric)),
        }
    }

    /// Decode a PAX 0.x map from the entry's records.
    fn pax_map_sparse(records: &HashMap<String, String>) -> SparseResult {
        let datas = parse_pax_map(records)?.ok_or(HeaderError::SparseMap)?;
        let logical = match records.get(pax::GNU_SPARSE_SIZE) {
            Some(size) => size.parse().map_err(|_| HeaderError::SparseMap)?,
            None => datas.iter().map(|&(off, len)| off + len).max().unwrap_or(0),
        };
        Ok((datas, logical))
    }

    /// Read a PAX 1.0 map from the head of the entry body. The consumed
    /// blocks become part of the header-side range.
    fn pax_body_sparse(
        &mut self,
        records: &HashMap<String, String>,
        stored_total: u64,
    ) -> Result<SparseResult> {
        let limit = round_up(stored_total).ok_or_else(|| self.overflow())?;
        let mut data: Vec<u8> = Vec::new();
        let datas = loop {
            if data.len() as u64 >= limit {
                return Ok(Err(HeaderError::SparseMap));
            }
            let Some(block) = self.read_block()? else {
                return Err(self.bad_header(HeaderError::Truncated));
            };
            data.extend_from_slice(block.raw());
            match parse_body_map(&data) {
                None => continue,
                Some(Ok(datas)) => break datas,
                Some(Err(err)) => return Ok(Err(err)),
            }
        };
        let logical = match records.get(pax::GNU_SPARSE_REALSIZE) {
            Some(size) => match size.parse() {
                Ok(size) => size,
                Err(_) => return Ok(Err(HeaderError::SparseMap)),
            },
            None => datas.iter().map(|&(off, len)| off + len).max().unwrap_or(0),
        };
        Ok(Ok((datas, logical)))
    }

    /// Check a decoded map against the framing and complement it into
    /// holes.
    fn validate_sparse(
        datas: &[SparseData],
        logical: u64,
        data_stored: u64,
    ) -> std::result::Result<Vec<SparseHole>, HeaderError> {
        if stored_size(datas) != data_stored {
            return Err(HeaderError::SparseMap);
        }
        holes_from_datas(datas, logical)
    }

    fn next_section(&mut self) -> Result<Option<Section>> {
        let header_start = self.pos;
        let mut local_records: Vec<(String, String)> = Vec::new();
        let mut long_name: Option<String> = None;
        let mut long_link: Option<String> = None;

        let (block, mut entry_type, size_field) = loop {
            let in_prelude =
                !local_records.is_empty() || long_name.is_some() || long_link.is_some();
            let Some(block) = self.read_block()? else {
                if in_prelude {
                    return Err(self.bad_header(HeaderError::Truncated));
                }
                tracing::debug!(offset = self.pos, "archive ends without terminator blocks");
                return Ok(None);
            };
            if block.is_zero() {
                if in_prelude {
                    tracing::warn!(
                        offset = self.pos,
                        "extended headers at end of archive modify no entry"
                    );
                }
                // consume the customary second terminator when present
                let _ = self.read_block();
                return Ok(None);
            }
            block
                .verify_checksum()
                .map_err(|err| self.bad_header(err))?;
            let entry_type = EntryType::from_flag(block.typeflag());
            let size = parse_numeric(block.size()).map_err(|err| self.bad_header(err))?;
            if size < 0 {
                return Err(self.bad_header(HeaderError::Numeric));
            }
            let size = size as u64;
            match entry_type {
                EntryType::ExtendedHeader => {
                    let data = self.read_payload(size)?;
                    let records = parse_pax_records(&data).map_err(|err| self.bad_header(err))?;
                    local_records.extend(records);
                }
                EntryType::GlobalExtendedHeader => {
                    let data = self.read_payload(size)?;
                    let records = parse_pax_records(&data).map_err(|err| self.bad_header(err))?;
                    for (key, value) in records {
                        self.global_pax.insert(key, value);
                    }
                }
                EntryType::GnuLongName => {
                    let data = self.read_payload(size)?;
                    long_name = Some(parse_string(&data).map_err(|err| self.bad_header(err))?);
                }
                EntryType::GnuLongLink => {
                    let data = self.read_payload(size)?;
                    long_link = Some(parse_string(&data).map_err(|err| self.bad_header(err))?);
                }
                other => break (block, other, size),
            }
        };

        // Effective PAX records: entry records override global ones.
        let mut records = self.global_pax.clone();
        records.extend(fold_pax_records(local_records).map_err(|err| self.bad_header(err))?);

        let mut name = match records.get(pax::PATH) {
            Some(name) => name.clone(),
            None => match long_name {
                Some(name) => name,
                None => {
                    let mut name =
                        parse_string(block.name()).map_err(|err| self.bad_header(err))?;
                    if block.magic() == Magic::Ustar && block.prefix()[0] != 0 {
                        let prefix =
                            parse_string(block.prefix()).map_err(|err| self.bad_header(err))?;
                        name = format!("{prefix}/{name}");
                    }
                    name
                }
            },
        };
        if entry_type == EntryType::Regular && name.ends_with('/') {
            entry_type = EntryType::Directory;
        }
        if let Some(real_name) = records.get(pax::GNU_SPARSE_NAME) {
            name = real_name.clone();
        }

        let link_target = match records.get(pax::LINKPATH) {
            Some(target) => target.clone(),
            None => match long_link {
                Some(target) => target,
                None => parse_string(block.linkname()).map_err(|err| self.bad_header(err))?,
            },
        };

        let mode =
            parse_numeric(block.mode()).map_err(|err| self.bad_header(err))? as u32 & 0o7777;
        let uid = match records.get(pax::UID) {
            Some(uid) => uid
                .parse()
                .map_err(|_| self.bad_header(HeaderError::Numeric))?,
            None => parse_numeric(block.uid()).map_err(|err| self.bad_header(err))? as u32,
        };
        let gid = match records.get(pax::GID) {
            Some(gid) => gid
                .parse()
                .map_err(|_| self.bad_header(HeaderError::Numeric))?,
            None => parse_numeric(block.gid()).map_err(|err| self.bad_header(err))? as u32,
        };
        let mtime = match records.get(pax::MTIME) {
            Some(mtime) => parse_pax_time(mtime).map_err(|err| self.bad_header(err))?,
            None => {
                let secs = parse_numeric(block.mtime()).map_err(|err| self.bad_header(err))?;
                DateTime::from_timestamp(secs, 0)
                    .ok_or_else(|| self.bad_header(HeaderError::Numeric))?
            }
        };
        let (dev_major, dev_minor) = match entry_type {
            EntryType::CharDevice | EntryType::BlockDevice => (
                parse_numeric(block.dev_major()).map_err(|err| self.bad_header(err))? as u32,
                parse_numeric(block.dev_minor()).map_err(|err| self.bad_header(err))? as u32,
            ),
            _ => (0, 0),
        };

        // The size field (or its PAX override) counts the stored bytes
        // that follow the header-side blocks. Non-data kinds carry none.
        let mut stored_total: u64 = match records.get(pax::SIZE) {
            Some(size) => size
                .parse()
                .map_err(|_| self.bad_header(HeaderError::Numeric))?,
            None => size_field,
        };
        if !entry_type.has_body() {
            stored_total = 0;
        }

        // Sparse reconstruction. Old-GNU extension blocks live on the
        // header side; a PAX 1.0 map is carved off the body head.
        let mut sparse: Option<SparseResult> = None;
        if entry_type == EntryType::GnuSparse {
            sparse = Some(self.read_old_gnu_sparse(&block)?);
        }
        let body_origin = self.pos;
        if entry_type == EntryType::Regular {
            match SparseFormat::detect(false, &records) {
                Some(SparseFormat::PaxBody) => {
                    sparse = Some(self.pax_body_sparse(&records, stored_total)?);
                }
                Some(SparseFormat::PaxMap | SparseFormat::OldGnu) => {
                    sparse = Some(Self::pax_map_sparse(&records));
                }
                None => (),
            }
        }
        let header_end = self.pos;
        let map_consumed = header_end - body_origin;
        let data_stored = stored_total.saturating_sub(map_consumed);

        let (logical_size, holes) = match sparse {
            None => (data_stored, Vec::new()),
            Some(result) => {
                let validated = result.and_then(|(datas, logical)| {
                    Self::validate_sparse(&datas, logical, data_stored).map(|holes| (logical, holes))
                });
                match validated {
                    Ok((logical, holes)) => (logical, holes),
                    Err(err) if !self.strict_sparse => {
                        tracing::warn!(
                            name = %name,
                            error = %err,
                            "degrading malformed sparse entry to its stored bytes"
                        );
                        (data_stored, Vec::new())
                    }
                    Err(err) => return Err(self.bad_header(err)),
                }
            }
        };

        let body_end = header_end + data_stored;
        self.pos = body_origin
            .checked_add(round_up(stored_total).ok_or_else(|| self.overflow())?)
            .ok_or_else(|| self.overflow())?;

        let header = Header {
            name: path::clean(&name),
            entry_type,
            mode,
            uid,
            gid,
            size: logical_size,
            mtime,
            link_target,
            dev_major,
            dev_minor,
            pax_records: records,
        };
        Ok(Some(Section {
            header,
            header_start,
            header_end,
            body_end,
            holes,
        }))
    }
}

impl Iterator for SectionScanner {
    type Item = Result<Section>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_section() {
            Ok(Some(section)) => Some(Ok(section)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
