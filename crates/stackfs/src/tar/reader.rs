// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

//! Random-access sources and the per-entry readers assembled over them.

use std::io::{self, SeekFrom};
use std::sync::{Arc, Mutex};

use super::index::Section;

#[cfg(test)]
#[path = "./reader_test.rs"]
mod reader_test;

/// A source of positioned reads over an immutable byte range.
///
/// The TAR engine never reads sequentially from its input; every access
/// names an absolute offset, so concurrent readers need no coordination.
pub trait ReadAt: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

#[cfg(unix)]
impl ReadAt for std::fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.len() as u64 {
            return Ok(0);
        }
        let avail = &self[offset as usize..];
        let n = avail.len().min(buf.len());
        buf[..n].copy_from_slice(&avail[..n]);
        Ok(n)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.as_slice().read_at(buf, offset)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Arc<T> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for &T {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }
}

/// Read until the buffer is full or the source is exhausted, retrying
/// interrupted reads. Returns the number of bytes placed in `buf`.
pub(crate) fn read_full_at(
    source: &dyn ReadAt,
    buf: &mut [u8],
    mut offset: u64,
) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read_at(&mut buf[filled..], offset) {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                offset += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// One run of a section's logical byte range.
#[derive(Debug, Clone, Copy)]
struct Segment {
    /// Offset of this run within the logical file.
    logical: u64,
    length: u64,
    /// Absolute archive offset of the stored bytes; `None` for a hole,
    /// which reads as zero.
    stored: Option<u64>,
}

/// A reader reconstructing one archive entry's logical contents.
///
/// Non-sparse entries read straight from `[body_start, body_end)` of the
/// source; sparse entries interleave stored data runs with zero fill.
/// Sequential reads and seeks serialise on the reader's cursor;
/// positioned reads are lock-free.
pub struct SectionReader {
    source: Arc<dyn ReadAt>,
    segments: Vec<Segment>,
    size: u64,
    pos: Mutex<u64>,
}

impl SectionReader {
    pub fn new(source: Arc<dyn ReadAt>, section: &Section) -> Self {
        Self::from_parts(
            source,
            section.body_start(),
            section.header.size,
            &section.holes,
        )
    }

    pub(crate) fn from_parts(
        source: Arc<dyn ReadAt>,
        body_start: u64,
        size: u64,
        holes: &[super::sparse::SparseHole],
    ) -> Self {
        let mut segments = Vec::new();
        let mut logical = 0u64;
        let mut stored = body_start;
        for hole in holes {
            if hole.offset > logical {
                let length = hole.offset - logical;
                segments.push(Segment {
                    logical,
                    length,
                    stored: Some(stored),
                });
                stored += length;
            }
            segments.push(Segment {
                logical: hole.offset,
                length: hole.length,
                stored: None,
            });
            logical = hole.offset + hole.length;
        }
        if logical < size {
            segments.push(Segment {
                logical,
                length: size - logical,
                stored: Some(stored),
            });
        }
        Self {
            source,
            segments,
            size,
            pos: Mutex::new(0),
        }
    }

    /// The logical size of the entry.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Positioned read at `offset` of the logical file.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((self.size - offset) as usize);
        let buf = &mut buf[..want];
        let mut filled = 0usize;
        for seg in &self.segments {
            let seg_end = seg.logical + seg.length;
            let read_start = offset + filled as u64;
            if read_start >= seg_end || filled == buf.len() {
                continue;
            }
            if read_start < seg.logical {
                break;
            }
            let within = read_start - seg.logical;
            let avail = ((seg.length - within) as usize).min(buf.len() - filled);
            let dst = &mut buf[filled..filled + avail];
            match seg.stored {
                None => dst.fill(0),
                Some(archive_off) => {
                    let n = read_full_at(&*self.source, dst, archive_off + within)?;
                    filled += n;
                    if n < avail {
                        // truncated source; surface what we have
                        return Ok(filled);
                    }
                    continue;
                }
            }
            filled += avail;
        }
        Ok(filled)
    }

    /// Sequential read from the reader's cursor.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pos = self.pos.lock().expect("cursor lock poisoned");
        let n = self.read_at(buf, *pos)?;
        *pos += n as u64;
        Ok(n)
    }

    pub fn seek(&self, seek: SeekFrom) -> io::Result<u64> {
        let mut pos = self.pos.lock().expect("cursor lock poisoned");
        let next = match seek {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => *pos as i64 + delta,
            SeekFrom::End(delta) => self.size as i64 + delta,
        };
        if next < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of entry",
            ));
        }
        *pos = next as u64;
        Ok(*pos)
    }
}

impl ReadAt for SectionReader {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        SectionReader::read_at(self, buf, offset)
    }
}
