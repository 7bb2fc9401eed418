//! On-disk format of a single log segment.
//!
//! A segment file is named `segment-{seq:020}-{base_index:020}.log` and holds a run of records
//! with contiguous indexes starting at `base_index`. Each record is framed as:
//!
//! ```text
//! | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 ... 15 | 16 ...           |
//! +---------------+---------------+----------+-----------------+
//! |  Len (u32 BE) |  CRC (u32 BE) |  Index   | Payload (Len) ...|
//! +---------------+---------------+----------+-----------------+
//! ```
//!
//! * `Len` - size of the payload in bytes
//! * `CRC` - crc32 of `Index` + `Payload`
//! * `Index` - log index of the record (u64 BE), used to verify contiguity on recovery

use crate::commitlog::{Index, LogError};
use bytes::{Buf, BufMut};
use std::convert::TryFrom;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

pub(super) const RECORD_HEADER_LEN: usize = 4 + 4 + 8;
const SEGMENT_FILE_PREFIX: &str = "segment-";
const SEGMENT_FILE_SUFFIX: &str = ".log";

#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) struct SegmentName {
    pub(super) seq: u64,
    pub(super) base_index: Index,
}

impl SegmentName {
    pub(super) fn file_name(&self) -> String {
        format!(
            "{}{:020}-{:020}{}",
            SEGMENT_FILE_PREFIX,
            self.seq,
            self.base_index.as_u64(),
            SEGMENT_FILE_SUFFIX
        )
    }

    pub(super) fn parse(file_name: &str) -> Option<Self> {
        let middle = file_name
            .strip_prefix(SEGMENT_FILE_PREFIX)?
            .strip_suffix(SEGMENT_FILE_SUFFIX)?;
        let mut parts = middle.splitn(2, '-');
        let seq = parts.next()?.parse::<u64>().ok()?;
        let base_index = Index::from_u64_opt(parts.next()?.parse::<u64>().ok()?)?;

        Some(SegmentName { seq, base_index })
    }

    pub(super) fn path_in(&self, directory: &Path) -> PathBuf {
        directory.join(self.file_name())
    }
}

/// Lists all segment files in `directory`, ordered by sequence number.
pub(super) fn list_segments(directory: &Path) -> io::Result<Vec<SegmentName>> {
    let mut names = Vec::new();
    for dir_entry in fs::read_dir(directory)? {
        let dir_entry = dir_entry?;
        if let Some(name) = dir_entry.file_name().to_str().and_then(SegmentName::parse) {
            names.push(name);
        }
    }

    names.sort_by_key(|name| name.seq);
    Ok(names)
}

pub(super) fn encode_record(index: Index, payload: &[u8]) -> Result<Vec<u8>, LogError> {
    let len = framed_len(payload.len())?;
    let mut checksummed = Vec::with_capacity(8 + payload.len());
    checksummed.put_u64(index.as_u64());
    checksummed.put_slice(payload);
    let crc = crc32fast::hash(&checksummed);

    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    record.put_u32(len);
    record.put_u32(crc);
    record.put_slice(&checksummed);
    Ok(record)
}

fn framed_len(payload_len: usize) -> Result<u32, LogError> {
    u32::try_from(payload_len).map_err(|_| LogError::PayloadTooLarge {
        len: payload_len,
        max: u32::MAX as usize,
    })
}

#[derive(Debug, PartialEq)]
pub(super) enum RecordError {
    /// Not enough bytes for a complete record. Expected at the tail after a crash mid-write.
    Incomplete,
    ChecksumMismatch,
}

/// Decodes the record at the start of `buf`. Returns the record's index, payload, and the
/// total number of bytes it occupies.
pub(super) fn decode_record(mut buf: &[u8]) -> Result<(Index, Vec<u8>, usize), RecordError> {
    if buf.len() < RECORD_HEADER_LEN {
        return Err(RecordError::Incomplete);
    }

    let payload_len = buf.get_u32() as usize;
    let stored_crc = buf.get_u32();
    if buf.len() < 8 + payload_len {
        return Err(RecordError::Incomplete);
    }

    let checksummed = &buf[..8 + payload_len];
    if crc32fast::hash(checksummed) != stored_crc {
        return Err(RecordError::ChecksumMismatch);
    }

    let raw_index = buf.get_u64();
    let index = Index::from_u64_opt(raw_index).ok_or(RecordError::ChecksumMismatch)?;
    let payload = buf[..payload_len].to_vec();

    Ok((index, payload, RECORD_HEADER_LEN + payload_len))
}

/// Result of scanning a segment file front to back.
#[derive(Debug)]
pub(super) struct SegmentScan {
    /// Byte offset of every valid record, in index order.
    pub(super) offsets: Vec<u64>,
    /// Length of the valid prefix of the file.
    pub(super) valid_len: u64,
    /// Total length of the file. Larger than `valid_len` if the tail is torn or corrupt.
    pub(super) file_len: u64,
    pub(super) tail_error: Option<RecordError>,
}

/// Reads the segment and validates every record, stopping at the first bad record. Records must
/// carry contiguous indexes starting at the segment's base index.
pub(super) fn scan_segment(path: &Path, base_index: Index) -> io::Result<SegmentScan> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    let mut offsets = Vec::new();
    let mut position = 0usize;
    let mut expected_index = base_index;
    let mut tail_error = None;
    while position < bytes.len() {
        match decode_record(&bytes[position..]) {
            Ok((index, _, record_len)) => {
                if index != expected_index {
                    // A well-formed record with the wrong index is not a torn write.
                    tail_error = Some(RecordError::ChecksumMismatch);
                    break;
                }
                offsets.push(position as u64);
                position += record_len;
                expected_index = expected_index.plus(1);
            }
            Err(e) => {
                tail_error = Some(e);
                break;
            }
        }
    }

    Ok(SegmentScan {
        offsets,
        valid_len: position as u64,
        file_len: bytes.len() as u64,
        tail_error,
    })
}

/// fsync a directory so that file creations, renames, and deletions inside it are durable.
pub(crate) fn sync_directory(directory: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(directory)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = directory;
    }
    Ok(())
}
