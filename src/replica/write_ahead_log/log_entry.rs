use crate::commitlog;
use crate::commitlog::EntryDecodeError;
use crate::replica::Term;
use bytes::{Buf, BufMut, Bytes};
use std::convert::TryFrom;

/// Byte representation:
///
/// ```text
/// |                                         1                               |
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 0 | 1 | 2 | 3 | 4 | 5 | ...     |
/// +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+-...-----+
/// |Vrs|       Term (8 bytes LE)       |Knd|   Data (variable size)      ... |
/// +---+-------------------------------+---+-----------------------------...-+
/// ```
///
/// * `Vrs` - version of the serialized payload
/// * `Term` - raft leadership term when this entry was created
/// * `Knd` - kind of payload, see `EntryPayload`
/// * `Data` - app specific data payload; empty for barriers
///
/// Not needed:
///
/// * Checksum is not needed, it's guaranteed by underlying commitlog.
/// * Size/length of `Data` is not needed; the underlying commitlog will give us the correctly allocated array.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteAheadLogEntry {
    pub term: Term,
    pub payload: EntryPayload,
}

/// What a log entry carries.
#[derive(Clone, Debug, PartialEq)]
pub enum EntryPayload {
    /// Opaque command submitted by the application.
    Command(Bytes),
    /// Appended by a newly elected leader in its own term. Carries nothing for the application.
    LeaderBarrier,
}

const RAFT_LOG_ENTRY_FORMAT_VERSION: u8 = 2;
const HEADER_LEN: usize = 1 + 8 + 1;
const KIND_COMMAND: u8 = 0;
const KIND_LEADER_BARRIER: u8 = 1;

impl commitlog::Entry for WriteAheadLogEntry {}

impl TryFrom<Vec<u8>> for WriteAheadLogEntry {
    type Error = EntryDecodeError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        if bytes.len() < HEADER_LEN {
            return Err(EntryDecodeError(format!("Entry too short: {} bytes", bytes.len())));
        }

        let mut bytes = Bytes::from(bytes);
        let version = bytes.get_u8();
        if version != RAFT_LOG_ENTRY_FORMAT_VERSION {
            return Err(EntryDecodeError(format!("Unknown entry format version {}", version)));
        }

        let term = Term::new(bytes.get_u64_le());
        let payload = match bytes.get_u8() {
            KIND_COMMAND => EntryPayload::Command(bytes),
            KIND_LEADER_BARRIER => EntryPayload::LeaderBarrier,
            kind => return Err(EntryDecodeError(format!("Unknown entry kind {}", kind))),
        };

        Ok(WriteAheadLogEntry { term, payload })
    }
}

impl From<WriteAheadLogEntry> for Vec<u8> {
    fn from(entry: WriteAheadLogEntry) -> Self {
        let data_len = match &entry.payload {
            EntryPayload::Command(data) => data.len(),
            EntryPayload::LeaderBarrier => 0,
        };
        let mut bytes: Vec<u8> = Vec::with_capacity(HEADER_LEN + data_len);

        bytes.put_u8(RAFT_LOG_ENTRY_FORMAT_VERSION);
        bytes.put_u64_le(entry.term.as_u64());
        match entry.payload {
            EntryPayload::Command(data) => {
                bytes.put_u8(KIND_COMMAND);
                bytes.put_slice(&data);
            }
            EntryPayload::LeaderBarrier => bytes.put_u8(KIND_LEADER_BARRIER),
        }

        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_is_little_endian_after_version_byte() {
        let entry = WriteAheadLogEntry {
            term: Term::new(0x0102),
            payload: EntryPayload::Command(Bytes::from_static(b"xyz")),
        };

        let bytes: Vec<u8> = entry.clone().into();
        assert_eq!(bytes, vec![2, 0x02, 0x01, 0, 0, 0, 0, 0, 0, KIND_COMMAND, b'x', b'y', b'z']);
        assert_eq!(WriteAheadLogEntry::try_from(bytes).unwrap(), entry);
    }

    #[test]
    fn barrier_has_no_data() {
        let barrier = WriteAheadLogEntry {
            term: Term::new(9),
            payload: EntryPayload::LeaderBarrier,
        };

        let bytes: Vec<u8> = barrier.clone().into();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(WriteAheadLogEntry::try_from(bytes).unwrap(), barrier);
    }

    #[test]
    fn rejects_malformed_bytes() {
        assert!(WriteAheadLogEntry::try_from(vec![2, 0, 0]).is_err());
        assert!(WriteAheadLogEntry::try_from(vec![1, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(WriteAheadLogEntry::try_from(vec![2, 0, 0, 0, 0, 0, 0, 0, 0, 7]).is_err());
    }
}
