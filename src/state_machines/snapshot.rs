use crate::state_machines::command::{ensure_remaining, CommandDecodeError, IdType, TokenType};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::convert::TryFrom;

/// Token and id allocation state as of `last_applied_index`. The transaction store records it
/// together with its own position, so a restarted member resumes from there instead of replaying
/// log entries that retention may already have pruned.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateMachinesSnapshot {
    pub last_applied_index: u64,
    /// Token names per type, ordered by id.
    pub tokens: Vec<(TokenType, Vec<String>)>,
    pub first_unallocated: Vec<(IdType, u64)>,
}

/// Byte representation, all integers little endian:
///
/// ```text
/// | Vrs | LastApplied (8) | NumTokenTypes (1) | Tokens ... | NumIdTypes (1) | Ids ... |
/// ```
///
/// * tokens, per type: `TokenType (1) | Count (4) | Count x (NameLen (4) | Name)`
/// * ids, per type: `IdType (1) | FirstUnallocated (8)`
const SNAPSHOT_FORMAT_VERSION: u8 = 1;

impl StateMachinesSnapshot {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 8 + 2);
        buf.put_u8(SNAPSHOT_FORMAT_VERSION);
        buf.put_u64_le(self.last_applied_index);

        buf.put_u8(self.tokens.len() as u8);
        for (token_type, names) in &self.tokens {
            buf.put_u8(u8::from(*token_type));
            buf.put_u32_le(names.len() as u32);
            for name in names {
                buf.put_u32_le(name.len() as u32);
                buf.put_slice(name.as_bytes());
            }
        }

        buf.put_u8(self.first_unallocated.len() as u8);
        for (id_type, first_unallocated) in &self.first_unallocated {
            buf.put_u8(u8::from(*id_type));
            buf.put_u64_le(*first_unallocated);
        }

        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, CommandDecodeError> {
        ensure_remaining(&bytes, 1 + 8 + 1)?;
        let version = bytes.get_u8();
        if version != SNAPSHOT_FORMAT_VERSION {
            return Err(CommandDecodeError::UnknownVersion(version));
        }
        let last_applied_index = bytes.get_u64_le();

        let num_token_types = bytes.get_u8();
        let mut tokens = Vec::with_capacity(num_token_types as usize);
        for _ in 0..num_token_types {
            ensure_remaining(&bytes, 1 + 4)?;
            let token_type = TokenType::try_from(bytes.get_u8())?;
            let count = bytes.get_u32_le();
            let mut names = Vec::new();
            for _ in 0..count {
                ensure_remaining(&bytes, 4)?;
                let name_len = bytes.get_u32_le() as usize;
                ensure_remaining(&bytes, name_len)?;
                let name = String::from_utf8(bytes.split_to(name_len).to_vec())
                    .map_err(|_| CommandDecodeError::InvalidTokenName)?;
                names.push(name);
            }
            tokens.push((token_type, names));
        }

        ensure_remaining(&bytes, 1)?;
        let num_id_types = bytes.get_u8();
        let mut first_unallocated = Vec::with_capacity(num_id_types as usize);
        for _ in 0..num_id_types {
            ensure_remaining(&bytes, 1 + 8)?;
            first_unallocated.push((IdType::try_from(bytes.get_u8())?, bytes.get_u64_le()));
        }

        if bytes.has_remaining() {
            return Err(CommandDecodeError::TrailingBytes(bytes.remaining()));
        }

        Ok(StateMachinesSnapshot {
            last_applied_index,
            tokens,
            first_unallocated,
        })
    }
}
