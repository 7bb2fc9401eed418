use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::convert::TryFrom;

/// Identifies the operation a command came from, so the submitting member can recognise its own
/// request when it is applied.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct DistributedOperation {
    pub global_session: GlobalSession,
    pub local_operation_id: u64,
}

/// A member's session with the cluster. `session_id` is unique per member process start.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct GlobalSession {
    pub session_id: u64,
    pub owner_id: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum TokenType {
    Label,
    PropertyKey,
    RelationshipType,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum IdType {
    Node,
    Relationship,
    Property,
    String,
    Array,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReplicatedCommand {
    TokenRequest {
        operation: DistributedOperation,
        token_type: TokenType,
        name: String,
    },
    IdAllocationRequest {
        operation: DistributedOperation,
        id_type: IdType,
        range_start: u64,
        range_length: u64,
    },
    Transaction {
        operation: DistributedOperation,
        representation: Bytes,
    },
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CommandDecodeError {
    #[error("Command truncated: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("Unknown command format version {0}")]
    UnknownVersion(u8),
    #[error("Unknown command kind {0}")]
    UnknownKind(u8),
    #[error("Unknown token type {0}")]
    UnknownTokenType(u8),
    #[error("Unknown id type {0}")]
    UnknownIdType(u8),
    #[error("Token name is not valid UTF-8")]
    InvalidTokenName,
    #[error("{0} trailing bytes after command")]
    TrailingBytes(usize),
}

/// Byte representation, all integers little endian:
///
/// ```text
/// | Vrs | Knd | SessionId (8) | OwnerId (8) | LocalOpId (8) | Body ... |
/// ```
///
/// Body per kind:
///
/// * token: `TokenType (1) | NameLen (4) | Name (utf-8)`
/// * id allocation: `IdType (1) | RangeStart (8) | RangeLength (8)`
/// * transaction: the remaining bytes, opaque
const COMMAND_FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 1 + 8 + 8 + 8;

const KIND_TOKEN: u8 = 1;
const KIND_ID_ALLOCATION: u8 = 2;
const KIND_TRANSACTION: u8 = 3;

impl ReplicatedCommand {
    pub fn operation(&self) -> DistributedOperation {
        match self {
            ReplicatedCommand::TokenRequest { operation, .. }
            | ReplicatedCommand::IdAllocationRequest { operation, .. }
            | ReplicatedCommand::Transaction { operation, .. } => *operation,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 32);
        buf.put_u8(COMMAND_FORMAT_VERSION);
        buf.put_u8(match self {
            ReplicatedCommand::TokenRequest { .. } => KIND_TOKEN,
            ReplicatedCommand::IdAllocationRequest { .. } => KIND_ID_ALLOCATION,
            ReplicatedCommand::Transaction { .. } => KIND_TRANSACTION,
        });

        let operation = self.operation();
        buf.put_u64_le(operation.global_session.session_id);
        buf.put_u64_le(operation.global_session.owner_id);
        buf.put_u64_le(operation.local_operation_id);

        match self {
            ReplicatedCommand::TokenRequest { token_type, name, .. } => {
                buf.put_u8(u8::from(*token_type));
                buf.put_u32_le(name.len() as u32);
                buf.put_slice(name.as_bytes());
            }
            ReplicatedCommand::IdAllocationRequest {
                id_type,
                range_start,
                range_length,
                ..
            } => {
                buf.put_u8(u8::from(*id_type));
                buf.put_u64_le(*range_start);
                buf.put_u64_le(*range_length);
            }
            ReplicatedCommand::Transaction { representation, .. } => {
                buf.put_slice(representation);
            }
        }

        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, CommandDecodeError> {
        ensure_remaining(&bytes, HEADER_LEN)?;

        let version = bytes.get_u8();
        if version != COMMAND_FORMAT_VERSION {
            return Err(CommandDecodeError::UnknownVersion(version));
        }
        let kind = bytes.get_u8();
        let operation = DistributedOperation {
            global_session: GlobalSession {
                session_id: bytes.get_u64_le(),
                owner_id: bytes.get_u64_le(),
            },
            local_operation_id: bytes.get_u64_le(),
        };

        let command = match kind {
            KIND_TOKEN => {
                ensure_remaining(&bytes, 1 + 4)?;
                let token_type = TokenType::try_from(bytes.get_u8())?;
                let name_len = bytes.get_u32_le() as usize;
                ensure_remaining(&bytes, name_len)?;
                let name = String::from_utf8(bytes.split_to(name_len).to_vec())
                    .map_err(|_| CommandDecodeError::InvalidTokenName)?;

                ReplicatedCommand::TokenRequest {
                    operation,
                    token_type,
                    name,
                }
            }
            KIND_ID_ALLOCATION => {
                ensure_remaining(&bytes, 1 + 8 + 8)?;
                ReplicatedCommand::IdAllocationRequest {
                    operation,
                    id_type: IdType::try_from(bytes.get_u8())?,
                    range_start: bytes.get_u64_le(),
                    range_length: bytes.get_u64_le(),
                }
            }
            KIND_TRANSACTION => {
                let representation = bytes.split_to(bytes.len());
                ReplicatedCommand::Transaction {
                    operation,
                    representation,
                }
            }
            unknown => return Err(CommandDecodeError::UnknownKind(unknown)),
        };

        if bytes.has_remaining() {
            return Err(CommandDecodeError::TrailingBytes(bytes.remaining()));
        }

        Ok(command)
    }
}

pub(super) fn ensure_remaining(bytes: &Bytes, needed: usize) -> Result<(), CommandDecodeError> {
    if bytes.remaining() < needed {
        return Err(CommandDecodeError::Truncated {
            needed: needed - bytes.remaining(),
        });
    }

    Ok(())
}

impl From<TokenType> for u8 {
    fn from(token_type: TokenType) -> Self {
        match token_type {
            TokenType::Label => 0,
            TokenType::PropertyKey => 1,
            TokenType::RelationshipType => 2,
        }
    }
}

impl TryFrom<u8> for TokenType {
    type Error = CommandDecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TokenType::Label),
            1 => Ok(TokenType::PropertyKey),
            2 => Ok(TokenType::RelationshipType),
            unknown => Err(CommandDecodeError::UnknownTokenType(unknown)),
        }
    }
}

impl From<IdType> for u8 {
    fn from(id_type: IdType) -> Self {
        match id_type {
            IdType::Node => 0,
            IdType::Relationship => 1,
            IdType::Property => 2,
            IdType::String => 3,
            IdType::Array => 4,
        }
    }
}

impl TryFrom<u8> for IdType {
    type Error = CommandDecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(IdType::Node),
            1 => Ok(IdType::Relationship),
            2 => Ok(IdType::Property),
            3 => Ok(IdType::String),
            4 => Ok(IdType::Array),
            unknown => Err(CommandDecodeError::UnknownIdType(unknown)),
        }
    }
}
