//! Fixed-size segment metadata and the protocol tag space.
//!
//! Every metadata variant marshals to exactly [`METADATA_LEN`] bytes so the
//! encrypted header is constant-size on the wire; the first byte is the
//! protocol tag, remaining fields are big-endian at fixed offsets, and the
//! unused tail is zero. The tag space partitions into three disjoint sets:
//! session control, data/ack, and close-connection.

use thiserror::Error;

/// Marshaled size of every metadata variant.
pub const METADATA_LEN: usize = 32;

// Session protocols: open/close request/response.
pub const OPEN_SESSION_REQUEST: u8 = 1;
pub const OPEN_SESSION_RESPONSE: u8 = 2;
pub const CLOSE_SESSION_REQUEST: u8 = 3;
pub const CLOSE_SESSION_RESPONSE: u8 = 4;

// Data-ack protocols.
pub const DATA: u8 = 5;
pub const ACK: u8 = 6;

// Close-connection protocol.
pub const CLOSE_CONN: u8 = 7;

/// `session_id = 0` is reserved and never valid on the wire.
pub const RESERVED_SESSION_ID: u32 = 0;

pub fn is_session_protocol(protocol: u8) -> bool {
    (OPEN_SESSION_REQUEST..=CLOSE_SESSION_RESPONSE).contains(&protocol)
}

pub fn is_data_ack_protocol(protocol: u8) -> bool {
    protocol == DATA || protocol == ACK
}

pub fn is_close_conn_protocol(protocol: u8) -> bool {
    protocol == CLOSE_CONN
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("metadata must be exactly {METADATA_LEN} bytes, got {0}")]
    Size(usize),
    #[error("unknown protocol {0}")]
    UnknownProtocol(u8),
    #[error("session id 0 is reserved")]
    ReservedSessionId,
}

/// Metadata for session open/close request/response segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionMetadata {
    pub protocol: u8,
    pub session_id: u32,
    pub seq: u32,
    pub status_code: u8,
    pub payload_len: u16,
    pub suffix_len: u8,
}

/// Metadata for data and ack segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAckMetadata {
    pub protocol: u8,
    pub session_id: u32,
    pub seq: u32,
    pub un_ack_seq: u32,
    pub window_size: u16,
    pub prefix_len: u8,
    pub payload_len: u16,
    pub suffix_len: u8,
}

/// Metadata for the close-connection segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseConnMetadata {
    pub protocol: u8,
    pub status_code: u8,
    pub suffix_len: u8,
}

/// Tagged metadata, dispatched on the protocol byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metadata {
    Session(SessionMetadata),
    DataAck(DataAckMetadata),
    CloseConn(CloseConnMetadata),
}

impl Metadata {
    pub fn protocol(&self) -> u8 {
        match self {
            Metadata::Session(m) => m.protocol,
            Metadata::DataAck(m) => m.protocol,
            Metadata::CloseConn(m) => m.protocol,
        }
    }

    /// Session id, where the variant carries one.
    pub fn session_id(&self) -> Option<u32> {
        match self {
            Metadata::Session(m) => Some(m.session_id),
            Metadata::DataAck(m) => Some(m.session_id),
            Metadata::CloseConn(_) => None,
        }
    }

    /// Ordering key within a session. Close-conn segments do not order.
    pub fn seq(&self) -> u32 {
        match self {
            Metadata::Session(m) => m.seq,
            Metadata::DataAck(m) => m.seq,
            Metadata::CloseConn(_) => 0,
        }
    }

    pub fn payload_len(&self) -> u16 {
        match self {
            Metadata::Session(m) => m.payload_len,
            Metadata::DataAck(m) => m.payload_len,
            Metadata::CloseConn(_) => 0,
        }
    }

    pub fn suffix_len(&self) -> u8 {
        match self {
            Metadata::Session(m) => m.suffix_len,
            Metadata::DataAck(m) => m.suffix_len,
            Metadata::CloseConn(m) => m.suffix_len,
        }
    }

    /// Prefix padding only exists on data/ack segments.
    pub fn prefix_len(&self) -> u8 {
        match self {
            Metadata::DataAck(m) => m.prefix_len,
            _ => 0,
        }
    }

    pub fn as_session(&self) -> Option<&SessionMetadata> {
        match self {
            Metadata::Session(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_data_ack(&self) -> Option<&DataAckMetadata> {
        match self {
            Metadata::DataAck(m) => Some(m),
            _ => None,
        }
    }

    /// Marshal to exactly [`METADATA_LEN`] bytes, protocol tag first,
    /// fields big-endian, zero tail.
    pub fn marshal(&self) -> [u8; METADATA_LEN] {
        let mut buf = [0u8; METADATA_LEN];
        match self {
            Metadata::Session(m) => {
                buf[0] = m.protocol;
                buf[1..5].copy_from_slice(&m.session_id.to_be_bytes());
                buf[5..9].copy_from_slice(&m.seq.to_be_bytes());
                buf[9] = m.status_code;
                buf[10..12].copy_from_slice(&m.payload_len.to_be_bytes());
                buf[12] = m.suffix_len;
            }
            Metadata::DataAck(m) => {
                buf[0] = m.protocol;
                buf[1..5].copy_from_slice(&m.session_id.to_be_bytes());
                buf[5..9].copy_from_slice(&m.seq.to_be_bytes());
                buf[9..13].copy_from_slice(&m.un_ack_seq.to_be_bytes());
                buf[13..15].copy_from_slice(&m.window_size.to_be_bytes());
                buf[15] = m.prefix_len;
                buf[16..18].copy_from_slice(&m.payload_len.to_be_bytes());
                buf[18] = m.suffix_len;
            }
            Metadata::CloseConn(m) => {
                buf[0] = m.protocol;
                buf[1] = m.status_code;
                buf[2] = m.suffix_len;
            }
        }
        buf
    }

    /// Inverse of [`Metadata::marshal`]. Rejects any input that is not
    /// exactly [`METADATA_LEN`] bytes or whose tag is unknown.
    pub fn unmarshal(input: &[u8]) -> Result<Metadata, CodecError> {
        if input.len() != METADATA_LEN {
            return Err(CodecError::Size(input.len()));
        }
        let protocol = input[0];
        if is_session_protocol(protocol) {
            Ok(Metadata::Session(SessionMetadata {
                protocol,
                session_id: u32::from_be_bytes(input[1..5].try_into().unwrap()),
                seq: u32::from_be_bytes(input[5..9].try_into().unwrap()),
                status_code: input[9],
                payload_len: u16::from_be_bytes(input[10..12].try_into().unwrap()),
                suffix_len: input[12],
            }))
        } else if is_data_ack_protocol(protocol) {
            Ok(Metadata::DataAck(DataAckMetadata {
                protocol,
                session_id: u32::from_be_bytes(input[1..5].try_into().unwrap()),
                seq: u32::from_be_bytes(input[5..9].try_into().unwrap()),
                un_ack_seq: u32::from_be_bytes(input[9..13].try_into().unwrap()),
                window_size: u16::from_be_bytes(input[13..15].try_into().unwrap()),
                prefix_len: input[15],
                payload_len: u16::from_be_bytes(input[16..18].try_into().unwrap()),
                suffix_len: input[18],
            }))
        } else if is_close_conn_protocol(protocol) {
            Ok(Metadata::CloseConn(CloseConnMetadata {
                protocol,
                status_code: input[1],
                suffix_len: input[2],
            }))
        } else {
            Err(CodecError::UnknownProtocol(protocol))
        }
    }
}

/// Sequence comparison with u32 wraparound, window semantics: `a` is
/// before `b` when the forward distance from `a` to `b` is shorter than
/// the way back around.
pub fn seq_before(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) < u32::MAX / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_sets_disjoint() {
        for p in 0..=u8::MAX {
            let sets = [
                is_session_protocol(p),
                is_data_ack_protocol(p),
                is_close_conn_protocol(p),
            ];
            assert!(sets.iter().filter(|&&s| s).count() <= 1, "protocol {}", p);
        }
    }

    #[test]
    fn test_marshal_size_all_variants() {
        let variants = [
            Metadata::Session(SessionMetadata {
                protocol: OPEN_SESSION_REQUEST,
                session_id: 7,
                seq: 1,
                status_code: 0,
                payload_len: 100,
                suffix_len: 13,
            }),
            Metadata::DataAck(DataAckMetadata {
                protocol: DATA,
                session_id: 0xdead_beef,
                seq: u32::MAX,
                un_ack_seq: 42,
                window_size: 256,
                prefix_len: 9,
                payload_len: 1400,
                suffix_len: 200,
            }),
            Metadata::CloseConn(CloseConnMetadata {
                protocol: CLOSE_CONN,
                status_code: 1,
                suffix_len: 77,
            }),
        ];
        for m in variants {
            let buf = m.marshal();
            assert_eq!(buf.len(), METADATA_LEN);
            assert_eq!(buf[0], m.protocol());
            let back = Metadata::unmarshal(&buf).unwrap();
            assert_eq!(back, m);
        }
    }

    #[test]
    fn test_unmarshal_rejects_wrong_size() {
        let m = Metadata::CloseConn(CloseConnMetadata {
            protocol: CLOSE_CONN,
            status_code: 0,
            suffix_len: 0,
        });
        let buf = m.marshal();
        assert_eq!(
            Metadata::unmarshal(&buf[..METADATA_LEN - 1]),
            Err(CodecError::Size(METADATA_LEN - 1))
        );
        let mut long = buf.to_vec();
        long.push(0);
        assert_eq!(Metadata::unmarshal(&long), Err(CodecError::Size(METADATA_LEN + 1)));
    }

    #[test]
    fn test_unmarshal_rejects_unknown_protocol() {
        let mut buf = [0u8; METADATA_LEN];
        buf[0] = 0;
        assert_eq!(Metadata::unmarshal(&buf), Err(CodecError::UnknownProtocol(0)));
        buf[0] = 200;
        assert_eq!(Metadata::unmarshal(&buf), Err(CodecError::UnknownProtocol(200)));
    }

    #[test]
    fn test_seq_before_wraparound() {
        assert!(seq_before(0, 1));
        assert!(seq_before(100, 200));
        assert!(!seq_before(200, 100));
        assert!(!seq_before(5, 5));
        // Across the wrap point.
        assert!(seq_before(u32::MAX, 0));
        assert!(seq_before(u32::MAX - 10, 3));
        assert!(!seq_before(3, u32::MAX - 10));
    }
}
