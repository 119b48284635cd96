//! Segments and transmission-unit budgeting.

use crate::crypto::{NONCE_SIZE, TAG_SIZE};
use crate::net::metadata::{DataAckMetadata, Metadata, DATA, METADATA_LEN};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use std::time::Instant;

/// Fixed per-datagram cost of the UDP underlay: one nonce, the encrypted
/// metadata block with its tag, and the payload tag.
pub const UDP_OVERHEAD: usize = NONCE_SIZE + METADATA_LEN + 2 * TAG_SIZE;

/// Largest segment payload the TCP underlay variant carries per PDU.
pub const MAX_PDU: usize = 16384;

/// Conservative MTU assumed when the IP version or transport is unknown.
const DEFAULT_MTU: usize = 1440;

const IPV4_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;
const UDP_HEADER: usize = 8;

/// Padding lengths are uniform in `[0, MAX_PADDING)`.
pub const MAX_PADDING: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Unknown,
}

/// Largest payload that fits one datagram on the given path.
pub fn max_fragment_size(mtu: usize, ipv: IpVersion, transport: TransportProtocol) -> usize {
    match transport {
        TransportProtocol::Tcp => MAX_PDU,
        TransportProtocol::Udp => {
            let ip_header = match ipv {
                IpVersion::V4 => IPV4_HEADER,
                IpVersion::V6 => IPV6_HEADER,
                IpVersion::Unknown => return DEFAULT_MTU.saturating_sub(UDP_OVERHEAD),
            };
            mtu.saturating_sub(ip_header + UDP_HEADER + UDP_OVERHEAD)
        }
        TransportProtocol::Unknown => DEFAULT_MTU.saturating_sub(UDP_OVERHEAD),
    }
}

/// Draw a padding length uniform in `[0, MAX_PADDING)`.
pub fn padding_len() -> u8 {
    OsRng.gen_range(0..MAX_PADDING)
}

/// Padding budget left in a datagram after `payload_len` payload bytes,
/// keeping the whole datagram within the path MTU. Padding beyond this
/// would truncate on receive.
pub fn max_padding(mtu: usize, ipv: IpVersion, payload_len: usize) -> usize {
    max_fragment_size(mtu, ipv, TransportProtocol::Udp).saturating_sub(payload_len)
}

/// Fill a padding buffer from the cryptographic RNG. Padding must be
/// indistinguishable from ciphertext.
pub fn padding(len: u8) -> Vec<u8> {
    let mut buf = vec![0u8; len as usize];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// A unit of metadata plus payload exchanged between peers, with the
/// transmission bookkeeping the reliability loops maintain.
#[derive(Debug, Clone)]
pub struct Segment {
    pub metadata: Metadata,
    pub payload: Vec<u8>,
    /// Times this segment has been written to the wire.
    pub tx_count: u32,
    /// Last write time; `None` until first transmission.
    pub last_tx: Option<Instant>,
}

impl Segment {
    pub fn new(metadata: Metadata, payload: Vec<u8>) -> Self {
        Self {
            metadata,
            payload,
            tx_count: 0,
            last_tx: None,
        }
    }

    pub fn seq(&self) -> u32 {
        self.metadata.seq()
    }

    pub fn protocol(&self) -> u8 {
        self.metadata.protocol()
    }

    pub fn session_id(&self) -> Option<u32> {
        self.metadata.session_id()
    }

    pub fn mark_transmitted(&mut self, now: Instant) {
        self.tx_count += 1;
        self.last_tx = Some(now);
    }
}

/// Split `data` into data segments of at most `fragment_size` bytes,
/// numbering them from `first_seq`. Empty input produces one empty segment
/// so pure control writes still consume a sequence number.
pub fn fragment(
    session_id: u32,
    first_seq: u32,
    fragment_size: usize,
    data: &[u8],
) -> Vec<Segment> {
    let fragment_size = fragment_size.max(1);
    let chunks: Vec<&[u8]> = if data.is_empty() {
        vec![&[]]
    } else {
        data.chunks(fragment_size).collect()
    };

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            Segment::new(
                Metadata::DataAck(DataAckMetadata {
                    protocol: DATA,
                    session_id,
                    seq: first_seq.wrapping_add(i as u32),
                    un_ack_seq: 0,
                    window_size: 0,
                    prefix_len: 0,
                    payload_len: chunk.len() as u16,
                    suffix_len: 0,
                }),
                chunk.to_vec(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_overhead() {
        assert_eq!(UDP_OVERHEAD, 12 + 32 + 32);
    }

    #[test]
    fn test_fragment_size_math() {
        assert_eq!(
            max_fragment_size(1500, IpVersion::V4, TransportProtocol::Udp),
            1472 - UDP_OVERHEAD
        );
        assert_eq!(
            max_fragment_size(1500, IpVersion::V6, TransportProtocol::Udp),
            1452 - UDP_OVERHEAD
        );
        assert_eq!(
            max_fragment_size(1500, IpVersion::Unknown, TransportProtocol::Unknown),
            1440 - UDP_OVERHEAD
        );
        assert_eq!(
            max_fragment_size(1500, IpVersion::V4, TransportProtocol::Tcp),
            MAX_PDU
        );
    }

    #[test]
    fn test_padding_bounds() {
        for _ in 0..64 {
            let len = padding_len();
            assert!(len < MAX_PADDING);
            assert_eq!(padding(len).len(), len as usize);
        }
    }

    #[test]
    fn test_max_padding_budget() {
        let fragment = max_fragment_size(1500, IpVersion::V4, TransportProtocol::Udp);
        assert_eq!(max_padding(1500, IpVersion::V4, 0), fragment);
        assert_eq!(max_padding(1500, IpVersion::V4, fragment), 0);
        assert_eq!(max_padding(1500, IpVersion::V4, fragment + 100), 0);
        assert_eq!(max_padding(1500, IpVersion::V4, fragment - 40), 40);
    }

    #[test]
    fn test_fragment_numbering() {
        let segments = fragment(9, 100, 10, &[0u8; 35]);
        assert_eq!(segments.len(), 4);
        let seqs: Vec<u32> = segments.iter().map(|s| s.seq()).collect();
        assert_eq!(seqs, vec![100, 101, 102, 103]);
        assert_eq!(segments[0].payload.len(), 10);
        assert_eq!(segments[3].payload.len(), 5);
    }

    #[test]
    fn test_fragment_empty_input() {
        let segments = fragment(9, 5, 10, &[]);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].payload.is_empty());
        assert_eq!(segments[0].seq(), 5);
    }

    #[test]
    fn test_fragment_seq_wraparound() {
        let segments = fragment(9, u32::MAX, 4, &[0u8; 8]);
        let seqs: Vec<u32> = segments.iter().map(|s| s.seq()).collect();
        assert_eq!(seqs, vec![u32::MAX, 0]);
    }
}
