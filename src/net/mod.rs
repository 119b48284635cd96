//! Datagram underlay networking layer

pub mod metadata;
pub mod segment;
pub mod session;
pub mod tree;
pub mod udp;
pub mod underlay;

// Re-exports
pub use metadata::{
    is_close_conn_protocol, is_data_ack_protocol, is_session_protocol, seq_before,
    CloseConnMetadata, CodecError, DataAckMetadata, Metadata, SessionMetadata, ACK,
    CLOSE_CONN, CLOSE_SESSION_REQUEST, CLOSE_SESSION_RESPONSE, DATA, METADATA_LEN,
    OPEN_SESSION_REQUEST, OPEN_SESSION_RESPONSE, RESERVED_SESSION_ID,
};
pub use segment::{
    max_fragment_size, IpVersion, Segment, TransportProtocol, MAX_PDU, UDP_OVERHEAD,
};
pub use session::Session;
pub use tree::{SegmentTree, TreeError};
pub use udp::UdpUnderlay;
pub use underlay::{TransportError, Underlay, READY_SESSIONS_CAPACITY, RECV_CHAN_CAPACITY};
