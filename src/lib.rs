pub mod client;
pub mod crypto;
pub mod metrics;
pub mod net;
pub mod replay;

pub use client::{Client, ClientConfig, ClientError, UserProfile};
pub use crypto::{
    derive_key, trial_decrypt, BlockCipher, CryptoError, KEY_SIZE, NONCE_SIZE, TAG_SIZE,
};
pub use metrics::{MetricsSnapshot, UnderlayMetrics};
pub use net::{
    max_fragment_size, IpVersion, Metadata, Segment, SegmentTree, Session, TransportError,
    TransportProtocol, TreeError, UdpUnderlay, Underlay, MAX_PDU, METADATA_LEN, UDP_OVERHEAD,
};
pub use replay::ReplayCache;
