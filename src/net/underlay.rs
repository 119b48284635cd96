//! The underlay contract and the state shared by its implementations.
//!
//! An underlay carries many logical sessions over one network endpoint.
//! The capability set is a trait; implementations (UDP here, TCP as an
//! external variant) share [`UnderlayCore`] by composition rather than
//! inheritance: the session table, MTU, role flag, done signal, and the
//! ready-session queue for the accept path.

use crate::crypto::CryptoError;
use crate::net::metadata::CodecError;
use crate::net::segment::{IpVersion, TransportProtocol};
use crate::net::session::Session;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Segments queued per session before the event loop starts dropping.
/// Sized to absorb handshake traffic: control messages must never be lost
/// to a momentarily busy input loop.
pub const RECV_CHAN_CAPACITY: usize = 64;

/// Sessions awaiting an accept call.
pub const READY_SESSIONS_CAPACITY: usize = 16;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("unsupported network {0:?}, want udp, udp4 or udp6")]
    UnsupportedNetwork(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("possible replay attack from {0}")]
    Replay(SocketAddr),

    #[error("session id 0 is reserved")]
    ReservedSessionId,

    #[error("segment length mismatch: metadata promises {expected} remaining bytes, datagram has {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("no session with id {0}")]
    UnknownSession(u32),

    #[error("underlay is closed")]
    Closed,

    #[error("dial timed out")]
    DialTimeout,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability set every underlay implementation exposes.
pub trait Underlay {
    fn local_addr(&self) -> Result<SocketAddr, TransportError>;
    fn remote_addr(&self) -> Option<SocketAddr>;
    fn ip_version(&self) -> IpVersion;
    fn transport_protocol(&self) -> TransportProtocol;

    fn add_session(&self, session: Arc<Session>) -> Result<(), TransportError>;
    fn remove_session(&self, session_id: u32) -> Result<(), TransportError>;

    /// Signal shutdown. Idempotent: the first call signals `done`;
    /// subsequent calls are no-ops.
    fn close(&self);
    fn is_closed(&self) -> bool;
}

pub(crate) struct SessionEntry {
    pub session: Arc<Session>,
    pub recv_tx: mpsc::Sender<crate::net::segment::Segment>,
}

/// Shared inner record for underlay implementations.
pub(crate) struct UnderlayCore {
    pub is_client: bool,
    pub mtu: usize,
    pub sessions: Mutex<HashMap<u32, SessionEntry>>,
    pub ready_tx: mpsc::Sender<Arc<Session>>,
    pub ready_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Session>>>,
    pub done: CancellationToken,
}

impl UnderlayCore {
    pub fn new(is_client: bool, mtu: usize) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(READY_SESSIONS_CAPACITY);
        Self {
            is_client,
            mtu,
            sessions: Mutex::new(HashMap::new()),
            ready_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
            done: CancellationToken::new(),
        }
    }

    /// Lock discipline: held only for map lookups and updates, never across
    /// blocking I/O.
    pub fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<u32, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }
}
