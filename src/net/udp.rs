//! UDP underlay: the packet pump.
//!
//! One socket carries every session. Outbound segments are sealed into
//! datagrams with encrypted metadata and random padding; inbound datagrams
//! are authenticated (trial-decrypting against the candidate set until a
//! peer cipher is bound), replay-checked, parsed, and demultiplexed to the
//! owning session's receive channel.
//!
//! Wire image of a datagram:
//!
//! ```text
//! nonce | Enc(metadata)+tag | [prefix_pad] | Enc(payload)+tag | suffix_pad
//! ```
//!
//! The payload block is always present (possibly sealing an empty payload,
//! leaving just its tag), so the shortest valid datagram is exactly
//! `UDP_OVERHEAD` bytes and the length identity
//! `prefix + payload_len + tag + suffix == remaining` holds uniformly.
//! Only data/ack segments carry prefix padding.

use crate::crypto::{
    payload_nonce, trial_decrypt_with_nonce, BlockCipher, NONCE_SIZE, TAG_SIZE,
};
use crate::metrics::{bump, UnderlayMetrics};
use crate::net::metadata::{
    Metadata, ACK, CLOSE_CONN, CLOSE_SESSION_REQUEST, CLOSE_SESSION_RESPONSE, DATA,
    METADATA_LEN, OPEN_SESSION_REQUEST, OPEN_SESSION_RESPONSE, RESERVED_SESSION_ID,
};
use crate::net::segment::{
    max_padding, padding, padding_len, IpVersion, Segment, TransportProtocol,
};
use crate::net::session::Session;
use crate::net::underlay::{
    SessionEntry, TransportError, Underlay, UnderlayCore, RECV_CHAN_CAPACITY,
};
use crate::replay::ReplayCache;
use rand::rngs::OsRng;
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Offset of the encrypted metadata block within a datagram.
const METADATA_OFFSET: usize = NONCE_SIZE;
/// Offset of the first byte after the encrypted metadata block.
const BODY_OFFSET: usize = NONCE_SIZE + METADATA_LEN + TAG_SIZE;

/// The send half of the underlay, shared with sessions as a non-owning
/// handle. Sessions write through it; the underlay owns session lifetime.
pub struct UdpTransport {
    socket: UdpSocket,
    mtu: usize,
    /// The configured server address. `Some` on the client role.
    remote_addr: Option<SocketAddr>,
    /// Cipher bound to the peer once authentication succeeds.
    block: Mutex<Option<BlockCipher>>,
    /// Server: all configured users' derived ciphers. Client: exactly one.
    candidates: Vec<BlockCipher>,
    /// Serializes datagram writes. No partial or interleaved sends.
    send_lock: tokio::sync::Mutex<()>,
    pub(crate) metrics: UnderlayMetrics,
}

impl UdpTransport {
    pub fn is_client(&self) -> bool {
        self.remote_addr.is_some()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn ip_version(&self) -> IpVersion {
        match self.socket.local_addr() {
            Ok(addr) if addr.is_ipv4() => IpVersion::V4,
            Ok(_) => IpVersion::V6,
            Err(_) => IpVersion::Unknown,
        }
    }

    fn bound_block(&self) -> Option<BlockCipher> {
        self.lock_block().clone()
    }

    /// Bind the peer cipher. First writer wins; later calls are no-ops.
    fn bind_block(&self, cipher: BlockCipher) {
        let mut block = self.lock_block();
        if block.is_none() {
            debug!("bound peer cipher {}", cipher.fingerprint());
            *block = Some(cipher);
        }
    }

    /// Cipher for the send path. The client binds lazily from its sole
    /// candidate; the server must have authenticated a datagram first.
    fn send_block(&self) -> Result<BlockCipher, TransportError> {
        if let Some(block) = self.bound_block() {
            return Ok(block);
        }
        if self.is_client() {
            let block = self.candidates[0].clone();
            self.bind_block(block.clone());
            return Ok(block);
        }
        Err(TransportError::InvalidOperation(
            "server cipher not established before write".into(),
        ))
    }

    /// Seal and send one segment. Serialized by the send lock; all
    /// per-packet nonces are fresh; padding is stamped per transmission.
    pub(crate) async fn write_one_segment(
        &self,
        segment: &Segment,
        dst: SocketAddr,
    ) -> Result<(), TransportError> {
        if let Some(remote) = self.remote_addr {
            if dst != remote {
                return Err(TransportError::InvalidArgument(format!(
                    "client write to {} but server is {}",
                    dst, remote
                )));
            }
        }
        let block = self.send_block()?;

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        // Padding is clamped so the datagram never exceeds the path MTU;
        // an oversized datagram truncates on receive and fails the length
        // identity there.
        let mut budget = max_padding(self.mtu, self.ip_version(), segment.payload.len());
        let suffix_len = (padding_len() as usize).min(budget) as u8;
        budget -= suffix_len as usize;

        let mut metadata = segment.metadata;
        let prefix_len = match metadata {
            Metadata::Session(ref mut m) => {
                m.payload_len = segment.payload.len() as u16;
                m.suffix_len = suffix_len;
                0
            }
            Metadata::DataAck(ref mut m) => {
                m.payload_len = segment.payload.len() as u16;
                m.suffix_len = suffix_len;
                m.prefix_len = (padding_len() as usize).min(budget) as u8;
                m.prefix_len
            }
            Metadata::CloseConn(ref mut m) => {
                m.suffix_len = suffix_len;
                0
            }
        };

        let sealed_metadata = block.encrypt_with_nonce(&nonce, &metadata.marshal())?;
        let sealed_payload =
            block.encrypt_with_nonce(&payload_nonce(&nonce), &segment.payload)?;

        let mut datagram = Vec::with_capacity(
            NONCE_SIZE
                + sealed_metadata.len()
                + prefix_len as usize
                + sealed_payload.len()
                + suffix_len as usize,
        );
        datagram.extend_from_slice(&nonce);
        datagram.extend_from_slice(&sealed_metadata);
        datagram.extend_from_slice(&padding(prefix_len));
        datagram.extend_from_slice(&sealed_payload);
        datagram.extend_from_slice(&padding(suffix_len));

        {
            let _guard = self.send_lock.lock().await;
            self.socket.send_to(&datagram, dst).await?;
        }
        bump(&self.metrics.datagrams_sent);
        Ok(())
    }

    fn lock_block(&self) -> std::sync::MutexGuard<'_, Option<BlockCipher>> {
        self.block.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The UDP underlay: socket owner, demultiplexer, session-table keeper.
pub struct UdpUnderlay {
    core: UnderlayCore,
    transport: Arc<UdpTransport>,
    replay: Arc<ReplayCache>,
}

impl UdpUnderlay {
    /// Create an underlay bound to `laddr` (or an unspecified local
    /// address). A set `raddr` makes this a client underlay targeting that
    /// server; clients carry exactly one candidate cipher.
    pub async fn new(
        network: &str,
        laddr: Option<SocketAddr>,
        raddr: Option<SocketAddr>,
        mtu: usize,
        candidates: Vec<BlockCipher>,
        replay: Arc<ReplayCache>,
    ) -> Result<Arc<Self>, TransportError> {
        if !matches!(network, "udp" | "udp4" | "udp6") {
            return Err(TransportError::UnsupportedNetwork(network.to_string()));
        }
        if candidates.is_empty() {
            return Err(TransportError::InvalidArgument(
                "at least one candidate cipher is required".into(),
            ));
        }
        let is_client = raddr.is_some();
        if is_client && candidates.len() != 1 {
            return Err(TransportError::InvalidArgument(format!(
                "client underlay wants exactly one candidate cipher, got {}",
                candidates.len()
            )));
        }

        let bind_addr = laddr.unwrap_or_else(|| match network {
            "udp6" => "[::]:0".parse().unwrap(),
            _ => "0.0.0.0:0".parse().unwrap(),
        });
        let socket = UdpSocket::bind(bind_addr).await?;
        info!(
            "udp underlay listening on {} ({})",
            socket.local_addr()?,
            if is_client { "client" } else { "server" }
        );

        Ok(Arc::new(Self {
            core: UnderlayCore::new(is_client, mtu),
            transport: Arc::new(UdpTransport {
                socket,
                mtu,
                remote_addr: raddr,
                block: Mutex::new(None),
                candidates,
                send_lock: tokio::sync::Mutex::new(()),
                metrics: UnderlayMetrics::new(),
            }),
            replay,
        }))
    }

    pub fn metrics(&self) -> &UnderlayMetrics {
        &self.transport.metrics
    }

    pub fn mtu(&self) -> usize {
        self.core.mtu
    }

    pub fn session_count(&self) -> usize {
        self.core.session_count()
    }

    /// Pop the next server-side session that completed its open handshake.
    pub async fn accept(&self) -> Result<Arc<Session>, TransportError> {
        let mut ready_rx = self.core.ready_rx.lock().await;
        tokio::select! {
            _ = self.core.done.cancelled() => Err(TransportError::Closed),
            session = ready_rx.recv() => session.ok_or(TransportError::Closed),
        }
    }

    /// Client path: register a fresh session and send its open request.
    /// `payload` rides along for early delivery.
    pub async fn open_session(
        &self,
        session_id: u32,
        payload: Vec<u8>,
    ) -> Result<Arc<Session>, TransportError> {
        if !self.core.is_client {
            return Err(TransportError::InvalidOperation(
                "open_session on a server underlay".into(),
            ));
        }
        let remote = self
            .transport
            .remote_addr
            .ok_or_else(|| TransportError::InvalidArgument("no remote address".into()))?;
        let session = Session::new(session_id, true, self.core.mtu, self.transport.clone(), remote);
        self.add_session(session.clone())?;
        if let Err(e) = session.send_open_request(payload).await {
            session.done_token().cancel();
            session.wait_loops().await;
            let _ = self.remove_session(session_id);
            return Err(e);
        }
        Ok(session)
    }

    /// Run the demultiplex loop until cancellation, close, or a terminal
    /// error. Any exit path cancels the remaining sessions so their loops
    /// wind down; nothing leaks.
    pub async fn run_event_loop(&self, ctx: CancellationToken) -> Result<(), TransportError> {
        let result = self.event_loop(ctx).await;
        let sessions: Vec<Arc<Session>> = self
            .core
            .lock_sessions()
            .values()
            .map(|e| e.session.clone())
            .collect();
        for session in sessions {
            session.done_token().cancel();
        }
        result
    }

    async fn event_loop(&self, ctx: CancellationToken) -> Result<(), TransportError> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = self.core.done.cancelled() => return Ok(()),
                result = self.read_one_segment() => {
                    let (segment, addr) = result?;
                    self.dispatch(segment, addr).await?;
                }
            }
        }
    }

    /// Read datagrams until one yields a valid segment. Transient problems
    /// (unsolicited source, short datagram, failed authentication) are
    /// counted and retried; replays and length-identity violations are
    /// terminal.
    async fn read_one_segment(&self) -> Result<(Segment, SocketAddr), TransportError> {
        let mut buf = vec![0u8; self.core.mtu.max(BODY_OFFSET + TAG_SIZE)];
        loop {
            let (n, addr) = self.transport.socket.recv_from(&mut buf).await?;

            if self.core.is_client {
                if let Some(remote) = self.transport.remote_addr {
                    if addr != remote {
                        bump(&self.transport.metrics.unsolicited);
                        debug!("dropping datagram from unsolicited source {}", addr);
                        continue;
                    }
                }
            }
            if n < BODY_OFFSET + TAG_SIZE {
                bump(&self.transport.metrics.malformed);
                debug!("dropping short datagram from {} ({} bytes)", addr, n);
                continue;
            }
            let packet = &buf[..n];

            let fingerprint = &packet[METADATA_OFFSET..METADATA_OFFSET + TAG_SIZE];
            if self.replay.is_duplicate(fingerprint, addr) {
                bump(&self.transport.metrics.replay_new_session);
                warn!("possible replay attack from {}", addr);
                return Err(TransportError::Replay(addr));
            }

            let mut nonce = [0u8; NONCE_SIZE];
            nonce.copy_from_slice(&packet[..NONCE_SIZE]);
            let sealed_metadata = &packet[METADATA_OFFSET..BODY_OFFSET];

            let (block, metadata_plain) = match self.transport.bound_block() {
                Some(block) => match block.decrypt_with_nonce(&nonce, sealed_metadata) {
                    Ok(plain) => (block, plain),
                    Err(_) => {
                        bump(&self.transport.metrics.malformed);
                        debug!("metadata authentication failed from {}", addr);
                        continue;
                    }
                },
                None if self.core.is_client => {
                    let block = self.transport.candidates[0].clone();
                    match block.decrypt_with_nonce(&nonce, sealed_metadata) {
                        Ok(plain) => {
                            self.transport.bind_block(block.clone());
                            (block, plain)
                        }
                        Err(_) => {
                            bump(&self.transport.metrics.malformed);
                            continue;
                        }
                    }
                }
                None => {
                    match trial_decrypt_with_nonce(
                        &self.transport.candidates,
                        &nonce,
                        sealed_metadata,
                    ) {
                        Ok((block, plain)) => {
                            self.transport.bind_block(block.clone());
                            (block, plain)
                        }
                        Err(_) => {
                            bump(&self.transport.metrics.malformed);
                            debug!("no candidate cipher authenticated {}", addr);
                            continue;
                        }
                    }
                }
            };

            let metadata = match Metadata::unmarshal(&metadata_plain) {
                Ok(metadata) => metadata,
                Err(e) => {
                    // Authenticated but unparseable: a peer speaking a newer
                    // dialect. Skip it.
                    bump(&self.transport.metrics.malformed);
                    debug!("undecodable metadata from {}: {}", addr, e);
                    continue;
                }
            };

            let body = &packet[BODY_OFFSET..];
            let prefix_len = metadata.prefix_len() as usize;
            let payload_len = metadata.payload_len() as usize;
            let suffix_len = metadata.suffix_len() as usize;
            let expected = prefix_len + payload_len + TAG_SIZE + suffix_len;
            if expected != body.len() {
                return Err(TransportError::LengthMismatch {
                    expected,
                    actual: body.len(),
                });
            }

            let sealed_payload = &body[prefix_len..prefix_len + payload_len + TAG_SIZE];
            let payload =
                match block.decrypt_with_nonce(&payload_nonce(&nonce), sealed_payload) {
                    Ok(payload) => payload,
                    Err(_) => {
                        bump(&self.transport.metrics.malformed);
                        debug!("payload authentication failed from {}", addr);
                        continue;
                    }
                };

            bump(&self.transport.metrics.segments_received);
            return Ok((Segment::new(metadata, payload), addr));
        }
    }

    async fn dispatch(&self, segment: Segment, addr: SocketAddr) -> Result<(), TransportError> {
        match segment.protocol() {
            OPEN_SESSION_REQUEST => self.handle_open_session_request(segment, addr).await,
            OPEN_SESSION_RESPONSE => self.handle_open_session_response(segment).await,
            CLOSE_SESSION_REQUEST | CLOSE_SESSION_RESPONSE => {
                self.handle_close_session(segment).await
            }
            DATA | ACK => {
                self.deliver_data_ack(segment);
                Ok(())
            }
            CLOSE_CONN => self.handle_close_conn().await,
            other => {
                // Unknown protocols are ignored for forward compatibility.
                debug!("ignoring protocol {} from {}", other, addr);
                Ok(())
            }
        }
    }

    async fn handle_open_session_request(
        &self,
        segment: Segment,
        addr: SocketAddr,
    ) -> Result<(), TransportError> {
        if self.core.is_client {
            return Err(TransportError::InvalidOperation(
                "open-session-request received on a client underlay".into(),
            ));
        }
        let session_id = segment
            .session_id()
            .ok_or(TransportError::ReservedSessionId)?;
        if session_id == RESERVED_SESSION_ID {
            return Err(TransportError::ReservedSessionId);
        }
        if self.core.lock_sessions().contains_key(&session_id) {
            debug!("duplicate open-session-request for {}, dropping", session_id);
            return Ok(());
        }

        let session = Session::new(
            session_id,
            false,
            self.core.mtu,
            self.transport.clone(),
            addr,
        );
        self.add_session(session.clone())?;

        // The triggering segment goes through the session's own queue so
        // the input loop performs the handshake.
        if let Some(entry) = self.core.lock_sessions().get(&session_id) {
            if entry.recv_tx.try_send(segment).is_err() {
                bump(&self.transport.metrics.recv_overflow);
            }
        }
        if self.core.ready_tx.try_send(session).is_err() {
            warn!("ready-session queue full, session {} not offered", session_id);
        }
        Ok(())
    }

    async fn handle_open_session_response(
        &self,
        segment: Segment,
    ) -> Result<(), TransportError> {
        if !self.core.is_client {
            return Err(TransportError::InvalidOperation(
                "open-session-response received on a server underlay".into(),
            ));
        }
        let session_id = segment
            .session_id()
            .ok_or(TransportError::ReservedSessionId)?;
        let delivered = {
            let sessions = self.core.lock_sessions();
            match sessions.get(&session_id) {
                Some(entry) => {
                    if entry.recv_tx.try_send(segment).is_err() {
                        bump(&self.transport.metrics.recv_overflow);
                    }
                    true
                }
                None => false,
            }
        };
        if !delivered {
            return Err(TransportError::UnknownSession(session_id));
        }
        Ok(())
    }

    async fn handle_close_session(&self, segment: Segment) -> Result<(), TransportError> {
        let session_id = match segment.session_id() {
            Some(id) => id,
            None => return Ok(()),
        };
        let (session, recv_tx) = {
            let sessions = self.core.lock_sessions();
            match sessions.get(&session_id) {
                Some(entry) => (entry.session.clone(), entry.recv_tx.clone()),
                None => {
                    bump(&self.transport.metrics.no_session);
                    debug!("close for unknown session {}", session_id);
                    return Ok(());
                }
            }
        };

        if recv_tx.try_send(segment).is_err() {
            // Input loop wedged or gone; force the loops down so the wait
            // below terminates.
            session.done_token().cancel();
        }
        session.wait_loops().await;
        // A concurrent caller (a timed-out dial, say) may have removed the
        // session already; that is not a loop-terminating condition.
        if let Err(e) = self.remove_session(session_id) {
            debug!("session {} already removed: {}", session_id, e);
        }
        Ok(())
    }

    fn deliver_data_ack(&self, segment: Segment) {
        let session_id = match segment.session_id() {
            Some(id) => id,
            None => return,
        };
        let sessions = self.core.lock_sessions();
        match sessions.get(&session_id) {
            Some(entry) => {
                if entry.recv_tx.try_send(segment).is_err() {
                    bump(&self.transport.metrics.recv_overflow);
                }
            }
            None => {
                bump(&self.transport.metrics.no_session);
                debug!("segment for unknown session {}, dropping", session_id);
            }
        }
    }

    /// Underlay-level teardown requested by the peer: cancel every session,
    /// drain their loops, and close.
    async fn handle_close_conn(&self) -> Result<(), TransportError> {
        info!("close-connection received, tearing down underlay");
        let sessions: Vec<Arc<Session>> = {
            let mut guard = self.core.lock_sessions();
            let sessions = guard.values().map(|e| e.session.clone()).collect();
            guard.clear();
            sessions
        };
        for session in sessions {
            session.done_token().cancel();
            session.wait_loops().await;
            bump(&self.transport.metrics.sessions_closed);
        }
        self.close();
        Ok(())
    }
}

impl Underlay for UdpUnderlay {
    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.transport.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport.remote_addr
    }

    fn ip_version(&self) -> IpVersion {
        self.transport.ip_version()
    }

    fn transport_protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }

    fn add_session(&self, session: Arc<Session>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let session_id = session.id();
        if session_id == RESERVED_SESSION_ID {
            return Err(TransportError::ReservedSessionId);
        }
        let (recv_tx, recv_rx) = mpsc::channel(RECV_CHAN_CAPACITY);
        {
            let mut sessions = self.core.lock_sessions();
            if sessions.contains_key(&session_id) {
                return Err(TransportError::InvalidArgument(format!(
                    "session {} already exists",
                    session_id
                )));
            }
            sessions.insert(
                session_id,
                SessionEntry {
                    session: session.clone(),
                    recv_tx,
                },
            );
        }
        session.start(recv_rx);
        bump(&self.transport.metrics.sessions_opened);
        debug!("session {} added", session_id);
        Ok(())
    }

    fn remove_session(&self, session_id: u32) -> Result<(), TransportError> {
        let (removed, now_empty) = {
            let mut sessions = self.core.lock_sessions();
            let removed = sessions.remove(&session_id).is_some();
            (removed, sessions.is_empty())
        };
        if !removed {
            return Err(TransportError::UnknownSession(session_id));
        }
        bump(&self.transport.metrics.sessions_closed);
        debug!("session {} removed", session_id);
        if now_empty {
            // Last session gone: the underlay has no further purpose.
            self.close();
        }
        Ok(())
    }

    fn close(&self) {
        if !self.core.done.is_cancelled() {
            info!("closing udp underlay");
            self.core.done.cancel();
        }
    }

    fn is_closed(&self) -> bool {
        self.core.done.is_cancelled()
    }
}
