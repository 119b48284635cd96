//! Logical bidirectional streams multiplexed over one underlay.
//!
//! Each session runs two loops: the input loop consumes segments the
//! underlay demultiplexed onto the session's receive channel (handshake,
//! data, acks, close), and the output loop drains the send queue with a
//! simple windowed retransmission scheme. The session holds a non-owning
//! transport handle for writes; the underlay owns session lifetime through
//! its map.

use crate::net::metadata::{
    seq_before, DataAckMetadata, Metadata, SessionMetadata, ACK, CLOSE_SESSION_REQUEST,
    CLOSE_SESSION_RESPONSE, DATA, OPEN_SESSION_REQUEST, OPEN_SESSION_RESPONSE,
};
use crate::net::segment::{fragment, max_fragment_size, Segment, TransportProtocol};
use crate::net::tree::SegmentTree;
use crate::net::udp::UdpTransport;
use crate::net::underlay::TransportError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Capacity of the send queue and the ordered receive buffer.
const QUEUE_CAPACITY: usize = 256;

/// Segments in flight before the peer advertises a window.
const DEFAULT_WINDOW: u16 = 64;

/// Unacked segments are retransmitted after this long.
const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(200);

/// A segment retransmitted this many times abandons the session.
const MAX_TRANSMIT_COUNT: u32 = 20;

/// Output loop pacing when idle.
const OUTPUT_TICK: Duration = Duration::from_millis(20);

/// Segments written per output-loop pass.
const MAX_BURST: usize = 32;

/// How long the close initiator waits for the close response.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on how long the input loop may stall on a full receive buffer
/// before dropping a segment. Keeps the loop responsive to close segments
/// queued behind the stall.
const RECV_INSERT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Pending,
    Established,
    Closing,
    Closed,
}

/// One logical stream, identified by a non-zero 32-bit id.
pub struct Session {
    id: u32,
    is_client: bool,
    mtu: usize,
    peer_addr: SocketAddr,
    transport: Arc<UdpTransport>,

    state: Mutex<SessionState>,
    /// Outgoing segments waiting to be sent or acknowledged.
    send_queue: SegmentTree,
    /// Received data segments awaiting in-order delivery to the reader.
    recv_buf: SegmentTree,

    /// Next sequence number to assign to an outgoing segment.
    next_send_seq: AtomicU32,
    /// Next in-order sequence number expected from the peer.
    next_recv_seq: AtomicU32,
    /// Peer-advertised receive window, in segments.
    peer_window: AtomicU32,
    /// Receive state advanced with nothing to piggyback on.
    ack_needed: AtomicBool,

    output_kick: tokio::sync::Notify,
    ready: CancellationToken,
    done: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub(crate) fn new(
        id: u32,
        is_client: bool,
        mtu: usize,
        transport: Arc<UdpTransport>,
        peer_addr: SocketAddr,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            is_client,
            mtu,
            peer_addr,
            transport,
            state: Mutex::new(SessionState::Pending),
            send_queue: SegmentTree::new(QUEUE_CAPACITY),
            recv_buf: SegmentTree::new(QUEUE_CAPACITY),
            next_send_seq: AtomicU32::new(0),
            next_recv_seq: AtomicU32::new(0),
            peer_window: AtomicU32::new(DEFAULT_WINDOW as u32),
            ack_needed: AtomicBool::new(false),
            output_kick: tokio::sync::Notify::new(),
            ready: CancellationToken::new(),
            done: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_established(&self) -> bool {
        matches!(*self.lock_state(), SessionState::Established)
    }

    /// Resolves once the session is bound and the open handshake completed.
    pub async fn ready(&self) {
        self.ready.cancelled().await;
    }

    pub(crate) fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Spawn the input and output loops. Called once when the session is
    /// added to an underlay.
    pub(crate) fn start(self: &Arc<Self>, recv_rx: mpsc::Receiver<Segment>) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.push(tokio::spawn(self.clone().input_loop(recv_rx)));
        handles.push(tokio::spawn(self.clone().output_loop()));
    }

    /// Await completion of both loops. The close-handshake join point.
    pub async fn wait_loops(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Queue `data` for reliable delivery, fragmenting to the path MTU.
    /// Blocks when the send queue is full.
    pub async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        match *self.lock_state() {
            SessionState::Closing | SessionState::Closed => {
                return Err(TransportError::Closed);
            }
            _ => {}
        }

        if data.is_empty() {
            return Ok(());
        }
        let fragment_size = max_fragment_size(
            self.mtu,
            self.transport.ip_version(),
            TransportProtocol::Udp,
        )
        .max(1);
        let count = data.len().div_ceil(fragment_size) as u32;
        let first_seq = self.next_send_seq.fetch_add(count, Ordering::SeqCst);
        for segment in fragment(self.id, first_seq, fragment_size, data) {
            tokio::select! {
                _ = self.done.cancelled() => return Err(TransportError::Closed),
                _ = self.send_queue.insert_blocking(segment) => {}
            }
        }
        self.output_kick.notify_waiters();
        Ok(())
    }

    /// Return the next in-order payload. Blocks until it arrives; returns
    /// [`TransportError::Closed`] once the session is done and drained.
    pub async fn read(&self) -> Result<Vec<u8>, TransportError> {
        loop {
            let notified = self.recv_buf.changed();
            let expected = self.next_recv_seq.load(Ordering::SeqCst);
            if let Some(segment) = self
                .recv_buf
                .delete_min_if(|s| !seq_before(expected, s.seq()))
            {
                if segment.seq() == expected {
                    self.next_recv_seq
                        .store(expected.wrapping_add(1), Ordering::SeqCst);
                    self.ack_needed.store(true, Ordering::SeqCst);
                    self.output_kick.notify_waiters();
                    return Ok(segment.payload);
                }
                // Stale duplicate below the delivery point.
                continue;
            }
            if self.done.is_cancelled() {
                return Err(TransportError::Closed);
            }
            tokio::select! {
                _ = notified => {}
                _ = self.done.cancelled() => {}
            }
        }
    }

    /// Initiate the close handshake and wait for it to finish (bounded).
    pub async fn close(&self) -> Result<(), TransportError> {
        {
            let mut state = self.lock_state();
            match *state {
                SessionState::Closing | SessionState::Closed => return Ok(()),
                _ => *state = SessionState::Closing,
            }
        }
        let seq = self.next_send_seq.fetch_add(1, Ordering::SeqCst);
        let metadata = Metadata::Session(SessionMetadata {
            protocol: CLOSE_SESSION_REQUEST,
            session_id: self.id,
            seq,
            status_code: 0,
            payload_len: 0,
            suffix_len: 0,
        });
        self.transport
            .write_one_segment(&Segment::new(metadata, Vec::new()), self.peer_addr)
            .await?;

        if tokio::time::timeout(CLOSE_TIMEOUT, self.done.cancelled())
            .await
            .is_err()
        {
            debug!("session {}: close response timed out", self.id);
            self.done.cancel();
        }
        Ok(())
    }

    /// Send the open-session request (client side). Consumes seq 0 of the
    /// client-to-server stream; an early payload rides along.
    pub(crate) async fn send_open_request(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.next_send_seq.store(1, Ordering::SeqCst);
        let metadata = Metadata::Session(SessionMetadata {
            protocol: OPEN_SESSION_REQUEST,
            session_id: self.id,
            seq: 0,
            status_code: 0,
            payload_len: payload.len() as u16,
            suffix_len: 0,
        });
        self.transport
            .write_one_segment(&Segment::new(metadata, payload), self.peer_addr)
            .await
    }

    // ------------------------------------------------------------------
    // Input loop
    // ------------------------------------------------------------------

    async fn input_loop(self: Arc<Self>, mut recv_rx: mpsc::Receiver<Segment>) {
        loop {
            tokio::select! {
                _ = self.done.cancelled() => break,
                segment = recv_rx.recv() => match segment {
                    None => break,
                    Some(segment) => {
                        if self.handle_segment(segment).await {
                            break;
                        }
                    }
                },
            }
        }
        *self.lock_state() = SessionState::Closed;
    }

    /// Returns true when the loop should exit.
    async fn handle_segment(&self, segment: Segment) -> bool {
        match segment.metadata {
            Metadata::Session(meta) => self.handle_session_segment(meta, segment.payload).await,
            Metadata::DataAck(meta) => {
                self.handle_data_ack_segment(meta, segment.payload).await
            }
            Metadata::CloseConn(_) => {
                // Underlay-level teardown; the underlay cancels sessions
                // directly, so a stray one here just ends the loop.
                self.done.cancel();
                true
            }
        }
    }

    async fn handle_session_segment(&self, meta: SessionMetadata, payload: Vec<u8>) -> bool {
        match meta.protocol {
            OPEN_SESSION_REQUEST => {
                if *self.lock_state() != SessionState::Pending {
                    debug!("session {}: duplicate open request", self.id);
                    return false;
                }
                self.accept_handshake_payload(meta.seq, payload);
                let seq = self.next_send_seq.fetch_add(1, Ordering::SeqCst);
                let response = Metadata::Session(SessionMetadata {
                    protocol: OPEN_SESSION_RESPONSE,
                    session_id: self.id,
                    seq,
                    status_code: 0,
                    payload_len: 0,
                    suffix_len: 0,
                });
                if let Err(e) = self
                    .transport
                    .write_one_segment(&Segment::new(response, Vec::new()), self.peer_addr)
                    .await
                {
                    warn!("session {}: open response failed: {}", self.id, e);
                }
                self.establish();
                false
            }
            OPEN_SESSION_RESPONSE => {
                if *self.lock_state() == SessionState::Pending {
                    self.accept_handshake_payload(meta.seq, payload);
                    self.establish();
                }
                false
            }
            CLOSE_SESSION_REQUEST => {
                debug!("session {}: close requested by peer", self.id);
                self.deliver_data_segment(meta.seq, payload).await;
                let seq = self.next_send_seq.fetch_add(1, Ordering::SeqCst);
                let response = Metadata::Session(SessionMetadata {
                    protocol: CLOSE_SESSION_RESPONSE,
                    session_id: self.id,
                    seq,
                    status_code: 0,
                    payload_len: 0,
                    suffix_len: 0,
                });
                if let Err(e) = self
                    .transport
                    .write_one_segment(&Segment::new(response, Vec::new()), self.peer_addr)
                    .await
                {
                    debug!("session {}: close response failed: {}", self.id, e);
                }
                self.done.cancel();
                true
            }
            CLOSE_SESSION_RESPONSE => {
                self.done.cancel();
                true
            }
            other => {
                // is_session_protocol admits exactly the four values above.
                warn!("session {}: unexpected session protocol {}", self.id, other);
                false
            }
        }
    }

    async fn handle_data_ack_segment(&self, meta: DataAckMetadata, payload: Vec<u8>) -> bool {
        self.purge_acked(meta.un_ack_seq);
        self.peer_window
            .store(meta.window_size.max(1) as u32, Ordering::SeqCst);

        if meta.protocol == DATA {
            self.deliver_data_segment(meta.seq, payload).await;
            self.ack_needed.store(true, Ordering::SeqCst);
        }
        self.output_kick.notify_waiters();
        false
    }

    /// Insert a received data payload into the ordered receive buffer,
    /// dropping stale duplicates.
    async fn deliver_data_segment(&self, seq: u32, payload: Vec<u8>) {
        if payload.is_empty() {
            // An empty fragment still consumes its sequence number, or the
            // sender would retransmit it forever.
            let expected = self.next_recv_seq.load(Ordering::SeqCst);
            if seq == expected {
                self.next_recv_seq
                    .store(seq.wrapping_add(1), Ordering::SeqCst);
            }
            return;
        }
        let expected = self.next_recv_seq.load(Ordering::SeqCst);
        if seq_before(seq, expected) || self.recv_buf.contains(seq) {
            return;
        }
        let segment = Segment::new(
            Metadata::DataAck(DataAckMetadata {
                protocol: DATA,
                session_id: self.id,
                seq,
                un_ack_seq: 0,
                window_size: 0,
                prefix_len: 0,
                payload_len: payload.len() as u16,
                suffix_len: 0,
            }),
            payload,
        );
        tokio::select! {
            _ = self.done.cancelled() => {}
            _ = self.recv_buf.insert_blocking(segment) => {}
            _ = tokio::time::sleep(RECV_INSERT_TIMEOUT) => {
                debug!("session {}: receive buffer stalled, dropping seq {}", self.id, seq);
            }
        }
    }

    fn accept_handshake_payload(&self, seq: u32, payload: Vec<u8>) {
        if payload.is_empty() {
            self.next_recv_seq
                .store(seq.wrapping_add(1), Ordering::SeqCst);
        } else {
            self.next_recv_seq.store(seq, Ordering::SeqCst);
            let segment = Segment::new(
                Metadata::DataAck(DataAckMetadata {
                    protocol: DATA,
                    session_id: self.id,
                    seq,
                    un_ack_seq: 0,
                    window_size: 0,
                    prefix_len: 0,
                    payload_len: payload.len() as u16,
                    suffix_len: 0,
                }),
                payload,
            );
            if self.recv_buf.insert(segment).is_err() {
                warn!("session {}: receive buffer full at handshake", self.id);
            }
        }
    }

    fn establish(&self) {
        *self.lock_state() = SessionState::Established;
        self.ready.cancel();
        debug!(
            "session {} established ({})",
            self.id,
            if self.is_client { "client" } else { "server" }
        );
    }

    fn purge_acked(&self, un_ack_seq: u32) {
        while self
            .send_queue
            .delete_min_if(|s| seq_before(s.seq(), un_ack_seq))
            .is_some()
        {}
    }

    // ------------------------------------------------------------------
    // Output loop
    // ------------------------------------------------------------------

    async fn output_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(OUTPUT_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.done.cancelled() => break,
                _ = tick.tick() => {}
                _ = self.output_kick.notified() => {}
            }
            self.flush().await;
        }
    }

    async fn flush(&self) {
        let now = Instant::now();
        let un_ack_seq = self.next_recv_seq.load(Ordering::SeqCst);
        let window = self.peer_window.load(Ordering::SeqCst) as usize;
        let my_window = self.recv_buf.remaining().min(u16::MAX as usize) as u16;

        let mut in_flight = 0usize;
        self.send_queue.ascend(|s| {
            if s.tx_count > 0 {
                in_flight += 1;
            }
            true
        });

        let mut to_send: Vec<Segment> = Vec::new();
        let mut exhausted = false;
        self.send_queue.ascend_mut(|s| {
            if s.tx_count >= MAX_TRANSMIT_COUNT {
                exhausted = true;
                return false;
            }
            let due = match s.last_tx {
                None => {
                    if in_flight >= window {
                        return false;
                    }
                    in_flight += 1;
                    true
                }
                Some(t) => now.duration_since(t) >= RETRANSMIT_INTERVAL,
            };
            if due {
                if let Metadata::DataAck(ref mut m) = s.metadata {
                    m.un_ack_seq = un_ack_seq;
                    m.window_size = my_window;
                }
                s.mark_transmitted(now);
                to_send.push(s.clone());
            }
            to_send.len() < MAX_BURST
        });

        if exhausted {
            warn!("session {}: retransmission limit reached, giving up", self.id);
            self.done.cancel();
            return;
        }

        for segment in &to_send {
            if let Err(e) = self
                .transport
                .write_one_segment(segment, self.peer_addr)
                .await
            {
                debug!("session {}: send failed: {}", self.id, e);
                return;
            }
        }

        if to_send.is_empty() {
            if self.ack_needed.swap(false, Ordering::SeqCst) {
                let ack = Metadata::DataAck(DataAckMetadata {
                    protocol: ACK,
                    session_id: self.id,
                    seq: self.next_send_seq.load(Ordering::SeqCst),
                    un_ack_seq,
                    window_size: my_window,
                    prefix_len: 0,
                    payload_len: 0,
                    suffix_len: 0,
                });
                if let Err(e) = self
                    .transport
                    .write_one_segment(&Segment::new(ack, Vec::new()), self.peer_addr)
                    .await
                {
                    debug!("session {}: ack failed: {}", self.id, e);
                }
            }
        } else {
            // Receive state rode along on the data segments.
            self.ack_needed.store(false, Ordering::SeqCst);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
