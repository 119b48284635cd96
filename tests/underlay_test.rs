//! UDP underlay integration tests over loopback sockets: open/close
//! round-trip, replay rejection, unsolicited-source filtering, reserved
//! session id, and role assertions.

use caligo::crypto::payload_nonce;
use caligo::net::{
    CloseConnMetadata, Metadata, SessionMetadata, TransportError, Underlay, CLOSE_CONN,
    OPEN_SESSION_REQUEST,
};
use caligo::{BlockCipher, ReplayCache, UdpUnderlay, NONCE_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const MTU: usize = 1400;

fn test_cipher() -> BlockCipher {
    BlockCipher::from_credentials("alice", "letmein")
}

async fn spawn_server(
    candidates: Vec<BlockCipher>,
) -> (Arc<UdpUnderlay>, SocketAddr, JoinHandle<Result<(), TransportError>>) {
    let underlay = UdpUnderlay::new(
        "udp4",
        Some("127.0.0.1:0".parse().unwrap()),
        None,
        MTU,
        candidates,
        Arc::new(ReplayCache::default()),
    )
    .await
    .unwrap();
    let addr = underlay.local_addr().unwrap();
    let looped = underlay.clone();
    let handle =
        tokio::spawn(async move { looped.run_event_loop(CancellationToken::new()).await });
    (underlay, addr, handle)
}

async fn spawn_client(
    server_addr: SocketAddr,
    cipher: BlockCipher,
) -> (Arc<UdpUnderlay>, JoinHandle<Result<(), TransportError>>) {
    let underlay = UdpUnderlay::new(
        "udp4",
        Some("127.0.0.1:0".parse().unwrap()),
        Some(server_addr),
        MTU,
        vec![cipher],
        Arc::new(ReplayCache::default()),
    )
    .await
    .unwrap();
    let looped = underlay.clone();
    let handle =
        tokio::spawn(async move { looped.run_event_loop(CancellationToken::new()).await });
    (underlay, handle)
}

/// Hand-seal a datagram the way the write path does, with zero padding so
/// the length identity is trivial to satisfy.
fn seal_datagram(
    cipher: &BlockCipher,
    nonce: [u8; NONCE_SIZE],
    metadata: &Metadata,
    payload: &[u8],
) -> Vec<u8> {
    let sealed_meta = cipher
        .encrypt_with_nonce(&nonce, &metadata.marshal())
        .unwrap();
    let sealed_payload = cipher
        .encrypt_with_nonce(&payload_nonce(&nonce), payload)
        .unwrap();
    let mut datagram = Vec::new();
    datagram.extend_from_slice(&nonce);
    datagram.extend_from_slice(&sealed_meta);
    datagram.extend_from_slice(&sealed_payload);
    datagram
}

fn open_request(session_id: u32) -> Metadata {
    Metadata::Session(SessionMetadata {
        protocol: OPEN_SESSION_REQUEST,
        session_id,
        seq: 0,
        status_code: 0,
        payload_len: 0,
        suffix_len: 0,
    })
}

async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn e1_open_close_round_trip() {
    let cipher = test_cipher();
    let (server, server_addr, server_loop) = spawn_server(vec![cipher.clone()]).await;
    let (client, client_loop) = spawn_client(server_addr, cipher).await;

    let session = client.open_session(7, Vec::new()).await.unwrap();
    timeout(Duration::from_secs(5), session.ready())
        .await
        .expect("client session never became ready");

    let server_session = timeout(Duration::from_secs(5), server.accept())
        .await
        .expect("accept timed out")
        .unwrap();
    assert_eq!(server_session.id(), 7);
    timeout(Duration::from_secs(5), server_session.ready())
        .await
        .expect("server session never became ready");
    assert!(server_session.is_established());
    assert_eq!(server.session_count(), 1);
    assert_eq!(server.metrics().snapshot().sessions_opened, 1);

    session.close().await.unwrap();

    // Close handshake drains both session maps; empty maps close the
    // underlays, which ends both event loops cleanly.
    wait_for(|| server.session_count() == 0, "server session removal").await;
    wait_for(|| server.is_closed(), "server underlay close").await;
    wait_for(|| client.session_count() == 0, "client session removal").await;
    wait_for(|| client.is_closed(), "client underlay close").await;

    assert!(timeout(Duration::from_secs(5), server_loop)
        .await
        .unwrap()
        .unwrap()
        .is_ok());
    assert!(timeout(Duration::from_secs(5), client_loop)
        .await
        .unwrap()
        .unwrap()
        .is_ok());
    assert_eq!(server.metrics().snapshot().sessions_closed, 1);
}

#[tokio::test]
async fn e2_replayed_datagram_is_rejected() {
    let cipher = test_cipher();
    let (server, server_addr, server_loop) = spawn_server(vec![cipher.clone()]).await;

    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let datagram = seal_datagram(&cipher, [3u8; NONCE_SIZE], &open_request(9), b"");

    sock.send_to(&datagram, server_addr).await.unwrap();
    wait_for(|| server.session_count() == 1, "session 9 creation").await;

    // Byte-identical datagram from the same peer within the TTL.
    sock.send_to(&datagram, server_addr).await.unwrap();

    let result = timeout(Duration::from_secs(5), server_loop)
        .await
        .expect("event loop did not terminate on replay")
        .unwrap();
    assert!(matches!(result, Err(TransportError::Replay(_))));
    assert_eq!(server.metrics().snapshot().replay_new_session, 1);
}

#[tokio::test]
async fn e4_unsolicited_source_is_ignored() {
    // The nominal server never sends; a stranger does.
    let nominal_server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = nominal_server.local_addr().unwrap();

    let (client, client_loop) = spawn_client(server_addr, test_cipher()).await;
    let client_addr = client.local_addr().unwrap();

    let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    stranger.send_to(&[0u8; 200], client_addr).await.unwrap();

    wait_for(
        || client.metrics().snapshot().unsolicited >= 1,
        "unsolicited counter",
    )
    .await;
    assert!(!client_loop.is_finished(), "event loop must keep running");

    client.close();
    assert!(timeout(Duration::from_secs(5), client_loop)
        .await
        .unwrap()
        .unwrap()
        .is_ok());
}

#[tokio::test]
async fn e5_reserved_session_id_is_an_error() {
    let cipher = test_cipher();
    let (server, server_addr, server_loop) = spawn_server(vec![cipher.clone()]).await;

    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let datagram = seal_datagram(&cipher, [5u8; NONCE_SIZE], &open_request(0), b"");
    sock.send_to(&datagram, server_addr).await.unwrap();

    let result = timeout(Duration::from_secs(5), server_loop)
        .await
        .expect("event loop did not reject reserved session id")
        .unwrap();
    assert!(matches!(result, Err(TransportError::ReservedSessionId)));
    assert_eq!(server.session_count(), 0);
}

#[tokio::test]
async fn e6_open_request_on_client_is_invalid_operation() {
    let cipher = test_cipher();
    let nominal_server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = nominal_server.local_addr().unwrap();

    let (client, client_loop) = spawn_client(server_addr, cipher.clone()).await;
    let client_addr = client.local_addr().unwrap();

    // From the configured server address, so it passes the source filter.
    let datagram = seal_datagram(&cipher, [9u8; NONCE_SIZE], &open_request(11), b"");
    nominal_server.send_to(&datagram, client_addr).await.unwrap();

    let result = timeout(Duration::from_secs(5), client_loop)
        .await
        .expect("event loop did not flag role violation")
        .unwrap();
    assert!(matches!(result, Err(TransportError::InvalidOperation(_))));
    assert_eq!(client.session_count(), 0);
}

#[tokio::test]
async fn server_trial_decrypts_across_users() {
    let users: Vec<BlockCipher> = ["alice", "bob", "carol"]
        .iter()
        .map(|u| BlockCipher::from_credentials(u, "pw"))
        .collect();
    let (server, server_addr, _server_loop) = spawn_server(users.clone()).await;

    // The dialing peer is bob: the server must bind his cipher by trial.
    let (client, _client_loop) = spawn_client(server_addr, users[1].clone()).await;
    let session = client.open_session(21, Vec::new()).await.unwrap();
    timeout(Duration::from_secs(5), session.ready())
        .await
        .expect("session with trial-decrypted cipher never ready");

    let server_session = timeout(Duration::from_secs(5), server.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server_session.id(), 21);
}

#[tokio::test]
async fn constructor_argument_validation() {
    let replay = Arc::new(ReplayCache::default());

    let bad_network = UdpUnderlay::new(
        "tcp",
        None,
        None,
        MTU,
        vec![test_cipher()],
        replay.clone(),
    )
    .await;
    assert!(matches!(
        bad_network,
        Err(TransportError::UnsupportedNetwork(_))
    ));

    let no_candidates = UdpUnderlay::new("udp", None, None, MTU, vec![], replay.clone()).await;
    assert!(matches!(
        no_candidates,
        Err(TransportError::InvalidArgument(_))
    ));

    let two_for_client = UdpUnderlay::new(
        "udp",
        None,
        Some("127.0.0.1:9999".parse().unwrap()),
        MTU,
        vec![test_cipher(), BlockCipher::from_credentials("bob", "pw")],
        replay,
    )
    .await;
    assert!(matches!(
        two_for_client,
        Err(TransportError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn close_conn_tears_down_every_session() {
    let cipher = test_cipher();
    let (server, server_addr, server_loop) = spawn_server(vec![cipher.clone()]).await;

    // Two live sessions from the same peer.
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let open_31 = seal_datagram(&cipher, [1u8; NONCE_SIZE], &open_request(31), b"");
    let open_32 = seal_datagram(&cipher, [2u8; NONCE_SIZE], &open_request(32), b"");
    sock.send_to(&open_31, server_addr).await.unwrap();
    sock.send_to(&open_32, server_addr).await.unwrap();
    wait_for(|| server.session_count() == 2, "both sessions to open").await;

    let close_conn = Metadata::CloseConn(CloseConnMetadata {
        protocol: CLOSE_CONN,
        status_code: 0,
        suffix_len: 0,
    });
    let datagram = seal_datagram(&cipher, [6u8; NONCE_SIZE], &close_conn, b"");
    sock.send_to(&datagram, server_addr).await.unwrap();

    // Every session is cancelled and removed, then the underlay closes and
    // the event loop exits cleanly.
    let result = timeout(Duration::from_secs(5), server_loop)
        .await
        .expect("event loop did not exit on close-conn")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(server.session_count(), 0);
    assert!(server.is_closed());

    let snapshot = server.metrics().snapshot();
    assert_eq!(snapshot.sessions_opened, 2);
    assert_eq!(snapshot.sessions_closed, 2);
}

#[tokio::test]
async fn length_identity_violation_is_terminal() {
    let cipher = test_cipher();
    let (server, server_addr, server_loop) = spawn_server(vec![cipher.clone()]).await;

    // Metadata promises 20 bytes of suffix padding that is never appended.
    let metadata = Metadata::Session(SessionMetadata {
        protocol: OPEN_SESSION_REQUEST,
        session_id: 13,
        seq: 0,
        status_code: 0,
        payload_len: 0,
        suffix_len: 20,
    });
    let datagram = seal_datagram(&cipher, [8u8; NONCE_SIZE], &metadata, b"");

    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sock.send_to(&datagram, server_addr).await.unwrap();

    let result = timeout(Duration::from_secs(5), server_loop)
        .await
        .expect("event loop did not flag the length mismatch")
        .unwrap();
    assert!(matches!(
        result,
        Err(TransportError::LengthMismatch { expected: 36, actual: 16 })
    ));
    assert_eq!(server.session_count(), 0);
}

#[tokio::test]
async fn close_is_idempotent() {
    let (server, _addr, server_loop) = spawn_server(vec![test_cipher()]).await;
    server.close();
    assert!(server.is_closed());
    server.close();
    server.close();
    assert!(server.is_closed());
    assert!(timeout(Duration::from_secs(5), server_loop)
        .await
        .unwrap()
        .unwrap()
        .is_ok());
}
