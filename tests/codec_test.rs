//! Metadata codec and fragment-size invariants.

use caligo::net::{
    is_close_conn_protocol, is_data_ack_protocol, is_session_protocol, CloseConnMetadata,
    CodecError, DataAckMetadata, Metadata, SessionMetadata, ACK, CLOSE_CONN,
    CLOSE_SESSION_REQUEST, CLOSE_SESSION_RESPONSE, DATA, METADATA_LEN, OPEN_SESSION_REQUEST,
    OPEN_SESSION_RESPONSE,
};
use caligo::{max_fragment_size, IpVersion, TransportProtocol, MAX_PDU, UDP_OVERHEAD};

#[test]
fn every_variant_marshals_to_metadata_len() {
    let all = vec![
        Metadata::Session(SessionMetadata {
            protocol: OPEN_SESSION_REQUEST,
            session_id: 1,
            seq: 0,
            status_code: 0,
            payload_len: 0,
            suffix_len: 0,
        }),
        Metadata::Session(SessionMetadata {
            protocol: OPEN_SESSION_RESPONSE,
            session_id: u32::MAX,
            seq: u32::MAX,
            status_code: u8::MAX,
            payload_len: u16::MAX,
            suffix_len: u8::MAX,
        }),
        Metadata::Session(SessionMetadata {
            protocol: CLOSE_SESSION_REQUEST,
            session_id: 77,
            seq: 3,
            status_code: 1,
            payload_len: 9,
            suffix_len: 30,
        }),
        Metadata::Session(SessionMetadata {
            protocol: CLOSE_SESSION_RESPONSE,
            session_id: 77,
            seq: 4,
            status_code: 0,
            payload_len: 0,
            suffix_len: 254,
        }),
        Metadata::DataAck(DataAckMetadata {
            protocol: DATA,
            session_id: 0x0102_0304,
            seq: 0x0a0b_0c0d,
            un_ack_seq: 0x1122_3344,
            window_size: 512,
            prefix_len: 17,
            payload_len: 1300,
            suffix_len: 99,
        }),
        Metadata::DataAck(DataAckMetadata {
            protocol: ACK,
            session_id: 2,
            seq: 10,
            un_ack_seq: 10,
            window_size: 1,
            prefix_len: 0,
            payload_len: 0,
            suffix_len: 0,
        }),
        Metadata::CloseConn(CloseConnMetadata {
            protocol: CLOSE_CONN,
            status_code: 2,
            suffix_len: 44,
        }),
    ];

    for metadata in all {
        let buf = metadata.marshal();
        assert_eq!(buf.len(), METADATA_LEN);
        assert_eq!(buf[0], metadata.protocol());
        assert_eq!(Metadata::unmarshal(&buf).unwrap(), metadata);
    }
}

#[test]
fn unmarshal_is_strict_about_size() {
    let buf = Metadata::Session(SessionMetadata {
        protocol: OPEN_SESSION_REQUEST,
        session_id: 5,
        seq: 0,
        status_code: 0,
        payload_len: 0,
        suffix_len: 0,
    })
    .marshal();

    for bad_len in [0usize, 1, METADATA_LEN - 1] {
        assert!(matches!(
            Metadata::unmarshal(&buf[..bad_len]),
            Err(CodecError::Size(_))
        ));
    }
    let mut long = buf.to_vec();
    long.extend_from_slice(&[0, 0]);
    assert!(matches!(
        Metadata::unmarshal(&long),
        Err(CodecError::Size(_))
    ));
}

#[test]
fn protocol_number_sets_partition() {
    let session = [
        OPEN_SESSION_REQUEST,
        OPEN_SESSION_RESPONSE,
        CLOSE_SESSION_REQUEST,
        CLOSE_SESSION_RESPONSE,
    ];
    let data_ack = [DATA, ACK];

    for p in session {
        assert!(is_session_protocol(p));
        assert!(!is_data_ack_protocol(p));
        assert!(!is_close_conn_protocol(p));
    }
    for p in data_ack {
        assert!(is_data_ack_protocol(p));
        assert!(!is_session_protocol(p));
        assert!(!is_close_conn_protocol(p));
    }
    assert!(is_close_conn_protocol(CLOSE_CONN));
    assert!(!is_session_protocol(CLOSE_CONN));
    assert!(!is_data_ack_protocol(CLOSE_CONN));
}

#[test]
fn fragment_size_budget() {
    assert_eq!(
        max_fragment_size(1500, IpVersion::V4, TransportProtocol::Udp),
        1472 - UDP_OVERHEAD
    );
    assert_eq!(
        max_fragment_size(1500, IpVersion::Unknown, TransportProtocol::Unknown),
        1440 - UDP_OVERHEAD
    );
    assert_eq!(
        max_fragment_size(1500, IpVersion::V4, TransportProtocol::Tcp),
        MAX_PDU
    );
    assert_eq!(
        max_fragment_size(1500, IpVersion::V6, TransportProtocol::Tcp),
        MAX_PDU
    );
}
