//! Integration tests for CoAP wire framing and RPC serialization
//! round-trips.

use raft_transport::errors::RejectionReason;
use raft_transport::msg::{screen_datagram, BlockOption, CoapMessage, Code, MessageType};
use raft_transport::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    LogEntry, RequestVoteRequest, RequestVoteResponse,
};
use raft_transport::serializer::{JsonSerializer, RpcSerializer, CONTENT_FORMAT_JSON};

#[test]
fn test_request_message_round_trip() {
    let mut msg = CoapMessage::new(
        MessageType::Confirmable,
        Code::POST,
        41234,
        vec![0xDE, 0xAD, 0xBE, 0xEF],
    );
    msg.set_uri_path("/raft/append_entries");
    msg.set_content_format(CONTENT_FORMAT_JSON);
    let msg = msg.with_payload(br#"{"term":7}"#.to_vec());

    let wire = msg.encode();
    let decoded = CoapMessage::decode(&wire).unwrap();

    assert_eq!(decoded.mtype, MessageType::Confirmable);
    assert_eq!(decoded.code, Code::POST);
    assert_eq!(decoded.message_id, 41234);
    assert_eq!(decoded.token, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(decoded.uri_path(), "/raft/append_entries");
    assert_eq!(decoded.content_format(), Some(CONTENT_FORMAT_JSON));
    assert_eq!(decoded.payload, br#"{"term":7}"#);

    println!("✅ CON request survived an encode/decode round trip");
}

#[test]
fn test_header_layout_is_rfc7252() {
    let msg = CoapMessage::new(MessageType::Confirmable, Code::POST, 0x1234, vec![0xAB]);
    let wire = msg.encode();

    // Version 01, type 00 (CON), TKL 1.
    assert_eq!(wire[0], 0b0100_0001);
    // 0.02 POST.
    assert_eq!(wire[1], 0x02);
    // Message ID, network byte order.
    assert_eq!(&wire[2..4], &[0x12, 0x34]);
    // Token bytes follow the header.
    assert_eq!(wire[4], 0xAB);

    println!("✅ Header bytes match RFC 7252 layout");
}

#[test]
fn test_all_response_codes_round_trip() {
    for code in [
        Code::CHANGED,
        Code::CONTENT,
        Code::CONTINUE,
        Code::BAD_REQUEST,
        Code::INTERNAL_SERVER_ERROR,
    ] {
        let msg = CoapMessage::new(MessageType::Acknowledgement, code, 1, vec![1]);
        let decoded = CoapMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.code, code);
    }
    assert_eq!(Code::CONTINUE.dotted(), "2.31");
    assert_eq!(Code::BAD_REQUEST.dotted(), "4.00");
    assert_eq!(Code::INTERNAL_SERVER_ERROR.dotted(), "5.00");

    println!("✅ Response codes and dotted rendering round trip");
}

#[test]
fn test_block_option_round_trips_through_message() {
    let mut msg = CoapMessage::new(MessageType::Confirmable, Code::POST, 9, vec![7]);
    msg.set_block1(BlockOption::new(4, false, 1024));
    msg.set_block2(BlockOption::new(2, true, 512));

    let decoded = CoapMessage::decode(&msg.encode()).unwrap();
    assert_eq!(
        decoded.block1().unwrap().unwrap(),
        BlockOption::new(4, false, 1024)
    );
    assert_eq!(
        decoded.block2().unwrap().unwrap(),
        BlockOption::new(2, true, 512)
    );

    println!("✅ Block1/Block2 options round trip inside a message");
}

#[test]
fn test_malformed_datagrams_are_screened() {
    // Too short.
    assert_eq!(screen_datagram(b"ab"), Some(RejectionReason::EmptyPayload));
    // Wrong version bits (10).
    assert_eq!(
        screen_datagram(&[0b1000_0000, 0x02, 0, 1]),
        Some(RejectionReason::BadVersion)
    );
    // Token length 12.
    assert_eq!(
        screen_datagram(&[0b0100_1100, 0x02, 0, 1]),
        Some(RejectionReason::TokenTooLong)
    );
    // Corruption patterns.
    assert_eq!(
        screen_datagram(&[0xFF; 16]),
        Some(RejectionReason::AllOnesPayload)
    );
    assert_eq!(
        screen_datagram(&[0x00; 16]),
        Some(RejectionReason::AllZeroPayload)
    );

    // A valid frame passes.
    let ok = CoapMessage::new(MessageType::Confirmable, Code::POST, 5, vec![1])
        .with_payload(b"x".to_vec())
        .encode();
    assert_eq!(screen_datagram(&ok), None);

    println!("✅ Malformed datagrams are screened with specific reasons");
}

#[test]
fn test_truncated_wire_forms_are_rejected() {
    let mut full = CoapMessage::new(MessageType::Confirmable, Code::POST, 3, vec![1, 2, 3]);
    full.set_uri_path("/raft/request_vote");
    let full = full.with_payload(b"payload".to_vec()).encode();

    // Chopping the frame anywhere after the header must not panic, and
    // most prefixes are invalid.
    for len in 0..4 {
        assert!(CoapMessage::decode(&full[..len]).is_err());
    }
    // Token truncated.
    assert!(CoapMessage::decode(&full[..5]).is_err());

    println!("✅ Truncated frames error instead of panicking");
}

#[test]
fn test_request_vote_serialization_round_trip() {
    let ser = JsonSerializer::new();

    let request = RequestVoteRequest {
        term: 9,
        candidate_id: 3,
        last_log_index: 120,
        last_log_term: 8,
    };
    let bytes = ser.encode_request_vote_request(&request).unwrap();
    assert_eq!(ser.decode_request_vote_request(&bytes).unwrap(), request);

    let response = RequestVoteResponse {
        term: 9,
        vote_granted: true,
    };
    let bytes = ser.encode_request_vote_response(&response).unwrap();
    assert_eq!(ser.decode_request_vote_response(&bytes).unwrap(), response);

    println!("✅ RequestVote request/response round trip");
}

#[test]
fn test_append_entries_serialization_round_trip() {
    let ser = JsonSerializer::new();

    let request = AppendEntriesRequest {
        term: 4,
        leader_id: 1,
        prev_log_index: 77,
        prev_log_term: 3,
        entries: vec![
            LogEntry {
                term: 4,
                index: 78,
                payload: vec![0, 1, 2, 255, 254],
            },
            LogEntry {
                term: 4,
                index: 79,
                payload: Vec::new(),
            },
        ],
        leader_commit: 77,
    };
    let bytes = ser.encode_append_entries_request(&request).unwrap();
    assert_eq!(ser.decode_append_entries_request(&bytes).unwrap(), request);

    let response = AppendEntriesResponse {
        term: 4,
        success: false,
        match_index: 70,
    };
    let bytes = ser.encode_append_entries_response(&response).unwrap();
    assert_eq!(ser.decode_append_entries_response(&bytes).unwrap(), response);

    println!("✅ AppendEntries request/response round trip");
}

#[test]
fn test_install_snapshot_serialization_round_trip() {
    let ser = JsonSerializer::new();

    let request = InstallSnapshotRequest {
        term: 12,
        leader_id: 2,
        last_included_index: 500,
        last_included_term: 11,
        offset: 4096,
        data: (0..=255u8).cycle().take(2000).collect(),
        done: false,
    };
    let bytes = ser.encode_install_snapshot_request(&request).unwrap();
    assert_eq!(ser.decode_install_snapshot_request(&bytes).unwrap(), request);

    let response = InstallSnapshotResponse { term: 12 };
    let bytes = ser.encode_install_snapshot_response(&response).unwrap();
    assert_eq!(
        ser.decode_install_snapshot_response(&bytes).unwrap(),
        response
    );

    println!("✅ InstallSnapshot request/response round trip");
}

#[test]
fn test_decode_of_wrong_shape_is_a_serialization_error() {
    let ser = JsonSerializer::new();
    let vote = ser
        .encode_request_vote_request(&RequestVoteRequest {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        })
        .unwrap();

    let err = ser.decode_append_entries_request(&vote).unwrap_err();
    assert_eq!(err.kind_label(), "serialization");

    println!("✅ Cross-shape decode fails with a serialization error");
}
