//! Tests for HTTP/2 frame header and payload parsing

use h2_rpc_core::frame::{flags, frame_type};
use h2_rpc_core::{ErrorCode, Frame, FrameDecoder, FrameHeader, PrioritySpec, Role, Setting, CONNECTION_PREFACE};

fn decode(bytes: &[u8]) -> Vec<Frame> {
    FrameDecoder::new(Role::Client).decode(bytes).unwrap()
}

#[test]
fn test_frame_header_parse() {
    // DATA frame, length 5, stream 1, END_STREAM
    let header_bytes = [0, 0, 5, 0, 1, 0, 0, 0, 1];
    let header = FrameHeader::parse(&header_bytes).unwrap();

    assert_eq!(header.length, 5);
    assert_eq!(header.frame_type, frame_type::DATA);
    assert_eq!(header.stream_id, 1);
    assert!(header.has_flag(flags::END_STREAM));
    assert!(!header.has_flag(flags::PADDED));
}

#[test]
fn test_frame_header_too_short() {
    assert!(FrameHeader::parse(&[0, 0, 5, 0, 1, 0, 0, 0]).is_none());
}

#[test]
fn test_stream_id_clears_reserved_bit() {
    let header_bytes = [0, 0, 0, 4, 0, 0x80, 0x00, 0x00, 0x05];
    let header = FrameHeader::parse(&header_bytes).unwrap();
    assert_eq!(header.stream_id, 5, "Reserved bit should be cleared from stream ID");
}

#[test]
fn test_total_size() {
    let header = FrameHeader {
        length: 100,
        frame_type: 0,
        flags: 0,
        stream_id: 1,
    };
    assert_eq!(header.total_size(), 109);
}

#[test]
fn test_data_frame() {
    let mut bytes = vec![0, 0, 5, 0, 1, 0, 0, 0, 1];
    bytes.extend_from_slice(b"hello");
    assert_eq!(decode(&bytes), vec![Frame::data(1, b"hello".to_vec(), true)]);
}

#[test]
fn test_padded_data_frame() {
    // Pad length 3, "hi", three zero bytes
    let bytes = [0, 0, 6, 0, 0x8, 0, 0, 0, 1, 3, b'h', b'i', 0, 0, 0];
    match &decode(&bytes)[0] {
        Frame::Data {
            data, pad_len, end_stream, ..
        } => {
            assert_eq!(data, b"hi");
            assert_eq!(*pad_len, Some(3));
            assert!(!*end_stream);
        }
        other => panic!("Expected Data frame, got {:?}", other),
    }
}

#[test]
fn test_headers_with_priority_flag() {
    let mut bytes = vec![0, 0, 7, 1, 0x24, 0, 0, 0, 1];
    bytes.extend_from_slice(&[0x80, 0, 0, 3]); // exclusive dependency on 3
    bytes.push(255);
    bytes.extend_from_slice(&[0x82, 0x86]);

    match &decode(&bytes)[0] {
        Frame::Headers {
            header_block,
            priority,
            end_headers,
            ..
        } => {
            assert_eq!(header_block, &[0x82, 0x86]);
            assert!(*end_headers);
            assert_eq!(
                *priority,
                Some(PrioritySpec {
                    dependency: 3,
                    exclusive: true,
                    weight: 255,
                })
            );
        }
        other => panic!("Expected Headers frame, got {:?}", other),
    }
}

#[test]
fn test_settings_frame() {
    let bytes = [
        0, 0, 12, 4, 0, 0, 0, 0, 0, //
        0, 4, 0, 1, 0, 0, // INITIAL_WINDOW_SIZE = 65536
        0, 0x42, 0, 0, 0, 1, // unknown id, ignored
    ];
    assert_eq!(
        decode(&bytes),
        vec![Frame::Settings {
            ack: false,
            settings: vec![Setting::InitialWindowSize(65_536)],
        }]
    );
}

#[test]
fn test_ping_frame() {
    let mut bytes = vec![0, 0, 8, 6, 1, 0, 0, 0, 0];
    bytes.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE, 0xBA, 0xBE]);
    assert_eq!(
        decode(&bytes),
        vec![Frame::Ping {
            ack: true,
            data: [0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE, 0xBA, 0xBE],
        }]
    );
}

#[test]
fn test_goaway_frame() {
    let mut bytes = vec![0, 0, 10, 7, 0, 0, 0, 0, 0];
    bytes.extend_from_slice(&7u32.to_be_bytes());
    bytes.extend_from_slice(&0xbu32.to_be_bytes());
    bytes.extend_from_slice(b"ok");
    assert_eq!(
        decode(&bytes),
        vec![Frame::GoAway {
            last_stream_id: 7,
            error_code: ErrorCode::EnhanceYourCalm,
            debug_data: b"ok".to_vec(),
        }]
    );
}

#[test]
fn test_window_update_frame() {
    let mut bytes = vec![0, 0, 4, 8, 0, 0, 0, 0, 5];
    bytes.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    assert_eq!(
        decode(&bytes),
        vec![Frame::WindowUpdate {
            stream_id: 5,
            increment: 65_536,
        }]
    );
}

#[test]
fn test_push_promise_frame() {
    let mut bytes = vec![0, 0, 6, 5, 0x4, 0, 0, 0, 1];
    bytes.extend_from_slice(&2u32.to_be_bytes());
    bytes.extend_from_slice(&[0x82, 0x87]);
    assert_eq!(
        decode(&bytes),
        vec![Frame::PushPromise {
            stream_id: 1,
            promised_stream_id: 2,
            header_block: vec![0x82, 0x87],
            end_headers: true,
            pad_len: None,
        }]
    );
}

#[test]
fn test_altsvc_and_origin_frames() {
    let mut bytes = Vec::new();
    Frame::AltSvc {
        stream_id: 0,
        origin: "https://example.com".into(),
        field_value: "h2=\":443\"".into(),
    }
    .encode(&mut bytes);
    Frame::Origin {
        origins: vec!["https://a.example".into(), "https://b.example".into()],
    }
    .encode(&mut bytes);

    let frames = decode(&bytes);
    assert!(matches!(
        &frames[0],
        Frame::AltSvc { origin, field_value, .. } if origin == "https://example.com" && field_value == "h2=\":443\""
    ));
    assert_eq!(
        frames[1],
        Frame::Origin {
            origins: vec!["https://a.example".into(), "https://b.example".into()],
        }
    );
}

#[test]
fn test_unknown_frame_type_is_dropped() {
    let mut bytes = vec![0, 0, 3, 0xfa, 0, 0, 0, 0, 1, 1, 2, 3];
    bytes.extend_from_slice(&[0, 0, 0, 4, 1, 0, 0, 0, 0]);
    assert_eq!(
        decode(&bytes),
        vec![Frame::Settings {
            ack: true,
            settings: Vec::new(),
        }]
    );
}

#[test]
fn test_incremental_decoding() {
    let frame = Frame::data(3, vec![9; 40], false).to_bytes();
    let mut decoder = FrameDecoder::new(Role::Client);
    for byte in &frame[..frame.len() - 1] {
        assert_eq!(decoder.decode(&[*byte]).unwrap(), Vec::new());
    }
    assert_eq!(
        decoder.decode(&frame[frame.len() - 1..]).unwrap(),
        vec![Frame::data(3, vec![9; 40], false)]
    );
    assert_eq!(decoder.buffered(), 0);
}

#[test]
fn test_server_decoder_expects_preface() {
    let mut bytes = CONNECTION_PREFACE.to_vec();
    bytes.extend_from_slice(&[0, 0, 0, 4, 0, 0, 0, 0, 0]);
    let frames = FrameDecoder::new(Role::Server).decode(&bytes).unwrap();
    assert_eq!(
        frames,
        vec![Frame::Settings {
            ack: false,
            settings: Vec::new(),
        }]
    );
}
