//! Tests for HTTP/2 frame encoding

use h2_rpc_core::frame::{flags, frame_type, header_block_frames, push_promise_frames};
use h2_rpc_core::{AltService, ErrorCode, Frame, FrameDecoder, PrioritySpec, Role, Setting};

#[test]
fn test_rst_stream_bytes() {
    let frame = Frame::RstStream {
        stream_id: 1,
        error_code: ErrorCode::Http11Required,
    }
    .to_bytes();
    assert_eq!(frame.len(), 13);
    assert_eq!(&frame[0..3], &[0, 0, 4]);
    assert_eq!(frame[3], frame_type::RST_STREAM);
    assert_eq!(&frame[9..], &[0, 0, 0, 0xd]);
}

#[test]
fn test_settings_ack_bytes() {
    let frame = Frame::Settings {
        ack: true,
        settings: Vec::new(),
    }
    .to_bytes();
    assert_eq!(frame, vec![0, 0, 0, frame_type::SETTINGS, flags::ACK, 0, 0, 0, 0]);
}

#[test]
fn test_settings_bytes() {
    let frame = Frame::Settings {
        ack: false,
        settings: vec![Setting::InitialWindowSize(1_048_576), Setting::EnablePush(false)],
    }
    .to_bytes();
    assert_eq!(frame.len(), 21);
    assert_eq!(&frame[9..15], &[0, 4, 0, 0x10, 0, 0]);
    assert_eq!(&frame[15..21], &[0, 2, 0, 0, 0, 0]);
}

#[test]
fn test_ping_ack_bytes() {
    let data = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
    let frame = Frame::Ping { ack: true, data }.to_bytes();
    assert_eq!(frame.len(), 17);
    assert_eq!(frame[3], frame_type::PING);
    assert_eq!(frame[4], flags::ACK);
    assert_eq!(&frame[9..], &data);
}

#[test]
fn test_goaway_bytes() {
    let frame = Frame::GoAway {
        last_stream_id: 5,
        error_code: ErrorCode::NoError,
        debug_data: Vec::new(),
    }
    .to_bytes();
    assert_eq!(frame.len(), 17);
    assert_eq!(frame[3], frame_type::GOAWAY);
    assert_eq!(&frame[9..13], &[0, 0, 0, 5]);
}

#[test]
fn test_padded_headers_bytes() {
    let frame = Frame::Headers {
        stream_id: 1,
        header_block: vec![0x82],
        end_stream: true,
        end_headers: true,
        priority: Some(PrioritySpec::default()),
        pad_len: Some(2),
    }
    .to_bytes();
    // pad length + priority + block + padding
    assert_eq!(&frame[0..3], &[0, 0, 9]);
    assert_eq!(
        frame[4],
        flags::END_STREAM | flags::END_HEADERS | flags::PADDED | flags::PRIORITY
    );
    assert_eq!(&frame[9..], &[2, 0, 0, 0, 0, 15, 0x82, 0, 0]);
}

#[test]
fn test_encode_decode_all_kinds() {
    let frames = vec![
        Frame::data(1, b"body".to_vec(), true),
        Frame::Headers {
            stream_id: 3,
            header_block: vec![0x82, 0x84],
            end_stream: false,
            end_headers: true,
            priority: Some(PrioritySpec {
                dependency: 1,
                exclusive: false,
                weight: 31,
            }),
            pad_len: Some(4),
        },
        Frame::Priority {
            stream_id: 5,
            priority: PrioritySpec::default(),
        },
        Frame::RstStream {
            stream_id: 1,
            error_code: ErrorCode::Cancel,
        },
        Frame::Settings {
            ack: false,
            settings: vec![Setting::HeaderTableSize(0), Setting::MaxFrameSize(20_000)],
        },
        Frame::PushPromise {
            stream_id: 1,
            promised_stream_id: 4,
            header_block: vec![0x82],
            end_headers: true,
            pad_len: None,
        },
        Frame::Ping {
            ack: false,
            data: [1, 2, 3, 4, 5, 6, 7, 8],
        },
        Frame::GoAway {
            last_stream_id: 9,
            error_code: ErrorCode::ProtocolError,
            debug_data: b"bye".to_vec(),
        },
        Frame::WindowUpdate {
            stream_id: 0,
            increment: 1000,
        },
        Frame::Continuation {
            stream_id: 3,
            header_block: vec![0x86],
            end_headers: true,
        },
        Frame::AltSvc {
            stream_id: 1,
            origin: String::new(),
            field_value: "h2=\":8443\"".into(),
        },
        Frame::Origin {
            origins: vec!["https://example.com".into()],
        },
    ];

    let mut bytes = Vec::new();
    for frame in &frames {
        frame.encode(&mut bytes);
    }
    assert_eq!(FrameDecoder::new(Role::Client).decode(&bytes).unwrap(), frames);
}

#[test]
fn test_header_block_fits_one_frame() {
    let frames = header_block_frames(1, vec![1; 100], true, None, 16_384);
    assert_eq!(frames.len(), 1);
    assert!(matches!(
        &frames[0],
        Frame::Headers {
            end_headers: true,
            end_stream: true,
            ..
        }
    ));
}

#[test]
fn test_header_block_split_into_continuations() {
    let frames = header_block_frames(7, vec![1; 250], false, None, 100);
    assert_eq!(frames.len(), 3);
    assert!(matches!(&frames[0], Frame::Headers { end_headers: false, header_block, .. } if header_block.len() == 100));
    assert!(matches!(&frames[1], Frame::Continuation { end_headers: false, stream_id: 7, .. }));
    assert!(matches!(&frames[2], Frame::Continuation { end_headers: true, header_block, .. } if header_block.len() == 50));
}

#[test]
fn test_header_block_split_leaves_room_for_priority() {
    let frames = header_block_frames(1, vec![1; 100], false, Some(PrioritySpec::default()), 100);
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f.to_bytes().len() - 9 <= 100));
}

#[test]
fn test_push_promise_split() {
    let frames = push_promise_frames(1, 2, vec![0; 120], 100);
    assert_eq!(frames.len(), 2);
    assert!(matches!(&frames[0], Frame::PushPromise { header_block, end_headers: false, .. } if header_block.len() == 96));
    assert!(matches!(&frames[1], Frame::Continuation { end_headers: true, .. }));
}

#[test]
fn test_alt_service_field_value() {
    let service = AltService::parse("h2=\"alt.example.com:8000\"; ma=3600, h3=\":443\"").unwrap();
    assert_eq!(service.protocol_id, "h2");
    assert_eq!(service.host, "alt.example.com");
    assert_eq!(service.port, 8000);
    assert_eq!(service.max_age, 3600);
    assert_eq!(AltService::parse(&service.to_field_value()), Some(service));

    let default_age = AltService::parse("h2=\":443\"").unwrap();
    assert_eq!(default_age.host, "");
    assert_eq!(default_age.max_age, AltService::DEFAULT_MAX_AGE);
}
