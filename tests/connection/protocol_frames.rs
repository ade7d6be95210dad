//! Tests for control frames and header block handling inside a connection

use h2_rpc_core::{
    AltService, Config, Connection, ErrorCode, Event, Frame, FrameKind, Header, Role, Setting, StreamState,
};

use super::{connected, default_pair, drain, frames_from, pump, request};

#[test]
fn test_large_headers_use_continuation() {
    let (mut client, mut server) = default_pair();

    let mut headers = request("/");
    headers.push(Header::new("x-large", "a".repeat(40_000)));
    let key = client.open_stream().unwrap();
    client.send_headers(key, headers.clone(), true).unwrap();

    let out = client.take_pending_send();
    let frames = frames_from(Role::Client, &out);
    assert!(matches!(frames[0], Frame::Headers { end_headers: false, .. }));
    assert!(frames.iter().any(|f| f.kind() == FrameKind::Continuation));

    server.recv(&out).unwrap();
    let events = drain(&mut server);
    assert!(matches!(
        &events[1],
        Event::Headers { headers: received, end_stream: true, .. } if *received == headers
    ));
}

#[test]
fn test_continuation_delivered_byte_by_byte() {
    let (mut client, mut server) = default_pair();

    let mut headers = request("/");
    headers.push(Header::new("x-large", "b".repeat(30_000)));
    let key = client.open_stream().unwrap();
    client.send_headers(key, headers.clone(), false).unwrap();

    for byte in client.take_pending_send() {
        server.recv(&[byte]).unwrap();
    }
    let events = drain(&mut server);
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[1], Event::Headers { headers: received, .. } if *received == headers));
}

fn limited_header_list() -> (Connection, Connection) {
    let mut config = Config::server();
    config.settings.max_header_list_size = Some(200);
    connected(Config::client(), config)
}

#[test]
fn test_header_list_over_limit_refuses_stream() {
    let (mut client, mut server) = limited_header_list();

    let small = client.open_stream().unwrap();
    client.send_headers(small, request("/small"), true).unwrap();
    let mut headers = request("/big");
    headers.push(Header::new("x-big", "a".repeat(100)));
    let big = client.open_stream().unwrap();
    client.send_headers(big, headers, true).unwrap();
    pump(&mut client, &mut server);

    let opened = drain(&mut server)
        .iter()
        .filter(|e| matches!(e, Event::StreamOpened { .. }))
        .count();
    assert_eq!(opened, 1);
    assert!(drain(&mut client).contains(&Event::Reset {
        stream: big,
        error_code: ErrorCode::ProtocolError,
    }));
    assert!(!server.is_closed());
}

#[test]
fn test_trailers_over_limit_reset_stream() {
    let (mut client, mut server) = limited_header_list();

    let key = client.open_stream().unwrap();
    client.send_headers(key, request("/"), false).unwrap();
    client
        .send_headers(key, vec![Header::new("x-trailer", "t".repeat(200))], true)
        .unwrap();
    pump(&mut client, &mut server);

    let events = drain(&mut server);
    assert!(events.iter().any(|e| matches!(e, Event::StreamError {
        error_code: ErrorCode::ProtocolError,
        ..
    })));
    assert_eq!(
        events.iter().filter(|e| matches!(e, Event::Headers { .. })).count(),
        1
    );
    assert!(drain(&mut client).contains(&Event::Reset {
        stream: key,
        error_code: ErrorCode::ProtocolError,
    }));
}

#[test]
fn test_oversized_header_block_is_rejected() {
    let mut config = Config::server();
    config.max_header_block_size = 1_024;
    let (_client, mut server) = connected(Config::client(), config);

    let mut bytes = Vec::new();
    Frame::Headers {
        stream_id: 1,
        header_block: vec![0; 800],
        end_stream: false,
        end_headers: false,
        priority: None,
        pad_len: None,
    }
    .encode(&mut bytes);
    Frame::Continuation {
        stream_id: 1,
        header_block: vec![0; 800],
        end_headers: false,
    }
    .encode(&mut bytes);

    let err = server.recv(&bytes).unwrap_err();
    assert_eq!(err.code(), ErrorCode::EnhanceYourCalm);
}

#[test]
fn test_continuation_for_wrong_stream() {
    let (_client, mut server) = default_pair();

    let mut bytes = Vec::new();
    Frame::Headers {
        stream_id: 1,
        header_block: vec![0x82],
        end_stream: false,
        end_headers: false,
        priority: None,
        pad_len: None,
    }
    .encode(&mut bytes);
    Frame::Continuation {
        stream_id: 3,
        header_block: vec![0x84],
        end_headers: true,
    }
    .encode(&mut bytes);

    let err = server.recv(&bytes).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ProtocolError);
}

#[test]
fn test_bad_header_block_is_compression_error() {
    let (_client, mut server) = default_pair();

    let bytes = Frame::Headers {
        stream_id: 1,
        header_block: vec![0x80],
        end_stream: true,
        end_headers: true,
        priority: None,
        pad_len: None,
    }
    .to_bytes();
    let err = server.recv(&bytes).unwrap_err();
    assert_eq!(err.code(), ErrorCode::CompressionError);
}

#[test]
fn test_peer_ping_is_acknowledged() {
    let (mut client, _server) = default_pair();

    client
        .recv(&Frame::Ping { ack: false, data: *b"12345678" }.to_bytes())
        .unwrap();
    assert!(drain(&mut client).is_empty());
    assert_eq!(
        frames_from(Role::Client, &client.take_pending_send()),
        vec![Frame::Ping {
            ack: true,
            data: *b"12345678",
        }]
    );
}

#[test]
fn test_unsolicited_ping_ack_is_ignored() {
    let (mut client, _server) = default_pair();

    client
        .recv(&Frame::Ping { ack: true, data: [9; 8] }.to_bytes())
        .unwrap();
    assert!(drain(&mut client).is_empty());
    assert!(client.take_pending_send().is_empty());
}

#[test]
fn test_push_promise_rejected_when_disabled() {
    let (mut client, mut server) = default_pair();

    let key = client.open_stream().unwrap();
    client.send_headers(key, request("/"), true).unwrap();
    pump(&mut client, &mut server);

    let bytes = Frame::PushPromise {
        stream_id: 1,
        promised_stream_id: 2,
        header_block: vec![0x82],
        end_headers: true,
        pad_len: None,
    }
    .to_bytes();
    let err = client.recv(&bytes).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ProtocolError);
}

#[test]
fn test_pushed_response_reaches_client() {
    let client_config = Config::client().with_settings(h2_rpc_core::Settings::default());
    let (mut client, mut server) = connected(client_config, Config::server());

    let key = client.open_stream().unwrap();
    client.send_headers(key, request("/index.html"), true).unwrap();
    pump(&mut client, &mut server);
    let parent = match drain(&mut server).first() {
        Some(Event::StreamOpened { stream, .. }) => *stream,
        other => panic!("Expected StreamOpened event, got {:?}", other),
    };

    let promised = server.push_promise(parent, request("/app.js")).unwrap();
    server
        .send_headers(parent, vec![Header::new(":status", "200")], false)
        .unwrap();
    server.send_data(parent, b"<html>".to_vec(), true).unwrap();
    server
        .send_headers(promised, vec![Header::new(":status", "200")], false)
        .unwrap();
    server.send_data(promised, b"alert(1)".to_vec(), true).unwrap();
    pump(&mut client, &mut server);

    let events = drain(&mut client);
    let client_promised = match &events[0] {
        Event::PushPromise {
            parent,
            promised,
            headers,
        } => {
            assert_eq!(*parent, key);
            assert_eq!(headers, &request("/app.js"));
            *promised
        }
        other => panic!("Expected PushPromise event, got {:?}", other),
    };
    assert_eq!(client.stream_id(client_promised), None);
    assert_eq!(client.stream_state(client_promised), Some(StreamState::Closed));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Data { stream, data, end_stream: true } if *stream == client_promised && data == b"alert(1)"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Data { stream, data, end_stream: true } if *stream == key && data == b"<html>"
    )));
}

#[test]
fn test_altsvc_on_stream_uses_request_origin() {
    let (mut client, _server) = default_pair();

    let service = AltService::parse("h2=\"alt.example.com:443\"; ma=60").unwrap();
    let mut bytes = Vec::new();
    Frame::AltSvc {
        stream_id: 1,
        origin: String::new(),
        field_value: service.to_field_value(),
    }
    .encode(&mut bytes);
    // Stream 0 without an origin is malformed and dropped
    Frame::AltSvc {
        stream_id: 0,
        origin: String::new(),
        field_value: service.to_field_value(),
    }
    .encode(&mut bytes);
    client.recv(&bytes).unwrap();

    let events = drain(&mut client);
    assert_eq!(events.len(), 1);
    match &events[0] {
        Event::AltSvc {
            stream_id,
            field_value,
            ..
        } => {
            assert_eq!(*stream_id, 1);
            assert_eq!(AltService::parse(field_value), Some(service));
        }
        other => panic!("Expected AltSvc event, got {:?}", other),
    }
}

#[test]
fn test_origin_from_client_is_ignored() {
    let (_client, mut server) = default_pair();

    let bytes = Frame::Origin {
        origins: vec!["https://evil.example".into()],
    }
    .to_bytes();
    server.recv(&bytes).unwrap();
    assert!(drain(&mut server).is_empty());
}

#[test]
fn test_header_table_size_setting_reaches_encoder() {
    let (mut client, mut server) = default_pair();

    server
        .update_settings(vec![Setting::HeaderTableSize(0)])
        .unwrap();
    pump(&mut client, &mut server);
    drain(&mut client);
    drain(&mut server);

    // First block after the change starts with a dynamic table size update
    let key = client.open_stream().unwrap();
    client.send_headers(key, request("/"), true).unwrap();
    let frames = frames_from(Role::Client, &client.take_pending_send());
    match &frames[0] {
        Frame::Headers { header_block, .. } => assert_eq!(header_block[0] & 0xe0, 0x20),
        other => panic!("Expected HEADERS frame, got {:?}", other),
    }
}

#[test]
fn test_settings_with_invalid_window_is_flow_control_error() {
    let (_client, mut server) = default_pair();

    // SETTINGS_INITIAL_WINDOW_SIZE = 2^31
    let bytes = [0, 0, 6, 4, 0, 0, 0, 0, 0, 0, 4, 0x80, 0, 0, 0];
    let err = server.recv(&bytes).unwrap_err();
    assert_eq!(err.code(), ErrorCode::FlowControlError);
}
