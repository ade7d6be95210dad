//! Tests for connection setup, request/response exchanges and shutdown

use h2_rpc_core::{
    Config, Connection, ErrorCode, Event, Frame, H2Error, Header, Role, Setting, Settings, StreamState,
};

use super::{connected, default_pair, drain, frames_from, pump, request};

#[test]
fn test_settings_exchange() {
    let mut client = Connection::client();
    let mut server = Connection::server();
    pump(&mut client, &mut server);

    let server_events = drain(&mut server);
    assert!(server_events.contains(&Event::Settings(vec![Setting::EnablePush(false)])));
    assert!(server_events.contains(&Event::SettingsAcknowledged));
    assert!(drain(&mut client).contains(&Event::SettingsAcknowledged));
    assert!(!client.is_closed());
    assert!(!server.is_closed());
}

#[test]
fn test_custom_settings_are_announced() {
    let settings = Settings {
        max_concurrent_streams: Some(10),
        initial_window_size: 1 << 20,
        ..Settings::default()
    };
    let (client, _server) = connected(Config::client(), Config::server().with_settings(settings));

    assert_eq!(client.remote_settings().max_concurrent_streams, Some(10));
    assert_eq!(client.remote_settings().initial_window_size, 1 << 20);
}

#[test]
fn test_request_with_body_and_trailers() {
    let (mut client, mut server) = default_pair();

    let key = client.open_stream().unwrap();
    client.send_headers(key, request("/upload"), false).unwrap();
    client.send_data(key, b"part one ".to_vec(), false).unwrap();
    client.send_data(key, b"part two".to_vec(), false).unwrap();
    client
        .send_headers(key, vec![Header::new("x-checksum", "abc")], true)
        .unwrap();
    pump(&mut client, &mut server);

    let events = drain(&mut server);
    let stream = match &events[0] {
        Event::StreamOpened { stream, stream_id: 1 } => *stream,
        other => panic!("Expected StreamOpened event, got {:?}", other),
    };

    let mut body = Vec::new();
    let mut trailers = None;
    for event in &events[1..] {
        match event {
            Event::Headers {
                headers,
                end_stream: false,
                ..
            } => assert_eq!(headers, &request("/upload")),
            Event::Data { data, end_stream, .. } => {
                assert!(!end_stream);
                body.extend_from_slice(data);
            }
            Event::Headers {
                headers,
                end_stream: true,
                ..
            } => trailers = Some(headers.clone()),
            other => panic!("Unexpected event {:?}", other),
        }
    }
    assert_eq!(body, b"part one part two");
    assert_eq!(trailers, Some(vec![Header::new("x-checksum", "abc")]));
    assert_eq!(server.stream_state(stream), Some(StreamState::HalfClosedRemote));
}

#[test]
fn test_many_streams_are_multiplexed() {
    let (mut client, mut server) = default_pair();

    let keys: Vec<_> = (0..5).map(|_| client.open_stream().unwrap()).collect();
    for (i, key) in keys.iter().enumerate() {
        client.send_headers(*key, request(&format!("/{}", i)), false).unwrap();
        client.send_data(*key, vec![i as u8; 30_000], true).unwrap();
    }
    pump(&mut client, &mut server);

    let mut per_stream = std::collections::HashMap::new();
    let mut ended = 0;
    for event in drain(&mut server) {
        if let Event::Data {
            stream,
            data,
            end_stream,
        } = event
        {
            *per_stream.entry(stream).or_insert(0usize) += data.len();
            if end_stream {
                ended += 1;
            }
        }
    }
    assert_eq!(per_stream.len(), 5);
    assert!(per_stream.values().all(|&n| n == 30_000));
    assert_eq!(ended, 5);

    let ids: Vec<_> = keys.iter().map(|k| client.stream_id(*k).unwrap()).collect();
    assert_eq!(ids, vec![1, 3, 5, 7, 9]);
}

#[test]
fn test_deferred_stream_starts_when_slot_frees() {
    let settings = Settings {
        max_concurrent_streams: Some(1),
        ..Settings::default()
    };
    let (mut client, mut server) = connected(Config::client(), Config::server().with_settings(settings));

    let first = client.open_stream().unwrap();
    let second = client.open_stream().unwrap();
    client.send_headers(first, request("/a"), true).unwrap();
    client.send_headers(second, request("/b"), true).unwrap();

    let mut opened = 0;
    for _ in 0..2 {
        pump(&mut client, &mut server);
        for event in drain(&mut server) {
            if let Event::StreamOpened { stream, .. } = event {
                opened += 1;
                server
                    .send_headers(stream, vec![Header::new(":status", "204")], true)
                    .unwrap();
            }
        }
        if opened == 1 {
            assert_eq!(client.stream_id(second), None);
        }
    }
    pump(&mut client, &mut server);

    assert_eq!(opened, 2);
    assert_eq!(client.stream_id(second), Some(3));
    assert_eq!(client.stream_state(first), Some(StreamState::Closed));
    assert_eq!(client.stream_state(second), Some(StreamState::Closed));
    assert_eq!(client.active_streams(), 0);
}

#[test]
fn test_graceful_shutdown() {
    let (mut client, mut server) = default_pair();

    let key = client.open_stream().unwrap();
    client.send_headers(key, request("/"), true).unwrap();
    pump(&mut client, &mut server);
    drain(&mut server);

    server.close(ErrorCode::NoError);
    pump(&mut client, &mut server);

    assert_eq!(
        drain(&mut client),
        vec![Event::GoAway {
            last_stream_id: 1,
            error_code: ErrorCode::NoError,
            debug_data: Vec::new(),
        }]
    );
    assert!(client.is_closed());
    assert!(matches!(client.open_stream(), Err(H2Error::Closed)));
    assert!(matches!(server.open_stream(), Err(H2Error::Closed)));
}

#[test]
fn test_input_after_goaway_is_ignored() {
    let (_client, mut server) = default_pair();

    let mut bytes = Frame::GoAway {
        last_stream_id: 0,
        error_code: ErrorCode::NoError,
        debug_data: Vec::new(),
    }
    .to_bytes();
    Frame::Ping { ack: false, data: [1; 8] }.encode(&mut bytes);
    server.recv(&bytes).unwrap();
    server.recv(&Frame::Ping { ack: false, data: [2; 8] }.to_bytes()).unwrap();

    assert_eq!(drain(&mut server).len(), 1);
    // No PING ACK goes out
    let out = server.take_pending_send();
    assert!(frames_from(Role::Client, &out)
        .iter()
        .all(|f| !matches!(f, Frame::Ping { .. })));
}

#[test]
fn test_connection_error_closes_connection() {
    let (_client, mut server) = default_pair();

    // DATA on a stream the client never opened
    let err = server.recv(&Frame::data(1, vec![0; 4], false).to_bytes()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ProtocolError);
    assert!(err.is_connection_error());
    assert!(server.is_closed());

    let out = server.take_pending_send();
    assert!(matches!(
        frames_from(Role::Client, &out).last(),
        Some(Frame::GoAway {
            last_stream_id: 0,
            error_code: ErrorCode::ProtocolError,
            ..
        })
    ));
    assert!(matches!(server.recv(&[]), Err(H2Error::Closed)));
}
