//! Tests for flow control and send backpressure

use h2_rpc_core::frame::header_block_frames;
use h2_rpc_core::{Config, ErrorCode, Event, Frame, FrameKind, Role, Setting, Settings};

use super::{connected, default_pair, drain, frames_from, pump, request};

fn data_bytes(frames: &[Frame]) -> usize {
    frames
        .iter()
        .filter(|f| f.kind() == FrameKind::Data)
        .map(|f| f.flow_controlled_len())
        .sum()
}

#[test]
fn test_data_waits_for_window_update() {
    let settings = Settings {
        initial_window_size: 100,
        ..Settings::default()
    };
    let (mut client, mut server) = connected(Config::client(), Config::server().with_settings(settings));

    let key = client.open_stream().unwrap();
    client.send_headers(key, request("/"), false).unwrap();
    client.send_data(key, vec![9; 250], true).unwrap();

    let out = client.take_pending_send();
    assert_eq!(data_bytes(&frames_from(Role::Client, &out)), 100);
    assert!(client.take_pending_send().is_empty());

    // Server returns the credit, the rest follows
    server.recv(&out).unwrap();
    pump(&mut client, &mut server);
    let received: usize = drain(&mut server)
        .iter()
        .map(|e| match e {
            Event::Data { data, .. } => data.len(),
            _ => 0,
        })
        .sum();
    assert_eq!(received, 250);
}

#[test]
fn test_data_is_split_at_max_frame_size() {
    let (mut client, _server) = default_pair();

    let key = client.open_stream().unwrap();
    client.send_headers(key, request("/"), false).unwrap();
    client.send_data(key, vec![1; 40_000], true).unwrap();
    let frames = frames_from(Role::Client, &client.take_pending_send());

    let sizes: Vec<usize> = frames
        .iter()
        .filter(|f| f.kind() == FrameKind::Data)
        .map(|f| f.flow_controlled_len())
        .collect();
    assert_eq!(sizes, vec![16_384, 16_384, 7_232]);
    assert!(frames.last().unwrap().is_end_stream());
}

#[test]
fn test_initial_window_change_shifts_open_streams() {
    let (mut client, mut server) = default_pair();

    let key = client.open_stream().unwrap();
    client.send_headers(key, request("/"), false).unwrap();
    pump(&mut client, &mut server);
    assert_eq!(client.stream_send_window(key), Some(65_535));

    server
        .update_settings(vec![Setting::InitialWindowSize(1_000)])
        .unwrap();
    pump(&mut client, &mut server);
    assert_eq!(client.stream_send_window(key), Some(1_000));
    // The connection window is not affected by SETTINGS
    assert_eq!(client.send_window(), 65_535);
}

#[test]
fn test_receiver_returns_credit() {
    let (mut client, mut server) = default_pair();

    let key = client.open_stream().unwrap();
    client.send_headers(key, request("/"), false).unwrap();
    client.send_data(key, vec![0; 1_000], false).unwrap();
    server.recv(&client.take_pending_send()).unwrap();

    let updates: Vec<Frame> = frames_from(Role::Client, &server.take_pending_send())
        .into_iter()
        .filter(|f| f.kind() == FrameKind::WindowUpdate)
        .collect();
    assert!(updates.contains(&Frame::WindowUpdate {
        stream_id: 0,
        increment: 1_000,
    }));
    assert!(updates.contains(&Frame::WindowUpdate {
        stream_id: 1,
        increment: 1_000,
    }));
}

#[test]
fn test_no_stream_credit_after_end_stream() {
    let (mut client, mut server) = default_pair();

    let key = client.open_stream().unwrap();
    client.send_headers(key, request("/"), false).unwrap();
    client.send_data(key, vec![0; 500], true).unwrap();
    server.recv(&client.take_pending_send()).unwrap();

    let updates: Vec<Frame> = frames_from(Role::Client, &server.take_pending_send())
        .into_iter()
        .filter(|f| f.kind() == FrameKind::WindowUpdate)
        .collect();
    assert_eq!(
        updates,
        vec![Frame::WindowUpdate {
            stream_id: 0,
            increment: 500,
        }]
    );
}

#[test]
fn test_padding_counts_against_window() {
    let (mut client, mut server) = default_pair();

    let key = client.open_stream().unwrap();
    client.send_headers(key, request("/"), false).unwrap();
    pump(&mut client, &mut server);
    drain(&mut server);

    let padded = Frame::Data {
        stream_id: 1,
        data: vec![7; 10],
        end_stream: false,
        pad_len: Some(20),
    };
    server.recv(&padded.to_bytes()).unwrap();
    assert!(matches!(
        drain(&mut server).as_slice(),
        [Event::Data { data, .. }] if data.len() == 10
    ));

    let updates = frames_from(Role::Client, &server.take_pending_send());
    assert!(updates.contains(&Frame::WindowUpdate {
        stream_id: 0,
        increment: 31,
    }));
}

#[test]
fn test_sender_exceeding_window_is_flow_control_error() {
    let settings = Settings {
        initial_window_size: 10,
        ..Settings::default()
    };
    let (_client, mut server) = connected(Config::client(), Config::server().with_settings(settings));

    let mut bytes = Vec::new();
    header_block_frames(1, vec![0x82, 0x86, 0x84], false, None, 16_384)
        .into_iter()
        .for_each(|f| f.encode(&mut bytes));
    Frame::data(1, vec![0; 11], false).encode(&mut bytes);
    server.recv(&bytes).unwrap();

    assert!(drain(&mut server).iter().any(|e| matches!(
        e,
        Event::StreamError {
            error_code: ErrorCode::FlowControlError,
            ..
        }
    )));
    assert!(frames_from(Role::Client, &server.take_pending_send()).contains(&Frame::RstStream {
        stream_id: 1,
        error_code: ErrorCode::FlowControlError,
    }));
}

#[test]
fn test_backpressure_signals_writable() {
    let mut config = Config::client();
    config.stream_send_buffer = 1_000;
    let (mut client, mut server) = connected(config, Config::server());

    let key = client.open_stream().unwrap();
    client.send_headers(key, request("/"), false).unwrap();
    assert!(client.send_data(key, vec![0; 600], false).unwrap());
    assert!(!client.send_data(key, vec![0; 600], true).unwrap());

    pump(&mut client, &mut server);
    let events = drain(&mut client);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::StreamWritable { .. }))
            .count(),
        1
    );
}
