//! Header blocks exchanged with an independent HPACK implementation

use h2_rpc_core::{Compressor, Decompressor, Header};

fn sample_blocks() -> Vec<Vec<Header>> {
    vec![
        vec![
            Header::new(":method", "POST"),
            Header::new(":scheme", "http"),
            Header::new(":path", "/helloworld.Greeter/SayHello"),
            Header::new(":authority", "localhost:50051"),
            Header::new("content-type", "application/grpc"),
            Header::new("te", "trailers"),
        ],
        vec![
            Header::new(":method", "POST"),
            Header::new(":scheme", "http"),
            Header::new(":path", "/helloworld.Greeter/SayHelloAgain"),
            Header::new(":authority", "localhost:50051"),
            Header::new("content-type", "application/grpc"),
            Header::new("te", "trailers"),
            Header::new("authorization", "Basic dXNlcjpwYXNz"),
        ],
        vec![
            Header::new("grpc-status", "0"),
            Header::new("grpc-message", ""),
        ],
    ]
}

fn to_headers(pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Vec<Header> {
    pairs
        .into_iter()
        .map(|(name, value)| {
            Header::new(
                String::from_utf8(name).unwrap(),
                String::from_utf8(value).unwrap(),
            )
        })
        .collect()
}

#[test]
fn test_our_blocks_decode_with_fluke_hpack() {
    let mut encoder = Compressor::default();
    let mut decoder = fluke_hpack::Decoder::new();

    for headers in sample_blocks() {
        let block = encoder.compress(&headers);
        let decoded = to_headers(decoder.decode(&block).unwrap());
        assert_eq!(decoded, headers);
    }
}

#[test]
fn test_fluke_hpack_blocks_decode_with_ours() {
    let mut encoder = fluke_hpack::Encoder::new();
    let mut decoder = Decompressor::default();

    for headers in sample_blocks() {
        let pairs: Vec<(&[u8], &[u8])> = headers
            .iter()
            .map(|h| (h.name.as_bytes(), h.value.as_bytes()))
            .collect();
        let block = encoder.encode(pairs);
        let decoded = decoder.decompress(&block).unwrap();
        assert_eq!(decoded, headers);
    }
}
