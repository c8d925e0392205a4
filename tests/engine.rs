//! Black-box tests driving [`h2engine::Connection`] purely through its
//! public API, with a hand-rolled peer speaking raw HTTP/2 frames over an
//! in-memory `tokio::io::duplex` pipe. No network, no TLS.

use bytes::{BufMut, BytesMut};
use h2engine::{Connection, Options, Request, RequestContext};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_SETTINGS: u8 = 0x4;
const FRAME_GOAWAY: u8 = 0x7;
const FRAME_WINDOW_UPDATE: u8 = 0x8;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_ACK: u8 = 0x1;

async fn write_raw_frame(io: &mut DuplexStream, frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) {
    let mut header = BytesMut::with_capacity(9 + payload.len());
    header.put_u8((payload.len() >> 16) as u8);
    header.put_u8((payload.len() >> 8) as u8);
    header.put_u8(payload.len() as u8);
    header.put_u8(frame_type);
    header.put_u8(flags);
    header.put_u32(stream_id & 0x7fff_ffff);
    header.extend_from_slice(payload);
    io.write_all(&header).await.unwrap();
}

/// Returns `(frame_type, flags, stream_id, payload)`.
async fn read_raw_frame(io: &mut DuplexStream) -> (u8, u8, u32, Vec<u8>) {
    let mut header = [0u8; 9];
    io.read_exact(&mut header).await.unwrap();
    let length = (usize::from(header[0]) << 16) | (usize::from(header[1]) << 8) | usize::from(header[2]);
    let frame_type = header[3];
    let flags = header[4];
    let stream_id = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & 0x7fff_ffff;
    let mut payload = vec![0u8; length];
    io.read_exact(&mut payload).await.unwrap();
    (frame_type, flags, stream_id, payload)
}

/// A literal header field, never indexed, with a literal (non-Huffman) name
/// and value — the simplest representation the decoder accepts.
fn encode_header_literal(name: &str, value: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(0x10);
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
    out.push(value.len() as u8);
    out.extend_from_slice(value.as_bytes());
    out
}

async fn read_preface_and_client_settings(io: &mut DuplexStream) {
    let mut preface = [0u8; PREFACE.len()];
    io.read_exact(&mut preface).await.unwrap();
    assert_eq!(&preface, PREFACE);
    let (frame_type, flags, stream_id, _) = read_raw_frame(io).await;
    assert_eq!(frame_type, FRAME_SETTINGS);
    assert_eq!(flags, 0);
    assert_eq!(stream_id, 0);
}

async fn complete_handshake(mut io: DuplexStream) -> DuplexStream {
    read_preface_and_client_settings(&mut io).await;
    write_raw_frame(&mut io, FRAME_SETTINGS, 0, 0, &[]).await;
    write_raw_frame(&mut io, FRAME_SETTINGS, FLAG_ACK, 0, &[]).await;
    io
}

#[tokio::test]
async fn successful_get_round_trip_decodes_status_and_body() {
    let (client_io, server_io) = duplex(1 << 16);
    let server = tokio::spawn(async move {
        let mut io = complete_handshake(server_io).await;
        let (frame_type, flags, stream_id, _) = read_raw_frame(&mut io).await;
        assert_eq!(frame_type, FRAME_HEADERS);
        assert_eq!(flags & FLAG_END_STREAM, FLAG_END_STREAM);
        assert_eq!(stream_id, 1);

        let mut block = encode_header_literal(":status", "200");
        block.extend(encode_header_literal("content-type", "text/plain"));
        write_raw_frame(&mut io, FRAME_HEADERS, FLAG_END_HEADERS, 1, &block).await;
        write_raw_frame(&mut io, FRAME_DATA, FLAG_END_STREAM, 1, b"hello world").await;
    });

    let conn = Connection::initialize(client_io, Options::default()).await.unwrap();
    let request = Request::get("example.com", "/");
    let ctx = RequestContext::new();
    let response = conn.send_request(request, &ctx, None).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert_eq!(&response.body[..], b"hello world");
    assert!(response.is_success());

    server.await.unwrap();
}

#[tokio::test]
async fn large_request_body_waits_for_window_update_before_completing() {
    // Bigger than the default 65_535-octet initial window, so the client
    // must stall mid-body until the server grants more credit.
    let body = vec![b'x'; 100_000];

    let (client_io, server_io) = duplex(1 << 20);
    let server = tokio::spawn(async move {
        let mut io = complete_handshake(server_io).await;
        let (frame_type, flags, stream_id, _) = read_raw_frame(&mut io).await;
        assert_eq!(frame_type, FRAME_HEADERS);
        assert_eq!(flags & FLAG_END_STREAM, 0); // body still to come
        assert_eq!(stream_id, 1);

        let mut received = 0usize;
        loop {
            let (frame_type, flags, _, payload) = read_raw_frame(&mut io).await;
            assert_eq!(frame_type, FRAME_DATA);
            received += payload.len();
            if flags & FLAG_END_STREAM != 0 {
                break;
            }
            if received >= 65_535 && received < 100_000 {
                // Grant connection- and stream-level credit so the rest of
                // the body can flow.
                let mut increment = BytesMut::new();
                increment.put_u32(100_000);
                write_raw_frame(&mut io, FRAME_WINDOW_UPDATE, 0, 0, &increment).await;
                write_raw_frame(&mut io, FRAME_WINDOW_UPDATE, 0, 1, &increment).await;
            }
        }
        assert_eq!(received, 100_000);

        let status = encode_header_literal(":status", "204");
        write_raw_frame(&mut io, FRAME_HEADERS, FLAG_END_HEADERS | FLAG_END_STREAM, 1, &status).await;
    });

    let conn = Connection::initialize(client_io, Options::default()).await.unwrap();
    let request = Request::post("example.com", "/upload", body);
    let ctx = RequestContext::new();
    let response = conn.send_request(request, &ctx, None).await.unwrap();

    assert_eq!(response.status, 204);
    server.await.unwrap();
}

#[tokio::test]
async fn goaway_during_handshake_window_is_observed_as_not_alive() {
    let (client_io, server_io) = duplex(1 << 16);
    let server = tokio::spawn(async move {
        let mut io = complete_handshake(server_io).await;
        let mut payload = BytesMut::new();
        payload.put_u32(0);
        payload.put_u32(0); // NO_ERROR
        write_raw_frame(&mut io, FRAME_GOAWAY, 0, 0, &payload).await;
        // Keep the pipe open briefly so the client's read loop observes it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    });

    let conn = Connection::initialize(client_io, Options::default()).await.unwrap();
    server.await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!conn.is_alive());
}

#[test]
fn build_request_exposes_port_and_authority() {
    let request = Request::get("example.com", "/index").with_port(8443);
    assert_eq!(request.authority(), "example.com:8443");
}
