//! Unit tests for the newline-delimited message codec.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use acp_broker::rpc::framing::{LineCodec, MAX_MESSAGE_BYTES};
use acp_broker::AppError;

#[test]
fn encode_then_decode_round_trips() {
    let mut codec = LineCodec::new();
    let payload = r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#;

    let mut buf = BytesMut::new();
    codec
        .encode(payload.to_owned(), &mut buf)
        .expect("encode must succeed");
    assert_eq!(&buf[..], format!("{payload}\n").as_bytes());

    let decoded = codec
        .decode(&mut buf)
        .expect("decode must succeed")
        .expect("a complete line is buffered");
    assert_eq!(decoded, payload, "payload must round-trip byte-for-byte");
}

#[test]
fn successive_lines_decode_in_order() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from("A\nB\n");

    let first = codec.decode(&mut buf).expect("decode A");
    assert_eq!(first.as_deref(), Some("A"));

    let second = codec.decode(&mut buf).expect("decode B");
    assert_eq!(second.as_deref(), Some("B"));

    let third = codec.decode(&mut buf).expect("buffer empty");
    assert!(third.is_none());
}

#[test]
fn decode_strips_trailing_carriage_return() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from("{\"a\":1}\r\n");

    let decoded = codec.decode(&mut buf).expect("decode must succeed");
    assert_eq!(decoded.as_deref(), Some("{\"a\":1}"));
}

#[test]
fn decode_skips_blank_lines() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from("\n   \n{\"a\":1}\n");

    let decoded = codec.decode(&mut buf).expect("decode must succeed");
    assert_eq!(
        decoded.as_deref(),
        Some("{\"a\":1}"),
        "blank and whitespace-only lines must be consumed silently"
    );
}

#[test]
fn decode_buffers_partial_line_until_newline() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from("{\"a\":");

    let pending = codec.decode(&mut buf).expect("partial line buffers");
    assert!(pending.is_none());

    buf.extend_from_slice(b"1}\n");
    let decoded = codec.decode(&mut buf).expect("decode must succeed");
    assert_eq!(decoded.as_deref(), Some("{\"a\":1}"));
}

#[test]
fn encode_rejects_empty_payload() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::new();

    let err = codec.encode(String::new(), &mut buf).expect_err("must fail");
    assert!(matches!(err, AppError::Transport(_)));
    assert!(buf.is_empty(), "nothing may be written on failure");
}

#[test]
fn encode_rejects_embedded_newline() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::new();

    let err = codec
        .encode("{\n}".to_owned(), &mut buf)
        .expect_err("must fail");
    assert!(matches!(err, AppError::Transport(_)));
}

#[test]
fn encode_rejects_oversized_payload() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::new();
    let oversized = "x".repeat(MAX_MESSAGE_BYTES + 1);

    let err = codec.encode(oversized, &mut buf).expect_err("must fail");
    assert!(matches!(err, AppError::Transport(_)));
}

#[test]
fn encode_accepts_payload_at_limit() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::new();
    let max = "x".repeat(MAX_MESSAGE_BYTES);

    codec
        .encode(max, &mut buf)
        .expect("payload exactly at the cap is valid");
    assert_eq!(buf.len(), MAX_MESSAGE_BYTES + 1);
}

#[test]
fn decode_rejects_oversized_line() {
    let mut codec = LineCodec::new();
    let mut line = "y".repeat(MAX_MESSAGE_BYTES + 16);
    line.push('\n');
    let mut buf = BytesMut::from(line.as_str());

    let err = codec.decode(&mut buf).expect_err("over-long line must fail");
    assert!(matches!(err, AppError::Transport(_)));
}
