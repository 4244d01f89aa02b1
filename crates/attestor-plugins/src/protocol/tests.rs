//! Unit tests for the wire protocol.

use std::io::BufReader;

use rstest::rstest;
use serde_json::json;

use super::*;

#[test]
fn hello_frame_flattens_handshake_triple() {
    let frame = Frame::Hello {
        handshake: HandshakeConfig::default(),
    };
    let line = serde_json::to_string(&frame).expect("serialise hello");
    let value: serde_json::Value = serde_json::from_str(&line).expect("parse hello");
    assert_eq!(value.get("type"), Some(&json!("hello")));
    assert_eq!(value.get("cookie_key"), Some(&json!("ATTESTOR_PLUGIN")));
    assert_eq!(value.get("protocol_version"), Some(&json!(1)));
}

#[rstest]
#[case::dispensed(Frame::Dispensed { seq: 7 }, Some(7))]
#[case::unknown(
    Frame::UnknownService { seq: 9, service: "decoder".into() },
    Some(9)
)]
#[case::reply(Frame::Reply { seq: 3, result: json!(null) }, Some(3))]
#[case::fault(Frame::Fault { seq: 4, message: "boom".into() }, Some(4))]
#[case::call(
    Frame::Call { seq: 5, service: "decoder".into(), method: "m".into(), params: json!(null) },
    None
)]
#[case::shutdown(Frame::Shutdown, None)]
fn response_seq_identifies_response_frames(#[case] frame: Frame, #[case] expected: Option<u64>) {
    assert_eq!(frame.response_seq(), expected);
}

#[test]
fn write_then_read_round_trips_one_line() {
    let frame = Frame::Call {
        seq: 42,
        service: "evidence-handler".into(),
        method: "get_name".into(),
        params: json!({}),
    };
    let mut buffer = Vec::new();
    write_frame(&mut buffer, &frame).expect("write frame");
    assert_eq!(buffer.iter().filter(|byte| **byte == b'\n').count(), 1);

    let mut reader = BufReader::new(buffer.as_slice());
    let read_back = read_frame(&mut reader).expect("read frame");
    assert_eq!(read_back, Some(frame));
}

#[test]
fn read_frame_reports_end_of_stream_as_none() {
    let mut reader = BufReader::new(&b""[..]);
    assert_eq!(read_frame(&mut reader).expect("clean EOF"), None);
}

#[test]
fn read_frame_rejects_garbage_lines() {
    let mut reader = BufReader::new(&b"not json\n"[..]);
    let error = read_frame(&mut reader).expect_err("garbage should fail");
    assert!(matches!(error, PluginError::Codec { .. }));
}
