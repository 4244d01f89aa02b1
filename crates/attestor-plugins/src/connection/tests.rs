//! Unit tests for the multiplexed connection.

use std::io::BufReader;
use std::path::Path;
use std::thread;
use std::time::Duration;

use serde_json::json;

use super::*;
use crate::protocol::{read_frame as proto_read, write_frame as proto_write};
use crate::testing::{PipeReader, PipeWriter, pipe};

const TIMEOUT: Duration = Duration::from_millis(500);

/// Runs a scripted peer on a background thread and connects to it.
fn connect_to_peer(
    script: impl FnOnce(&mut BufReader<PipeReader>, &mut PipeWriter) + Send + 'static,
) -> Result<Connection, PluginError> {
    let (host_writer, peer_reader) = pipe();
    let (peer_writer, host_reader) = pipe();
    thread::spawn(move || {
        let mut reader = BufReader::new(peer_reader);
        let mut writer = peer_writer;
        script(&mut reader, &mut writer);
    });
    Connection::establish(
        Box::new(host_writer),
        Box::new(host_reader),
        Path::new("/plugins/test.plugin"),
        &HandshakeConfig::default(),
        TIMEOUT,
    )
}

/// Script step: read the hello and acknowledge it.
fn ack_hello(reader: &mut BufReader<PipeReader>, writer: &mut PipeWriter) {
    let hello = proto_read(reader).expect("read hello").expect("hello frame");
    assert!(matches!(hello, Frame::Hello { .. }));
    proto_write(writer, &Frame::HelloAck { protocol_version: 1 }).expect("write ack");
}

#[test]
fn establish_completes_on_matching_ack() {
    let connection = connect_to_peer(|reader, writer| {
        ack_hello(reader, writer);
    });
    connection.expect("handshake should succeed");
}

#[test]
fn establish_fails_on_rejection() {
    let error = connect_to_peer(|reader, writer| {
        drop(proto_read(reader));
        proto_write(
            writer,
            &Frame::HelloReject {
                message: "cookie mismatch".into(),
            },
        )
        .expect("write reject");
    })
    .expect_err("rejection should fail the handshake");
    assert!(matches!(error, PluginError::Handshake { .. }));
    assert!(error.to_string().contains("cookie mismatch"));
}

#[test]
fn establish_fails_on_version_mismatch() {
    let error = connect_to_peer(|reader, writer| {
        drop(proto_read(reader));
        proto_write(writer, &Frame::HelloAck { protocol_version: 99 }).expect("write ack");
    })
    .expect_err("version mismatch should fail");
    assert!(matches!(error, PluginError::Handshake { .. }));
}

#[test]
fn establish_fails_when_peer_closes_the_pipe() {
    let error = connect_to_peer(|_, writer| {
        writer.close();
    })
    .expect_err("closed pipe should fail the handshake");
    assert!(matches!(error, PluginError::Handshake { .. }));
}

#[test]
fn establish_times_out_on_a_silent_peer() {
    let error = connect_to_peer(|reader, _| {
        // Swallow the hello, never answer, keep the pipe open.
        drop(proto_read(reader));
        thread::sleep(Duration::from_secs(2));
    })
    .expect_err("silent peer should time out");
    assert!(matches!(error, PluginError::Handshake { .. }));
}

#[test]
fn dispense_distinguishes_unknown_service() {
    let connection = connect_to_peer(|reader, writer| {
        ack_hello(reader, writer);
        let frame = proto_read(reader).expect("read dispense").expect("frame");
        let Frame::Dispense { seq, service } = frame else {
            panic!("expected dispense, got {frame:?}");
        };
        proto_write(writer, &Frame::UnknownService { seq, service }).expect("write unknown");
    })
    .expect("handshake");

    let error = connection
        .dispense("evidence-handler")
        .expect_err("unknown service should surface");
    assert!(error.is_unknown_service());
}

#[test]
fn call_routes_replies_by_sequence_number() {
    let connection = Arc::new(
        connect_to_peer(|reader, writer| {
            ack_hello(reader, writer);
            // Collect both calls before answering, then reply in reverse
            // order to exercise the multiplexing.
            let mut calls = Vec::new();
            for _ in 0..2 {
                let frame = proto_read(reader).expect("read call").expect("frame");
                let Frame::Call { seq, method, .. } = frame else {
                    panic!("expected call, got {frame:?}");
                };
                calls.push((seq, method));
            }
            for (seq, method) in calls.into_iter().rev() {
                proto_write(
                    writer,
                    &Frame::Reply {
                        seq,
                        result: json!(method),
                    },
                )
                .expect("write reply");
            }
        })
        .expect("handshake"),
    );

    let first = Arc::clone(&connection);
    let first_caller =
        thread::spawn(move || first.call("svc", "alpha", json!(null)).expect("alpha reply"));
    let second = Arc::clone(&connection);
    let second_caller =
        thread::spawn(move || second.call("svc", "beta", json!(null)).expect("beta reply"));

    assert_eq!(first_caller.join().expect("alpha thread"), json!("alpha"));
    assert_eq!(second_caller.join().expect("beta thread"), json!("beta"));
}

#[test]
fn call_surfaces_remote_faults() {
    let connection = connect_to_peer(|reader, writer| {
        ack_hello(reader, writer);
        let frame = proto_read(reader).expect("read call").expect("frame");
        let Frame::Call { seq, .. } = frame else {
            panic!("expected call, got {frame:?}");
        };
        proto_write(
            writer,
            &Frame::Fault {
                seq,
                message: "no such claim".into(),
            },
        )
        .expect("write fault");
    })
    .expect("handshake");

    let error = connection
        .call("svc", "extract_claims", json!({}))
        .expect_err("fault should surface");
    assert!(matches!(error, PluginError::RemoteFault { .. }));
    assert!(error.to_string().contains("no such claim"));
}

#[test]
fn call_times_out_when_no_reply_arrives() {
    let connection = connect_to_peer(|reader, writer| {
        ack_hello(reader, writer);
        // Swallow the call and stall past the caller's deadline.
        drop(proto_read(reader));
        thread::sleep(Duration::from_secs(2));
    })
    .expect("handshake");

    let error = connection
        .call("svc", "slow", json!(null))
        .expect_err("stalled call should time out");
    assert!(matches!(error, PluginError::CallTimeout { .. }));
}

#[test]
fn rpc_client_round_trips_typed_payloads() {
    let connection = connect_to_peer(|reader, writer| {
        ack_hello(reader, writer);
        let frame = proto_read(reader).expect("read call").expect("frame");
        let Frame::Call { seq, params, .. } = frame else {
            panic!("expected call, got {frame:?}");
        };
        proto_write(writer, &Frame::Reply { seq, result: params }).expect("write echo");
    })
    .expect("handshake");

    let client = RpcClient::new(Arc::new(connection), "svc".into());
    let echoed: Vec<u32> = client.call("echo", &vec![1_u32, 2, 3]).expect("echo reply");
    assert_eq!(echoed, vec![1, 2, 3]);
}
