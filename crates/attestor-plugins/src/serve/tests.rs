//! Unit tests for the plugin-side serve loop.

use std::io::BufReader;
use std::sync::Arc;
use std::thread;

use serde_json::json;

use super::*;
use crate::contract::Pluggable;
use crate::testing::{PipeReader, PipeWriter, StaticPluggable, base_channel, pipe};

/// Starts a server with one registered scheme plugin and returns the host
/// ends of its pipes.
fn start_server(handshake: HandshakeConfig) -> (PipeWriter, BufReader<PipeReader>) {
    let mut server = PluginServer::new(handshake);
    let plugin: Arc<dyn Pluggable> = Arc::new(
        StaticPluggable::new("cca-scheme", "CCA", "1.0.0")
            .with_media_types("evidence-verification", &["application/cca-token"]),
    );
    server
        .register("scheme", base_channel(), plugin)
        .expect("register scheme service");

    let (host_writer, plugin_reader) = pipe();
    let (plugin_writer, host_reader) = pipe();
    thread::spawn(move || {
        drop(server.serve_connection(plugin_reader, Box::new(plugin_writer)));
    });
    (host_writer, BufReader::new(host_reader))
}

fn send(writer: &mut PipeWriter, frame: &Frame) {
    write_frame(writer, frame).expect("write frame to server");
}

fn receive(reader: &mut BufReader<PipeReader>) -> Frame {
    read_frame(reader).expect("read frame from server").expect("frame present")
}

fn shake_hands(writer: &mut PipeWriter, reader: &mut BufReader<PipeReader>) {
    send(
        writer,
        &Frame::Hello {
            handshake: HandshakeConfig::default(),
        },
    );
    let ack = receive(reader);
    assert!(matches!(ack, Frame::HelloAck { protocol_version: 1 }));
}

#[test]
fn matching_hello_is_acknowledged() {
    let (mut writer, mut reader) = start_server(HandshakeConfig::default());
    shake_hands(&mut writer, &mut reader);
}

#[test]
fn mismatched_hello_is_rejected_and_connection_closes() {
    let (mut writer, mut reader) = start_server(HandshakeConfig::new(1, "OTHER_KEY", "OTHER"));
    send(
        &mut writer,
        &Frame::Hello {
            handshake: HandshakeConfig::default(),
        },
    );
    let reply = receive(&mut reader);
    assert!(matches!(reply, Frame::HelloReject { .. }));
    // The server closes its end after rejecting.
    assert_eq!(read_frame(&mut reader).expect("clean EOF"), None);
}

#[test]
fn connection_closes_when_first_frame_is_not_hello() {
    let (mut writer, mut reader) = start_server(HandshakeConfig::default());
    send(&mut writer, &Frame::Dispense { seq: 1, service: "scheme".into() });
    assert_eq!(read_frame(&mut reader).expect("clean EOF"), None);
}

#[test]
fn dispense_answers_for_registered_and_unknown_services() {
    let (mut writer, mut reader) = start_server(HandshakeConfig::default());
    shake_hands(&mut writer, &mut reader);

    send(&mut writer, &Frame::Dispense { seq: 1, service: "scheme".into() });
    assert_eq!(receive(&mut reader), Frame::Dispensed { seq: 1 });

    send(&mut writer, &Frame::Dispense { seq: 2, service: "store".into() });
    assert_eq!(
        receive(&mut reader),
        Frame::UnknownService {
            seq: 2,
            service: "store".into()
        }
    );
}

#[test]
fn calls_are_dispatched_to_the_service() {
    let (mut writer, mut reader) = start_server(HandshakeConfig::default());
    shake_hands(&mut writer, &mut reader);

    send(
        &mut writer,
        &Frame::Call {
            seq: 5,
            service: "scheme".into(),
            method: "get_name".into(),
            params: json!(null),
        },
    );
    assert_eq!(
        receive(&mut reader),
        Frame::Reply {
            seq: 5,
            result: json!("cca-scheme")
        }
    );
}

#[test]
fn unknown_methods_fault() {
    let (mut writer, mut reader) = start_server(HandshakeConfig::default());
    shake_hands(&mut writer, &mut reader);

    send(
        &mut writer,
        &Frame::Call {
            seq: 6,
            service: "scheme".into(),
            method: "does_not_exist".into(),
            params: json!(null),
        },
    );
    let reply = receive(&mut reader);
    assert!(matches!(reply, Frame::Fault { seq: 6, .. }));
}

#[test]
fn calls_to_unknown_services_fault() {
    let (mut writer, mut reader) = start_server(HandshakeConfig::default());
    shake_hands(&mut writer, &mut reader);

    send(
        &mut writer,
        &Frame::Call {
            seq: 7,
            service: "store".into(),
            method: "get_name".into(),
            params: json!(null),
        },
    );
    let reply = receive(&mut reader);
    assert!(matches!(reply, Frame::Fault { seq: 7, .. }));
}

#[test]
fn duplicate_service_registration_is_rejected() {
    let mut server = PluginServer::new(HandshakeConfig::default());
    let plugin: Arc<dyn Pluggable> = Arc::new(StaticPluggable::new("psa", "PSA", "1.0.0"));
    server
        .register("scheme", base_channel(), Arc::clone(&plugin))
        .expect("first registration");
    let error = server
        .register("scheme", base_channel(), plugin)
        .expect_err("duplicate should fail");
    assert!(matches!(error, PluginError::ChannelExists { .. }));
}

#[test]
fn serve_refuses_direct_execution_without_the_cookie() {
    // The variable is never set by the test harness, so this mimics a user
    // running the plugin binary by hand.
    let server = PluginServer::new(HandshakeConfig::new(1, "ATTESTOR_ABSENT_COOKIE", "VALUE"));
    let error = server.serve().expect_err("cookie is absent");
    assert!(matches!(error, PluginError::Handshake { .. }));
}

#[test]
fn shutdown_frame_ends_the_loop() {
    let (mut writer, mut reader) = start_server(HandshakeConfig::default());
    shake_hands(&mut writer, &mut reader);
    send(&mut writer, &Frame::Shutdown);
    assert_eq!(read_frame(&mut reader).expect("clean EOF"), None);
}
