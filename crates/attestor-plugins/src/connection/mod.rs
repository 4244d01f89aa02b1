//! Host-side multiplexed connection to a plugin subprocess.
//!
//! A [`Connection`] owns the write half of the subprocess's stdio pipe and a
//! background reader thread. Outgoing dispense and call frames carry a
//! sequence number from a monotonically increasing counter; the reader
//! thread routes each response frame to the waiting caller by that number,
//! so independent calls from concurrent call sites multiplex safely over the
//! single pipe without serialising each other.
//!
//! Every exchange, including the handshake, carries a deadline. Expiry
//! surfaces as [`PluginError::CallTimeout`] instead of blocking the caller
//! on a hung subprocess.

use std::collections::HashMap;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::PluginError;
use crate::handshake::HandshakeConfig;
use crate::protocol::{Frame, read_frame, write_frame};

/// Tracing target for connection operations.
const CONNECTION_TARGET: &str = "attestor_plugins::connection";

/// Sequence number reserved for the handshake exchange.
const HANDSHAKE_SEQ: u64 = 0;

type PendingMap = HashMap<u64, SyncSender<Frame>>;

/// A live, multiplexed connection to one plugin subprocess.
pub struct Connection {
    peer: PathBuf,
    writer: Mutex<Box<dyn Write + Send>>,
    pending: Arc<Mutex<PendingMap>>,
    next_seq: AtomicU64,
    timeout: Duration,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Establishes a connection over the given pipe halves, performing the
    /// handshake before returning.
    ///
    /// `peer` labels the subprocess (its executable path) in errors and
    /// logs. The reader thread is started first so the handshake reply is
    /// routed like any other response and honours `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Handshake`] if the plugin rejects the triple,
    /// answers with a mismatched protocol version, or closes the pipe, and
    /// [`PluginError::CallTimeout`] if no answer arrives within the deadline.
    pub fn establish(
        writer: Box<dyn Write + Send>,
        reader: Box<dyn Read + Send>,
        peer: &Path,
        handshake: &HandshakeConfig,
        timeout: Duration,
    ) -> Result<Self, PluginError> {
        let connection = Self {
            peer: peer.to_path_buf(),
            writer: Mutex::new(writer),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(HANDSHAKE_SEQ + 1),
            timeout,
        };
        connection.spawn_reader(reader);

        let (sender, receiver) = mpsc::sync_channel(1);
        lock_pending(&connection.pending).insert(HANDSHAKE_SEQ, sender);
        connection.write(&Frame::Hello {
            handshake: handshake.clone(),
        })?;

        let reply = match connection.wait(HANDSHAKE_SEQ, &receiver, "handshake", "hello") {
            Ok(reply) => reply,
            // A peer that stalls or drops the pipe before answering the
            // hello has failed the handshake, whatever the transport said.
            Err(err) => {
                return Err(PluginError::Handshake {
                    path: connection.peer,
                    message: err.to_string(),
                });
            }
        };
        connection.check_hello_reply(&reply, handshake)
    }

    fn check_hello_reply(
        self,
        reply: &Frame,
        handshake: &HandshakeConfig,
    ) -> Result<Self, PluginError> {
        match reply {
            Frame::HelloAck { protocol_version }
                if *protocol_version == handshake.protocol_version() =>
            {
                debug!(
                    target: CONNECTION_TARGET,
                    peer = %self.peer.display(),
                    protocol_version,
                    "handshake complete"
                );
                Ok(self)
            }
            Frame::HelloAck { protocol_version } => Err(PluginError::Handshake {
                path: self.peer,
                message: format!(
                    "protocol version mismatch: host speaks {}, plugin speaks {protocol_version}",
                    handshake.protocol_version()
                ),
            }),
            Frame::HelloReject { message } => Err(PluginError::Handshake {
                path: self.peer,
                message: message.clone(),
            }),
            other => Err(PluginError::Handshake {
                path: self.peer,
                message: format!("unexpected frame before handshake completion: {other:?}"),
            }),
        }
    }

    /// Asks the subprocess to dispense the service with the given protocol
    /// name.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::UnknownService`] when the subprocess does not
    /// serve the name (recoverable during discovery), or a transport error.
    pub fn dispense(&self, service: &str) -> Result<(), PluginError> {
        let reply = self.roundtrip(service, "dispense", |seq| Frame::Dispense {
            seq,
            service: service.to_owned(),
        })?;
        match reply {
            Frame::Dispensed { .. } => {
                debug!(
                    target: CONNECTION_TARGET,
                    peer = %self.peer.display(),
                    service,
                    "service dispensed"
                );
                Ok(())
            }
            Frame::UnknownService { .. } => Err(PluginError::UnknownService {
                path: self.peer.clone(),
                service: service.to_owned(),
            }),
            other => Err(self.unexpected_frame(service, "dispense", &other)),
        }
    }

    /// Invokes a method on a dispensed service and returns the raw result.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::RemoteFault`] when the plugin reports a fault,
    /// [`PluginError::CallTimeout`] on deadline expiry, or a transport error.
    pub fn call(&self, service: &str, method: &str, params: Value) -> Result<Value, PluginError> {
        let reply = self.roundtrip(service, method, |seq| Frame::Call {
            seq,
            service: service.to_owned(),
            method: method.to_owned(),
            params,
        })?;
        match reply {
            Frame::Reply { result, .. } => Ok(result),
            Frame::Fault { message, .. } => Err(PluginError::RemoteFault {
                service: service.to_owned(),
                method: method.to_owned(),
                message,
            }),
            other => Err(self.unexpected_frame(service, method, &other)),
        }
    }

    /// Sends a best-effort shutdown notice; failures are ignored.
    pub fn send_shutdown(&self) {
        if self.write(&Frame::Shutdown).is_err() {
            debug!(
                target: CONNECTION_TARGET,
                peer = %self.peer.display(),
                "shutdown notice not delivered"
            );
        }
    }

    fn roundtrip(
        &self,
        service: &str,
        method: &str,
        build: impl FnOnce(u64) -> Frame,
    ) -> Result<Frame, PluginError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::sync_channel(1);
        lock_pending(&self.pending).insert(seq, sender);

        if let Err(err) = self.write(&build(seq)) {
            lock_pending(&self.pending).remove(&seq);
            return Err(err);
        }
        self.wait(seq, &receiver, service, method)
    }

    fn wait(
        &self,
        seq: u64,
        receiver: &mpsc::Receiver<Frame>,
        service: &str,
        method: &str,
    ) -> Result<Frame, PluginError> {
        match receiver.recv_timeout(self.timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => {
                lock_pending(&self.pending).remove(&seq);
                Err(PluginError::CallTimeout {
                    service: service.to_owned(),
                    method: method.to_owned(),
                    timeout_secs: self.timeout.as_secs(),
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(PluginError::Disconnected {
                message: format!("pipe to {} closed", self.peer.display()),
            }),
        }
    }

    fn write(&self, frame: &Frame) -> Result<(), PluginError> {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        write_frame(&mut *writer, frame)
    }

    fn unexpected_frame(&self, service: &str, method: &str, frame: &Frame) -> PluginError {
        PluginError::Codec {
            message: format!(
                "unexpected frame answering {service}.{method} from {}: {frame:?}",
                self.peer.display()
            ),
            source: None,
        }
    }

    fn spawn_reader(&self, reader: Box<dyn Read + Send>) {
        let pending = Arc::clone(&self.pending);
        let peer = self.peer.clone();
        std::thread::spawn(move || {
            let mut buffered = BufReader::new(reader);
            loop {
                match read_frame(&mut buffered) {
                    Ok(Some(frame)) => route_frame(&pending, &peer, frame),
                    Ok(None) => break,
                    Err(err) => {
                        warn!(
                            target: CONNECTION_TARGET,
                            peer = %peer.display(),
                            error = %err,
                            "reader thread stopping on protocol error"
                        );
                        break;
                    }
                }
            }
            // Dropping the pending senders wakes every waiting caller with
            // a disconnected error.
            lock_pending(&pending).clear();
        });
    }
}

fn route_frame(pending: &Arc<Mutex<PendingMap>>, peer: &Path, frame: Frame) {
    let Some(seq) = frame.response_seq().or(match &frame {
        Frame::HelloAck { .. } | Frame::HelloReject { .. } => Some(HANDSHAKE_SEQ),
        _ => None,
    }) else {
        warn!(
            target: CONNECTION_TARGET,
            peer = %peer.display(),
            ?frame,
            "discarding frame with no originating request"
        );
        return;
    };
    match lock_pending(pending).remove(&seq) {
        Some(waiting) => {
            // The caller may have timed out and dropped the receiver.
            drop(waiting.try_send(frame));
        }
        None => debug!(
            target: CONNECTION_TARGET,
            peer = %peer.display(),
            seq,
            "response for unknown or expired sequence number"
        ),
    }
}

fn lock_pending(pending: &Arc<Mutex<PendingMap>>) -> std::sync::MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A cheap, cloneable handle for invoking one dispensed service.
///
/// Category client stubs hold an `RpcClient` and translate their trait
/// methods into typed [`RpcClient::call`] invocations.
#[derive(Debug, Clone)]
pub struct RpcClient {
    connection: Arc<Connection>,
    service: String,
}

impl RpcClient {
    /// Creates a client scoped to one service on a connection.
    #[must_use]
    pub const fn new(connection: Arc<Connection>, service: String) -> Self {
        Self {
            connection,
            service,
        }
    }

    /// Returns the protocol name of the service this client addresses.
    #[must_use]
    pub const fn service(&self) -> &str {
        self.service.as_str()
    }

    /// Invokes a method with typed parameters and result.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Codec`] when parameters or result do not
    /// serialise, plus any transport error from the underlying call.
    pub fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<R, PluginError> {
        let encoded = serde_json::to_value(params).map_err(|err| PluginError::Codec {
            message: format!("failed to serialise parameters for {method}"),
            source: Some(err),
        })?;
        let result = self.connection.call(&self.service, method, encoded)?;
        serde_json::from_value(result).map_err(|err| PluginError::Codec {
            message: format!("failed to deserialise result of {method}"),
            source: Some(err),
        })
    }

    /// Invokes a parameterless method, logging and defaulting on failure.
    ///
    /// Used by client stubs for the base contract getters, whose trait
    /// signatures are infallible; failures are logged at warn level.
    #[must_use]
    pub fn call_or_default<R: DeserializeOwned + Default>(&self, method: &str) -> R {
        self.call(method, &()).unwrap_or_else(|err| {
            warn!(
                target: CONNECTION_TARGET,
                service = self.service,
                method,
                error = %err,
                "base contract call failed, substituting default"
            );
            R::default()
        })
    }
}

#[cfg(test)]
mod tests;
