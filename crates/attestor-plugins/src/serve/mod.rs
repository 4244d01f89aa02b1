//! Plugin-side serving of dispensed services.
//!
//! A plugin executable builds a [`PluginServer`], registers one
//! implementation per capability category it provides, and calls
//! [`PluginServer::serve`] from `main`. The server validates the host's
//! handshake, answers dispense requests from its dispatcher table, and runs
//! each capability call on its own thread so one slow method does not block
//! the connection for concurrent callers. It returns when the host closes
//! the pipe or sends a shutdown frame.

use std::collections::HashMap;
use std::io::{BufReader, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::{debug, warn};

use crate::channel::{RpcChannel, ServiceDispatcher};
use crate::error::PluginError;
use crate::handshake::HandshakeConfig;
use crate::protocol::{Frame, read_frame, write_frame};

/// Tracing target for plugin-side serving.
const SERVE_TARGET: &str = "attestor_plugins::serve";

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Serves one plugin executable's capability categories to the host.
pub struct PluginServer {
    handshake: HandshakeConfig,
    dispatchers: HashMap<String, Arc<dyn ServiceDispatcher>>,
}

impl std::fmt::Debug for PluginServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginServer")
            .field("handshake", &self.handshake)
            .field("services", &self.dispatchers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginServer {
    /// Creates a server that accepts connections carrying `handshake`.
    #[must_use]
    pub fn new(handshake: HandshakeConfig) -> Self {
        Self {
            handshake,
            dispatchers: HashMap::new(),
        }
    }

    /// Registers a local implementation for one capability category.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ChannelExists`] if a service is already
    /// registered under `name`.
    pub fn register<H>(
        &mut self,
        name: &str,
        channel: RpcChannel<H>,
        implementation: H,
    ) -> Result<(), PluginError> {
        if self.dispatchers.contains_key(name) {
            return Err(PluginError::ChannelExists {
                name: name.to_owned(),
            });
        }
        self.dispatchers
            .insert(name.to_owned(), Arc::from(channel.wrap_server(implementation)));
        Ok(())
    }

    /// Blocks serving the host over stdin/stdout until the connection ends.
    ///
    /// Refuses to run unless the handshake cookie environment variable is
    /// present and correct, so direct execution of a plugin binary by a
    /// user fails fast instead of hanging on stdin.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Handshake`] when the cookie variable is
    /// absent or wrong, or a transport error from the serve loop.
    pub fn serve(self) -> Result<(), PluginError> {
        let cookie = std::env::var(self.handshake.cookie_key()).unwrap_or_default();
        if cookie != self.handshake.cookie_value() {
            return Err(PluginError::Handshake {
                path: std::env::current_exe().unwrap_or_default(),
                message: String::from(
                    "this binary is an attestor plugin and must be launched by its host service",
                ),
            });
        }
        self.serve_connection(std::io::stdin(), Box::new(std::io::stdout()))
    }

    /// Serves one connection over arbitrary pipe halves.
    ///
    /// This is the transport-agnostic core of [`PluginServer::serve`]; test
    /// harnesses drive it over in-memory pipes.
    ///
    /// # Errors
    ///
    /// Returns a transport error when a response frame cannot be written.
    pub fn serve_connection(
        self,
        reader: impl Read,
        writer: Box<dyn Write + Send>,
    ) -> Result<(), PluginError> {
        let shared_writer: SharedWriter = Arc::new(Mutex::new(writer));
        let mut buffered = BufReader::new(reader);

        if !self.await_hello(&mut buffered, &shared_writer)? {
            return Ok(());
        }

        loop {
            match read_frame(&mut buffered)? {
                Some(Frame::Dispense { seq, service }) => {
                    self.answer_dispense(&shared_writer, seq, &service)?;
                }
                Some(Frame::Call {
                    seq,
                    service,
                    method,
                    params,
                }) => self.answer_call(&shared_writer, seq, &service, method, params)?,
                Some(Frame::Shutdown) | None => break,
                Some(frame) => warn!(
                    target: SERVE_TARGET,
                    ?frame,
                    "ignoring unexpected frame"
                ),
            }
        }
        debug!(target: SERVE_TARGET, "connection closed, serve loop ending");
        Ok(())
    }

    /// Waits for the hello frame and answers it. Returns `false` when the
    /// handshake failed and the connection should close.
    fn await_hello(
        &self,
        reader: &mut impl std::io::BufRead,
        writer: &SharedWriter,
    ) -> Result<bool, PluginError> {
        let Some(frame) = read_frame(reader)? else {
            return Ok(false);
        };
        let handshake = match frame {
            Frame::Hello { handshake } => handshake,
            other => {
                warn!(
                    target: SERVE_TARGET,
                    frame = ?other,
                    "closing connection: first frame was not a hello"
                );
                return Ok(false);
            }
        };
        if self.handshake.matches(&handshake) {
            write_shared(
                writer,
                &Frame::HelloAck {
                    protocol_version: self.handshake.protocol_version(),
                },
            )?;
            return Ok(true);
        }
        write_shared(
            writer,
            &Frame::HelloReject {
                message: String::from("handshake triple does not match this plugin build"),
            },
        )?;
        Ok(false)
    }

    fn answer_dispense(
        &self,
        writer: &SharedWriter,
        seq: u64,
        service: &str,
    ) -> Result<(), PluginError> {
        let frame = if self.dispatchers.contains_key(service) {
            debug!(target: SERVE_TARGET, service, "dispensing service");
            Frame::Dispensed { seq }
        } else {
            debug!(target: SERVE_TARGET, service, "service not provided");
            Frame::UnknownService {
                seq,
                service: service.to_owned(),
            }
        };
        write_shared(writer, &frame)
    }

    fn answer_call(
        &self,
        writer: &SharedWriter,
        seq: u64,
        service: &str,
        method: String,
        params: Value,
    ) -> Result<(), PluginError> {
        let Some(entry) = self.dispatchers.get(service) else {
            return write_shared(
                writer,
                &Frame::Fault {
                    seq,
                    message: format!("service {service:?} is not provided by this plugin"),
                },
            );
        };
        let dispatcher = Arc::clone(entry);
        let response_writer = Arc::clone(writer);
        std::thread::spawn(move || {
            let frame = match dispatcher.dispatch(&method, params) {
                Ok(result) => Frame::Reply { seq, result },
                Err(message) => Frame::Fault { seq, message },
            };
            if let Err(err) = write_shared(&response_writer, &frame) {
                warn!(
                    target: SERVE_TARGET,
                    method,
                    error = %err,
                    "failed to write call response"
                );
            }
        });
        Ok(())
    }
}

fn write_shared(writer: &SharedWriter, frame: &Frame) -> Result<(), PluginError> {
    let mut guard = writer.lock().unwrap_or_else(PoisonError::into_inner);
    write_frame(&mut *guard, frame)
}

#[cfg(test)]
mod tests;
