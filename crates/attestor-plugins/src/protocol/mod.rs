//! Wire protocol for host-plugin communication.
//!
//! The transport is line-delimited JSON over the subprocess's stdin and
//! stdout: every frame is one JSON object terminated by a newline. The host
//! opens the exchange with a [`Frame::Hello`] carrying the handshake triple;
//! after a [`Frame::HelloAck`] both sides exchange dispense and call frames,
//! matched to their originators by the host-allocated `seq` number. Plugin
//! stderr is outside the protocol and is drained for diagnostic logging.

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PluginError;
use crate::handshake::HandshakeConfig;

/// A single protocol frame.
///
/// Serialised as one JSONL line with a `type` discriminator field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Connection bootstrap, host to plugin. Carries the handshake triple.
    Hello {
        /// Handshake triple the host was built with.
        #[serde(flatten)]
        handshake: HandshakeConfig,
    },
    /// Handshake accepted, plugin to host.
    HelloAck {
        /// Protocol version the plugin was built with.
        protocol_version: u32,
    },
    /// Handshake rejected, plugin to host. The plugin closes the connection
    /// after sending this frame.
    HelloReject {
        /// Reason for the rejection.
        message: String,
    },
    /// Request to dispense the service with the given protocol name.
    Dispense {
        /// Sequence number allocated by the host.
        seq: u64,
        /// Protocol name of the requested service.
        service: String,
    },
    /// The plugin serves the requested name.
    Dispensed {
        /// Sequence number of the originating dispense.
        seq: u64,
    },
    /// The plugin does not serve the requested name. Distinguished from a
    /// transport error so discovery can skip the candidate.
    UnknownService {
        /// Sequence number of the originating dispense.
        seq: u64,
        /// Protocol name that was requested.
        service: String,
    },
    /// Capability call, host to plugin.
    Call {
        /// Sequence number allocated by the host.
        seq: u64,
        /// Protocol name of the dispensed service.
        service: String,
        /// Method name within the service.
        method: String,
        /// Method parameters as arbitrary JSON.
        params: Value,
    },
    /// Successful call result, plugin to host.
    Reply {
        /// Sequence number of the originating call.
        seq: u64,
        /// Method result as arbitrary JSON.
        result: Value,
    },
    /// Call failure, plugin to host.
    Fault {
        /// Sequence number of the originating call.
        seq: u64,
        /// Fault description.
        message: String,
    },
    /// Best-effort teardown notice, host to plugin.
    Shutdown,
}

impl Frame {
    /// Returns the sequence number this frame responds to, if it is a
    /// response frame.
    #[must_use]
    pub const fn response_seq(&self) -> Option<u64> {
        match self {
            Self::Dispensed { seq }
            | Self::UnknownService { seq, .. }
            | Self::Reply { seq, .. }
            | Self::Fault { seq, .. } => Some(*seq),
            _ => None,
        }
    }
}

/// Writes one frame as a JSONL line and flushes the writer.
///
/// # Errors
///
/// Returns [`PluginError::Codec`] if the frame cannot be serialised and
/// [`PluginError::Io`] on write failure.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), PluginError> {
    let mut line = serde_json::to_string(frame).map_err(|err| PluginError::Codec {
        message: "failed to serialise frame".into(),
        source: Some(err),
    })?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .and_then(|()| writer.flush())
        .map_err(|err| PluginError::Io {
            context: "writing protocol frame".into(),
            source: std::sync::Arc::new(err),
        })
}

/// Reads one frame from the next JSONL line.
///
/// Returns `Ok(None)` on a clean end of stream.
///
/// # Errors
///
/// Returns [`PluginError::Io`] on read failure and [`PluginError::Codec`]
/// when the line is not a valid frame.
pub fn read_frame<R: BufRead>(reader: &mut R) -> Result<Option<Frame>, PluginError> {
    let mut line = String::new();
    let bytes_read = reader
        .read_line(&mut line)
        .map_err(|err| PluginError::Io {
            context: "reading protocol frame".into(),
            source: std::sync::Arc::new(err),
        })?;
    if bytes_read == 0 {
        return Ok(None);
    }
    serde_json::from_str(line.trim())
        .map(Some)
        .map_err(|err| PluginError::Codec {
            message: format!("invalid protocol frame: {}", line.trim()),
            source: Some(err),
        })
}

#[cfg(test)]
mod tests;
