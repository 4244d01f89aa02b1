//! Subprocess supervision and capability binding.
//!
//! [`CommandLauncher`] spawns a candidate executable with piped stdio and a
//! stderr-draining log thread, exporting the handshake cookie in the child's
//! environment. [`bind`] drives the full binding sequence against a launched
//! subprocess: handshake, service dispensing, client wrapping, and the base
//! contract metadata reads that populate the plugin descriptor. Every
//! failure after launch kills the subprocess before the error is returned,
//! so no candidate leaks a process.
//!
//! The [`Launcher`] trait is the seam for test doubles: test code launches
//! in-process plugin servers over in-memory pipes instead of real binaries.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::channel::RpcChannel;
use crate::connection::{Connection, RpcClient};
use crate::contract::{
    METHOD_GET_ATTESTATION_SCHEME, METHOD_GET_NAME, METHOD_GET_SUPPORTED_MEDIA_TYPES,
    METHOD_GET_VERSION, MediaTypeMap, Pluggable,
};
use crate::context::{PluginContext, PluginDescriptor, PluginProcess};
use crate::error::PluginError;
use crate::handshake::HandshakeConfig;

/// Tracing target for process operations.
const PROCESS_TARGET: &str = "attestor_plugins::process";

/// Kill/liveness handle for one launched subprocess.
pub trait ProcessSupervisor: Send + Sync {
    /// Terminates the subprocess, best-effort and idempotent.
    fn kill(&self);

    /// Returns `true` while the subprocess is still running.
    fn is_running(&self) -> bool;
}

/// The pipe halves and supervisor of a freshly launched subprocess.
pub struct LaunchedPlugin {
    /// Write half towards the subprocess's stdin.
    pub writer: Box<dyn Write + Send>,
    /// Read half from the subprocess's stdout.
    pub reader: Box<dyn Read + Send>,
    /// Kill/liveness handle for the subprocess.
    pub supervisor: Box<dyn ProcessSupervisor>,
}

impl std::fmt::Debug for LaunchedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedPlugin").finish_non_exhaustive()
    }
}

/// Launches candidate plugin executables.
pub trait Launcher: Send + Sync {
    /// Launches the executable at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::SpawnFailed`] when the subprocess cannot be
    /// started or its pipes cannot be captured.
    fn launch(&self, path: &Path) -> Result<LaunchedPlugin, PluginError>;
}

/// Production launcher spawning real subprocesses.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    handshake: HandshakeConfig,
}

impl CommandLauncher {
    /// Creates a launcher that exports the given handshake cookie to every
    /// child process.
    #[must_use]
    pub const fn new(handshake: HandshakeConfig) -> Self {
        Self { handshake }
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, path: &Path) -> Result<LaunchedPlugin, PluginError> {
        debug!(
            target: PROCESS_TARGET,
            executable = %path.display(),
            "spawning plugin process"
        );
        let mut child = Command::new(path)
            .env(self.handshake.cookie_key(), self.handshake.cookie_value())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| PluginError::SpawnFailed {
                path: path.to_path_buf(),
                message: err.to_string(),
                source: Some(Arc::new(err)),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| capture_failure(path, "stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| capture_failure(path, "stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            drain_stderr(path, stderr);
        }

        Ok(LaunchedPlugin {
            writer: Box::new(stdin),
            reader: Box::new(stdout),
            supervisor: Box::new(ChildSupervisor {
                child: Mutex::new(child),
            }),
        })
    }
}

fn capture_failure(path: &Path, stream: &str) -> PluginError {
    PluginError::SpawnFailed {
        path: path.to_path_buf(),
        message: format!("failed to capture {stream}"),
        source: None,
    }
}

/// Forwards the subprocess's stderr lines to the log, one line at a time,
/// so the child never blocks on a full pipe buffer.
fn drain_stderr(path: &Path, stderr: impl Read + Send + 'static) {
    let origin = path.to_path_buf();
    std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(text) if !text.is_empty() => debug!(
                    target: PROCESS_TARGET,
                    plugin = %origin.display(),
                    stderr = %text,
                    "plugin stderr output"
                ),
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
}

struct ChildSupervisor {
    child: Mutex<Child>,
}

impl ProcessSupervisor for ChildSupervisor {
    fn kill(&self) {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if child.kill().is_err() {
            // Already exited.
            return;
        }
        drop(child.wait());
    }

    fn is_running(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(child.try_wait(), Ok(None))
    }
}

/// Metadata read from a freshly dispensed service.
struct BaseMetadata {
    name: String,
    scheme: String,
    version: String,
    media_types: MediaTypeMap,
}

/// Binds one candidate executable to a capability category.
///
/// Implements the full sequence: launch, handshake, dispense, wrap, and the
/// base contract reads that populate the descriptor. Every error after a
/// successful launch kills the subprocess before returning.
///
/// # Errors
///
/// Returns [`PluginError::UnknownService`] when the candidate does not
/// serve `service` (recoverable during discovery); all other errors are
/// fatal for the candidate.
pub fn bind<H>(
    launcher: &dyn Launcher,
    path: &Path,
    service: &str,
    channel: RpcChannel<H>,
    handshake: &HandshakeConfig,
    timeout: Duration,
) -> Result<PluginContext<H>, PluginError>
where
    H: Pluggable + Clone + Send + Sync + 'static,
{
    let launched = launcher.launch(path)?;
    let supervisor = launched.supervisor;

    let connection =
        match Connection::establish(launched.writer, launched.reader, path, handshake, timeout) {
            Ok(connection) => Arc::new(connection),
            Err(err) => {
                supervisor.kill();
                return Err(err);
            }
        };

    if let Err(err) = connection.dispense(service) {
        supervisor.kill();
        return Err(err);
    }

    let client = RpcClient::new(Arc::clone(&connection), service.to_owned());
    let metadata = match read_base_metadata(&client, path, service) {
        Ok(metadata) => metadata,
        Err(err) => {
            supervisor.kill();
            return Err(err);
        }
    };

    debug!(
        target: PROCESS_TARGET,
        plugin = metadata.name,
        scheme = metadata.scheme,
        version = metadata.version,
        path = %path.display(),
        "plugin bound"
    );

    let descriptor = PluginDescriptor::new(
        path,
        metadata.name,
        metadata.scheme,
        metadata.version,
        &metadata.media_types,
    );
    let handle = channel.wrap_client(client);
    let process = PluginProcess::new(connection, supervisor);
    Ok(PluginContext::new(
        descriptor,
        service.to_owned(),
        handle,
        process,
    ))
}

/// Reads the four base contract values, classifying failures as capability
/// shape errors for this candidate.
fn read_base_metadata(
    client: &RpcClient,
    path: &Path,
    service: &str,
) -> Result<BaseMetadata, PluginError> {
    let shape_error = |message: String| PluginError::CapabilityShape {
        path: path.to_path_buf(),
        category: service.to_owned(),
        message,
    };

    let name: String = client
        .call(METHOD_GET_NAME, &())
        .map_err(|err| shape_error(format!("get_name failed: {err}")))?;
    if name.trim().is_empty() {
        return Err(shape_error("plugin reported an empty instance name".into()));
    }
    let scheme: String = client
        .call(METHOD_GET_ATTESTATION_SCHEME, &())
        .map_err(|err| shape_error(format!("get_attestation_scheme failed: {err}")))?;
    let version: String = client
        .call(METHOD_GET_VERSION, &())
        .map_err(|err| shape_error(format!("get_version failed: {err}")))?;
    let media_types: MediaTypeMap = client
        .call(METHOD_GET_SUPPORTED_MEDIA_TYPES, &())
        .map_err(|err| shape_error(format!("get_supported_media_types failed: {err}")))?;

    Ok(BaseMetadata {
        name,
        scheme,
        version,
        media_types,
    })
}
