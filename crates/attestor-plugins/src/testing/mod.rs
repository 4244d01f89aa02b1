//! In-process test support for exercising the full binding path.
//!
//! Real deployments launch plugin executables; tests launch
//! [`crate::serve::PluginServer`] instances on background threads, wired to
//! the host over in-memory pipes. The [`InProcessLauncher`] implements the
//! [`Launcher`] seam so loaders under test run the genuine handshake,
//! dispense, and call machinery without any binaries on disk.
//!
//! Available to dependent crates through the `test-support` cargo feature.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::channel::{RpcChannel, ServiceDispatcher};
use crate::connection::RpcClient;
use crate::contract::{
    METHOD_GET_ATTESTATION_SCHEME, METHOD_GET_NAME, METHOD_GET_SUPPORTED_MEDIA_TYPES,
    METHOD_GET_VERSION, MediaTypeMap, Pluggable, dispatch_base,
};
use crate::error::PluginError;
use crate::process::{LaunchedPlugin, Launcher, ProcessSupervisor};
use crate::serve::PluginServer;

enum PipeMessage {
    Data(Vec<u8>),
    Eof,
}

/// Write half of an in-memory pipe.
pub struct PipeWriter {
    sender: Sender<PipeMessage>,
}

impl Clone for PipeWriter {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl PipeWriter {
    /// Signals end-of-stream to the read half.
    pub fn close(&self) {
        drop(self.sender.send(PipeMessage::Eof));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.sender
            .send(PipeMessage::Data(buf.to_vec()))
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Read half of an in-memory pipe.
pub struct PipeReader {
    receiver: Receiver<PipeMessage>,
    buffer: VecDeque<u8>,
    done: bool,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.buffer.is_empty() {
            if self.done {
                return Ok(0);
            }
            match self.receiver.recv() {
                Ok(PipeMessage::Data(bytes)) => self.buffer.extend(bytes),
                Ok(PipeMessage::Eof) | Err(_) => {
                    self.done = true;
                    return Ok(0);
                }
            }
        }
        let count = self.buffer.len().min(buf.len());
        for slot in buf.iter_mut().take(count) {
            if let Some(byte) = self.buffer.pop_front() {
                *slot = byte;
            }
        }
        Ok(count)
    }
}

/// Creates a unidirectional in-memory pipe.
#[must_use]
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (sender, receiver) = channel();
    (
        PipeWriter { sender },
        PipeReader {
            receiver,
            buffer: VecDeque::new(),
            done: false,
        },
    )
}

/// A fixed, in-memory implementation of the base capability contract.
#[derive(Debug, Clone)]
pub struct StaticPluggable {
    name: String,
    scheme: String,
    version: String,
    media_types: MediaTypeMap,
}

impl StaticPluggable {
    /// Creates a plugin implementation with the given identity.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        scheme: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            scheme: scheme.into(),
            version: version.into(),
            media_types: MediaTypeMap::new(),
        }
    }

    /// Declares media types for one media-type category.
    #[must_use]
    pub fn with_media_types(mut self, category: &str, media_types: &[&str]) -> Self {
        self.media_types.insert(
            category.to_owned(),
            media_types.iter().map(|&media_type| media_type.to_owned()).collect(),
        );
        self
    }
}

impl Pluggable for StaticPluggable {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn attestation_scheme(&self) -> String {
        self.scheme.clone()
    }

    fn supported_media_types(&self) -> MediaTypeMap {
        self.media_types.clone()
    }

    fn version(&self) -> String {
        self.version.clone()
    }
}

/// Host-side stub implementing only the base contract over RPC.
#[derive(Debug, Clone)]
pub struct BaseClient {
    client: RpcClient,
}

impl Pluggable for BaseClient {
    fn name(&self) -> String {
        self.client.call_or_default(METHOD_GET_NAME)
    }

    fn attestation_scheme(&self) -> String {
        self.client.call_or_default(METHOD_GET_ATTESTATION_SCHEME)
    }

    fn supported_media_types(&self) -> MediaTypeMap {
        self.client.call_or_default(METHOD_GET_SUPPORTED_MEDIA_TYPES)
    }

    fn version(&self) -> String {
        self.client.call_or_default(METHOD_GET_VERSION)
    }
}

struct BaseDispatcher {
    inner: Arc<dyn Pluggable>,
}

impl ServiceDispatcher for BaseDispatcher {
    fn dispatch(&self, method: &str, _params: Value) -> Result<Value, String> {
        dispatch_base(self.inner.as_ref(), method)
            .ok_or_else(|| format!("unknown method {method:?}"))
    }
}

/// Channel for the plain base contract, with `Arc<dyn Pluggable>` handles.
#[must_use]
pub fn base_channel() -> RpcChannel<Arc<dyn Pluggable>> {
    fn wrap_client(client: RpcClient) -> Arc<dyn Pluggable> {
        Arc::new(BaseClient { client })
    }
    fn wrap_server(inner: Arc<dyn Pluggable>) -> Box<dyn ServiceDispatcher> {
        Box::new(BaseDispatcher { inner })
    }
    RpcChannel::new(wrap_client, wrap_server)
}

/// Builds fresh [`PluginServer`]s, one per launch of a scripted executable.
pub type ProgramFactory = Box<dyn Fn() -> PluginServer + Send + Sync>;

struct InProcessSupervisor {
    running: Arc<AtomicBool>,
    host_to_plugin: PipeWriter,
    plugin_to_host: PipeWriter,
}

impl ProcessSupervisor for InProcessSupervisor {
    fn kill(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.host_to_plugin.close();
        self.plugin_to_host.close();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Launches scripted plugin servers on background threads.
///
/// Paths with no registered program fail to launch, mirroring a missing or
/// broken executable.
#[derive(Default)]
pub struct InProcessLauncher {
    programs: Mutex<HashMap<PathBuf, ProgramFactory>>,
    live: Arc<AtomicUsize>,
}

impl std::fmt::Debug for InProcessLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessLauncher")
            .field("live", &self.live.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl InProcessLauncher {
    /// Creates a launcher with no registered programs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the program to run for launches of `path`.
    pub fn script(&self, path: impl Into<PathBuf>, factory: ProgramFactory) {
        self.programs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), factory);
    }

    /// Returns the number of scripted plugins currently running.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Waits until every scripted plugin has stopped, up to `timeout`.
    ///
    /// Serve threads unwind asynchronously after a kill; assertions on
    /// [`InProcessLauncher::running_count`] should wait first.
    #[must_use]
    pub fn wait_idle(&self, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while self.live.load(Ordering::SeqCst) > 0 {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        true
    }
}

impl Launcher for InProcessLauncher {
    fn launch(&self, path: &Path) -> Result<LaunchedPlugin, PluginError> {
        let server = {
            let programs = self.programs.lock().unwrap_or_else(PoisonError::into_inner);
            let factory = programs.get(path).ok_or_else(|| PluginError::SpawnFailed {
                path: path.to_path_buf(),
                message: String::from("no such scripted plugin"),
                source: None,
            })?;
            factory()
        };

        let (host_writer, plugin_reader) = pipe();
        let (plugin_writer, host_reader) = pipe();
        let running = Arc::new(AtomicBool::new(true));
        let live = Arc::clone(&self.live);
        live.fetch_add(1, Ordering::SeqCst);

        let supervisor = InProcessSupervisor {
            running: Arc::clone(&running),
            host_to_plugin: host_writer.clone(),
            plugin_to_host: plugin_writer.clone(),
        };

        std::thread::spawn(move || {
            drop(server.serve_connection(plugin_reader, Box::new(plugin_writer)));
            running.store(false, Ordering::SeqCst);
            live.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(LaunchedPlugin {
            writer: Box::new(host_writer),
            reader: Box::new(host_reader),
            supervisor: Box::new(supervisor),
        })
    }
}
