//! Bound plugin contexts.
//!
//! A successful binding produces a [`PluginContext`]: the self-reported
//! [`PluginDescriptor`], the live typed handle, and the owning
//! [`PluginProcess`]. Contexts are parameterised by the capability handle
//! type; a single executable bound against several categories yields one
//! context per category. The loader stores contexts type-erased behind
//! [`ErasedContext`] so one index can hold every category.

use std::any::Any;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::connection::Connection;
use crate::contract::MediaTypeMap;
use crate::process::ProcessSupervisor;

/// Tracing target for context lifecycle events.
const CONTEXT_TARGET: &str = "attestor_plugins::context";

/// Immutable metadata self-reported by a bound plugin.
///
/// Produced once by a successful binding and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    path: PathBuf,
    instance_name: String,
    attestation_scheme: String,
    version: String,
    media_types: BTreeSet<String>,
}

impl PluginDescriptor {
    /// Creates a descriptor, flattening the per-category media-type map
    /// into an ordered, deduplicated set.
    #[must_use]
    pub fn new(
        path: &Path,
        instance_name: String,
        attestation_scheme: String,
        version: String,
        media_types: &MediaTypeMap,
    ) -> Self {
        let flattened = media_types
            .values()
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>();
        Self {
            path: path.to_path_buf(),
            instance_name,
            attestation_scheme,
            version,
            media_types: flattened,
        }
    }

    /// Returns the path of the executable this plugin was bound from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the self-reported instance name.
    #[must_use]
    pub const fn instance_name(&self) -> &str {
        self.instance_name.as_str()
    }

    /// Returns the attestation scheme this plugin implements.
    #[must_use]
    pub const fn attestation_scheme(&self) -> &str {
        self.attestation_scheme.as_str()
    }

    /// Returns the plugin version.
    #[must_use]
    pub const fn version(&self) -> &str {
        self.version.as_str()
    }

    /// Returns the ordered set of media types this plugin claims.
    #[must_use]
    pub const fn media_types(&self) -> &BTreeSet<String> {
        &self.media_types
    }
}

/// Owns one plugin subprocess and its connection.
///
/// Termination sends a best-effort shutdown notice, then kills the
/// subprocess. It is idempotent; only the first call acts.
pub struct PluginProcess {
    connection: Arc<Connection>,
    supervisor: Box<dyn ProcessSupervisor>,
    terminated: AtomicBool,
}

impl std::fmt::Debug for PluginProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginProcess")
            .field("connection", &self.connection)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl PluginProcess {
    /// Creates a process wrapper from an established connection and its
    /// supervisor.
    #[must_use]
    pub const fn new(connection: Arc<Connection>, supervisor: Box<dyn ProcessSupervisor>) -> Self {
        Self {
            connection,
            supervisor,
            terminated: AtomicBool::new(false),
        }
    }

    /// Terminates the subprocess; repeated calls are no-ops.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connection.send_shutdown();
        self.supervisor.kill();
    }

    /// Returns `true` while the subprocess is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }
}

/// A plugin bound against one capability category.
#[derive(Debug)]
pub struct PluginContext<H> {
    descriptor: PluginDescriptor,
    category: String,
    handle: H,
    process: PluginProcess,
}

impl<H> PluginContext<H> {
    /// Creates a context from the pieces produced by a successful binding.
    #[must_use]
    pub const fn new(
        descriptor: PluginDescriptor,
        category: String,
        handle: H,
        process: PluginProcess,
    ) -> Self {
        Self {
            descriptor,
            category,
            handle,
            process,
        }
    }

    /// Returns the descriptor of this plugin.
    #[must_use]
    pub const fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    /// Returns the protocol name of the category this context was bound
    /// against.
    #[must_use]
    pub const fn category(&self) -> &str {
        self.category.as_str()
    }

    /// Returns the owning process.
    #[must_use]
    pub const fn process(&self) -> &PluginProcess {
        &self.process
    }
}

impl<H: Clone> PluginContext<H> {
    /// Returns a clone of the live capability handle.
    #[must_use]
    pub fn handle(&self) -> H {
        self.handle.clone()
    }
}

/// Type-erased access to a [`PluginContext`], used by the loader's indices.
pub trait ErasedContext: Send + Sync {
    /// Returns the descriptor of the bound plugin.
    fn descriptor(&self) -> &PluginDescriptor;

    /// Returns the protocol name of the bound category.
    fn category(&self) -> &str;

    /// Terminates the owning subprocess (idempotent).
    fn terminate(&self);

    /// Returns `self` for downcasting to the concrete context type.
    fn as_any(&self) -> &dyn Any;
}

impl<H: Send + Sync + 'static> ErasedContext for PluginContext<H> {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn category(&self) -> &str {
        &self.category
    }

    fn terminate(&self) {
        debug!(
            target: CONTEXT_TARGET,
            plugin = self.descriptor.instance_name(),
            path = %self.descriptor.path().display(),
            "terminating plugin"
        );
        self.process.terminate();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
