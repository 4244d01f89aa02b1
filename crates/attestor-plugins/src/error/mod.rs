//! Domain errors raised by plugin framework operations.
//!
//! All errors use `thiserror`-derived enums with structured context so callers
//! can classify the failure programmatically. Only
//! [`PluginError::UnknownService`] and the three lookup-miss variants are
//! expected during normal operation; every other variant indicates a
//! deployment or packaging defect and should stop the owning service from
//! starting. I/O errors are wrapped in `Arc` to satisfy the
//! `result_large_err` Clippy lint.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Errors arising from plugin discovery, binding, and dispatch.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Discovery was attempted before the loader was initialised.
    #[error("plugin loader has not been initialized")]
    NotInitialized,

    /// The loader was initialised a second time.
    #[error("plugin loader is already initialized")]
    AlreadyInitialized,

    /// The loader configuration is invalid.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// A channel for this protocol name is already registered.
    #[error("channel for {name:?} is already registered")]
    ChannelExists {
        /// Protocol name that was registered twice.
        name: String,
    },

    /// No channel has been registered for the requested category.
    #[error("no channel registered for capability category {category}")]
    CategoryNotRegistered {
        /// Category handle type or protocol name that was looked up.
        category: String,
    },

    /// The candidate executable rejected or mangled the handshake.
    #[error("handshake with {path} failed: {message}")]
    Handshake {
        /// Path to the candidate executable.
        path: PathBuf,
        /// Description of the handshake failure.
        message: String,
    },

    /// The candidate executable could not be spawned.
    #[error("failed to launch plugin {path}: {message}")]
    SpawnFailed {
        /// Path to the candidate executable.
        path: PathBuf,
        /// Human-readable failure description.
        message: String,
        /// Optional underlying I/O error.
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    /// The connected subprocess does not serve the requested protocol name.
    ///
    /// Recoverable during discovery: the executable may serve other
    /// categories than the one being discovered.
    #[error("plugin {path} does not provide service {service:?}")]
    UnknownService {
        /// Path to the candidate executable.
        path: PathBuf,
        /// Protocol name that was requested.
        service: String,
    },

    /// The dispensed service does not satisfy the requested capability
    /// contract.
    #[error("plugin {path} does not satisfy capability {category}: {message}")]
    CapabilityShape {
        /// Path to the offending executable.
        path: PathBuf,
        /// Capability category that was requested.
        category: String,
        /// Description of the contract violation.
        message: String,
    },

    /// Two discovered plugins report the same instance name.
    #[error("plugin {name:?} provided by two sources: [{first}] and [{second}]")]
    NameConflict {
        /// Instance name claimed by both plugins.
        name: String,
        /// Path of the plugin registered first.
        first: PathBuf,
        /// Path of the conflicting plugin.
        second: PathBuf,
    },

    /// Two discovered plugins claim the same media type.
    #[error(
        "plugins {first_name:?} [{first_path}] and {second_name:?} [{second_path}] \
         both provide support for {media_type:?}"
    )]
    MediaTypeConflict {
        /// Media type claimed by both plugins.
        media_type: String,
        /// Instance name of the plugin registered first.
        first_name: String,
        /// Path of the plugin registered first.
        first_path: PathBuf,
        /// Instance name of the conflicting plugin.
        second_name: String,
        /// Path of the conflicting plugin.
        second_path: PathBuf,
    },

    /// No registered plugin has the requested instance name.
    #[error("plugin named {name:?} with capability {category} not found")]
    NameNotFound {
        /// Instance name that was looked up.
        name: String,
        /// Capability category of the lookup.
        category: String,
    },

    /// No registered plugin claims the requested media type.
    #[error("plugin providing {media_type:?} with capability {category} not found")]
    MediaTypeNotFound {
        /// Media type that was looked up.
        media_type: String,
        /// Capability category of the lookup.
        category: String,
    },

    /// No registered plugin implements the requested attestation scheme.
    #[error("plugin providing scheme {scheme:?} with capability {category} not found")]
    SchemeNotFound {
        /// Attestation scheme that was looked up.
        scheme: String,
        /// Capability category of the lookup.
        category: String,
    },

    /// A remote call did not complete within its deadline.
    #[error("call to {service}.{method} timed out after {timeout_secs}s")]
    CallTimeout {
        /// Service the call was addressed to.
        service: String,
        /// Method that was invoked.
        method: String,
        /// Deadline in seconds.
        timeout_secs: u64,
    },

    /// The plugin reported a fault while executing a call.
    #[error("remote fault in {service}.{method}: {message}")]
    RemoteFault {
        /// Service the call was addressed to.
        service: String,
        /// Method that was invoked.
        method: String,
        /// Fault description reported by the plugin.
        message: String,
    },

    /// The subprocess connection closed while calls were outstanding.
    #[error("connection to plugin closed: {message}")]
    Disconnected {
        /// Description of how the connection was lost.
        message: String,
    },

    /// A wire frame or payload could not be encoded or decoded.
    #[error("protocol codec error: {message}")]
    Codec {
        /// Description of the codec failure.
        message: String,
        /// Optional underlying JSON error.
        #[source]
        source: Option<serde_json::Error>,
    },

    /// An I/O error occurred while communicating with a subprocess.
    #[error("I/O error while {context}: {source}")]
    Io {
        /// Operation that was in progress.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl PluginError {
    /// Returns `true` for the recoverable "unknown plugin" discovery outcome.
    ///
    /// Discovery skips candidates that fail with this error and continues
    /// scanning; every other error aborts the discovery run.
    #[must_use]
    pub const fn is_unknown_service(&self) -> bool {
        matches!(self, Self::UnknownService { .. })
    }
}
