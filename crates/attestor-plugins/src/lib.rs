//! Extension registry and out-of-process capability dispatcher for the
//! attestor services.
//!
//! The attestor platform must support many incompatible attestation formats
//! (PSA, CCA, TPM, ...) without baking format-specific code into its core
//! services. This crate provides the mechanism: independently built plugin
//! executables are discovered in a directory, spawned as subprocesses,
//! gated by a versioned handshake, bound to typed capability handles over a
//! multiplexed JSONL protocol, and made addressable by instance name,
//! media type, and attestation scheme.
//!
//! # Architecture
//!
//! A capability category (e.g. `"evidence-handler"`) is a trait extending
//! [`Pluggable`] plus an [`RpcChannel`] describing how to wrap the category
//! across the process boundary. The host side registers channels with a
//! [`Loader`] and calls [`Loader::discover`]; plugin executables register
//! implementations with a [`PluginServer`] and call
//! [`PluginServer::serve`] from `main`. Both sides link the same category
//! definition code, so they agree on the wrapping without sharing a
//! process.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use attestor_plugins::channel::RpcChannel;
//! use attestor_plugins::contract::Pluggable;
//! use attestor_plugins::loader::{Loader, LoaderConfig};
//! # fn scheme_channel() -> RpcChannel<Arc<dyn Pluggable>> { unimplemented!() }
//!
//! let mut loader = Loader::new();
//! loader.init(&LoaderConfig::new("/opt/attestor/plugins"))?;
//! loader.register_channel("scheme", scheme_channel())?;
//! loader.discover::<Arc<dyn Pluggable>>()?;
//!
//! let handle = loader
//!     .lookup_by_media_type::<Arc<dyn Pluggable>>("application/psa-attestation-token")?;
//! assert!(!handle.name().is_empty());
//! # Ok::<(), attestor_plugins::PluginError>(())
//! ```

pub mod channel;
pub mod connection;
pub mod context;
pub mod contract;
pub mod error;
pub mod handshake;
pub mod loader;
pub mod manager;
pub mod process;
pub mod protocol;
pub mod serve;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

#[cfg(test)]
mod tests;

pub use self::channel::{ChannelRegistry, RpcChannel, ServiceDispatcher};
pub use self::connection::RpcClient;
pub use self::context::{PluginContext, PluginDescriptor};
pub use self::contract::{MediaTypeMap, Pluggable};
pub use self::error::PluginError;
pub use self::handshake::HandshakeConfig;
pub use self::loader::{Loader, LoaderConfig};
pub use self::manager::Manager;
pub use self::serve::PluginServer;
