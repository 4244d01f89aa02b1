//! Per-category channel registration.
//!
//! A capability category (e.g. `"evidence-handler"`) is defined once by a
//! pair of wrap functions: one turns a raw [`RpcClient`] into the typed
//! handle the host uses, the other turns a local implementation into the
//! [`ServiceDispatcher`] a plugin process serves. The same category
//! definition code is linked into both the host and the plugin executable,
//! so both sides agree on how a category is wrapped even though they are
//! different processes.
//!
//! The [`ChannelRegistry`] is an explicitly constructed object owned by a
//! loader (or, inside a plugin, by its server); there is no process-global
//! registry. Entries are keyed by protocol name with the typed channel
//! stored behind `Any`, and a failed downcast on lookup is the
//! capability-shape error of the binding step.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use serde_json::Value;

use crate::connection::RpcClient;
use crate::error::PluginError;

/// Server-side dispatch surface for one dispensed service.
///
/// Implementations answer both the base contract methods and the category's
/// own methods; [`crate::contract::dispatch_base`] handles the former.
pub trait ServiceDispatcher: Send + Sync {
    /// Executes `method` with the given parameters.
    ///
    /// # Errors
    ///
    /// Returns a human-readable fault message, which the serve loop reports
    /// to the host as a fault frame.
    fn dispatch(&self, method: &str, params: Value) -> Result<Value, String>;
}

/// How to wrap one capability category across the process boundary.
///
/// `H` is the category's handle type, typically `Arc<dyn Category>`. The
/// wrap functions are plain function pointers so a channel is `Copy` and
/// can live in the registry without synchronisation.
pub struct RpcChannel<H> {
    wrap_client: fn(RpcClient) -> H,
    wrap_server: fn(H) -> Box<dyn ServiceDispatcher>,
}

impl<H> RpcChannel<H> {
    /// Creates a channel from the category's wrap functions.
    #[must_use]
    pub const fn new(
        wrap_client: fn(RpcClient) -> H,
        wrap_server: fn(H) -> Box<dyn ServiceDispatcher>,
    ) -> Self {
        Self {
            wrap_client,
            wrap_server,
        }
    }

    /// Wraps a raw service client into the category handle.
    #[must_use]
    pub fn wrap_client(&self, client: RpcClient) -> H {
        (self.wrap_client)(client)
    }

    /// Wraps a local implementation into a server-side dispatcher.
    #[must_use]
    pub fn wrap_server(&self, implementation: H) -> Box<dyn ServiceDispatcher> {
        (self.wrap_server)(implementation)
    }
}

impl<H> Clone for RpcChannel<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H> Copy for RpcChannel<H> {}

impl<H> std::fmt::Debug for RpcChannel<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("handle", &std::any::type_name::<H>())
            .finish()
    }
}

/// Name-keyed table of registered capability categories.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Box<dyn Any + Send + Sync>>,
    names_by_type: HashMap<TypeId, String>,
}

impl ChannelRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel under a protocol name.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ChannelExists`] if the name or the handle
    /// type is already registered.
    pub fn register<H: 'static>(
        &mut self,
        name: &str,
        channel: RpcChannel<H>,
    ) -> Result<(), PluginError> {
        if self.channels.contains_key(name) || self.names_by_type.contains_key(&TypeId::of::<H>())
        {
            return Err(PluginError::ChannelExists {
                name: name.to_owned(),
            });
        }
        self.channels.insert(name.to_owned(), Box::new(channel));
        self.names_by_type
            .insert(TypeId::of::<H>(), name.to_owned());
        Ok(())
    }

    /// Looks up the channel registered under a protocol name.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::CategoryNotRegistered`] when the name is
    /// unknown, and [`PluginError::CapabilityShape`] when the name is
    /// registered for a different handle type than `H`.
    pub fn lookup<H: 'static>(&self, name: &str) -> Result<RpcChannel<H>, PluginError> {
        let entry = self
            .channels
            .get(name)
            .ok_or_else(|| PluginError::CategoryNotRegistered {
                category: name.to_owned(),
            })?;
        entry
            .downcast_ref::<RpcChannel<H>>()
            .copied()
            .ok_or_else(|| PluginError::CapabilityShape {
                path: std::path::PathBuf::new(),
                category: std::any::type_name::<H>().to_owned(),
                message: format!("channel {name:?} is registered for a different handle type"),
            })
    }

    /// Returns the protocol name registered for the handle type `H`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::CategoryNotRegistered`] when no channel was
    /// registered with this handle type.
    pub fn name_for<H: 'static>(&self) -> Result<&str, PluginError> {
        self.names_by_type
            .get(&TypeId::of::<H>())
            .map(String::as_str)
            .ok_or_else(|| PluginError::CategoryNotRegistered {
                category: std::any::type_name::<H>().to_owned(),
            })
    }

    /// Returns `true` when a channel is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }
}
