//! Typed per-category plugin manager.
//!
//! A [`Manager`] is the facade a core service holds for one capability
//! category: creation performs loader initialisation, channel registration,
//! and discovery in a single step, and the lookup surface is typed to the
//! category's handle. Services that manage several categories over one
//! plugin directory use a shared [`Loader`] directly instead.

use std::marker::PhantomData;

use crate::channel::RpcChannel;
use crate::contract::Pluggable;
use crate::error::PluginError;
use crate::loader::{Loader, LoaderConfig};

/// Manages the discovered plugins of one capability category.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use attestor_plugins::contract::Pluggable;
/// use attestor_plugins::loader::LoaderConfig;
/// use attestor_plugins::manager::Manager;
/// # fn category_channel() -> attestor_plugins::channel::RpcChannel<Arc<dyn Pluggable>> {
/// #     unimplemented!()
/// # }
///
/// let config = LoaderConfig::new("/opt/attestor/plugins");
/// let manager: Manager<Arc<dyn Pluggable>> =
///     Manager::create(&config, "scheme", category_channel()).unwrap();
/// let handle = manager.lookup_by_media_type("application/psa-attestation-token").unwrap();
/// ```
#[derive(Debug)]
pub struct Manager<H> {
    loader: Loader,
    service: String,
    _handle: PhantomData<H>,
}

impl<H> Manager<H>
where
    H: Pluggable + Clone + Send + Sync + 'static,
{
    /// Creates a manager with a production loader, then discovers plugins.
    ///
    /// # Errors
    ///
    /// Returns any error from loader initialisation, channel registration,
    /// or discovery.
    pub fn create(
        config: &LoaderConfig,
        service: &str,
        channel: RpcChannel<H>,
    ) -> Result<Self, PluginError> {
        Self::create_with_loader(Loader::new(), config, service, channel)
    }

    /// Creates a manager on top of an explicitly constructed loader.
    ///
    /// # Errors
    ///
    /// Returns any error from loader initialisation, channel registration,
    /// or discovery.
    pub fn create_with_loader(
        mut loader: Loader,
        config: &LoaderConfig,
        service: &str,
        channel: RpcChannel<H>,
    ) -> Result<Self, PluginError> {
        loader.init(config)?;
        loader.register_channel(service, channel)?;
        loader.discover::<H>()?;
        Ok(Self {
            loader,
            service: service.to_owned(),
            _handle: PhantomData,
        })
    }

    /// Returns the protocol name of the managed category.
    #[must_use]
    pub const fn service(&self) -> &str {
        self.service.as_str()
    }

    /// Returns `true` when a discovered plugin claims the media type.
    #[must_use]
    pub fn is_registered_media_type(&self, media_type: &str) -> bool {
        self.loader.is_registered_media_type(media_type)
    }

    /// Returns the media types registered by plugins of this category.
    #[must_use]
    pub fn registered_media_types(&self) -> Vec<String> {
        self.loader.registered_media_types_for(&self.service)
    }

    /// Returns the attestation schemes of the discovered plugins.
    #[must_use]
    pub fn registered_attestation_schemes(&self) -> Vec<String> {
        self.loader.registered_attestation_schemes::<H>()
    }

    /// Returns the handle of the plugin with the given instance name.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NameNotFound`] when no such plugin exists.
    pub fn lookup_by_name(&self, name: &str) -> Result<H, PluginError> {
        self.loader.lookup_by_name(name)
    }

    /// Returns the handle of the plugin claiming the given media type.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::MediaTypeNotFound`] when no plugin claims it.
    pub fn lookup_by_media_type(&self, media_type: &str) -> Result<H, PluginError> {
        self.loader.lookup_by_media_type(media_type)
    }

    /// Returns the handle of the first plugin implementing the scheme.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::SchemeNotFound`] when no plugin implements
    /// it.
    pub fn lookup_by_attestation_scheme(&self, scheme: &str) -> Result<H, PluginError> {
        self.loader.lookup_by_attestation_scheme(scheme)
    }

    /// Terminates every managed plugin. Idempotent.
    pub fn close(&mut self) {
        self.loader.close();
    }
}
