//! Plugin discovery and dispatch indices.
//!
//! The [`Loader`] orchestrates discovery over a directory of candidate
//! executables (files named `*.plugin`), binds each candidate through
//! [`crate::process::bind`], and maintains two dispatch indices: by
//! self-reported instance name and by claimed media type. Lookups by
//! attestation scheme scan descriptors, since several plugins may claim one
//! scheme for different media sub-profiles.
//!
//! Each core service owns its own loader instance; the indices are built
//! once by discovery and are read-only afterwards, except for
//! [`Loader::close`] which tears everything down. Adding a plugin requires
//! restarting the owning service.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::channel::{ChannelRegistry, RpcChannel};
use crate::context::{ErasedContext, PluginContext};
use crate::contract::Pluggable;
use crate::error::PluginError;
use crate::handshake::HandshakeConfig;
use crate::process::{CommandLauncher, Launcher, bind};

/// Tracing target for loader operations.
const LOADER_TARGET: &str = "attestor_plugins::loader";

/// Filename extension that marks a candidate plugin executable.
const PLUGIN_EXTENSION: &str = "plugin";

/// Default deadline for remote calls, in seconds.
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

const fn default_call_timeout_secs() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS
}

/// Loader configuration, deserialised from the host's configuration store.
///
/// # Example
///
/// ```
/// use attestor_plugins::loader::LoaderConfig;
///
/// let config: LoaderConfig =
///     serde_json::from_str(r#"{"dir": "/opt/attestor/plugins"}"#).unwrap();
/// assert_eq!(config.dir(), "/opt/attestor/plugins");
/// assert_eq!(config.call_timeout_secs(), 30);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoaderConfig {
    dir: String,
    #[serde(default = "default_call_timeout_secs")]
    call_timeout_secs: u64,
}

impl LoaderConfig {
    /// Creates a configuration with the default call deadline.
    #[must_use]
    pub fn new(dir: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
        }
    }

    /// Overrides the remote-call deadline.
    #[must_use]
    pub const fn with_call_timeout_secs(mut self, call_timeout_secs: u64) -> Self {
        self.call_timeout_secs = call_timeout_secs;
        self
    }

    /// Returns the plugin directory path.
    #[must_use]
    pub const fn dir(&self) -> &str {
        self.dir.as_str()
    }

    /// Returns the remote-call deadline in seconds.
    #[must_use]
    pub const fn call_timeout_secs(&self) -> u64 {
        self.call_timeout_secs
    }
}

/// Discovers plugin executables and routes capability lookups to them.
pub struct Loader {
    directory: Option<PathBuf>,
    call_timeout: Duration,
    handshake: HandshakeConfig,
    launcher: Arc<dyn Launcher>,
    channels: ChannelRegistry,
    by_name: BTreeMap<String, Arc<dyn ErasedContext>>,
    by_media_type: BTreeMap<String, Arc<dyn ErasedContext>>,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("directory", &self.directory)
            .field("plugins", &self.by_name.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader {
    /// Creates a loader that spawns real subprocesses with the default
    /// handshake triple.
    #[must_use]
    pub fn new() -> Self {
        let handshake = HandshakeConfig::default();
        Self::with_launcher(Arc::new(CommandLauncher::new(handshake.clone())), handshake)
    }

    /// Creates a loader with an explicit launcher and handshake, the seam
    /// used by test harnesses.
    #[must_use]
    pub fn with_launcher(launcher: Arc<dyn Launcher>, handshake: HandshakeConfig) -> Self {
        Self {
            directory: None,
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            handshake,
            launcher,
            channels: ChannelRegistry::new(),
            by_name: BTreeMap::new(),
            by_media_type: BTreeMap::new(),
        }
    }

    /// Initialises the loader with its plugin directory.
    ///
    /// Must be called exactly once before [`Loader::discover`].
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::AlreadyInitialized`] on a second call and
    /// [`PluginError::Config`] when the directory is empty.
    pub fn init(&mut self, config: &LoaderConfig) -> Result<(), PluginError> {
        if self.directory.is_some() {
            return Err(PluginError::AlreadyInitialized);
        }
        if config.dir().trim().is_empty() {
            return Err(PluginError::Config {
                message: String::from("plugin directory must not be empty"),
            });
        }
        self.directory = Some(PathBuf::from(config.dir()));
        self.call_timeout = Duration::from_secs(config.call_timeout_secs());
        Ok(())
    }

    /// Registers the channel for one capability category.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ChannelExists`] when the protocol name or the
    /// handle type is already registered.
    pub fn register_channel<H: 'static>(
        &mut self,
        name: &str,
        channel: RpcChannel<H>,
    ) -> Result<(), PluginError> {
        self.channels.register(name, channel)
    }

    /// Discovers and binds every candidate executable serving the category
    /// with handle type `H`.
    ///
    /// Candidates are processed in sorted path order, so conflict detection
    /// has a deterministic first-writer-wins outcome. Candidates that do
    /// not serve the category are skipped; every other binding failure
    /// aborts the run. An empty directory is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotInitialized`] before [`Loader::init`],
    /// [`PluginError::CategoryNotRegistered`] when no channel was
    /// registered for `H`, conflict errors naming both offending paths, and
    /// any fatal binding error.
    pub fn discover<H>(&mut self) -> Result<(), PluginError>
    where
        H: Pluggable + Clone + Send + Sync + 'static,
    {
        let directory = self
            .directory
            .clone()
            .ok_or(PluginError::NotInitialized)?;
        let service = self.channels.name_for::<H>()?.to_owned();
        let channel = self.channels.lookup::<H>(&service)?;

        debug!(
            target: LOADER_TARGET,
            directory = %directory.display(),
            service,
            "discovering plugins"
        );
        let candidates = list_candidates(&directory)?;
        if candidates.is_empty() {
            warn!(
                target: LOADER_TARGET,
                directory = %directory.display(),
                service,
                "no plugins found"
            );
            return Ok(());
        }

        for path in candidates {
            match bind(
                self.launcher.as_ref(),
                &path,
                &service,
                channel,
                &self.handshake,
                self.call_timeout,
            ) {
                Ok(context) => self.insert(context)?,
                Err(err) if err.is_unknown_service() => {
                    debug!(
                        target: LOADER_TARGET,
                        path = %path.display(),
                        service,
                        "candidate does not serve this category, skipping"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Inserts a bound context into both indices, rejecting conflicts.
    ///
    /// The context loses the conflict (its subprocess is terminated) when
    /// another plugin already claimed its instance name or one of its media
    /// types.
    fn insert<H>(&mut self, context: PluginContext<H>) -> Result<(), PluginError>
    where
        H: Send + Sync + 'static,
    {
        let descriptor = context.descriptor();
        if let Some(existing) = self.by_name.get(descriptor.instance_name()) {
            let conflict = PluginError::NameConflict {
                name: descriptor.instance_name().to_owned(),
                first: existing.descriptor().path().to_path_buf(),
                second: descriptor.path().to_path_buf(),
            };
            context.process().terminate();
            return Err(conflict);
        }
        for media_type in descriptor.media_types() {
            if let Some(existing) = self.by_media_type.get(media_type) {
                let conflict = PluginError::MediaTypeConflict {
                    media_type: media_type.clone(),
                    first_name: existing.descriptor().instance_name().to_owned(),
                    first_path: existing.descriptor().path().to_path_buf(),
                    second_name: descriptor.instance_name().to_owned(),
                    second_path: descriptor.path().to_path_buf(),
                };
                context.process().terminate();
                return Err(conflict);
            }
        }

        let shared: Arc<dyn ErasedContext> = Arc::new(context);
        let shared_descriptor = shared.descriptor();
        debug!(
            target: LOADER_TARGET,
            plugin = shared_descriptor.instance_name(),
            scheme = shared_descriptor.attestation_scheme(),
            path = %shared_descriptor.path().display(),
            "plugin registered"
        );
        for media_type in shared_descriptor.media_types().clone() {
            self.by_media_type.insert(media_type, Arc::clone(&shared));
        }
        self.by_name
            .insert(shared.descriptor().instance_name().to_owned(), shared);
        Ok(())
    }

    /// Returns the live handle of the plugin with the given instance name.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NameNotFound`] when no plugin of category `H`
    /// has that name.
    pub fn lookup_by_name<H>(&self, name: &str) -> Result<H, PluginError>
    where
        H: Clone + Send + Sync + 'static,
    {
        self.by_name
            .get(name)
            .and_then(|context| downcast_handle::<H>(context))
            .ok_or_else(|| PluginError::NameNotFound {
                name: name.to_owned(),
                category: self.category_label::<H>(),
            })
    }

    /// Returns the live handle of the plugin claiming the given media type.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::MediaTypeNotFound`] when no plugin of
    /// category `H` claims the media type.
    pub fn lookup_by_media_type<H>(&self, media_type: &str) -> Result<H, PluginError>
    where
        H: Clone + Send + Sync + 'static,
    {
        self.by_media_type
            .get(media_type)
            .and_then(|context| downcast_handle::<H>(context))
            .ok_or_else(|| PluginError::MediaTypeNotFound {
                media_type: media_type.to_owned(),
                category: self.category_label::<H>(),
            })
    }

    /// Returns the live handle of the first plugin implementing the given
    /// attestation scheme.
    ///
    /// Scheme is not guaranteed unique: several plugins may claim one
    /// scheme for different media sub-profiles. The scan runs in
    /// instance-name order and the first match wins; callers must not
    /// assume uniqueness.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::SchemeNotFound`] when no plugin of category
    /// `H` implements the scheme.
    pub fn lookup_by_attestation_scheme<H>(&self, scheme: &str) -> Result<H, PluginError>
    where
        H: Clone + Send + Sync + 'static,
    {
        self.by_name
            .values()
            .filter(|context| context.descriptor().attestation_scheme() == scheme)
            .find_map(|context| downcast_handle::<H>(context))
            .ok_or_else(|| PluginError::SchemeNotFound {
                scheme: scheme.to_owned(),
                category: self.category_label::<H>(),
            })
    }

    /// Returns every registered media type, in order.
    #[must_use]
    pub fn registered_media_types(&self) -> Vec<String> {
        self.by_media_type.keys().cloned().collect()
    }

    /// Returns the media types registered by plugins of one category.
    #[must_use]
    pub fn registered_media_types_for(&self, category: &str) -> Vec<String> {
        self.by_media_type
            .iter()
            .filter(|(_, context)| context.category() == category)
            .map(|(media_type, _)| media_type.clone())
            .collect()
    }

    /// Returns the attestation schemes of every plugin bound as `H`, in
    /// instance-name order.
    #[must_use]
    pub fn registered_attestation_schemes<H>(&self) -> Vec<String>
    where
        H: Clone + Send + Sync + 'static,
    {
        self.by_name
            .values()
            .filter(|context| downcast_handle::<H>(context).is_some())
            .map(|context| context.descriptor().attestation_scheme().to_owned())
            .collect()
    }

    /// Returns `true` when some plugin claims the media type.
    #[must_use]
    pub fn is_registered_media_type(&self, media_type: &str) -> bool {
        self.by_media_type.contains_key(media_type)
    }

    /// Returns the number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Returns `true` when no plugins are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Terminates every registered plugin's subprocess and clears the
    /// indices. Idempotent and best-effort: per-process termination
    /// failures are not reported.
    pub fn close(&mut self) {
        for context in self.by_name.values() {
            context.terminate();
        }
        self.by_name.clear();
        self.by_media_type.clear();
    }

    /// Names the category `H` in lookup-miss errors.
    fn category_label<H: 'static>(&self) -> String {
        self.channels
            .name_for::<H>()
            .map_or_else(|_| std::any::type_name::<H>().to_owned(), str::to_owned)
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Downcasts an erased context to category `H` and clones its handle.
fn downcast_handle<H>(context: &Arc<dyn ErasedContext>) -> Option<H>
where
    H: Clone + Send + Sync + 'static,
{
    context
        .as_any()
        .downcast_ref::<PluginContext<H>>()
        .map(PluginContext::handle)
}

/// Lists `*.plugin` files in the directory, sorted by path.
fn list_candidates(directory: &std::path::Path) -> Result<Vec<PathBuf>, PluginError> {
    let entries = std::fs::read_dir(directory).map_err(|err| PluginError::Config {
        message: format!(
            "cannot read plugin directory {}: {err}",
            directory.display()
        ),
    })?;
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file() && path.extension().is_some_and(|ext| ext == PLUGIN_EXTENSION)
        })
        .collect();
    candidates.sort();
    Ok(candidates)
}
