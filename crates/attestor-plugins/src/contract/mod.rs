//! Base capability contract implemented by every plugin.
//!
//! [`Pluggable`] is the minimal set of operations a plugin of any category
//! must expose: a human-readable instance name, the attestation scheme it
//! implements, the media types it can process (grouped by media-type
//! category, e.g. provisioning vs. verification), and its version. Richer
//! capability categories (evidence handler, endorsement handler, ...) extend
//! this trait.
//!
//! The module also fixes the wire-level method names for the base contract
//! and provides [`dispatch_base`] so category dispatchers answer the base
//! methods uniformly.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

/// Wire method name for [`Pluggable::name`].
pub const METHOD_GET_NAME: &str = "get_name";

/// Wire method name for [`Pluggable::attestation_scheme`].
pub const METHOD_GET_ATTESTATION_SCHEME: &str = "get_attestation_scheme";

/// Wire method name for [`Pluggable::supported_media_types`].
pub const METHOD_GET_SUPPORTED_MEDIA_TYPES: &str = "get_supported_media_types";

/// Wire method name for [`Pluggable::version`].
pub const METHOD_GET_VERSION: &str = "get_version";

/// Media types grouped by media-type category.
///
/// Keys are category labels such as `"endorsement-provisioning"` or
/// `"evidence-verification"`; values are the content-type strings the plugin
/// accepts on that path. A `BTreeMap` keeps enumeration order deterministic.
pub type MediaTypeMap = BTreeMap<String, Vec<String>>;

/// The capability contract shared by all plugins.
///
/// Implemented by plugin-local service implementations on the plugin side
/// and by RPC client stubs on the host side, so the same category trait
/// describes both ends of the process boundary.
pub trait Pluggable: Send + Sync {
    /// Returns the plugin instance name.
    fn name(&self) -> String;

    /// Returns the attestation scheme this plugin implements (e.g. `"PSA"`).
    fn attestation_scheme(&self) -> String;

    /// Returns the media types this plugin can process, keyed by media-type
    /// category.
    fn supported_media_types(&self) -> MediaTypeMap;

    /// Returns the plugin version (semantic versioning, e.g. `"1.0.0"`).
    fn version(&self) -> String;
}

impl core::fmt::Debug for dyn Pluggable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pluggable")
            .field("name", &self.name())
            .field("attestation_scheme", &self.attestation_scheme())
            .finish_non_exhaustive()
    }
}

impl<T: Pluggable + ?Sized> Pluggable for Arc<T> {
    fn name(&self) -> String {
        self.as_ref().name()
    }

    fn attestation_scheme(&self) -> String {
        self.as_ref().attestation_scheme()
    }

    fn supported_media_types(&self) -> MediaTypeMap {
        self.as_ref().supported_media_types()
    }

    fn version(&self) -> String {
        self.as_ref().version()
    }
}

/// Answers a base-contract method against a local implementation.
///
/// Returns `None` when `method` is not one of the base methods, so category
/// dispatchers can fall through to their own method tables.
#[must_use]
pub fn dispatch_base<P: Pluggable + ?Sized>(implementation: &P, method: &str) -> Option<Value> {
    match method {
        METHOD_GET_NAME => Some(Value::String(implementation.name())),
        METHOD_GET_ATTESTATION_SCHEME => Some(Value::String(implementation.attestation_scheme())),
        METHOD_GET_SUPPORTED_MEDIA_TYPES => {
            let map = implementation.supported_media_types();
            // String-keyed maps of strings always serialise.
            Some(serde_json::to_value(map).unwrap_or(Value::Null))
        }
        METHOD_GET_VERSION => Some(Value::String(implementation.version())),
        _ => None,
    }
}

#[cfg(test)]
mod tests;
