//! Handshake configuration shared by the host and every plugin executable.
//!
//! Before any capability call, host and candidate subprocess must agree on a
//! fixed (protocol version, cookie key, cookie value) triple. A mismatch on
//! any field is a packaging error, not a transient fault: the host rejects
//! the connection and must not retry with different parameters.

use serde::{Deserialize, Serialize};

/// Protocol version spoken by this build of the framework.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default magic cookie key, exported to plugin subprocesses as an
/// environment variable.
pub const COOKIE_KEY: &str = "ATTESTOR_PLUGIN";

/// Default magic cookie value.
pub const COOKIE_VALUE: &str = "ATTESTOR";

/// The (protocol version, cookie key, cookie value) triple exchanged during
/// connection bootstrap.
///
/// The triple is immutable and process-wide: host and plugins of one
/// deployment must carry byte-identical values or the connection is rejected
/// before any capability call.
///
/// # Example
///
/// ```
/// use attestor_plugins::handshake::HandshakeConfig;
///
/// let config = HandshakeConfig::default();
/// assert_eq!(config.protocol_version(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    protocol_version: u32,
    cookie_key: String,
    cookie_value: String,
}

impl HandshakeConfig {
    /// Creates a handshake configuration with explicit values.
    #[must_use]
    pub fn new(
        protocol_version: u32,
        cookie_key: impl Into<String>,
        cookie_value: impl Into<String>,
    ) -> Self {
        Self {
            protocol_version,
            cookie_key: cookie_key.into(),
            cookie_value: cookie_value.into(),
        }
    }

    /// Returns the protocol version.
    #[must_use]
    pub const fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Returns the magic cookie key.
    #[must_use]
    pub const fn cookie_key(&self) -> &str {
        self.cookie_key.as_str()
    }

    /// Returns the magic cookie value.
    #[must_use]
    pub const fn cookie_value(&self) -> &str {
        self.cookie_value.as_str()
    }

    /// Returns `true` when `other` carries the identical triple.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self == other
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self::new(PROTOCOL_VERSION, COOKIE_KEY, COOKIE_VALUE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_triple_uses_crate_constants() {
        let config = HandshakeConfig::default();
        assert_eq!(config.protocol_version(), PROTOCOL_VERSION);
        assert_eq!(config.cookie_key(), COOKIE_KEY);
        assert_eq!(config.cookie_value(), COOKIE_VALUE);
    }

    #[test]
    fn matches_requires_identical_triple() {
        let config = HandshakeConfig::default();
        assert!(config.matches(&HandshakeConfig::default()));

        let wrong_cookie = HandshakeConfig::new(PROTOCOL_VERSION, COOKIE_KEY, "WRONG");
        assert!(!config.matches(&wrong_cookie));

        let wrong_version = HandshakeConfig::new(2, COOKIE_KEY, COOKIE_VALUE);
        assert!(!config.matches(&wrong_version));
    }
}
