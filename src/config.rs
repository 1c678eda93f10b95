//! Startup configuration for the signgate proxy.
//!
//! All settings come from the environment and are loaded exactly once, before
//! the listener binds. The resulting [`Settings`] snapshot is immutable and
//! shared read-only across request tasks.

use std::fmt;

use http::HeaderValue;
use thiserror::Error;

/// Env var naming the upstream base URL, e.g. `http://internal-api:8080`.
pub const REMOTE_HOST_VAR: &str = "REMOTE_HOST";

/// Env var naming the TCP port the proxy listens on.
pub const PORT_VAR: &str = "PORT";

/// Env var naming the signing user id sent in `Third-Party-User-Id`.
pub const USER_ID_VAR: &str = "K_USER_ID";

/// Env var naming the shared HMAC secret.
pub const PRIVATE_KEY_VAR: &str = "K_PRIVATE_KEY";

/// Errors that make the proxy refuse to start.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required environment variable is unset or empty. Reports the first
    /// one found missing, in documented check order.
    #[error("Missing parameters: {var}")]
    MissingVar { var: &'static str },

    /// The port variable is set but does not parse as a TCP port.
    #[error("Invalid {var}: {value:?} is not a valid TCP port")]
    InvalidPort { var: &'static str, value: String },

    /// The user id cannot be sent as an HTTP header value.
    #[error("Invalid {var}: user id is not a legal header value")]
    InvalidUserId { var: &'static str },
}

/// Shared HMAC secret. The raw bytes never appear in `Debug` output or logs.
#[derive(Clone)]
pub struct PrivateKey(Vec<u8>);

impl PrivateKey {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self(key.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey")
    }
}

/// The identity every outbound request is signed as.
#[derive(Debug, Clone)]
pub struct Identity {
    user_id: String,
    user_id_value: HeaderValue,
    private_key: PrivateKey,
}

impl Identity {
    /// Build an identity, validating that the user id is usable as a header
    /// value. Rejecting it here keeps the signing path infallible.
    pub fn new(user_id: String, private_key: PrivateKey) -> Result<Self, ConfigError> {
        let user_id_value = HeaderValue::from_str(&user_id)
            .map_err(|_| ConfigError::InvalidUserId { var: USER_ID_VAR })?;
        Ok(Self {
            user_id,
            user_id_value,
            private_key,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The user id pre-encoded as a header value.
    pub fn user_id_value(&self) -> &HeaderValue {
        &self.user_id_value
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }
}

/// Immutable startup snapshot of everything the proxy needs to run.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Port the proxy listens on.
    pub port: u16,

    /// Upstream base URL. Per-request target URLs are built by appending the
    /// inbound path and query to this string verbatim.
    pub upstream: String,

    /// Signing identity applied to every outbound request.
    pub identity: Identity,
}

impl Settings {
    /// Load settings from the environment.
    ///
    /// # Environment Variables
    ///
    /// - `REMOTE_HOST` - upstream base URL (required)
    /// - `PORT` - listen port (required)
    /// - `K_USER_ID` - signing user id (required)
    /// - `K_PRIVATE_KEY` - shared HMAC secret (required)
    ///
    /// Variables are checked in that order and an empty value counts as
    /// missing. The first missing variable is the one reported.
    pub fn from_env() -> Result<Self, ConfigError> {
        let upstream = require(REMOTE_HOST_VAR)?;
        let port_raw = require(PORT_VAR)?;
        let user_id = require(USER_ID_VAR)?;
        let private_key = require(PRIVATE_KEY_VAR)?;

        let port = port_raw.parse::<u16>().map_err(|_| ConfigError::InvalidPort {
            var: PORT_VAR,
            value: port_raw,
        })?;

        let identity = Identity::new(user_id, PrivateKey::new(private_key))?;

        Ok(Self {
            port,
            upstream,
            identity,
        })
    }
}

/// Read a required env var, treating empty values as unset.
fn require(var: &'static str) -> Result<String, ConfigError> {
    std::env::var(var)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::MissingVar { var })
}
