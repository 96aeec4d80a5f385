//! Server configuration types
//!
//! Defines the main configuration structures for the relay.

use crate::error::RelayError;
use crate::socks::{TargetAddr, UpstreamAuth};
use serde::{Deserialize, Serialize};

/// Default connection table capacity (socket entries, two per relay pair)
fn default_max_connections() -> usize {
    1024
}

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Relay server configuration
    pub server: ServerConfig,
}

/// Relay server configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address to listen on (e.g. "0.0.0.0:1234")
    pub bind_addr: String,

    /// Static destination ("host:port"); required unless `transparent`
    #[serde(default)]
    pub destination: Option<String>,

    /// Recover the real destination of redirected connections via
    /// SO_ORIGINAL_DST instead of using `destination` (Linux only)
    #[serde(default)]
    pub transparent: bool,

    /// Connection table capacity; a full table rejects new clients
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Dump a connection table snapshot whenever a line arrives on stdin
    #[serde(default)]
    pub stats_on_stdin: bool,

    /// Upstream SOCKS5 server; direct relay when absent
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
}

/// Upstream SOCKS5 server configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Upstream server address ("host:port")
    pub addr: String,

    /// Username for the RFC 1929 sub-negotiation
    #[serde(default)]
    pub username: Option<String>,

    /// Password for the RFC 1929 sub-negotiation
    #[serde(default)]
    pub password: Option<String>,
}

impl UpstreamConfig {
    /// Check if authentication credentials are configured
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Credentials to offer during the handshake, if configured
    pub fn auth(&self) -> Option<UpstreamAuth> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(UpstreamAuth {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

impl ServerConfig {
    /// Parsed static destination.
    pub fn destination_addr(&self) -> Result<Option<TargetAddr>, RelayError> {
        match &self.destination {
            Some(dest) => Ok(Some(dest.parse::<TargetAddr>()?)),
            None => Ok(None),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.destination.is_none() && !self.transparent {
            return Err(RelayError::Config(
                "either a static destination or transparent redirection is required".to_string(),
            ));
        }
        self.destination_addr()?;

        if self.transparent && !cfg!(target_os = "linux") {
            return Err(RelayError::Config(
                "transparent redirection requires SO_ORIGINAL_DST (Linux only)".to_string(),
            ));
        }

        if self.max_connections < 2 {
            return Err(RelayError::Config(
                "max_connections must hold at least one relay pair".to_string(),
            ));
        }

        if let Some(upstream) = &self.upstream {
            upstream.addr.parse::<TargetAddr>()?;

            if upstream.username.is_some() != upstream.password.is_some() {
                return Err(RelayError::Config(
                    "upstream username and password must be set together".to_string(),
                ));
            }
            if let Some(auth) = upstream.auth() {
                if auth.username.len() > 255 || auth.password.len() > 255 {
                    return Err(RelayError::Config(
                        "upstream credentials must be at most 255 bytes each".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}
