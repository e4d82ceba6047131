//! Client and server session configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:4433";

/// Body the server answers every request with.
pub const DEFAULT_RESPONSE_BODY: &str = "Not Found";

/// Server session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP address to listen on.
    ///
    /// **Default:** `"127.0.0.1:4433"`
    pub listen: String,

    /// Validate client addresses with a stateless Retry before accepting.
    ///
    /// When disabled, the first Initial of an unknown connection is accepted
    /// directly under a server-chosen connection ID.
    ///
    /// **Default:** `true`
    pub retry: bool,

    /// How long a Retry token stays valid after it is minted, in
    /// milliseconds.
    ///
    /// **Default:** `10000`
    pub retry_token_lifetime_ms: u64,

    /// Fixed body sent in response to every request.
    ///
    /// **Default:** `"Not Found"`
    pub response_body: String,

    /// Drop Initial packets carried in datagrams smaller than this many
    /// bytes. Zero disables the check; RFC 9000 Section 14.1 mandates 1200.
    ///
    /// **Default:** `0`
    pub min_initial_size: usize,

    /// Upper bound on a blocking receive while a shutdown flag is installed,
    /// in milliseconds.
    ///
    /// **Default:** `200`
    pub shutdown_poll_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_ADDRESS.to_string(),
            retry: true,
            retry_token_lifetime_ms: 10_000,
            response_body: DEFAULT_RESPONSE_BODY.to_string(),
            min_initial_size: 0,
            shutdown_poll_interval_ms: 200,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_poll_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_interval_ms)
    }

    pub fn retry_token_lifetime(&self) -> Duration {
        Duration::from_millis(self.retry_token_lifetime_ms)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.listen.parse::<SocketAddr>().is_err() {
            errors.push(format!("Invalid server.listen address: {}", self.listen));
        }

        if self.min_initial_size > 65527 {
            errors.push(format!(
                "server.min_initial_size ({}) exceeds the largest UDP payload",
                self.min_initial_size
            ));
        }

        if self.retry && self.retry_token_lifetime_ms == 0 {
            errors.push("server.retry_token_lifetime_ms must be > 0".to_string());
        }

        if self.shutdown_poll_interval_ms == 0 {
            errors.push("server.shutdown_poll_interval_ms must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Client session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server to connect to, as `host:port`.
    ///
    /// **Default:** `"127.0.0.1:4433"`
    pub url: String,

    /// Verify the server's certificate chain.
    ///
    /// **Default:** `true`
    pub verify_peer: bool,

    /// Path requested on the HTTP/0.9 stream.
    ///
    /// **Default:** `"/"`
    pub request_path: String,

    /// Stop after this many loop iterations. Unbounded when unset.
    pub max_iterations: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_ADDRESS.to_string(),
            verify_peer: true,
            request_path: "/".to_string(),
            max_iterations: None,
        }
    }
}

impl ClientConfig {
    /// Host part of `url`, used as the TLS server name.
    pub fn host(&self) -> &str {
        match self.url.rfind(':') {
            Some(idx) => self.url[..idx].trim_start_matches('[').trim_end_matches(']'),
            None => &self.url,
        }
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match self.url.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => errors.push(format!("client.url must be host:port (got {:?})", self.url)),
        }

        if !self.request_path.starts_with('/') {
            errors.push(format!(
                "client.request_path must start with '/' (got {:?})",
                self.request_path
            ));
        }

        if self.max_iterations == Some(0) {
            errors.push("client.max_iterations must be > 0 when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
