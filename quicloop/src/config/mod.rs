//! Configuration module.
//!
//! One TOML document configures both roles; each subcommand reads the
//! sections it needs.
//!
//! # Precedence
//!
//! 1. Default values (lowest priority)
//! 2. Configuration file
//! 3. Environment variables (`QUICLOOP_` prefix)
//! 4. Command-line arguments (highest priority)
//!
//! # Example
//!
//! ```toml
//! [logging]
//! level = "debug"
//!
//! [transport]
//! application_protos = ["hq-20", "http/0.9"]
//! idle_timeout_ms = 5000
//!
//! [server]
//! listen = "127.0.0.1:4433"
//! retry = true
//! response_body = "Not Found"
//!
//! [client]
//! url = "127.0.0.1:4433"
//! ```

pub mod global;
pub mod loader;
pub mod session;

#[cfg(test)]
mod tests;

pub use global::{LogLevel, LoggingConfig};
pub use loader::{load_config, CliArgs, ClientArgs, Command, ServerArgs};
pub use session::{ClientConfig, ServerConfig};

use crate::netio::NetIoConfig;
use quicloop_engine::TransportSettings;
use serde::{Deserialize, Serialize};

/// Master configuration composing all subsystems.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuicloopConfig {
    pub logging: LoggingConfig,

    /// Socket options
    pub network: NetIoConfig,

    /// Parameters handed to the protocol engine
    pub transport: TransportSettings,

    pub server: ServerConfig,

    pub client: ClientConfig,
}

impl QuicloopConfig {
    /// Validate the entire configuration, collecting every error.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.network.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.transport.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.server.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.client.validate() {
            errors.extend(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Transport settings as the client uses them.
    pub fn client_transport(&self) -> TransportSettings {
        TransportSettings {
            verify_peer: self.client.verify_peer,
            ..self.transport.clone()
        }
    }
}
