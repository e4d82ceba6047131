//! Configuration loading and parsing.
//!
//! This module handles loading configuration from files, environment variables,
//! and command-line arguments, with proper precedence handling.

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, FromArgMatches, Parser, Subcommand, ValueEnum};
use config::Config as ConfigLoader;
use std::path::Path;

use super::{LogLevel, QuicloopConfig};

/// Environment variable prefix; sections and keys are separated by `__`.
pub const ENV_PREFIX: &str = "QUICLOOP";

/// Command-line interface.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(long, short = 'c', global = true, default_value = "quicloop.toml")]
    pub config: String,

    /// Verbose logging (debug level)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Log level (overrides config file)
    #[arg(long, global = true, value_enum, ignore_case = true)]
    pub log_level: Option<LogLevel>,

    /// Print default configuration and exit
    #[arg(long)]
    pub print_default_config: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Connect to a server, request `/` over HTTP/0.9 and close
    Client(ClientArgs),
    /// Accept connections and answer every request with a fixed body
    Server(ServerArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct ClientArgs {
    /// Server address as host:port
    #[arg(long)]
    pub url: Option<String>,

    /// QUIC wire version to offer (decimal or 0x-prefixed hex)
    #[arg(long, value_parser = parse_version)]
    pub wire_version: Option<u32>,

    /// Do not verify the server certificate
    #[arg(long)]
    pub no_verify: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ServerArgs {
    /// Address to listen on
    #[arg(long)]
    pub listen: Option<String>,

    /// PEM certificate chain
    #[arg(long)]
    pub cert: Option<String>,

    /// PEM private key
    #[arg(long)]
    pub key: Option<String>,

    /// Accept new connections without a Retry round trip
    #[arg(long)]
    pub no_retry: bool,

    /// Response body sent on every request stream
    #[arg(long)]
    pub body: Option<String>,
}

fn parse_version(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid wire version {:?}: {}", s, e))
}

/// Parse the process arguments.
pub fn parse_cli() -> Result<CliArgs> {
    let matches = CliArgs::command().get_matches();
    CliArgs::from_arg_matches(&matches).context("Failed to parse command-line arguments")
}

/// Load and validate configuration for the parsed command line.
///
/// # Errors
///
/// Returns an error if:
/// - Configuration file cannot be parsed
/// - An environment override cannot be read
/// - Validation fails
pub fn load_config(cli: &CliArgs) -> Result<QuicloopConfig> {
    let mut config = load_config_file(Path::new(&cli.config))?;

    apply_env_overrides(&mut config, None)?;

    apply_cli_overrides(&mut config, cli);

    config.validate().map_err(|errors| {
        anyhow::anyhow!("Configuration validation failed:\n{}", errors.join("\n"))
    })?;

    Ok(config)
}

/// Load configuration from a TOML file. A missing file yields defaults.
pub fn load_config_file(path: &Path) -> Result<QuicloopConfig> {
    if !path.exists() {
        tracing::warn!(
            config_path = %path.display(),
            "Configuration file not found, using defaults"
        );
        return Ok(QuicloopConfig::default());
    }

    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    toml::from_str(&config_str)
        .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
}

/// Apply environment variable overrides.
///
/// Variables are prefixed with `QUICLOOP_` and use `__` between section and
/// key. `source` replaces the process environment when given.
///
/// Examples:
/// - `QUICLOOP_SERVER__LISTEN=0.0.0.0:443`
/// - `QUICLOOP_LOGGING__LEVEL=debug`
/// - `QUICLOOP_TRANSPORT__IDLE_TIMEOUT_MS=30000`
pub fn apply_env_overrides(
    config: &mut QuicloopConfig,
    source: Option<config::Map<String, String>>,
) -> Result<()> {
    let env = ConfigLoader::builder()
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .source(source),
        )
        .build()
        .context("Failed to load environment variables")?;

    if let Ok(level) = env.get_string("logging.level") {
        match LogLevel::from_str(&level, true) {
            Ok(level) => config.logging.level = level,
            Err(e) => tracing::warn!(error = %e, "Ignoring QUICLOOP_LOGGING__LEVEL"),
        }
    }

    if let Ok(listen) = env.get_string("server.listen") {
        config.server.listen = listen;
    }
    if let Ok(retry) = env.get_bool("server.retry") {
        config.server.retry = retry;
    }
    if let Ok(body) = env.get_string("server.response_body") {
        config.server.response_body = body;
    }
    if let Ok(ms) = env.get_int("server.retry_token_lifetime_ms") {
        config.server.retry_token_lifetime_ms = u64::try_from(ms)
            .context("QUICLOOP_SERVER__RETRY_TOKEN_LIFETIME_MS must not be negative")?;
    }
    if let Ok(size) = env.get_int("server.min_initial_size") {
        config.server.min_initial_size = usize::try_from(size)
            .context("QUICLOOP_SERVER__MIN_INITIAL_SIZE must not be negative")?;
    }

    if let Ok(url) = env.get_string("client.url") {
        config.client.url = url;
    }
    if let Ok(verify) = env.get_bool("client.verify_peer") {
        config.client.verify_peer = verify;
    }

    if let Ok(version) = env.get_string("transport.version") {
        config.transport.version =
            parse_version(&version).map_err(|e| anyhow::anyhow!("QUICLOOP_TRANSPORT__VERSION: {}", e))?;
    }
    if let Ok(ms) = env.get_int("transport.idle_timeout_ms") {
        config.transport.idle_timeout_ms = u64::try_from(ms)
            .context("QUICLOOP_TRANSPORT__IDLE_TIMEOUT_MS must not be negative")?;
    }
    if let Ok(cert) = env.get_string("transport.cert_path") {
        config.transport.cert_path = Some(cert);
    }
    if let Ok(key) = env.get_string("transport.key_path") {
        config.transport.key_path = Some(key);
    }

    Ok(())
}

/// Apply command-line argument overrides.
pub fn apply_cli_overrides(config: &mut QuicloopConfig, cli: &CliArgs) {
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    match &cli.command {
        Some(Command::Client(args)) => {
            if let Some(ref url) = args.url {
                config.client.url = url.clone();
            }
            if let Some(version) = args.wire_version {
                config.transport.version = version;
            }
            if args.no_verify {
                config.client.verify_peer = false;
            }
        }
        Some(Command::Server(args)) => {
            if let Some(ref listen) = args.listen {
                config.server.listen = listen.clone();
            }
            if let Some(ref cert) = args.cert {
                config.transport.cert_path = Some(cert.clone());
            }
            if let Some(ref key) = args.key {
                config.transport.key_path = Some(key.clone());
            }
            if args.no_retry {
                config.server.retry = false;
            }
            if let Some(ref body) = args.body {
                config.server.response_body = body.clone();
            }
        }
        None => {}
    }
}

/// The default configuration in TOML format.
pub fn default_config_toml() -> Result<String> {
    toml::to_string_pretty(&QuicloopConfig::default()).context("Failed to serialize default config")
}
