//! Tests for configuration loading, precedence and validation.

use super::*;
use crate::config::loader::{
    apply_cli_overrides, apply_env_overrides, default_config_toml, load_config_file,
};
use clap::Parser;
use std::io::Write;
use std::time::Duration;

fn env(pairs: &[(&str, &str)]) -> Option<config::Map<String, String>> {
    Some(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

// ============================================================================
// Defaults and validation
// ============================================================================

#[test]
fn test_default_config_is_valid() {
    let config = QuicloopConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.server.listen, "127.0.0.1:4433");
    assert!(config.server.retry);
    assert_eq!(config.server.response_body, "Not Found");
    assert_eq!(config.client.url, "127.0.0.1:4433");
    assert_eq!(config.logging.level, LogLevel::Info);
}

#[test]
fn test_validation_collects_errors_from_all_sections() {
    let mut config = QuicloopConfig::default();
    config.server.listen = "nowhere".to_string();
    config.client.url = "no-port".to_string();
    config.transport.application_protos.clear();
    config.network.socket_recv_buffer_size = Some(0);

    let errors = config.validate().unwrap_err();
    assert!(errors.iter().any(|e| e.contains("server.listen")));
    assert!(errors.iter().any(|e| e.contains("client.url")));
    assert!(errors.len() >= 4, "errors: {:?}", errors);
}

#[test]
fn test_retry_token_lifetime_must_be_positive() {
    let mut server = ServerConfig::default();
    assert_eq!(server.retry_token_lifetime(), Duration::from_secs(10));
    server.retry_token_lifetime_ms = 0;
    assert!(server.validate().is_err());
    server.retry = false;
    assert!(server.validate().is_ok());
}

#[test]
fn test_client_host_strips_port() {
    let mut client = ClientConfig::default();
    client.url = "example.org:443".to_string();
    assert_eq!(client.host(), "example.org");

    client.url = "[::1]:4433".to_string();
    assert_eq!(client.host(), "::1");
}

#[test]
fn test_client_request_path_must_be_absolute() {
    let client = ClientConfig {
        request_path: "index.html".to_string(),
        ..Default::default()
    };
    assert!(client.validate().is_err());
}

#[test]
fn test_client_transport_carries_verify_peer() {
    let mut config = QuicloopConfig::default();
    config.client.verify_peer = false;
    config.transport.verify_peer = true;
    assert!(!config.client_transport().verify_peer);
}

#[test]
fn test_log_level_parse() {
    let level = |arg: &str| CliArgs::try_parse_from(["quicloop", "--log-level", arg]).map(|c| c.log_level);
    assert_eq!(level("DEBUG").unwrap(), Some(LogLevel::Debug));
    assert_eq!(level("warning").unwrap(), Some(LogLevel::Warn));
    assert!(level("loud").is_err());
    assert_eq!(LogLevel::Trace.to_string(), "trace");
}

// ============================================================================
// File loading
// ============================================================================

#[test]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config_file(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, QuicloopConfig::default());
}

#[test]
fn test_partial_file_keeps_other_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[server]
listen = "0.0.0.0:8443"
retry = false

[transport]
idle_timeout_ms = 30000
"#
    )
    .unwrap();

    let config = load_config_file(file.path()).unwrap();
    assert_eq!(config.server.listen, "0.0.0.0:8443");
    assert!(!config.server.retry);
    assert_eq!(config.server.response_body, "Not Found");
    assert_eq!(config.transport.idle_timeout_ms, 30000);
    assert_eq!(config.client, ClientConfig::default());
}

#[test]
fn test_malformed_file_is_an_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[server\nlisten = ").unwrap();
    assert!(load_config_file(file.path()).is_err());
}

#[test]
fn test_default_config_toml_round_trips() {
    let text = default_config_toml().unwrap();
    assert!(text.contains("[server]"));
    let parsed: QuicloopConfig = toml::from_str(&text).unwrap();
    assert_eq!(parsed, QuicloopConfig::default());
}

// ============================================================================
// Environment and CLI precedence
// ============================================================================

#[test]
fn test_env_overrides() {
    let mut config = QuicloopConfig::default();
    apply_env_overrides(
        &mut config,
        env(&[
            ("QUICLOOP_SERVER__LISTEN", "0.0.0.0:443"),
            ("QUICLOOP_SERVER__RETRY", "false"),
            ("QUICLOOP_LOGGING__LEVEL", "debug"),
            ("QUICLOOP_TRANSPORT__VERSION", "0xbabababa"),
            ("QUICLOOP_TRANSPORT__IDLE_TIMEOUT_MS", "100"),
            ("QUICLOOP_SERVER__RETRY_TOKEN_LIFETIME_MS", "2500"),
        ]),
    )
    .unwrap();

    assert_eq!(config.server.listen, "0.0.0.0:443");
    assert!(!config.server.retry);
    assert_eq!(config.logging.level, LogLevel::Debug);
    assert_eq!(config.transport.version, 0xbaba_baba);
    assert_eq!(config.transport.idle_timeout_ms, 100);
    assert_eq!(config.server.retry_token_lifetime(), Duration::from_millis(2500));
}

#[test]
fn test_env_rejects_bad_version() {
    let mut config = QuicloopConfig::default();
    let result = apply_env_overrides(&mut config, env(&[("QUICLOOP_TRANSPORT__VERSION", "v1")]));
    assert!(result.is_err());
}

#[test]
fn test_cli_overrides_env() {
    let mut config = QuicloopConfig::default();
    apply_env_overrides(
        &mut config,
        env(&[("QUICLOOP_SERVER__LISTEN", "0.0.0.0:443")]),
    )
    .unwrap();

    let cli = CliArgs::try_parse_from([
        "quicloop",
        "--log-level",
        "trace",
        "server",
        "--listen",
        "127.0.0.1:9000",
        "--no-retry",
        "--body",
        "hello",
    ])
    .unwrap();
    apply_cli_overrides(&mut config, &cli);

    assert_eq!(config.server.listen, "127.0.0.1:9000");
    assert!(!config.server.retry);
    assert_eq!(config.server.response_body, "hello");
    assert_eq!(config.logging.level, LogLevel::Trace);
}

#[test]
fn test_client_cli_arguments() {
    let cli = CliArgs::try_parse_from([
        "quicloop",
        "client",
        "--url",
        "10.0.0.1:4433",
        "--wire-version",
        "0x1a2a3a4a",
        "--no-verify",
        "-v",
    ])
    .unwrap();
    assert!(cli.verbose);

    let mut config = QuicloopConfig::default();
    apply_cli_overrides(&mut config, &cli);
    assert_eq!(config.client.url, "10.0.0.1:4433");
    assert_eq!(config.transport.version, 0x1a2a_3a4a);
    assert!(!config.client.verify_peer);
}

#[test]
fn test_cli_rejects_unparseable_version() {
    let result = CliArgs::try_parse_from(["quicloop", "client", "--wire-version", "draft-29"]);
    assert!(result.is_err());
}

#[test]
fn test_decimal_wire_version() {
    let cli = CliArgs::try_parse_from(["quicloop", "client", "--wire-version", "1"]).unwrap();
    match cli.command {
        Some(Command::Client(args)) => assert_eq!(args.wire_version, Some(1)),
        other => panic!("unexpected command: {:?}", other),
    }
}
