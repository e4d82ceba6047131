//! # Transport Settings (RFC 9000 Section 18.2)
//!
//! Engine-neutral description of the transport parameters and TLS options a
//! connection is created with. Every engine adapter translates this into its
//! own configuration object.

#![forbid(unsafe_code)]

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::version::PROTOCOL_VERSION;

/// Largest UDP payload either side sends. Fits IPv6 minimum MTU minus headers.
pub const DEFAULT_MAX_UDP_PAYLOAD: usize = 1232;

pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_INITIAL_MAX_DATA: u64 = 10_000_000;
pub const DEFAULT_INITIAL_MAX_STREAM_DATA: u64 = 1_000_000;
pub const DEFAULT_MAX_STREAMS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Wire version offered by clients.
    pub version: u32,

    /// ALPN identifiers in preference order.
    pub application_protos: Vec<String>,

    /// Idle timeout in milliseconds. Zero disables it.
    pub idle_timeout_ms: u64,

    pub max_udp_payload: usize,

    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,

    pub disable_active_migration: bool,

    /// Verify the peer's certificate chain.
    pub verify_peer: bool,

    /// Send GREASE values (RFC 9287).
    pub grease: bool,

    /// PEM certificate chain (servers).
    pub cert_path: Option<String>,

    /// PEM private key (servers).
    pub key_path: Option<String>,

    /// Directory of trusted roots for peer verification.
    pub ca_path: Option<String>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            application_protos: vec!["hq-20".to_string(), "http/0.9".to_string()],
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            max_udp_payload: DEFAULT_MAX_UDP_PAYLOAD,
            initial_max_data: DEFAULT_INITIAL_MAX_DATA,
            initial_max_stream_data_bidi_local: DEFAULT_INITIAL_MAX_STREAM_DATA,
            initial_max_stream_data_bidi_remote: DEFAULT_INITIAL_MAX_STREAM_DATA,
            initial_max_stream_data_uni: DEFAULT_INITIAL_MAX_STREAM_DATA,
            initial_max_streams_bidi: DEFAULT_MAX_STREAMS,
            initial_max_streams_uni: DEFAULT_MAX_STREAMS,
            disable_active_migration: true,
            verify_peer: false,
            grease: true,
            cert_path: None,
            key_path: None,
            ca_path: None,
        }
    }
}

impl TransportSettings {
    /// Idle timeout as a duration; `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    /// ALPN list in wire form: each identifier prefixed by its length.
    pub fn alpn_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for proto in &self.application_protos {
            out.push(proto.len() as u8);
            out.extend_from_slice(proto.as_bytes());
        }
        out
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.application_protos.is_empty() {
            errors.push("transport.application_protos must not be empty".to_string());
        }
        for proto in &self.application_protos {
            if proto.is_empty() || proto.len() > 255 {
                errors.push(format!(
                    "transport.application_protos entry {:?} must be 1..=255 bytes",
                    proto
                ));
            }
        }

        // RFC 9000 Section 18.2: values below 1200 are invalid
        if self.max_udp_payload < 1200 {
            errors.push(format!(
                "transport.max_udp_payload must be at least 1200 (got {})",
                self.max_udp_payload
            ));
        }
        if self.max_udp_payload > 65527 {
            errors.push(format!(
                "transport.max_udp_payload must be at most 65527 (got {})",
                self.max_udp_payload
            ));
        }

        if self.cert_path.is_some() != self.key_path.is_some() {
            errors.push("transport.cert_path and transport.key_path must be set together".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
