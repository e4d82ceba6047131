//! quicloop-engine: the protocol-engine seam of quicloop
//!
//! The orchestration crate never touches packet protection, TLS or loss
//! recovery. It talks to a QUIC engine through [`ProtocolEngine`] and uses
//! this crate's version-independent header codec to route datagrams before a
//! connection exists.
//!
//! # Module Organization
//!
//! - `packet`: invariant header parsing, varints, Version Negotiation and Retry
//! - `engine`: the [`ProtocolEngine`] trait
//! - `settings`: engine-neutral transport parameters
//! - `sim`: deterministic in-process engine used by tests and the default build
//! - `quiche_engine`: adapter over cloudflare/quiche (feature `quiche`)

#![forbid(unsafe_code)]

pub mod engine;
pub mod error;
pub mod packet;
pub mod settings;
pub mod sim;
pub mod types;
pub mod version;

#[cfg(feature = "quiche")]
pub mod quiche_engine;

pub use engine::ProtocolEngine;
pub use error::{Error, Result};
pub use packet::{Header, PacketType};
pub use settings::TransportSettings;
pub use sim::{SimConfig, SimEngine};
pub use types::{ConnectionId, RecvInfo, SendInfo, Stats, MAX_CONN_ID_LEN};
pub use version::{PROTOCOL_VERSION, SUPPORTED_VERSIONS, VERSION_1};

#[cfg(feature = "quiche")]
pub use quiche_engine::{QuicheConfig, QuicheEngine};
