//! Network I/O utilities module.
//!
//! - Socket creation and configuration
//! - Deadline-bounded datagram receive
//! - Network I/O configuration

pub mod config;
pub mod socket;


pub use config::{NetIoConfig, MAX_DATAGRAM_SIZE, RECV_BUFFER_SIZE};
pub use socket::{create_client_socket, create_udp_socket, recv_with_deadline};
