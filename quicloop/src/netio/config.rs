use serde::{Deserialize, Serialize};

/// Receive buffer size for one datagram. Larger than any payload the
/// engines send, so a read never truncates.
pub const RECV_BUFFER_SIZE: usize = 2048;

/// Largest datagram handed to the socket in one send.
pub const MAX_DATAGRAM_SIZE: usize = 1232;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct NetIoConfig {
    /// Enable SO_REUSEADDR on the server socket.
    /// Allows quick restarts on the same port.
    pub reuse_address: bool,

    /// Optional kernel receive buffer size (SO_RCVBUF).
    /// Larger buffers reduce packet loss under burst traffic.
    pub socket_recv_buffer_size: Option<usize>,

    /// Optional kernel send buffer size (SO_SNDBUF).
    pub socket_send_buffer_size: Option<usize>,
}

impl Default for NetIoConfig {
    fn default() -> Self {
        Self {
            reuse_address: true,
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
        }
    }
}

impl NetIoConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        for (name, size) in [
            ("network.socket_recv_buffer_size", self.socket_recv_buffer_size),
            ("network.socket_send_buffer_size", self.socket_send_buffer_size),
        ] {
            if size == Some(0) {
                errors.push(format!("{} must be > 0 when set", name));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
