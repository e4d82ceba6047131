//! HTTP/0.9 over QUIC, the toy application both sessions speak.
//!
//! - Client sends: `GET /path\r\n` on its first bidirectional stream, with fin
//! - Server answers with a fixed body on the same stream, with fin
//!
//! There are no headers and no framing; the stream end delimits both sides.

use quicloop_engine::error::INTERNAL_ERROR;
use quicloop_engine::{ConnectionId, ProtocolEngine};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::stream_io::StreamHandler;
use crate::{Error, Result};

/// Stream the client sends its request on.
pub const REQUEST_STREAM_ID: u64 = 4;

/// Requests longer than this without a line end are refused.
const MAX_REQUEST_LEN: usize = 8192;

/// `GET <path>\r\n`
pub fn request_line(path: &str) -> Vec<u8> {
    format!("GET {}\r\n", path).into_bytes()
}

/// Parse a request of the form `GET /path\r\n` (or `\n`) and return the path.
pub fn parse_request(data: &[u8]) -> Result<&str> {
    let request = std::str::from_utf8(data)
        .map_err(|e| Error::InvalidRequest(format!("Invalid UTF-8: {}", e)))?;

    let mut parts = request.split_whitespace();
    let method = parts.next().unwrap_or_default();
    if !method.eq_ignore_ascii_case("GET") {
        return Err(Error::InvalidRequest(format!(
            "Only GET method supported, got: {:?}",
            method
        )));
    }

    let path = parts
        .next()
        .ok_or_else(|| Error::InvalidRequest("Request must be: GET /path".to_string()))?;
    if !path.starts_with('/') {
        return Err(Error::InvalidRequest("Path must start with /".to_string()));
    }
    Ok(path)
}

// ============================================================================
// Server
// ============================================================================

/// Answers every request stream once with a fixed body.
///
/// Request bytes are buffered per (connection, stream) until the client's fin.
#[derive(Debug)]
pub struct HqServer {
    body: Vec<u8>,
    pending: HashMap<(ConnectionId, u64), Vec<u8>>,
    answered: HashSet<(ConnectionId, u64)>,
    responses: u64,
}

impl HqServer {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            pending: HashMap::new(),
            answered: HashSet::new(),
            responses: 0,
        }
    }

    /// Number of responses sent so far.
    pub fn responses(&self) -> u64 {
        self.responses
    }

    /// Drop per-stream state of a reaped connection.
    pub fn forget(&mut self, scid: &ConnectionId) {
        self.pending.retain(|(cid, _), _| cid != scid);
        self.answered.retain(|(cid, _)| cid != scid);
    }

    fn respond<E: ProtocolEngine>(&mut self, conn: &mut Connection<E>, stream_id: u64, request: &[u8]) {
        match parse_request(request) {
            Ok(path) => info!(trace_id = %conn.trace_id(), stream_id, path, "request"),
            Err(e) => warn!(trace_id = %conn.trace_id(), stream_id, error = %e, "unparseable request"),
        }

        match conn.stream_send(stream_id, &self.body, true) {
            Ok(written) => {
                self.responses += 1;
                debug!(trace_id = %conn.trace_id(), stream_id, bytes = written, "response queued");
            }
            Err(e) => {
                warn!(trace_id = %conn.trace_id(), stream_id, error = %e, "response failed, closing");
                let _ = conn.close(false, INTERNAL_ERROR, b"fail");
            }
        }
    }
}

impl<E: ProtocolEngine> StreamHandler<E> for HqServer {
    fn on_stream_data(&mut self, conn: &mut Connection<E>, stream_id: u64, data: &[u8], fin: bool) {
        let key = (conn.source_id().clone(), stream_id);
        if self.answered.contains(&key) {
            return;
        }

        let request = self.pending.entry(key.clone()).or_default();
        request.extend_from_slice(data);
        let complete = fin || request.len() > MAX_REQUEST_LEN;
        if !complete {
            return;
        }

        let request = self.pending.remove(&key).unwrap_or_default();
        self.answered.insert(key);
        self.respond(conn, stream_id, &request);
    }
}

// ============================================================================
// Client
// ============================================================================

/// Collects the response on the request stream and closes once it ends.
#[derive(Debug, Clone, Default)]
pub struct HqClient {
    stream_id: u64,
    response: Vec<u8>,
    complete: bool,
}

impl HqClient {
    pub fn new(stream_id: u64) -> Self {
        Self {
            stream_id,
            ..Default::default()
        }
    }

    pub fn response(&self) -> &[u8] {
        &self.response
    }

    pub fn into_response(self) -> Vec<u8> {
        self.response
    }

    /// The server finished the response stream.
    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

impl<E: ProtocolEngine> StreamHandler<E> for HqClient {
    fn on_stream_data(&mut self, conn: &mut Connection<E>, stream_id: u64, data: &[u8], fin: bool) {
        if stream_id != self.stream_id {
            debug!(trace_id = %conn.trace_id(), stream_id, "data on unexpected stream");
            return;
        }

        self.response.extend_from_slice(data);
        info!(
            trace_id = %conn.trace_id(),
            stream_id,
            bytes = data.len(),
            fin,
            "response data: {}",
            String::from_utf8_lossy(data)
        );

        if fin && !self.complete {
            self.complete = true;
            if let Err(e) = conn.close(true, 0x00, b"bye") {
                if !e.is_done() {
                    warn!(trace_id = %conn.trace_id(), error = %e, "close failed");
                }
            }
        }
    }
}
