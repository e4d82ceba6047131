//! # Stream I/O Loop
//!
//! Drains every readable stream of one connection into a fixed buffer and
//! hands the bytes to the application. Never blocks: it stops as soon as the
//! engine reports no readable stream.

use quicloop_engine::ProtocolEngine;
use tracing::{debug, trace, warn};

use crate::connection::Connection;

/// Size of the buffer each stream read goes through.
pub const STREAM_BUFFER_SIZE: usize = 2048;

/// Application logic fed by [`drain_readable`].
pub trait StreamHandler<E: ProtocolEngine> {
    /// `data` arrived on `stream_id`; `fin` marks the end of the stream.
    fn on_stream_data(&mut self, conn: &mut Connection<E>, stream_id: u64, data: &[u8], fin: bool);
}

/// Read all readable streams of `conn`. Returns the bytes delivered.
///
/// A stream whose read fails is logged and skipped.
pub fn drain_readable<E, H>(conn: &mut Connection<E>, handler: &mut H) -> usize
where
    E: ProtocolEngine,
    H: StreamHandler<E> + ?Sized,
{
    let mut buf = [0u8; STREAM_BUFFER_SIZE];
    let mut delivered = 0;

    while let Some(stream_id) = conn.next_readable_stream() {
        loop {
            match conn.stream_recv(stream_id, &mut buf) {
                Ok((read, fin)) => {
                    trace!(
                        trace_id = %conn.trace_id(),
                        stream_id,
                        bytes = read,
                        fin,
                        "stream data"
                    );
                    delivered += read;
                    handler.on_stream_data(conn, stream_id, &buf[..read], fin);
                    if fin || read == 0 {
                        break;
                    }
                }
                Err(quicloop_engine::Error::Done) => break,
                Err(e) => {
                    warn!(
                        trace_id = %conn.trace_id(),
                        stream_id,
                        error = %e,
                        "stream read failed, skipping stream"
                    );
                    break;
                }
            }
        }
    }

    if delivered > 0 {
        debug!(trace_id = %conn.trace_id(), bytes = delivered, "drained readable streams");
    }
    delivered
}
