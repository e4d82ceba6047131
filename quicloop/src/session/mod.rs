//! Client and server event loops.
//!
//! Both are single-threaded and synchronous: block on the socket with a
//! deadline from the timeout scheduler, feed the engine, run the stream
//! loop, flush. Nothing else blocks.

pub mod client;
pub mod server;

pub use client::{ClientReport, ClientSession, ClientState};
pub use server::ServerSession;
