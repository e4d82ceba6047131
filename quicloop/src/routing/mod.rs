//! Server-side routing: connection IDs, the connection registry and the
//! packet dispatcher that ties them to stateless Retry and Version
//! Negotiation.

pub mod cid_generator;
pub mod dispatcher;
pub mod registry;

#[cfg(test)]
mod tests;

pub use cid_generator::{
    ConnectionIdGenerator, DerivedConnectionIds, RandomConnectionIdGenerator,
    SequentialConnectionIdGenerator, CID_LENGTH,
};
pub use dispatcher::{Dispatch, DispatchOptions, DropReason, PacketDispatcher};
pub use registry::{ConnectionRegistry, Reaped};
