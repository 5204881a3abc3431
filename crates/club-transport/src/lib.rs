//! Club transport layer.
//!
//! Provides the socket abstraction the club hub consumes: a bidirectional
//! in-process duplex with a **reliable** lane (ordered, never dropped) and an
//! **unreliable** lane (bounded queue, silently lossy), plus the atomic
//! preamble swap used by the fusion handshake.
//!
//! The hub never touches wire-level concerns beyond this surface, so a
//! network-backed transport can replace the in-process one without touching
//! protocol code.

mod error;
mod exchange;
mod socket;

pub use error::TransportError;
pub use exchange::reliable_exchange;
pub use socket::{EndpointId, Lane, Socket, SocketReader, SocketSender};
