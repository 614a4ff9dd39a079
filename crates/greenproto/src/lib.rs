//! Protocol types for the greenroom session daemon.
//!
//! Everything a peer needs to talk to `greenroomd`: the message envelope,
//! the request/reply vocabulary for the app supervisor, graph and studio,
//! the notification stream, and the line-oriented wire format.

pub mod envelope;
pub mod session;
pub mod wire;

pub use envelope::{Message, MessageHeader, PROTOCOL_VERSION};
pub use session::*;
pub use wire::{Frame, JsonLines, WireFormat};
