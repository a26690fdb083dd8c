//! Wire format and socket loops of the tunnel connection.

pub mod message;
pub mod pump;

pub use message::{Frame, MessageError, TunnelMessage};
