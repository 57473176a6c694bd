mod frame;
mod handshake;
mod peer_message;

pub use frame::Frame;
pub use handshake::Handshake;
pub use peer_message::{MessageId, PeerMessage};
