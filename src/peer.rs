//! Peer wire protocol (BEP-3, BEP-6, BEP-52) and per-connection state.
//!
//! This module implements the message codec for the base protocol, the fast
//! extension, and the tree-hash extension, plus the mutable state a torrent
//! session keeps for each connected peer.

mod error;
mod fast;
mod message;
mod peer_id;
mod session;
mod transport;

pub use error::PeerError;
pub use fast::{allowed_fast_set, FastState};
pub use message::{Handshake, Message, MessageId, HANDSHAKE_LEN, PROTOCOL};
pub use peer_id::PeerId;
pub use session::{ChokeAccount, Flags, PeerSession};
pub use transport::PeerTransport;

#[cfg(test)]
mod tests;
