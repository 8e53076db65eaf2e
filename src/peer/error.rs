use thiserror::Error;

/// Errors that can occur on a peer connection.
///
/// Every variant except `Io` and `Timeout` is a protocol violation: the
/// connection is torn down, the torrent continues.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent an invalid handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// A handshake arrived after the connection was already established.
    #[error("handshake repeated mid-connection")]
    UnexpectedHandshake,

    /// The peer's info hash doesn't match ours.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// Received a malformed protocol message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Received an unknown message ID.
    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    /// A message not permitted by the torrent's active mode.
    #[error("message {message} not accepted in mode {mode}")]
    NotAcceptedInMode {
        message: &'static str,
        mode: &'static str,
    },

    /// A request with out-of-bounds piece index, offset, or length.
    #[error("illegal request: piece {piece} offset {offset} length {length}")]
    IllegalRequest { piece: u32, offset: u32, length: u32 },

    /// The peer sent a bitfield that doesn't match the piece count.
    #[error("bad bitfield: {0}")]
    BadBitfield(#[from] crate::bitfield::BitfieldError),

    /// Too many consecutive pieces from this peer failed verification.
    #[error("{0} consecutive hash failures")]
    HashFailures(u32),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("timeout")]
    Timeout,
}
