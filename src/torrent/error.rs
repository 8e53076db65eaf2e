use thiserror::Error;

use crate::disk::DiskError;
use crate::torrent::mode::Mode;

/// Errors at the torrent session level.
#[derive(Debug, Error)]
pub enum TorrentError {
    /// Disk failure; the session moves to the error mode.
    #[error("disk failure: {0}")]
    Disk(#[from] DiskError),

    /// A mode replacement the transition table forbids.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },

    /// An operation that needs a connected peer was aimed at an unknown one.
    #[error("unknown peer")]
    UnknownPeer,
}

impl TorrentError {
    pub fn illegal_transition(from: Mode, to: Mode) -> Self {
        Self::IllegalTransition {
            from: from.name(),
            to: to.name(),
        }
    }
}
