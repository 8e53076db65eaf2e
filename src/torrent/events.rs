use crate::torrent::mode::Mode;

/// Where newly discovered peers came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Dht,
    LocalDiscovery,
    PeerExchange,
    WebSeed,
    Incoming,
}

/// Events the core raises for outer layers (persistence, UI, announcer).
///
/// Collaborators observe these through a queue the driver drains; the core
/// never calls back into collaborator internals synchronously.
#[derive(Debug, Clone, PartialEq)]
pub enum TorrentEvent {
    /// A piece finished verification.
    PieceVerified { piece: u32, passed: bool },
    /// The active mode was replaced.
    StateChanged { from: Mode, to: Mode },
    /// A discovery source reported peers.
    PeersFound {
        source: PeerSource,
        new_count: usize,
        total_count: usize,
    },
    /// The download finished; announcers typically re-announce on this.
    Completed,
}
