use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use crate::bitfield::Bitfield;
use crate::constants::INITIAL_ALLOWANCE;
use crate::peer::fast::FastState;
use crate::peer::message::Message;
use crate::peer::peer_id::PeerId;
use crate::rate::RateEstimator;

/// The four independent choke/interest flags of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Per-peer reciprocation ledger for the choke review.
///
/// Lifetime mirrors the peer session. The allowance starts at the market
/// rate and is adjusted multiplicatively each review round.
#[derive(Debug, Clone)]
pub struct ChokeAccount {
    /// Review rounds this peer spent choked by us.
    pub rounds_choked: u32,
    /// Review rounds this peer spent unchoked by us.
    pub rounds_unchoked: u32,
    /// When we last choked this peer.
    pub last_choked: Option<Instant>,
    /// When we last unchoked this peer.
    pub last_unchoked: Option<Instant>,
    /// When this peer's allowance was last reduced.
    pub last_rate_reduction: Option<Instant>,
    /// Upload bytes/sec currently assigned to this peer.
    pub allowance: f64,
}

impl Default for ChokeAccount {
    fn default() -> Self {
        Self {
            rounds_choked: 0,
            rounds_unchoked: 0,
            last_choked: None,
            last_unchoked: None,
            last_rate_reduction: None,
            allowance: INITIAL_ALLOWANCE,
        }
    }
}

/// Mutable per-connection state, created on successful handshake and
/// destroyed on disconnect. Owned exclusively by the torrent session;
/// the remote bitfield is this session's own copy, never shared with the
/// torrent's authoritative bitfield.
pub struct PeerSession {
    /// Remote socket address.
    pub addr: SocketAddr,
    /// Whether the peer connected to us.
    pub incoming: bool,
    /// The peer's ID from its handshake.
    pub peer_id: Option<PeerId>,
    /// Whether the peer advertised the fast extension.
    pub supports_fast: bool,

    /// Choke/interest flags.
    pub flags: Flags,
    /// Our copy of the peer's piece availability; `None` until known.
    pub remote_bitfield: Option<Bitfield>,
    /// Fast-extension state.
    pub fast: FastState,
    /// Reciprocation ledger.
    pub account: ChokeAccount,

    /// Observed download rate from this peer.
    pub download_rate: RateEstimator,
    /// Observed upload rate to this peer.
    pub upload_rate: RateEstimator,
    /// Have-message frequency, for rate estimation while choked.
    pub have_rate: RateEstimator,

    /// Consecutive hash failures attributed to this peer.
    pub hash_failures: u32,
    /// Uploads this peer asked for that are still waiting on the disk,
    /// as `(piece, offset)`; a Cancel removes the entry before the read
    /// completes.
    pub pending_serves: HashSet<(u32, u32)>,

    /// When any message was last received.
    pub last_received: Instant,
    /// When a block was last received.
    pub last_block: Instant,
    /// When we last sent anything.
    pub last_sent: Instant,

    /// Messages queued for the network driver to send.
    outbox: VecDeque<Message>,
}

impl PeerSession {
    pub fn new(addr: SocketAddr, incoming: bool, now: Instant) -> Self {
        Self {
            addr,
            incoming,
            peer_id: None,
            supports_fast: false,
            flags: Flags::default(),
            remote_bitfield: None,
            fast: FastState::new(),
            account: ChokeAccount::default(),
            download_rate: RateEstimator::new(),
            upload_rate: RateEstimator::new(),
            have_rate: RateEstimator::new(),
            hash_failures: 0,
            pending_serves: HashSet::new(),
            last_received: now,
            last_block: now,
            last_sent: now,
            outbox: VecDeque::new(),
        }
    }

    /// Queues a message for the driver; stamps the send clock.
    pub fn queue(&mut self, message: Message, now: Instant) {
        self.last_sent = now;
        self.outbox.push_back(message);
    }

    /// Drains every queued outgoing message.
    pub fn drain_outbox(&mut self) -> Vec<Message> {
        self.outbox.drain(..).collect()
    }

    /// Number of messages waiting for the driver.
    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// Records receipt of a block of `len` bytes.
    pub fn record_block(&mut self, now: Instant, len: u64) {
        self.last_received = now;
        self.last_block = now;
        self.download_rate.record(now, len);
    }

    /// Records a Have announcement from the peer.
    pub fn record_have(&mut self, now: Instant) {
        self.last_received = now;
        self.have_rate.record(now, 0);
    }

    /// Estimated download rate, falling back to have-frequency when the
    /// peer is choking us and no blocks flow.
    pub fn estimated_download_rate(&mut self, now: Instant, piece_length: u64) -> f64 {
        let measured = self.download_rate.rate(now);
        if measured > 0.0 {
            return measured;
        }
        let haves = self.have_rate.events(now) as f64;
        haves * piece_length as f64 / crate::constants::RATE_WINDOW.as_secs_f64()
    }

    /// True if the peer has `piece` according to our copy of its bitfield.
    pub fn peer_has(&self, piece: u32) -> bool {
        self.remote_bitfield
            .as_ref()
            .is_some_and(|bf| bf.get(piece as usize))
    }

    /// Whether we may send this peer requests right now: unchoked, or
    /// choked but holding an allowed-fast grant for the piece.
    pub fn may_request(&self, piece: u32) -> bool {
        !self.flags.peer_choking || self.fast.can_request_while_choked(piece)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn session() -> PeerSession {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881);
        PeerSession::new(addr, false, Instant::now())
    }

    #[test]
    fn test_default_flags() {
        let s = session();
        assert!(s.flags.am_choking);
        assert!(s.flags.peer_choking);
        assert!(!s.flags.am_interested);
        assert!(!s.flags.peer_interested);
    }

    #[test]
    fn test_outbox_drain() {
        let mut s = session();
        let now = Instant::now();
        s.queue(Message::Interested, now);
        s.queue(Message::Have { piece: 3 }, now);
        assert_eq!(s.outbox_len(), 2);
        let drained = s.drain_outbox();
        assert_eq!(drained.len(), 2);
        assert_eq!(s.outbox_len(), 0);
    }

    #[test]
    fn test_have_frequency_estimate() {
        let mut s = session();
        let start = Instant::now();
        // Peer is choking us; 5 haves of 1 MiB pieces in the window.
        for i in 0..5 {
            s.record_have(start + Duration::from_millis(500 * i));
        }
        let rate = s.estimated_download_rate(start + Duration::from_secs(3), 1 << 20);
        assert!(rate > 0.0);
        assert_eq!(rate, 5.0 * (1 << 20) as f64 / 5.0);
    }

    #[test]
    fn test_measured_rate_preferred() {
        let mut s = session();
        let start = Instant::now();
        s.record_have(start);
        s.record_block(start, 16384);
        let rate = s.estimated_download_rate(start + Duration::from_secs(1), 1 << 20);
        assert_eq!(rate, 16384.0 / 5.0);
    }

    #[test]
    fn test_may_request_fast_grant() {
        let mut s = session();
        assert!(s.flags.peer_choking);
        assert!(!s.may_request(2));
        s.fast.add_allowed_incoming(2);
        assert!(s.may_request(2));
        s.flags.peer_choking = false;
        assert!(s.may_request(9));
    }
}
