use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::debug;

use crate::constants::{
    ALLOWANCE_CUT, ALLOWANCE_RAISE, CHOKE_REVIEW_INTERVAL, RATE_REDUCTION_INTERVAL,
    RECIPROCATION_WINDOW,
};
use crate::peer::PeerSession;

/// A choke-state change the session should apply and announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokeDecision {
    pub peer: SocketAddr,
    pub choke: bool,
}

/// Maps an upload rate to the number of peers a rational counterpart would
/// reciprocate to at that rate. Thresholds are KiB/s; the table is the
/// empirically tuned BitTyrant step function and is kept verbatim.
pub fn active_set_size(upload_rate_bytes_per_sec: f64) -> usize {
    let kib = upload_rate_bytes_per_sec / 1024.0;
    match kib {
        k if k < 11.0 => 2,
        k if k < 35.0 => 3,
        k if k < 80.0 => 4,
        k if k < 200.0 => 5,
        k if k < 350.0 => 6,
        k if k < 600.0 => 7,
        k if k < 900.0 => 8,
        _ => 9,
    }
}

/// Periodically reviews connected peers and decides which may upload from
/// us, using BitTyrant-style reciprocation.
///
/// The review is gated to a minimum interval, but freeing an upload slot
/// (a peer turning interested, or an unchoked peer choking us) forces a
/// review on the next tick.
pub struct ChokeManager {
    last_review: Option<Instant>,
    review_forced: bool,
}

impl ChokeManager {
    pub fn new() -> Self {
        Self {
            last_review: None,
            review_forced: false,
        }
    }

    /// Forces the next `review` call to run regardless of the interval.
    pub fn trigger(&mut self) {
        self.review_forced = true;
    }

    /// Runs one review round if due.
    ///
    /// Updates every peer's reciprocation ledger, then ranks interested
    /// peers by estimated download rate and unchokes the top
    /// `active_set_size(our upload rate)` of them. Returned decisions are
    /// only the changes; the caller flips the flags and sends the messages.
    pub fn review(
        &mut self,
        now: Instant,
        peers: &mut HashMap<SocketAddr, PeerSession>,
        upload_rate: f64,
        piece_length: u64,
    ) -> Vec<ChokeDecision> {
        let due = self.review_forced
            || match self.last_review {
                None => true,
                Some(last) => now.duration_since(last) >= CHOKE_REVIEW_INTERVAL,
            };
        if !due {
            return Vec::new();
        }
        self.last_review = Some(now);
        self.review_forced = false;

        for peer in peers.values_mut() {
            Self::settle_account(peer, now);
        }

        let slots = active_set_size(upload_rate);

        // Rank interested peers by what they are worth to us.
        let mut ranked: Vec<(SocketAddr, f64)> = peers
            .iter_mut()
            .filter(|(_, p)| p.flags.peer_interested)
            .map(|(&addr, p)| (addr, p.estimated_download_rate(now, piece_length)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let unchoke: Vec<SocketAddr> = ranked.iter().take(slots).map(|(addr, _)| *addr).collect();

        let mut decisions = Vec::new();
        for (&addr, peer) in peers.iter() {
            let should_choke = !unchoke.contains(&addr);
            if should_choke != peer.flags.am_choking {
                decisions.push(ChokeDecision {
                    peer: addr,
                    choke: should_choke,
                });
            }
        }

        if !decisions.is_empty() {
            debug!(slots, changes = decisions.len(), "choke review");
        }
        decisions
    }

    /// One round of ledger bookkeeping for a single peer.
    fn settle_account(peer: &mut PeerSession, now: Instant) {
        if peer.flags.am_choking {
            peer.account.rounds_choked += 1;
            return;
        }
        peer.account.rounds_unchoked += 1;

        if !peer.flags.peer_choking {
            // Reciprocating; the measured download rate speaks for itself.
            return;
        }

        let unchoked_long_enough = peer
            .account
            .last_unchoked
            .is_some_and(|t| now.duration_since(t) >= RECIPROCATION_WINDOW);
        if !unchoked_long_enough {
            return;
        }

        if peer.flags.peer_interested {
            // Interested but not yet reciprocating: raise the offer.
            peer.account.allowance *= ALLOWANCE_RAISE;
        } else {
            // Keeps choking us and wants nothing: stop overpaying, but no
            // more than one cut per reduction window.
            let may_reduce = match peer.account.last_rate_reduction {
                None => true,
                Some(t) => now.duration_since(t) >= RATE_REDUCTION_INTERVAL,
            };
            if may_reduce {
                peer.account.allowance *= ALLOWANCE_CUT;
                peer.account.last_rate_reduction = Some(now);
            }
        }
    }
}

impl Default for ChokeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::INITIAL_ALLOWANCE;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn peers_with(count: u16, now: Instant) -> HashMap<SocketAddr, PeerSession> {
        (0..count)
            .map(|i| {
                let a = addr(7000 + i);
                (a, PeerSession::new(a, false, now))
            })
            .collect()
    }

    #[test]
    fn test_active_set_size_table() {
        let kib = 1024.0;
        assert_eq!(active_set_size(0.0), 2);
        assert_eq!(active_set_size(10.0 * kib), 2);
        assert_eq!(active_set_size(11.0 * kib), 3);
        assert_eq!(active_set_size(34.0 * kib), 3);
        assert_eq!(active_set_size(35.0 * kib), 4);
        assert_eq!(active_set_size(199.0 * kib), 5);
        assert_eq!(active_set_size(349.0 * kib), 6);
        assert_eq!(active_set_size(599.0 * kib), 7);
        assert_eq!(active_set_size(899.0 * kib), 8);
        assert_eq!(active_set_size(900.0 * kib), 9);
        assert_eq!(active_set_size(90000.0 * kib), 9);
    }

    #[test]
    fn test_review_interval_gate() {
        let now = Instant::now();
        let mut mgr = ChokeManager::new();
        let mut peers = peers_with(1, now);

        // First review always runs.
        mgr.review(now, &mut peers, 0.0, 1 << 18);
        let rounds = peers.values().next().unwrap().account.rounds_choked;
        assert_eq!(rounds, 1);

        // Within the interval nothing happens.
        mgr.review(now + Duration::from_secs(5), &mut peers, 0.0, 1 << 18);
        assert_eq!(peers.values().next().unwrap().account.rounds_choked, 1);

        // Past the interval it runs again.
        mgr.review(now + Duration::from_secs(10), &mut peers, 0.0, 1 << 18);
        assert_eq!(peers.values().next().unwrap().account.rounds_choked, 2);
    }

    #[test]
    fn test_trigger_bypasses_gate() {
        let now = Instant::now();
        let mut mgr = ChokeManager::new();
        let mut peers = peers_with(1, now);

        mgr.review(now, &mut peers, 0.0, 1 << 18);
        mgr.trigger();
        mgr.review(now + Duration::from_secs(1), &mut peers, 0.0, 1 << 18);
        assert_eq!(peers.values().next().unwrap().account.rounds_choked, 2);
    }

    #[test]
    fn test_interested_peers_unchoked_up_to_slots() {
        let now = Instant::now();
        let mut mgr = ChokeManager::new();
        let mut peers = peers_with(4, now);
        for p in peers.values_mut() {
            p.flags.peer_interested = true;
        }

        // Low upload rate: slots = 2.
        let decisions = mgr.review(now, &mut peers, 0.0, 1 << 18);
        let unchokes = decisions.iter().filter(|d| !d.choke).count();
        assert_eq!(unchokes, 2);
        assert!(decisions.iter().all(|d| !d.choke));
    }

    #[test]
    fn test_uninterested_peers_not_unchoked() {
        let now = Instant::now();
        let mut mgr = ChokeManager::new();
        let mut peers = peers_with(3, now);
        let decisions = mgr.review(now, &mut peers, 0.0, 1 << 18);
        assert!(decisions.is_empty());
    }

    #[test]
    fn test_allowance_cut_when_unreciprocated_and_uninterested() {
        let now = Instant::now();
        let mut mgr = ChokeManager::new();
        let mut peers = peers_with(1, now);
        let a = addr(7000);

        {
            let p = peers.get_mut(&a).unwrap();
            p.flags.am_choking = false;
            p.flags.peer_choking = true;
            p.flags.peer_interested = false;
            p.account.last_unchoked = Some(now);
        }

        // 35 seconds of continued choking-while-unchoked.
        mgr.review(now + Duration::from_secs(35), &mut peers, 0.0, 1 << 18);
        let allowance = peers.get(&a).unwrap().account.allowance;
        assert_eq!(allowance, INITIAL_ALLOWANCE * ALLOWANCE_CUT);

        // A second review inside the reduction window must not cut again.
        mgr.trigger();
        mgr.review(now + Duration::from_secs(45), &mut peers, 0.0, 1 << 18);
        assert_eq!(peers.get(&a).unwrap().account.allowance, allowance);

        // Past the reduction window the next cut applies.
        mgr.trigger();
        mgr.review(now + Duration::from_secs(70), &mut peers, 0.0, 1 << 18);
        assert_eq!(
            peers.get(&a).unwrap().account.allowance,
            allowance * ALLOWANCE_CUT
        );
    }

    #[test]
    fn test_allowance_raised_for_interested_holdout() {
        let now = Instant::now();
        let mut mgr = ChokeManager::new();
        let mut peers = peers_with(1, now);
        let a = addr(7000);

        {
            let p = peers.get_mut(&a).unwrap();
            p.flags.am_choking = false;
            p.flags.peer_choking = true;
            p.flags.peer_interested = true;
            p.account.last_unchoked = Some(now);
        }

        mgr.review(now + Duration::from_secs(31), &mut peers, 0.0, 1 << 18);
        assert_eq!(
            peers.get(&a).unwrap().account.allowance,
            INITIAL_ALLOWANCE * ALLOWANCE_RAISE
        );
    }

    #[test]
    fn test_no_adjustment_inside_reciprocation_window() {
        let now = Instant::now();
        let mut mgr = ChokeManager::new();
        let mut peers = peers_with(1, now);
        let a = addr(7000);

        {
            let p = peers.get_mut(&a).unwrap();
            p.flags.am_choking = false;
            p.flags.peer_choking = true;
            p.account.last_unchoked = Some(now);
        }

        mgr.review(now + Duration::from_secs(10), &mut peers, 0.0, 1 << 18);
        assert_eq!(peers.get(&a).unwrap().account.allowance, INITIAL_ALLOWANCE);
    }

    #[test]
    fn test_reciprocating_peer_untouched() {
        let now = Instant::now();
        let mut mgr = ChokeManager::new();
        let mut peers = peers_with(1, now);
        let a = addr(7000);

        {
            let p = peers.get_mut(&a).unwrap();
            p.flags.am_choking = false;
            p.flags.peer_choking = false;
            p.account.last_unchoked = Some(now);
        }

        mgr.review(now + Duration::from_secs(40), &mut peers, 0.0, 1 << 18);
        let p = peers.get(&a).unwrap();
        assert_eq!(p.account.allowance, INITIAL_ALLOWANCE);
        assert_eq!(p.account.rounds_unchoked, 1);
    }

    #[test]
    fn test_faster_peers_win_slots() {
        let now = Instant::now();
        let mut mgr = ChokeManager::new();
        let mut peers = peers_with(3, now);
        for p in peers.values_mut() {
            p.flags.peer_interested = true;
        }
        // Peer 7002 downloads to us fastest.
        peers
            .get_mut(&addr(7002))
            .unwrap()
            .record_block(now, 1_000_000);
        peers.get_mut(&addr(7001)).unwrap().record_block(now, 500);

        let decisions = mgr.review(now, &mut peers, 0.0, 1 << 18);
        let unchoked: Vec<SocketAddr> =
            decisions.iter().filter(|d| !d.choke).map(|d| d.peer).collect();
        assert_eq!(unchoked.len(), 2);
        assert!(unchoked.contains(&addr(7002)));
        assert!(unchoked.contains(&addr(7001)));
    }
}
