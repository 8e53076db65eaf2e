use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::net::IpAddr;

use crate::info_hash::InfoHashes;

/// Per-peer state for the Fast Extension (BEP-6).
///
/// Tracks the pieces each side may request while choked and the pieces the
/// remote peer has suggested.
#[derive(Debug, Clone, Default)]
pub struct FastState {
    /// Pieces the remote peer has allowed us to download while choked.
    pub allowed_incoming: HashSet<u32>,
    /// Pieces we have allowed the remote peer to download while choked.
    pub allowed_outgoing: HashSet<u32>,
    /// Pieces the remote peer has suggested we download, in receipt order.
    pub suggested: Vec<u32>,
}

impl FastState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an AllowedFast grant from the remote peer.
    pub fn add_allowed_incoming(&mut self, piece: u32) {
        self.allowed_incoming.insert(piece);
    }

    /// Records an AllowedFast grant we sent to the remote peer.
    pub fn add_allowed_outgoing(&mut self, piece: u32) {
        self.allowed_outgoing.insert(piece);
    }

    /// Whether we may request `piece` while the peer is choking us.
    pub fn can_request_while_choked(&self, piece: u32) -> bool {
        self.allowed_incoming.contains(&piece)
    }

    /// Whether we should serve `piece` to this peer while choking it.
    pub fn should_serve_choked_request(&self, piece: u32) -> bool {
        self.allowed_outgoing.contains(&piece)
    }

    /// Records a SuggestPiece from the remote peer.
    pub fn add_suggested(&mut self, piece: u32) {
        if !self.suggested.contains(&piece) {
            self.suggested.push(piece);
        }
    }
}

/// Generates the allowed fast set for a peer (BEP-6).
///
/// The peer's address is masked to its top 3 bytes (network byte order,
/// low byte zeroed) and concatenated with the torrent's 20-byte flat
/// identity hash into a 24-byte seed. The seed is repeatedly SHA-1 hashed
/// and each 4-byte chunk of the digest, read big-endian modulo the piece
/// count, becomes a candidate index until `count` indices are produced.
///
/// The sequence is deterministic for a given (address, hash, count,
/// piece count) and may contain the same index more than once; duplicates
/// are deliberately not removed. A tree-hash-only torrent has no flat
/// identity, so its set is empty.
pub fn allowed_fast_set(
    info_hashes: &InfoHashes,
    peer_ip: IpAddr,
    piece_count: u32,
    count: u32,
) -> Vec<u32> {
    let Some(info_hash) = info_hashes.v1() else {
        return Vec::new();
    };
    if piece_count == 0 {
        return Vec::new();
    }

    let ip_bytes = match peer_ip {
        IpAddr::V4(ip) => {
            let octets = ip.octets();
            [octets[0], octets[1], octets[2], 0]
        }
        IpAddr::V6(ip) => {
            let octets = ip.octets();
            [octets[0], octets[1], octets[2], 0]
        }
    };

    let mut x = Vec::with_capacity(24);
    x.extend_from_slice(&ip_bytes);
    x.extend_from_slice(info_hash);

    let mut set = Vec::with_capacity(count as usize);
    while (set.len() as u32) < count {
        let digest = Sha1::digest(&x);

        for chunk in digest.chunks(4) {
            if set.len() as u32 >= count {
                break;
            }
            let index =
                u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) % piece_count;
            set.push(index);
        }

        x = digest.to_vec();
    }

    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn hashes() -> InfoHashes {
        InfoHashes::v1_only([0xAA; 20])
    }

    #[test]
    fn test_deterministic() {
        let ip = IpAddr::V4(Ipv4Addr::new(80, 4, 4, 200));
        let a = allowed_fast_set(&hashes(), ip, 1313, 7);
        let b = allowed_fast_set(&hashes(), ip, 1313, 7);
        assert_eq!(a, b);
        assert_eq!(a.len(), 7);
    }

    #[test]
    fn test_indices_in_range() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        for piece_count in [1u32, 2, 9, 1000] {
            let set = allowed_fast_set(&hashes(), ip, piece_count, 10);
            assert_eq!(set.len(), 10);
            assert!(set.iter().all(|&i| i < piece_count));
        }
    }

    #[test]
    fn test_low_address_byte_ignored() {
        let a = allowed_fast_set(&hashes(), IpAddr::V4(Ipv4Addr::new(80, 4, 4, 200)), 99, 10);
        let b = allowed_fast_set(&hashes(), IpAddr::V4(Ipv4Addr::new(80, 4, 4, 7)), 99, 10);
        assert_eq!(a, b);
    }

    #[test]
    fn test_third_address_byte_matters() {
        let a = allowed_fast_set(&hashes(), IpAddr::V4(Ipv4Addr::new(80, 4, 4, 200)), 99, 10);
        let b = allowed_fast_set(&hashes(), IpAddr::V4(Ipv4Addr::new(80, 4, 5, 200)), 99, 10);
        assert_ne!(a, b);
    }

    #[test]
    fn test_duplicates_preserved() {
        // With a single piece every candidate maps to index 0; the set must
        // still contain `count` entries rather than collapsing to one.
        let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        let set = allowed_fast_set(&hashes(), ip, 1, 10);
        assert_eq!(set, vec![0; 10]);
    }

    #[test]
    fn test_empty_without_flat_hash() {
        let v2 = InfoHashes::v2_only([0xBB; 32]);
        let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        assert!(allowed_fast_set(&v2, ip, 100, 10).is_empty());
    }

    #[test]
    fn test_fast_state() {
        let mut state = FastState::new();
        state.add_allowed_incoming(3);
        assert!(state.can_request_while_choked(3));
        assert!(!state.can_request_while_choked(4));

        state.add_allowed_outgoing(7);
        assert!(state.should_serve_choked_request(7));

        state.add_suggested(5);
        state.add_suggested(5);
        assert_eq!(state.suggested, vec![5]);
    }
}
