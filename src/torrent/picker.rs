use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::debug;

use crate::bitfield::Bitfield;
use crate::constants::{BLOCK_SIZE, MAX_BLOCK_LENGTH};
use crate::peer::PeerError;

/// How many peers may hold the same in-flight block during endgame.
const MAX_ENDGAME_DUPLICATES: usize = 3;

/// An immutable `(piece, offset, length)` triple identifying one sub-piece
/// transfer unit. Created when the pipeline selects work for a peer,
/// destroyed on completion, cancellation, or disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }
}

#[derive(Debug, Default)]
struct BlockState {
    received: bool,
    assigned: Vec<SocketAddr>,
}

#[derive(Debug)]
struct PieceState {
    blocks: Vec<BlockState>,
    received_count: usize,
}

impl PieceState {
    fn new(block_count: usize) -> Self {
        let mut blocks = Vec::with_capacity(block_count);
        blocks.resize_with(block_count, BlockState::default);
        Self {
            blocks,
            received_count: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.received_count == self.blocks.len()
    }
}

/// What became of a received block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// First valid arrival; piece not yet complete.
    Accepted,
    /// First valid arrival and the piece's final missing block: the caller
    /// should hand the assembled piece to verification. Other peers still
    /// holding duplicates of this block should receive the listed cancels.
    PieceComplete,
    /// A later duplicate (endgame) or a block we never asked this peer for;
    /// dropped silently, no penalty.
    Dropped,
}

/// Owns the per-torrent set of outstanding block requests.
///
/// Decides which blocks each request-eligible peer should fetch next,
/// bounded by a per-peer budget; reconciles cancellations, rejections, and
/// endgame duplication. Piece *bytes* are assembled by the owner; only
/// request state lives here.
pub struct RequestPipeline {
    piece_count: u32,
    piece_length: u32,
    total_length: u64,
    pieces: HashMap<u32, PieceState>,
    in_flight: HashMap<SocketAddr, usize>,
    endgame: bool,
}

impl RequestPipeline {
    pub fn new(piece_count: u32, piece_length: u32, total_length: u64) -> Self {
        Self {
            piece_count,
            piece_length,
            total_length,
            pieces: HashMap::new(),
            in_flight: HashMap::new(),
            endgame: false,
        }
    }

    /// Bytes in the given piece (the final piece is usually shorter).
    pub fn piece_size(&self, piece: u32) -> u32 {
        let start = piece as u64 * self.piece_length as u64;
        (self.total_length - start).min(self.piece_length as u64) as u32
    }

    /// Blocks in the given piece.
    pub fn block_count(&self, piece: u32) -> u32 {
        self.piece_size(piece).div_ceil(BLOCK_SIZE)
    }

    /// Length of one block within a piece.
    pub fn block_length(&self, piece: u32, block: u32) -> u32 {
        let offset = block * BLOCK_SIZE;
        (self.piece_size(piece) - offset).min(BLOCK_SIZE)
    }

    /// Outstanding requests currently assigned to `peer`.
    pub fn in_flight(&self, peer: &SocketAddr) -> usize {
        self.in_flight.get(peer).copied().unwrap_or(0)
    }

    /// Whether endgame duplication is currently armed.
    pub fn endgame(&self) -> bool {
        self.endgame
    }

    /// Validates a request *received from* a peer against piece geometry.
    ///
    /// Illegal bounds are a protocol error: the connection must close.
    pub fn validate_request(&self, piece: u32, offset: u32, length: u32) -> Result<(), PeerError> {
        let illegal = PeerError::IllegalRequest {
            piece,
            offset,
            length,
        };
        if piece >= self.piece_count {
            return Err(illegal);
        }
        let piece_size = self.piece_size(piece);
        if offset >= piece_size {
            return Err(illegal);
        }
        if length == 0 || length > MAX_BLOCK_LENGTH {
            return Err(illegal);
        }
        if offset as u64 + length as u64 > piece_size as u64 {
            return Err(illegal);
        }
        Ok(())
    }

    /// Selects up to `budget - in_flight(peer)` blocks for `peer`.
    ///
    /// Pieces already partially requested are finished first so they can be
    /// hash-checked as early as possible; fresh pieces start with suggested
    /// indices, then a linear scan. Outside endgame a block pending from any
    /// peer is never offered to another.
    pub fn pick<H, A>(
        &mut self,
        peer: SocketAddr,
        local: &Bitfield,
        peer_has: H,
        allowed: A,
        suggested: &[u32],
        budget: usize,
    ) -> Vec<BlockRequest>
    where
        H: Fn(u32) -> bool,
        A: Fn(u32) -> bool,
    {
        let room = budget.saturating_sub(self.in_flight(&peer));
        let mut picked = Vec::new();
        if room == 0 {
            return picked;
        }

        let eligible = |piece: u32| !local.get(piece as usize) && peer_has(piece) && allowed(piece);

        // Partial pieces first, in index order.
        let mut partial: Vec<u32> = self
            .pieces
            .iter()
            .filter(|(_, state)| !state.is_complete())
            .map(|(&piece, _)| piece)
            .collect();
        partial.sort_unstable();

        for piece in partial {
            if picked.len() >= room {
                break;
            }
            if eligible(piece) {
                self.take_fresh_blocks(peer, piece, room, &mut picked);
            }
        }

        // Fresh pieces: suggested indices, then a linear scan.
        for &piece in suggested {
            if picked.len() >= room {
                break;
            }
            if piece < self.piece_count && eligible(piece) && !self.pieces.contains_key(&piece) {
                self.start_piece(piece);
                self.take_fresh_blocks(peer, piece, room, &mut picked);
            }
        }

        for piece in 0..self.piece_count {
            if picked.len() >= room {
                break;
            }
            if eligible(piece) && !self.pieces.contains_key(&piece) {
                self.start_piece(piece);
                self.take_fresh_blocks(peer, piece, room, &mut picked);
            }
        }

        // Endgame: duplicate outstanding blocks across peers, least-requested
        // first, so one slow holder cannot stall completion.
        if self.endgame && picked.len() < room {
            self.take_endgame_blocks(peer, local, &peer_has, &allowed, room, &mut picked);
        }

        *self.in_flight.entry(peer).or_insert(0) += picked.len();
        picked
    }

    fn start_piece(&mut self, piece: u32) {
        let blocks = self.block_count(piece) as usize;
        self.pieces.insert(piece, PieceState::new(blocks));
    }

    fn take_fresh_blocks(
        &mut self,
        peer: SocketAddr,
        piece: u32,
        room: usize,
        picked: &mut Vec<BlockRequest>,
    ) {
        let piece_size = self.piece_size(piece);
        let Some(state) = self.pieces.get_mut(&piece) else {
            return;
        };
        for (block, slot) in state.blocks.iter_mut().enumerate() {
            if picked.len() >= room {
                return;
            }
            if slot.received || !slot.assigned.is_empty() {
                continue;
            }
            slot.assigned.push(peer);
            let offset = block as u32 * BLOCK_SIZE;
            let length = (piece_size - offset).min(BLOCK_SIZE);
            picked.push(BlockRequest::new(piece, offset, length));
        }
    }

    fn take_endgame_blocks<H, A>(
        &mut self,
        peer: SocketAddr,
        local: &Bitfield,
        peer_has: &H,
        allowed: &A,
        room: usize,
        picked: &mut Vec<BlockRequest>,
    ) where
        H: Fn(u32) -> bool,
        A: Fn(u32) -> bool,
    {
        let mut candidates: Vec<(usize, u32, u32)> = Vec::new();
        for (&piece, state) in &self.pieces {
            if local.get(piece as usize) || !peer_has(piece) || !allowed(piece) {
                continue;
            }
            for (block, slot) in state.blocks.iter().enumerate() {
                if slot.received
                    || slot.assigned.contains(&peer)
                    || slot.assigned.len() >= MAX_ENDGAME_DUPLICATES
                    || slot.assigned.is_empty()
                {
                    continue;
                }
                candidates.push((slot.assigned.len(), piece, block as u32));
            }
        }
        candidates.sort_unstable();

        for (_, piece, block) in candidates {
            if picked.len() >= room {
                return;
            }
            let length = self.block_length(piece, block);
            if let Some(state) = self.pieces.get_mut(&piece) {
                state.blocks[block as usize].assigned.push(peer);
                picked.push(BlockRequest::new(piece, block * BLOCK_SIZE, length));
            }
        }
    }

    /// Records a block received from `peer`.
    ///
    /// Along with the outcome, returns the cancels to send to other peers
    /// that still hold a duplicate assignment of this block.
    pub fn on_block_received(
        &mut self,
        peer: SocketAddr,
        piece: u32,
        offset: u32,
    ) -> (BlockOutcome, Vec<(SocketAddr, BlockRequest)>) {
        let length = if offset % BLOCK_SIZE == 0 && piece < self.piece_count {
            self.block_length(piece, offset / BLOCK_SIZE)
        } else {
            0
        };

        let Some(state) = self.pieces.get_mut(&piece) else {
            return (BlockOutcome::Dropped, Vec::new());
        };
        let block = (offset / BLOCK_SIZE) as usize;
        let Some(slot) = state.blocks.get_mut(block) else {
            return (BlockOutcome::Dropped, Vec::new());
        };

        let was_assigned_here = slot.assigned.contains(&peer);
        if was_assigned_here {
            slot.assigned.retain(|a| a != &peer);
            Self::decrement(&mut self.in_flight, peer);
        }

        if slot.received || !was_assigned_here {
            // Endgame duplicate or unsolicited data: first valid wins,
            // later arrivals are dropped without penalty.
            return (BlockOutcome::Dropped, Vec::new());
        }

        slot.received = true;
        state.received_count += 1;

        let request = BlockRequest::new(piece, offset, length);
        let cancels: Vec<(SocketAddr, BlockRequest)> = slot
            .assigned
            .drain(..)
            .map(|other| {
                Self::decrement(&mut self.in_flight, other);
                (other, request)
            })
            .collect();

        let outcome = if state.is_complete() {
            BlockOutcome::PieceComplete
        } else {
            BlockOutcome::Accepted
        };
        (outcome, cancels)
    }

    /// Applies a verification result for a completed piece.
    ///
    /// A failed piece forgets every received block so the piece is selected
    /// again from scratch; a passed piece leaves the pipeline entirely.
    pub fn on_piece_verified(&mut self, piece: u32, passed: bool) {
        if passed {
            self.pieces.remove(&piece);
            return;
        }
        debug!(piece, "verification failed, resetting block state");
        if let Some(state) = self.pieces.get_mut(&piece) {
            for slot in &mut state.blocks {
                for peer in slot.assigned.drain(..) {
                    Self::decrement(&mut self.in_flight, peer);
                }
                slot.received = false;
            }
            state.received_count = 0;
        }
    }

    /// Withdraws every pending request assigned to `peer`, making those
    /// blocks selectable again. Used on choke and on disconnect.
    pub fn cancel_peer(&mut self, peer: &SocketAddr) -> Vec<BlockRequest> {
        let mut freed = Vec::new();
        for (&piece, state) in self.pieces.iter_mut() {
            for (block, slot) in state.blocks.iter_mut().enumerate() {
                if let Some(pos) = slot.assigned.iter().position(|a| a == peer) {
                    slot.assigned.swap_remove(pos);
                    freed.push(BlockRequest::new(
                        piece,
                        block as u32 * BLOCK_SIZE,
                        0, // length recomputed below; keep borrow local
                    ));
                }
            }
        }
        for request in &mut freed {
            request.length = self.block_length(request.piece, request.offset / BLOCK_SIZE);
        }
        self.in_flight.remove(peer);
        freed
    }

    /// Withdraws exactly one rejected request (fast-extension Reject).
    pub fn on_reject(&mut self, peer: &SocketAddr, piece: u32, offset: u32) {
        if offset % BLOCK_SIZE != 0 {
            return;
        }
        let Some(state) = self.pieces.get_mut(&piece) else {
            return;
        };
        let Some(slot) = state.blocks.get_mut((offset / BLOCK_SIZE) as usize) else {
            return;
        };
        if let Some(pos) = slot.assigned.iter().position(|a| a == peer) {
            slot.assigned.swap_remove(pos);
            Self::decrement(&mut self.in_flight, *peer);
        }
    }

    /// Re-arms or disarms endgame: active while every missing block of every
    /// wanted piece is already pending somewhere.
    pub fn update_endgame(&mut self, local: &Bitfield) {
        let mut missing_blocks = 0usize;
        let mut unassigned = 0usize;

        for piece in 0..self.piece_count {
            if local.get(piece as usize) {
                continue;
            }
            match self.pieces.get(&piece) {
                Some(state) => {
                    for slot in &state.blocks {
                        if !slot.received {
                            missing_blocks += 1;
                            if slot.assigned.is_empty() {
                                unassigned += 1;
                            }
                        }
                    }
                }
                None => {
                    // A piece not yet started counts entirely as fresh work.
                    missing_blocks += self.block_count(piece) as usize;
                    unassigned += self.block_count(piece) as usize;
                }
            }
        }

        let arm = missing_blocks > 0 && unassigned == 0;
        if arm != self.endgame {
            debug!(arm, missing_blocks, "endgame state change");
            self.endgame = arm;
        }
    }

    /// True if `remote` holds any piece `local` is missing.
    pub fn is_interesting(local: &Bitfield, remote: &Bitfield) -> bool {
        (0..local.len().min(remote.len())).any(|i| remote.get(i) && !local.get(i))
    }

    fn decrement(in_flight: &mut HashMap<SocketAddr, usize>, peer: SocketAddr) {
        if let Some(count) = in_flight.get_mut(&peer) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                in_flight.remove(&peer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn pipeline_4x2() -> RequestPipeline {
        // 4 pieces of 2 blocks each.
        RequestPipeline::new(4, 2 * BLOCK_SIZE, 8 * BLOCK_SIZE as u64)
    }

    fn any(_: u32) -> bool {
        true
    }

    #[test]
    fn test_geometry() {
        let p = RequestPipeline::new(3, 2 * BLOCK_SIZE, 2 * 2 * BLOCK_SIZE as u64 + 100);
        assert_eq!(p.piece_size(0), 2 * BLOCK_SIZE);
        assert_eq!(p.piece_size(2), 100);
        assert_eq!(p.block_count(2), 1);
        assert_eq!(p.block_length(2, 0), 100);
        assert_eq!(p.block_length(0, 1), BLOCK_SIZE);
    }

    #[test]
    fn test_no_duplicate_requests_outside_endgame() {
        let mut p = pipeline_4x2();
        let local = Bitfield::new(4);

        let first = p.pick(addr(1), &local, any, any, &[], 100);
        assert_eq!(first.len(), 8);
        let second = p.pick(addr(2), &local, any, any, &[], 100);
        assert!(second.is_empty(), "second peer got {:?}", second);
    }

    #[test]
    fn test_budget_respected() {
        let mut p = pipeline_4x2();
        let local = Bitfield::new(4);
        let picked = p.pick(addr(1), &local, any, any, &[], 3);
        assert_eq!(picked.len(), 3);
        assert_eq!(p.in_flight(&addr(1)), 3);
        // Second call with same budget picks nothing further.
        assert!(p.pick(addr(1), &local, any, any, &[], 3).is_empty());
    }

    #[test]
    fn test_requests_only_from_peer_pieces() {
        // Peer bitfield 1010, local 0000: requests come only from {0, 2}.
        let mut p = pipeline_4x2();
        let local = Bitfield::new(4);
        let remote = Bitfield::from_bytes(4, &[0b1010_0000]).unwrap();

        let picked = p.pick(
            addr(1),
            &local,
            |piece| remote.get(piece as usize),
            any,
            &[],
            100,
        );
        assert!(!picked.is_empty());
        assert!(picked.iter().all(|r| r.piece == 0 || r.piece == 2));
        assert_eq!(picked.len(), 4);
    }

    #[test]
    fn test_partial_piece_preferred() {
        let mut p = pipeline_4x2();
        let local = Bitfield::new(4);

        // Peer 1 takes one block of piece 0, then disconnects.
        let first = p.pick(addr(1), &local, any, any, &[], 1);
        assert_eq!(first[0].piece, 0);
        p.cancel_peer(&addr(1));

        // Peer 2 should resume piece 0 before starting anything new.
        let second = p.pick(addr(2), &local, any, any, &[], 2);
        assert_eq!(second[0].piece, 0);
        assert_eq!(second[1].piece, 0);
    }

    #[test]
    fn test_suggested_pieces_first_among_fresh() {
        let mut p = pipeline_4x2();
        let local = Bitfield::new(4);
        let picked = p.pick(addr(1), &local, any, any, &[2], 2);
        assert!(picked.iter().all(|r| r.piece == 2));
    }

    #[test]
    fn test_block_received_completion() {
        let mut p = pipeline_4x2();
        let local = Bitfield::new(4);
        let peer = addr(1);
        let picked = p.pick(peer, &local, any, any, &[], 2);
        assert_eq!(picked.len(), 2);

        let (outcome, cancels) = p.on_block_received(peer, 0, 0);
        assert_eq!(outcome, BlockOutcome::Accepted);
        assert!(cancels.is_empty());

        let (outcome, _) = p.on_block_received(peer, 0, BLOCK_SIZE);
        assert_eq!(outcome, BlockOutcome::PieceComplete);
        assert_eq!(p.in_flight(&peer), 0);
    }

    #[test]
    fn test_unsolicited_block_dropped() {
        let mut p = pipeline_4x2();
        let (outcome, _) = p.on_block_received(addr(1), 0, 0);
        assert_eq!(outcome, BlockOutcome::Dropped);
    }

    #[test]
    fn test_endgame_duplicates_first_wins() {
        let mut p = pipeline_4x2();
        let mut local = Bitfield::new(4);
        // Everything but piece 3 already held locally.
        local.set(0, true);
        local.set(1, true);
        local.set(2, true);

        let a = addr(1);
        let b = addr(2);

        let picked_a = p.pick(a, &local, any, any, &[], 100);
        assert_eq!(picked_a.len(), 2);
        p.update_endgame(&local);
        assert!(p.endgame());

        // Peer B duplicates A's outstanding blocks.
        let picked_b = p.pick(b, &local, any, any, &[], 100);
        assert_eq!(picked_b.len(), 2);
        assert_eq!(picked_a[0].piece, picked_b[0].piece);

        // First arrival (from B) wins and cancels A's duplicate.
        let (outcome, cancels) = p.on_block_received(b, 3, 0);
        assert_eq!(outcome, BlockOutcome::Accepted);
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].0, a);

        // A's late duplicate is dropped silently.
        let (outcome, cancels) = p.on_block_received(a, 3, 0);
        assert_eq!(outcome, BlockOutcome::Dropped);
        assert!(cancels.is_empty());
    }

    #[test]
    fn test_endgame_not_armed_with_fresh_work() {
        let mut p = pipeline_4x2();
        let local = Bitfield::new(4);
        p.pick(addr(1), &local, any, any, &[], 2);
        p.update_endgame(&local);
        assert!(!p.endgame());
    }

    #[test]
    fn test_disconnect_frees_assignments() {
        let mut p = pipeline_4x2();
        let local = Bitfield::new(4);
        let peer = addr(1);

        let picked = p.pick(peer, &local, any, any, &[], 3);
        assert_eq!(picked.len(), 3);

        let freed = p.cancel_peer(&peer);
        assert_eq!(freed.len(), 3);
        assert_eq!(p.in_flight(&peer), 0);
        assert!(freed.iter().all(|r| r.length > 0));

        // The freed blocks are selectable by the next peer.
        let picked2 = p.pick(addr(2), &local, any, any, &[], 3);
        assert_eq!(picked2.len(), 3);
        assert_eq!(
            picked.iter().collect::<std::collections::HashSet<_>>(),
            picked2.iter().collect::<std::collections::HashSet<_>>()
        );
    }

    #[test]
    fn test_reject_frees_one_block() {
        let mut p = pipeline_4x2();
        let local = Bitfield::new(4);
        let peer = addr(1);

        let picked = p.pick(peer, &local, any, any, &[], 2);
        p.on_reject(&peer, picked[0].piece, picked[0].offset);
        assert_eq!(p.in_flight(&peer), 1);

        // Exactly the rejected block is selectable again.
        let retry = p.pick(addr(2), &local, any, any, &[], 1);
        assert_eq!(retry[0], picked[0]);
    }

    #[test]
    fn test_verification_failure_resets_piece() {
        let mut p = pipeline_4x2();
        let local = Bitfield::new(4);
        let peer = addr(1);

        p.pick(peer, &local, any, any, &[], 2);
        p.on_block_received(peer, 0, 0);
        p.on_block_received(peer, 0, BLOCK_SIZE);

        p.on_piece_verified(0, false);

        // The whole piece is requestable from scratch.
        let retry = p.pick(addr(2), &local, any, any, &[], 100);
        let piece0: Vec<_> = retry.iter().filter(|r| r.piece == 0).collect();
        assert_eq!(piece0.len(), 2);
    }

    #[test]
    fn test_verification_success_removes_piece() {
        let mut p = pipeline_4x2();
        let mut local = Bitfield::new(4);
        let peer = addr(1);

        p.pick(peer, &local, any, any, &[], 2);
        p.on_block_received(peer, 0, 0);
        p.on_block_received(peer, 0, BLOCK_SIZE);
        p.on_piece_verified(0, true);
        local.set(0, true);

        let retry = p.pick(addr(2), &local, any, any, &[], 100);
        assert!(retry.iter().all(|r| r.piece != 0));
    }

    #[test]
    fn test_validate_request_bounds() {
        let p = RequestPipeline::new(3, 2 * BLOCK_SIZE, 2 * 2 * BLOCK_SIZE as u64 + 100);

        assert!(p.validate_request(0, 0, BLOCK_SIZE).is_ok());
        assert!(p.validate_request(0, BLOCK_SIZE, 1).is_ok());
        // Short final block of the short final piece.
        assert!(p.validate_request(2, 0, 100).is_ok());

        // Piece index out of range.
        assert!(p.validate_request(3, 0, 1).is_err());
        // Offset past the piece.
        assert!(p.validate_request(2, 100, 1).is_err());
        // Zero and oversized lengths.
        assert!(p.validate_request(0, 0, 0).is_err());
        assert!(p.validate_request(0, 0, MAX_BLOCK_LENGTH + 1).is_err());
        // Runs past the end of the piece.
        assert!(p.validate_request(2, 50, 100).is_err());
    }

    #[test]
    fn test_is_interesting() {
        let local = Bitfield::from_bytes(4, &[0b0000_0000]).unwrap();
        let remote = Bitfield::from_bytes(4, &[0b1010_0000]).unwrap();
        assert!(RequestPipeline::is_interesting(&local, &remote));

        let full = Bitfield::full(4);
        assert!(!RequestPipeline::is_interesting(&full, &remote));
    }
}
