use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::bitfield::Bitfield;
use crate::constants::{
    BLOCK_SIZE, HAVE_FLUSH_BATCH, KEEPALIVE_INTERVAL, MAX_CONSECUTIVE_HASH_FAILURES,
    PEER_IDLE_TIMEOUT, REQUEST_BUDGET_FLOOR,
};
use crate::disk::{DiskError, DiskRequest};
use crate::info_hash::InfoHashes;
use crate::peer::{allowed_fast_set, Handshake, Message, PeerError, PeerSession};
use crate::pool::BufferPool;
use crate::rate::RateEstimator;
use crate::settings::Settings;
use crate::torrent::choking::ChokeManager;
use crate::torrent::error::TorrentError;
use crate::torrent::events::{PeerSource, TorrentEvent};
use crate::torrent::mode::{ErrorReason, Mode};
use crate::torrent::picker::{BlockRequest, RequestPipeline};
use crate::verify::{ceil_log2, HashVerifier, PieceHash};

/// Immutable facts about a loaded torrent.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    pub info_hashes: InfoHashes,
    pub piece_count: u32,
    pub piece_length: u32,
    pub total_length: u64,
}

/// Progress of fetching a tree torrent's piece layer from the swarm.
struct HashFetch {
    roots: Vec<Option<[u8; 32]>>,
    /// Outstanding span requests: span start -> peer asked.
    pending: HashMap<u32, SocketAddr>,
    span: u32,
}

/// The per-torrent session: one active mode, the authoritative bitfield,
/// the request pipeline, the choke manager, and every peer session.
///
/// All entry points are synchronous and run on the single control-loop
/// context; a driver marshals network and disk completions onto them and
/// drains the outgoing queues. No state here is shared across torrents.
pub struct TorrentSession {
    pub(crate) info: TorrentInfo,
    pub(crate) settings: Settings,
    pub(crate) mode: Mode,
    /// Bumped on every mode replacement; stale async completions carry an
    /// older generation and are discarded instead of mutating fresh state.
    pub(crate) generation: u64,

    pub(crate) bitfield: Bitfield,
    pub(crate) pipeline: RequestPipeline,
    pub(crate) choker: ChokeManager,
    pub(crate) verifier: HashVerifier,
    pub(crate) peers: HashMap<SocketAddr, PeerSession>,

    pool: Arc<BufferPool>,
    /// Pieces currently being assembled from received blocks.
    piece_buffers: HashMap<u32, BytesMut>,
    /// Peers that contributed blocks to each assembling piece.
    piece_contributors: HashMap<u32, HashSet<SocketAddr>>,

    hash_fetch: Option<HashFetch>,
    /// Pieces hash-checked so far in the hashing phase.
    hashed_pieces: u32,
    hash_check_done: bool,
    files_checked: bool,
    initial_seed: bool,

    /// Queued Have announcements, flushed in batches.
    pending_haves: VecDeque<u32>,
    /// Pieces revealed so far during initial seeding.
    revealed: u32,

    pub(crate) upload_rate: RateEstimator,
    pub(crate) hash_failures_total: u64,

    events: VecDeque<TorrentEvent>,
    disk_out: VecDeque<DiskRequest>,
    closed: Vec<(SocketAddr, String)>,
}

impl TorrentSession {
    /// Creates a session for a fully loaded torrent, initially `Stopped`.
    ///
    /// `have` is the resume bitfield, if any; it is still re-verified by the
    /// hashing phase before use.
    pub fn new(
        info: TorrentInfo,
        verifier: HashVerifier,
        settings: Settings,
        have: Option<Bitfield>,
    ) -> Self {
        let piece_count = info.piece_count;
        let bitfield = match have {
            Some(bf) if bf.len() == piece_count as usize => bf,
            _ => Bitfield::new(piece_count as usize),
        };
        let pipeline = RequestPipeline::new(piece_count, info.piece_length, info.total_length);
        let pool = BufferPool::new(info.piece_length as usize);
        Self {
            info,
            settings,
            mode: Mode::Stopped,
            generation: 0,
            bitfield,
            pipeline,
            choker: ChokeManager::new(),
            verifier,
            peers: HashMap::new(),
            pool,
            piece_buffers: HashMap::new(),
            piece_contributors: HashMap::new(),
            hash_fetch: None,
            hashed_pieces: 0,
            hash_check_done: false,
            files_checked: false,
            initial_seed: false,
            pending_haves: VecDeque::new(),
            revealed: 0,
            upload_rate: RateEstimator::new(),
            hash_failures_total: 0,
            events: VecDeque::new(),
            disk_out: VecDeque::new(),
            closed: Vec::new(),
        }
    }

    /// Creates a session for a magnet link: identities known, metadata not.
    ///
    /// The session idles in metadata mode until [`Self::on_metadata_available`].
    pub fn new_magnet(info_hashes: InfoHashes, settings: Settings) -> Self {
        let info = TorrentInfo {
            info_hashes,
            piece_count: 0,
            piece_length: 0,
            total_length: 0,
        };
        Self::new(info, HashVerifier::flat(Vec::new()), settings, None)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn connected_peers(&self) -> usize {
        self.peers.len()
    }

    pub fn hash_failures(&self) -> u64 {
        self.hash_failures_total
    }

    /// The upload bytes/sec currently assigned to a peer by the
    /// reciprocation ledger; the external rate limiter enforces it.
    pub fn upload_allowance(&self, addr: &SocketAddr) -> Option<f64> {
        self.peers.get(addr).map(|p| p.account.allowance)
    }

    /// Requests super-seed startup for a complete torrent; only honored
    /// when the engine supports it.
    pub fn enable_initial_seeding(&mut self) {
        self.initial_seed = self.settings.supports_initial_seeding;
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// `Stopped -> Starting`; probes the disk for existing files.
    pub fn start(&mut self) -> Result<(), TorrentError> {
        self.transition(Mode::Starting)?;
        if self.info.piece_count == 0 {
            return self.transition(Mode::Metadata);
        }
        if self.files_checked {
            return self.leave_starting();
        }
        self.disk_out.push_back(DiskRequest::CheckFilesExist);
        Ok(())
    }

    /// Begins teardown: severs peers, closes files.
    pub fn stop(&mut self) -> Result<(), TorrentError> {
        self.transition(Mode::Stopping)?;
        self.disk_out.push_back(DiskRequest::CloseFiles);
        Ok(())
    }

    /// Completes teardown once the disk confirms files are closed.
    pub fn on_files_closed(&mut self, generation: u64) {
        if generation != self.generation || self.mode != Mode::Stopping {
            return;
        }
        let _ = self.transition(Mode::Stopped);
    }

    /// Pauses or resumes an in-progress hash check.
    pub fn set_hashing_paused(&mut self, paused: bool) -> Result<(), TorrentError> {
        match self.mode {
            Mode::Hashing { paused: current } if current != paused => {
                self.transition(Mode::Hashing { paused })
            }
            Mode::Hashing { .. } => Ok(()),
            _ => Err(TorrentError::illegal_transition(
                self.mode,
                Mode::Hashing { paused },
            )),
        }
    }

    /// Installs fetched metadata for a magnet session and restarts the
    /// phase decision.
    pub fn on_metadata_available(
        &mut self,
        info: TorrentInfo,
        verifier: HashVerifier,
    ) -> Result<(), TorrentError> {
        if self.mode != Mode::Metadata {
            return Err(TorrentError::illegal_transition(self.mode, Mode::Starting));
        }
        self.bitfield = Bitfield::new(info.piece_count as usize);
        self.pipeline =
            RequestPipeline::new(info.piece_count, info.piece_length, info.total_length);
        self.pool = BufferPool::new(info.piece_length as usize);
        self.verifier = verifier;
        self.info = info;
        self.transition(Mode::Starting)?;
        self.disk_out.push_back(DiskRequest::CheckFilesExist);
        Ok(())
    }

    /// Disk's answer to `CheckFilesExist`.
    pub fn on_files_checked(&mut self, exists: bool, generation: u64) {
        if generation != self.generation || self.mode != Mode::Starting {
            return;
        }
        self.files_checked = true;
        if !exists {
            // Nothing on disk to verify; resume data is void.
            self.hash_check_done = true;
            self.bitfield.set_all(false);
        }
        if let Err(err) = self.leave_starting() {
            warn!(%err, "failed to leave starting");
        }
    }

    /// Picks the phase after `Starting`, with current knowledge.
    fn leave_starting(&mut self) -> Result<(), TorrentError> {
        if !self.hash_check_done {
            self.hashed_pieces = 0;
            self.transition(Mode::Hashing { paused: false })?;
            for piece in 0..self.info.piece_count {
                self.disk_out.push_back(DiskRequest::HashPiece { piece });
            }
            return Ok(());
        }
        if self.verifier.is_tree() && !self.verifier.has_piece_roots() {
            self.begin_hash_fetch();
            return self.transition(Mode::FetchingHashes);
        }
        if self.bitfield.all_true() {
            if self.initial_seed {
                self.revealed = 0;
                return self.transition(Mode::InitialSeeding);
            }
            return self.transition(Mode::Seeding);
        }
        self.transition(Mode::Downloading)
    }

    /// Result of hashing one on-disk piece during the hash-check phase.
    pub fn on_piece_hashed(
        &mut self,
        piece: u32,
        result: Result<PieceHash, DiskError>,
        generation: u64,
    ) {
        if generation != self.generation || !self.mode.can_hash_check() {
            return;
        }
        match result {
            Ok(hash) => {
                let passed = self.verifier.matches_reference(piece, &hash);
                self.bitfield.set(piece as usize, passed);
                self.hashed_pieces += 1;
                if self.hashed_pieces == self.info.piece_count {
                    self.hash_check_done = true;
                    if let Err(err) = self.leave_starting_via_hashing() {
                        warn!(%err, "failed to leave hashing");
                    }
                }
            }
            Err(err) => self.enter_error(&err),
        }
    }

    fn leave_starting_via_hashing(&mut self) -> Result<(), TorrentError> {
        self.transition(Mode::Starting)?;
        self.leave_starting()
    }

    /// Disk write completion for a persisted block.
    pub fn on_block_written(&mut self, result: Result<(), DiskError>, generation: u64) {
        if generation != self.generation {
            return;
        }
        if let Err(err) = result {
            self.enter_error(&err);
        }
    }

    /// Disk read completion for a block being served to `peer`.
    pub fn on_block_read(
        &mut self,
        peer: SocketAddr,
        request: BlockRequest,
        result: Result<Bytes, DiskError>,
        generation: u64,
        now: Instant,
    ) {
        if generation != self.generation {
            return;
        }
        let data = match result {
            Ok(data) => data,
            Err(err) => {
                self.enter_error(&err);
                return;
            }
        };
        let Some(session) = self.peers.get_mut(&peer) else {
            return;
        };
        // The peer may have cancelled while the disk was busy.
        if !session.pending_serves.remove(&(request.piece, request.offset)) {
            return;
        }
        self.upload_rate.record(now, data.len() as u64);
        session.upload_rate.record(now, data.len() as u64);
        session.queue(
            Message::Piece {
                index: request.piece,
                begin: request.offset,
                data,
            },
            now,
        );
    }

    /// Marks a discovery source's report and surfaces it to outer layers.
    pub fn on_peers_found(&mut self, source: PeerSource, new_count: usize) {
        self.events.push_back(TorrentEvent::PeersFound {
            source,
            new_count,
            total_count: self.peers.len() + new_count,
        });
    }

    /// Whether the download is starved enough that the driver should
    /// bootstrap web-seed peers.
    pub fn needs_web_seeds(&self) -> bool {
        self.mode == Mode::Downloading && self.peers.is_empty()
    }

    // ------------------------------------------------------------------
    // Peer lifecycle
    // ------------------------------------------------------------------

    /// Admits a handshaken connection and queues the opening messages.
    pub fn connect_peer(
        &mut self,
        addr: SocketAddr,
        handshake: &Handshake,
        incoming: bool,
        now: Instant,
    ) -> Result<(), PeerError> {
        if !self.mode.can_accept_connections() {
            return Err(PeerError::NotAcceptedInMode {
                message: "handshake",
                mode: self.mode.name(),
            });
        }
        if handshake.info_hash != self.info.info_hashes.wire_hash() {
            return Err(PeerError::InfoHashMismatch);
        }

        let mut session = PeerSession::new(addr, incoming, now);
        session.peer_id = crate::peer::PeerId::from_bytes(&handshake.peer_id);
        session.supports_fast =
            handshake.supports_fast_extension() && self.settings.supports_fast_peer;

        if self.info.piece_count > 0 {
            // Announce what we have, using the fast shorthands when legal.
            // Initial seeding conceals the full bitfield and reveals pieces
            // one Have at a time instead.
            let concealed = self.mode == Mode::InitialSeeding;
            if concealed || (session.supports_fast && self.bitfield.all_false()) {
                if session.supports_fast {
                    session.queue(Message::HaveNone, now);
                } else {
                    session.queue(
                        Message::Bitfield(Bitfield::new(self.info.piece_count as usize).to_bytes()),
                        now,
                    );
                }
            } else if session.supports_fast && self.bitfield.all_true() {
                session.queue(Message::HaveAll, now);
            } else {
                session.queue(Message::Bitfield(self.bitfield.to_bytes()), now);
            }

            if session.supports_fast {
                let grants = allowed_fast_set(
                    &self.info.info_hashes,
                    addr.ip(),
                    self.info.piece_count,
                    self.settings.allowed_fast_count,
                );
                for piece in grants {
                    session.fast.add_allowed_outgoing(piece);
                    session.queue(Message::AllowedFast { piece }, now);
                }
            }
        }

        self.peers.insert(addr, session);
        Ok(())
    }

    /// Removes a peer; its pending requests become selectable again.
    pub fn disconnect_peer(&mut self, addr: &SocketAddr) {
        if let Some(session) = self.peers.remove(addr) {
            if !session.flags.am_choking {
                // An upload slot freed up.
                self.choker.trigger();
            }
        }
        let freed = self.pipeline.cancel_peer(addr);
        if !freed.is_empty() {
            debug!(peer = %addr, blocks = freed.len(), "freed blocks on disconnect");
        }
        for contributors in self.piece_contributors.values_mut() {
            contributors.remove(addr);
        }
    }

    /// Internally decided closes (staleness, hash failures) the driver
    /// must dispose of.
    pub fn drain_closed_peers(&mut self) -> Vec<(SocketAddr, String)> {
        std::mem::take(&mut self.closed)
    }

    pub(crate) fn queue_disk(&mut self, request: DiskRequest) {
        self.disk_out.push_back(request);
    }

    pub(crate) fn close_peer(&mut self, addr: SocketAddr, reason: String) {
        self.disconnect_peer(&addr);
        self.closed.push((addr, reason));
    }

    // ------------------------------------------------------------------
    // Outbound queues
    // ------------------------------------------------------------------

    /// Routes one decoded message from a connected peer through the active
    /// mode. An `Err` is a protocol violation: the caller must dispose of
    /// the connection and then call [`Self::disconnect_peer`].
    pub fn handle_message(
        &mut self,
        addr: SocketAddr,
        msg: Message,
        now: Instant,
    ) -> Result<(), PeerError> {
        crate::torrent::dispatch::handle_message(self, addr, msg, now)
    }

    /// Drains the messages queued for one peer.
    pub fn drain_peer_outbox(&mut self, addr: &SocketAddr) -> Vec<Message> {
        self.peers
            .get_mut(addr)
            .map(PeerSession::drain_outbox)
            .unwrap_or_default()
    }

    /// Drains pending disk work, tagged with the generation it belongs to.
    pub fn drain_disk_requests(&mut self) -> (u64, Vec<DiskRequest>) {
        (self.generation, self.disk_out.drain(..).collect())
    }

    /// Drains events for outer layers.
    pub fn drain_events(&mut self) -> Vec<TorrentEvent> {
        self.events.drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// One pass of the control loop for this torrent.
    pub fn tick(&mut self, now: Instant) {
        if !self.mode.can_handle_messages() {
            return;
        }

        self.close_stale_peers(now);
        self.refresh_interest(now);
        self.flush_haves(now);
        self.send_keepalives(now);

        match self.mode {
            Mode::Downloading => {
                self.pipeline.update_endgame(&self.bitfield);
                self.fill_all_requests(now);
                self.run_choke_review(now);
                if self.bitfield.all_true() {
                    self.events.push_back(TorrentEvent::Completed);
                    let _ = self.transition(Mode::Seeding);
                }
            }
            Mode::Seeding => {
                self.run_choke_review(now);
                // File priorities may have regained undownloaded interest.
                if !self.bitfield.all_true() {
                    let _ = self.transition(Mode::Downloading);
                }
            }
            Mode::InitialSeeding => {
                self.reveal_next_pieces(now);
                self.run_choke_review(now);
                if self.revealed >= self.info.piece_count {
                    let _ = self.transition(Mode::Downloading);
                }
            }
            Mode::FetchingHashes => {
                self.request_hash_spans(now);
            }
            Mode::Metadata => {}
            _ => {}
        }
    }

    fn close_stale_peers(&mut self, now: Instant) {
        let stale_request = self.settings.stale_request_timeout;
        let stale: Vec<(SocketAddr, String)> = self
            .peers
            .iter()
            .filter_map(|(&addr, peer)| {
                if now.duration_since(peer.last_received) >= PEER_IDLE_TIMEOUT {
                    Some((addr, "idle timeout".to_string()))
                } else if self.pipeline.in_flight(&addr) > 0
                    && now.duration_since(peer.last_block) >= stale_request
                {
                    Some((addr, "stale requests".to_string()))
                } else {
                    None
                }
            })
            .collect();
        for (addr, reason) in stale {
            info!(peer = %addr, %reason, "closing stale connection");
            self.close_peer(addr, reason);
        }
    }

    fn refresh_interest(&mut self, now: Instant) {
        let piece_count = self.info.piece_count;
        if piece_count == 0 {
            return;
        }
        let bitfield = &self.bitfield;
        for peer in self.peers.values_mut() {
            let interesting = peer
                .remote_bitfield
                .as_ref()
                .is_some_and(|remote| RequestPipeline::is_interesting(bitfield, remote));
            if interesting != peer.flags.am_interested {
                peer.flags.am_interested = interesting;
                peer.queue(
                    if interesting {
                        Message::Interested
                    } else {
                        Message::NotInterested
                    },
                    now,
                );
            }
        }
    }

    fn flush_haves(&mut self, now: Instant) {
        for _ in 0..HAVE_FLUSH_BATCH {
            let Some(piece) = self.pending_haves.pop_front() else {
                break;
            };
            for peer in self.peers.values_mut() {
                // A peer that already announced the piece has no use for
                // our Have.
                if !peer.peer_has(piece) {
                    peer.queue(Message::Have { piece }, now);
                }
            }
        }
    }

    fn send_keepalives(&mut self, now: Instant) {
        for peer in self.peers.values_mut() {
            if now.duration_since(peer.last_sent) >= KEEPALIVE_INTERVAL {
                peer.queue(Message::KeepAlive, now);
            }
        }
    }

    fn run_choke_review(&mut self, now: Instant) {
        let upload = self.upload_rate.rate(now);
        let decisions =
            self.choker
                .review(now, &mut self.peers, upload, self.info.piece_length as u64);
        for decision in decisions {
            let Some(peer) = self.peers.get_mut(&decision.peer) else {
                continue;
            };
            peer.flags.am_choking = decision.choke;
            if decision.choke {
                peer.account.last_choked = Some(now);
                peer.queue(Message::Choke, now);
            } else {
                peer.account.last_unchoked = Some(now);
                peer.queue(Message::Unchoke, now);
            }
        }
    }

    /// Initial seeding: reveal one piece per tick per idle peer via Have,
    /// spreading distinct pieces across the swarm.
    fn reveal_next_pieces(&mut self, now: Instant) {
        let piece_count = self.info.piece_count;
        for peer in self.peers.values_mut() {
            if self.revealed >= piece_count {
                break;
            }
            let piece = self.revealed;
            self.revealed += 1;
            if !peer.peer_has(piece) {
                peer.queue(Message::Have { piece }, now);
            }
        }
    }

    // ------------------------------------------------------------------
    // Requesting
    // ------------------------------------------------------------------

    /// Refills the request pipeline for every eligible peer.
    fn fill_all_requests(&mut self, now: Instant) {
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.fill_requests(addr, now);
        }
    }

    /// Tops up `peer`'s outstanding requests to its budget.
    ///
    /// The budget grows with the observed download rate and never falls
    /// below the floor of two.
    pub(crate) fn fill_requests(&mut self, addr: SocketAddr, now: Instant) {
        if self.mode != Mode::Downloading {
            return;
        }
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        let Some(remote) = peer.remote_bitfield.clone() else {
            return;
        };

        let rate = peer.download_rate.rate(now);
        let budget = ((rate / BLOCK_SIZE as f64) as usize)
            .max(REQUEST_BUDGET_FLOOR)
            .min(self.settings.max_requests_per_peer);

        let choked = peer.flags.peer_choking;
        let fast = peer.fast.allowed_incoming.clone();
        let suggested = peer.fast.suggested.clone();

        let picked = self.pipeline.pick(
            addr,
            &self.bitfield,
            |piece| remote.get(piece as usize),
            |piece| !choked || fast.contains(&piece),
            &suggested,
            budget,
        );

        if picked.is_empty() {
            return;
        }
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        for request in picked {
            peer.queue(
                Message::Request {
                    index: request.piece,
                    begin: request.offset,
                    length: request.length,
                },
                now,
            );
        }
    }

    // ------------------------------------------------------------------
    // Piece assembly and verification
    // ------------------------------------------------------------------

    /// Copies a received block into the piece's assembly buffer.
    pub(crate) fn store_block(&mut self, peer: SocketAddr, piece: u32, offset: u32, data: &[u8]) {
        let size = self.pipeline.piece_size(piece) as usize;
        let buffer = self.piece_buffers.entry(piece).or_insert_with(|| {
            let mut buf = self.pool.checkout_piece();
            buf.resize(size, 0);
            buf
        });
        let start = offset as usize;
        let end = (start + data.len()).min(buffer.len());
        buffer[start..end].copy_from_slice(&data[..end - start]);
        self.piece_contributors.entry(piece).or_default().insert(peer);
    }

    /// Verifies a fully assembled piece and applies the outcome.
    pub(crate) fn complete_piece(&mut self, piece: u32) {
        let Some(buffer) = self.piece_buffers.remove(&piece) else {
            return;
        };
        let passed = self.verifier.verify(piece, &buffer, &[]);
        self.events.push_back(TorrentEvent::PieceVerified { piece, passed });
        self.pipeline.on_piece_verified(piece, passed);
        let contributors = self.piece_contributors.remove(&piece).unwrap_or_default();

        if passed {
            self.bitfield.set(piece as usize, true);
            self.pending_haves.push_back(piece);

            // Persist the verified piece block by block.
            let mut offset = 0u32;
            let size = self.pipeline.piece_size(piece);
            while offset < size {
                let len = (size - offset).min(BLOCK_SIZE) as usize;
                let data = Bytes::copy_from_slice(&buffer[offset as usize..offset as usize + len]);
                self.disk_out.push_back(DiskRequest::WriteBlock {
                    piece,
                    offset,
                    data,
                });
                offset += len as u32;
            }

            for addr in contributors {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.hash_failures = 0;
                }
            }
        } else {
            warn!(piece, "piece failed verification");
            self.hash_failures_total += 1;

            // Only a sole contributor can be blamed with certainty.
            if let [addr] = contributors.into_iter().collect::<Vec<_>>()[..] {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.hash_failures += 1;
                    if peer.hash_failures >= MAX_CONSECUTIVE_HASH_FAILURES {
                        self.close_peer(
                            addr,
                            format!("{} consecutive hash failures", MAX_CONSECUTIVE_HASH_FAILURES),
                        );
                    }
                }
            }
        }
        self.pool.return_piece(buffer);
    }

    // ------------------------------------------------------------------
    // Tree-hash fetching
    // ------------------------------------------------------------------

    fn begin_hash_fetch(&mut self) {
        let piece_count = self.info.piece_count;
        let span = piece_count
            .next_power_of_two()
            .clamp(crate::constants::MIN_HASH_REQUEST_LENGTH, crate::constants::MAX_HASH_REQUEST_LENGTH);
        self.hash_fetch = Some(HashFetch {
            roots: vec![None; piece_count as usize],
            pending: HashMap::new(),
            span,
        });
    }

    /// The absolute tree layer the piece hashes live at (0 = 16 KiB leaves).
    pub(crate) fn piece_layer(&self) -> u32 {
        ceil_log2((self.info.piece_length / BLOCK_SIZE).max(1))
    }

    fn request_hash_spans(&mut self, now: Instant) {
        let Some(root) = self.verifier.tree_root() else {
            return;
        };
        let base_layer = self.piece_layer();
        let piece_count = self.info.piece_count;
        let Some(fetch) = self.hash_fetch.as_mut() else {
            return;
        };
        let span = fetch.span;
        let proof_layers = ceil_log2(piece_count).saturating_sub(ceil_log2(span));

        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        if addrs.is_empty() {
            return;
        }

        let mut peer_index = 0usize;
        let mut start = 0u32;
        while start < piece_count {
            let covered = (start..(start + span).min(piece_count))
                .all(|i| fetch.roots[i as usize].is_some());
            if !covered && !fetch.pending.contains_key(&start) {
                let addr = addrs[peer_index % addrs.len()];
                peer_index += 1;
                fetch.pending.insert(start, addr);
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.queue(
                        Message::HashRequest {
                            pieces_root: root,
                            base_layer,
                            index: start,
                            length: span,
                            proof_layers,
                        },
                        now,
                    );
                }
            }
            start += span;
        }
    }

    /// Applies a verified span of piece-layer hashes.
    pub(crate) fn store_hash_span(&mut self, index: u32, hashes: &[[u8; 32]]) {
        let piece_count = self.info.piece_count;
        let Some(fetch) = self.hash_fetch.as_mut() else {
            return;
        };
        fetch.pending.remove(&index);
        for (i, hash) in hashes.iter().enumerate() {
            let piece = index + i as u32;
            if piece < piece_count {
                fetch.roots[piece as usize] = Some(*hash);
            }
        }

        if fetch.roots.iter().all(Option::is_some) {
            let roots: Vec<[u8; 32]> = fetch.roots.iter().copied().flatten().collect();
            self.hash_fetch = None;
            if self.verifier.set_piece_roots(roots) {
                info!("piece layer fetched and verified");
                let _ = self.transition(Mode::Downloading);
            } else {
                // The layer refused to reduce to the root: refetch.
                warn!("fetched piece layer did not match root, restarting");
                self.begin_hash_fetch();
            }
        }
    }

    /// Releases a rejected or failed span so it is requested again.
    pub(crate) fn release_hash_span(&mut self, index: u32) {
        if let Some(fetch) = self.hash_fetch.as_mut() {
            fetch.pending.remove(&index);
        }
    }

    // ------------------------------------------------------------------
    // Mode transitions
    // ------------------------------------------------------------------

    /// Replaces the active mode, releasing the old mode's resources.
    pub(crate) fn transition(&mut self, to: Mode) -> Result<(), TorrentError> {
        if !self.mode.can_transition_to(to) {
            return Err(TorrentError::illegal_transition(self.mode, to));
        }
        let from = self.mode;
        self.mode = to;
        // A pause toggle keeps its in-flight hash work; everything else
        // invalidates pending completions.
        if !matches!((from, to), (Mode::Hashing { .. }, Mode::Hashing { .. })) {
            self.generation += 1;
        }
        info!(from = from.name(), to = to.name(), "mode transition");

        match to {
            Mode::Stopping | Mode::Error(_) => {
                // Sever every connection; outstanding async work unwinds
                // against the bumped generation.
                let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
                for addr in addrs {
                    self.disconnect_peer(&addr);
                }
                self.piece_buffers.clear();
                self.piece_contributors.clear();
            }
            _ => {}
        }

        self.events
            .push_back(TorrentEvent::StateChanged { from, to });
        Ok(())
    }

    /// Moves the torrent to the error mode over a disk failure.
    pub(crate) fn enter_error(&mut self, err: &DiskError) {
        let reason = if err.is_write() {
            ErrorReason::WriteFailure
        } else {
            ErrorReason::ReadFailure
        };
        warn!(%err, "disk failure, torrent entering error mode");
        // Already in error: the first failure wins.
        if !matches!(self.mode, Mode::Error(_)) {
            let _ = self.transition(Mode::Error(reason));
        }
    }

    /// Resets a torrent out of the error mode, back through teardown.
    pub fn reset(&mut self) -> Result<(), TorrentError> {
        if !matches!(self.mode, Mode::Error(_)) {
            return Err(TorrentError::illegal_transition(self.mode, Mode::Stopping));
        }
        self.hash_check_done = false;
        self.files_checked = false;
        self.stop()
    }
}
