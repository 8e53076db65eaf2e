//! riptide - a BitTorrent session core
//!
//! This library implements the per-torrent session state machine and
//! piece-exchange pipeline of a BitTorrent client: mode management, peer
//! message dispatch, block request pipelining, piece verification (flat
//! SHA-1 and BEP-52 tree hashes), and BitTyrant-style choke/unchoke
//! reciprocation.
//!
//! File I/O, peer discovery, and bulk socket transport are collaborators
//! behind message-passing interfaces; the core never performs I/O itself.
//!
//! # Modules
//!
//! - [`bitfield`] - Packed piece-availability vectors
//! - [`peer`] - BEP-3/6/52 wire codec and per-connection state
//! - [`torrent`] - Mode state machine, request pipeline, choking
//! - [`verify`] - Flat and tree-hash piece verification
//! - [`disk`] - Disk collaborator interface
//! - [`pool`] - Pooled message buffers
//! - [`rate`] - Transfer rate estimation

pub mod bitfield;
pub mod constants;
pub mod disk;
pub mod info_hash;
pub mod peer;
pub mod pool;
pub mod rate;
pub mod settings;
pub mod torrent;
pub mod verify;

pub use bitfield::{Bitfield, BitfieldError};
pub use disk::{DiskCommand, DiskError, DiskHandle, DiskRequest};
pub use info_hash::InfoHashes;
pub use peer::{
    allowed_fast_set, Handshake, Message, MessageId, PeerError, PeerId, PeerSession, PeerTransport,
};
pub use pool::BufferPool;
pub use rate::RateEstimator;
pub use settings::Settings;
pub use torrent::{
    BlockRequest, ErrorReason, Mode, PeerSource, RequestPipeline, TorrentError, TorrentEvent,
    TorrentInfo, TorrentSession,
};
pub use verify::{HashVerifier, PieceHash};
