//! The per-torrent session core: mode state machine, message dispatch,
//! piece-exchange pipeline, and choke/unchoke reciprocation.
//!
//! One [`TorrentSession`] owns all state for a single torrent. Its entry
//! points are synchronous; a driver marshals network and disk completions
//! onto it and drains its outgoing queues.

mod choking;
mod dispatch;
mod error;
mod events;
mod mode;
mod picker;
mod session;

pub use choking::{active_set_size, ChokeDecision, ChokeManager};
pub use error::TorrentError;
pub use events::{PeerSource, TorrentEvent};
pub use mode::{ErrorReason, Mode};
pub use picker::{BlockOutcome, BlockRequest, RequestPipeline};
pub use session::{TorrentInfo, TorrentSession};
