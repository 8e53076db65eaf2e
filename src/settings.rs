use std::time::Duration;

use crate::constants::{
    DEFAULT_ALLOWED_FAST_COUNT, DEFAULT_STALE_REQUEST_TIMEOUT, REQUEST_BUDGET_CAP,
};

/// Immutable engine capability and tuning configuration.
///
/// Constructed once at engine start and passed by reference to every
/// component that needs it. Feature support that the source expressed as
/// process-wide statics lives here instead.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Whether encrypted connections are offered to peers.
    pub supports_encryption: bool,
    /// Whether a complete torrent may start in initial-seeding mode.
    pub supports_initial_seeding: bool,
    /// Whether the fast extension (BEP-6) is advertised.
    pub supports_fast_peer: bool,

    /// Allowed-fast pieces granted to each peer.
    pub allowed_fast_count: u32,
    /// Hard cap on per-peer in-flight block requests.
    pub max_requests_per_peer: usize,
    /// Drop a peer with outstanding requests but no block for this long.
    pub stale_request_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            supports_encryption: true,
            supports_initial_seeding: true,
            supports_fast_peer: true,
            allowed_fast_count: DEFAULT_ALLOWED_FAST_COUNT,
            max_requests_per_peer: REQUEST_BUDGET_CAP,
            stale_request_timeout: DEFAULT_STALE_REQUEST_TIMEOUT,
        }
    }
}
