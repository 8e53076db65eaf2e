//! Protocol constants and tuning parameters.
//!
//! Timing and budget values follow the defaults of mainline-compatible
//! clients; the reciprocation constants are the tuned values of the BitTyrant
//! strategy and should not be changed independently of each other.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &str = "-RP0001-";

// ============================================================================
// Block and piece sizes
// ============================================================================

/// Standard block size (16 KiB); the final block of a piece may be shorter
pub const BLOCK_SIZE: u32 = 16384;

/// Largest block length a peer may request
pub const MAX_BLOCK_LENGTH: u32 = 16384;

// ============================================================================
// Request pipelining
// ============================================================================

/// Smallest per-peer in-flight request budget
pub const REQUEST_BUDGET_FLOOR: usize = 2;

/// Largest per-peer in-flight request budget
pub const REQUEST_BUDGET_CAP: usize = 250;

/// Default number of allowed fast pieces (BEP-6)
pub const DEFAULT_ALLOWED_FAST_COUNT: u32 = 10;

// ============================================================================
// Tree-hash requests (BEP-52)
// ============================================================================

/// Smallest valid hash-request span
pub const MIN_HASH_REQUEST_LENGTH: u32 = 2;

/// Largest valid hash-request span
pub const MAX_HASH_REQUEST_LENGTH: u32 = 512;

// ============================================================================
// Timeouts
// ============================================================================

/// Drop a connection with no message at all for this long
pub const PEER_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// Send a keepalive after this much send silence
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

/// Drop a connection with outstanding requests but no block for this long
pub const DEFAULT_STALE_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Choking (BitTyrant reciprocation)
// ============================================================================

/// Minimum interval between choke reviews
pub const CHOKE_REVIEW_INTERVAL: Duration = Duration::from_secs(10);

/// A peer must have been unchoked this long before its allowance is adjusted
pub const RECIPROCATION_WINDOW: Duration = Duration::from_secs(30);

/// Minimum spacing between allowance reductions for one peer
pub const RATE_REDUCTION_INTERVAL: Duration = Duration::from_secs(30);

/// Allowance multiplier when reciprocation is overdue but the peer is
/// interested in us
pub const ALLOWANCE_RAISE: f64 = 1.20;

/// Allowance multiplier when an unchoked peer keeps choking us
pub const ALLOWANCE_CUT: f64 = 0.90;

/// Initial per-peer upload allowance in bytes/sec (the BitTyrant market rate)
pub const INITIAL_ALLOWANCE: f64 = 7000.0;

// ============================================================================
// Hash verification
// ============================================================================

/// Disconnect a peer after this many consecutive attributable hash failures
pub const MAX_CONSECUTIVE_HASH_FAILURES: u32 = 5;

// ============================================================================
// Announcements
// ============================================================================

/// Largest number of queued Have announcements flushed per tick
pub const HAVE_FLUSH_BATCH: usize = 32;

// ============================================================================
// Rate estimation
// ============================================================================

/// Window for transfer rate and have-frequency estimation
pub const RATE_WINDOW: Duration = Duration::from_secs(5);

// ============================================================================
// Transport
// ============================================================================

/// Maximum wire frame size (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
