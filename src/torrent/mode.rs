/// Why a torrent entered the error mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    /// Disk read (or hash-read) failure.
    ReadFailure,
    /// Disk write failure.
    WriteFailure,
}

/// The operating mode of a torrent.
///
/// Exactly one mode is active per torrent at any time; a transition is a
/// full replacement. The source's inheritance hierarchy of mode classes is
/// a closed variant here, with capability predicates and handler selection
/// as exhaustive matches instead of virtual overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Inert; nothing runs.
    Stopped,
    /// Deciding what the torrent needs next (verify, metadata, download).
    Starting,
    /// Re-verifying on-disk data against the torrent's hashes.
    Hashing { paused: bool },
    /// Fetching torrent metadata from peers; piece count unknown.
    Metadata,
    /// Fetching the piece-hash layers of a tree-hash torrent.
    FetchingHashes,
    /// Exchanging pieces; some wanted data is missing.
    Downloading,
    /// All wanted data present; uploading only.
    Seeding,
    /// Super-seed startup: revealing pieces one peer at a time.
    InitialSeeding,
    /// Unrecoverable disk failure; connections severed.
    Error(ErrorReason),
    /// Tearing down; announces and connections being closed.
    Stopping,
}

impl Mode {
    /// Short name for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Stopped => "stopped",
            Mode::Starting => "starting",
            Mode::Hashing { paused: false } => "hashing",
            Mode::Hashing { paused: true } => "hashing-paused",
            Mode::Metadata => "metadata",
            Mode::FetchingHashes => "fetching-hashes",
            Mode::Downloading => "downloading",
            Mode::Seeding => "seeding",
            Mode::InitialSeeding => "initial-seeding",
            Mode::Error(_) => "error",
            Mode::Stopping => "stopping",
        }
    }

    /// Whether new peer connections are admitted in this mode.
    pub fn can_accept_connections(&self) -> bool {
        matches!(
            self,
            Mode::Metadata
                | Mode::FetchingHashes
                | Mode::Downloading
                | Mode::Seeding
                | Mode::InitialSeeding
        )
    }

    /// Whether peer messages are dispatched in this mode.
    pub fn can_handle_messages(&self) -> bool {
        self.can_accept_connections()
    }

    /// Whether piece verification results are applied in this mode.
    pub fn can_hash_check(&self) -> bool {
        matches!(
            self,
            Mode::Hashing { .. }
                | Mode::FetchingHashes
                | Mode::Downloading
                | Mode::Seeding
                | Mode::InitialSeeding
        )
    }

    /// Whether the piece count is known to message handlers.
    ///
    /// Metadata mode ignores have/bitfield traffic because there is nothing
    /// to index it against yet.
    pub fn knows_piece_count(&self) -> bool {
        !matches!(self, Mode::Metadata)
    }

    /// Whether `next` is a legal replacement for this mode.
    pub fn can_transition_to(&self, next: Mode) -> bool {
        use Mode::*;
        match (self, next) {
            // Error is reachable from every non-terminal working state,
            // never from itself.
            (
                Starting | Hashing { .. } | Metadata | FetchingHashes | Downloading | Seeding
                | InitialSeeding,
                Error(_),
            ) => true,
            (Error(_), Stopping) => true,
            (Error(_), _) => false,

            (Stopped, Starting) => true,
            (Stopped, _) => false,

            (Stopping, Stopped) => true,
            (Stopping, _) => false,

            (Starting, Hashing { .. }) => true,
            (Starting, Metadata) => true,
            (Starting, FetchingHashes) => true,
            (Starting, Downloading) => true,
            (Starting, Seeding) => true,
            (Starting, InitialSeeding) => true,
            (Starting, Stopping) => true,

            // Hashing and Metadata conclude by re-entering Starting, which
            // picks the next phase with fresh knowledge.
            (Hashing { .. }, Starting) => true,
            (Hashing { .. }, Hashing { .. }) => true, // pause toggle
            (Hashing { .. }, Stopping) => true,
            (Metadata, Starting) => true,
            (Metadata, Stopping) => true,

            (FetchingHashes, Downloading) => true,
            (FetchingHashes, Stopping) => true,
            (InitialSeeding, Downloading) => true,
            (InitialSeeding, Stopping) => true,

            // Reversible as file priorities change.
            (Downloading, Seeding) => true,
            (Seeding, Downloading) => true,
            (Downloading, Stopping) => true,
            (Seeding, Stopping) => true,

            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Mode; 11] = [
        Mode::Stopped,
        Mode::Starting,
        Mode::Hashing { paused: false },
        Mode::Hashing { paused: true },
        Mode::Metadata,
        Mode::FetchingHashes,
        Mode::Downloading,
        Mode::Seeding,
        Mode::InitialSeeding,
        Mode::Error(ErrorReason::ReadFailure),
        Mode::Stopping,
    ];

    #[test]
    fn test_stopping_only_reaches_stopped() {
        for next in ALL {
            let legal = Mode::Stopping.can_transition_to(next);
            assert_eq!(legal, next == Mode::Stopped, "stopping -> {:?}", next);
        }
    }

    #[test]
    fn test_no_error_in_error() {
        let error = Mode::Error(ErrorReason::WriteFailure);
        assert!(!error.can_transition_to(Mode::Error(ErrorReason::ReadFailure)));
        assert!(!error.can_transition_to(Mode::Error(ErrorReason::WriteFailure)));
        assert!(error.can_transition_to(Mode::Stopping));
        assert!(!error.can_transition_to(Mode::Downloading));
    }

    #[test]
    fn test_error_reachable_from_working_states() {
        let err = Mode::Error(ErrorReason::ReadFailure);
        for mode in [
            Mode::Starting,
            Mode::Hashing { paused: false },
            Mode::Metadata,
            Mode::FetchingHashes,
            Mode::Downloading,
            Mode::Seeding,
            Mode::InitialSeeding,
        ] {
            assert!(mode.can_transition_to(err), "{:?} -> error", mode);
        }
        assert!(!Mode::Stopped.can_transition_to(err));
        assert!(!Mode::Stopping.can_transition_to(err));
    }

    #[test]
    fn test_download_seed_reversible() {
        assert!(Mode::Downloading.can_transition_to(Mode::Seeding));
        assert!(Mode::Seeding.can_transition_to(Mode::Downloading));
    }

    #[test]
    fn test_stopped_only_starts() {
        for next in ALL {
            let legal = Mode::Stopped.can_transition_to(next);
            assert_eq!(legal, next == Mode::Starting, "stopped -> {:?}", next);
        }
    }

    #[test]
    fn test_capabilities() {
        assert!(Mode::Downloading.can_handle_messages());
        assert!(Mode::Metadata.can_handle_messages());
        assert!(!Mode::Metadata.knows_piece_count());
        assert!(!Mode::Error(ErrorReason::ReadFailure).can_handle_messages());
        assert!(!Mode::Hashing { paused: false }.can_handle_messages());
        assert!(Mode::Hashing { paused: false }.can_hash_check());
        assert!(!Mode::Stopped.can_hash_check());
        assert!(!Mode::Stopping.can_accept_connections());
    }
}
