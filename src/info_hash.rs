use std::fmt;

/// The content identities of a torrent, version-independently.
///
/// A torrent carries a legacy flat (v1, SHA-1) info hash, a tree-hash
/// (v2, SHA-256) root, or both for hybrid torrents. At least one is always
/// present. Immutable once the torrent is loaded.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHashes {
    v1: Option<[u8; 20]>,
    v2: Option<[u8; 32]>,
}

impl InfoHashes {
    /// Creates the identity pair for a v1-only torrent.
    pub fn v1_only(hash: [u8; 20]) -> Self {
        Self {
            v1: Some(hash),
            v2: None,
        }
    }

    /// Creates the identity pair for a v2-only torrent.
    pub fn v2_only(root: [u8; 32]) -> Self {
        Self {
            v1: None,
            v2: Some(root),
        }
    }

    /// Creates the identity pair for a hybrid torrent.
    pub fn hybrid(hash: [u8; 20], root: [u8; 32]) -> Self {
        Self {
            v1: Some(hash),
            v2: Some(root),
        }
    }

    /// The legacy flat identity hash, if the torrent has one.
    pub fn v1(&self) -> Option<&[u8; 20]> {
        self.v1.as_ref()
    }

    /// The tree-hash root identity, if the torrent has one.
    pub fn v2(&self) -> Option<&[u8; 32]> {
        self.v2.as_ref()
    }

    /// The hash a handshake carries: v1 when present, else the truncated v2
    /// root, per the hybrid-torrent convention.
    pub fn wire_hash(&self) -> [u8; 20] {
        if let Some(v1) = self.v1 {
            return v1;
        }
        let root = self.v2.expect("InfoHashes holds at least one identity");
        let mut truncated = [0u8; 20];
        truncated.copy_from_slice(&root[..20]);
        truncated
    }

    pub fn to_hex(&self) -> String {
        match (&self.v1, &self.v2) {
            (Some(v1), _) => hex_encode(v1),
            (None, Some(v2)) => hex_encode(v2),
            (None, None) => unreachable!("InfoHashes holds at least one identity"),
        }
    }
}

impl fmt::Debug for InfoHashes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHashes({})", self.to_hex())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v1_only() {
        let ih = InfoHashes::v1_only([0xAB; 20]);
        assert!(ih.v1().is_some());
        assert!(ih.v2().is_none());
        assert_eq!(ih.wire_hash(), [0xAB; 20]);
    }

    #[test]
    fn test_v2_only_truncates_wire_hash() {
        let mut root = [0u8; 32];
        root[0] = 0x12;
        root[19] = 0x34;
        root[31] = 0xFF;
        let ih = InfoHashes::v2_only(root);
        assert!(ih.v1().is_none());
        let wire = ih.wire_hash();
        assert_eq!(wire[0], 0x12);
        assert_eq!(wire[19], 0x34);
    }

    #[test]
    fn test_hybrid() {
        let ih = InfoHashes::hybrid([1; 20], [2; 32]);
        assert!(ih.v1().is_some());
        assert!(ih.v2().is_some());
        assert_eq!(ih.wire_hash(), [1; 20]);
    }
}
