use uuid::Uuid;

/// Logical identity of one adaptor instance.
///
/// A `PeerId` is minted once per adaptor and survives transport-level
/// reconnects: the underlying connection may be torn down and rebuilt with a
/// fresh session id while the peer id stays stable, so correlation state and
/// reverse addresses keep working across connection resets.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PeerId([u8; 16]);

impl PeerId {
    pub const LEN: usize = 16;

    #[must_use]
    pub fn random() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    #[must_use]
    pub fn nil() -> Self {
        Self([0u8; 16])
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parses a peer id from a wire slice; anything but 16 bytes is invalid.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        slice.try_into().ok().map(Self)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Uuid::from_bytes(self.0).fmt(f)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id() {
        let a = PeerId::random();
        let b = PeerId::random();
        assert_ne!(a, b);
        assert!(!a.is_nil());
        assert!(PeerId::nil().is_nil());

        let c = PeerId::from_slice(a.as_bytes()).unwrap();
        assert_eq!(a, c);
        assert!(PeerId::from_slice(&[1, 2, 3]).is_none());
    }
}
