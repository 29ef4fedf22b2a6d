//! Chain coordinates.
//!
//! A chain coordinate is an opaque fixed-size tag naming a logical
//! subprotocol. Two peers can only exchange traffic on a coordinate both
//! have listened on; equality is bytewise.

use blake2::{Blake2b, Digest};

/// Size of a chain coordinate in bytes.
pub const COORD_SIZE: usize = 6;

/// Logical subprotocol tag multiplexed on a single socket.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChainCoord([u8; COORD_SIZE]);

impl ChainCoord {
    /// Create a coordinate from raw bytes.
    pub fn new(bytes: [u8; COORD_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; COORD_SIZE] {
        &self.0
    }
}

impl From<[u8; COORD_SIZE]> for ChainCoord {
    fn from(bytes: [u8; COORD_SIZE]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for ChainCoord {
    type Error = std::array::TryFromSliceError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(<[u8; COORD_SIZE]>::try_from(slice)?))
    }
}

impl std::fmt::Display for ChainCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for ChainCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChainCoord({})", hex::encode(self.0))
    }
}

/// Digest of a coordinate set, independent of insertion order.
///
/// Sent in the wire header so both sides can detect a listen-set mismatch
/// before exchanging Hello frames.
pub fn coord_set_hash(coords: &[ChainCoord]) -> [u8; 16] {
    let mut sorted: Vec<ChainCoord> = coords.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut hasher = Blake2b::<typenum::U16>::new();
    for coord in &sorted {
        hasher.update(coord.as_bytes());
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coord_equality_is_bytewise() {
        let a = ChainCoord::new([1, 2, 3, 4, 5, 6]);
        let b = ChainCoord::new([1, 2, 3, 4, 5, 6]);
        let c = ChainCoord::new([1, 2, 3, 4, 5, 7]);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_set_hash_order_independent() {
        let a = ChainCoord::new([1, 0, 0, 0, 0, 0]);
        let b = ChainCoord::new([2, 0, 0, 0, 0, 0]);

        assert_eq!(coord_set_hash(&[a, b]), coord_set_hash(&[b, a]));
        assert_ne!(coord_set_hash(&[a]), coord_set_hash(&[a, b]));
    }

    #[test]
    fn test_set_hash_ignores_duplicates() {
        let a = ChainCoord::new([1, 0, 0, 0, 0, 0]);
        assert_eq!(coord_set_hash(&[a, a]), coord_set_hash(&[a]));
    }
}
