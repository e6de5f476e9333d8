use crate::hex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

/// Longest candidate the harness knows how to embed.
pub const MAX_VECTOR_LEN: usize = 3;

/// Single byte `nop`, used to left-pad short candidates.
pub const FILLER: u8 = 0x90;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VectorError {
    Empty,
    TooLong(usize),
    InvalidHex(String),
}

impl Display for VectorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorError::Empty => write!(f, "Test vector is empty"),
            VectorError::TooLong(len) => write!(
                f,
                "Test vector has {} bytes, at most {} are supported",
                len, MAX_VECTOR_LEN
            ),
            VectorError::InvalidHex(s) => write!(f, "Invalid hex test vector: {:?}", s),
        }
    }
}

impl Error for VectorError {}

/// A candidate instruction of 1 to 3 raw bytes.
///
/// Bytes past `len` are always zero so the derived equality and hashing only see the
/// candidate itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TestVector {
    bytes: [u8; MAX_VECTOR_LEN],
    len: u8,
}

impl TestVector {
    pub fn new(bytes: &[u8]) -> Result<Self, VectorError> {
        if bytes.is_empty() {
            return Err(VectorError::Empty);
        }
        if bytes.len() > MAX_VECTOR_LEN {
            return Err(VectorError::TooLong(bytes.len()));
        }

        let mut buffer = [0u8; MAX_VECTOR_LEN];
        buffer[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            bytes: buffer,
            len: bytes.len() as u8,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The candidate left-padded with [`FILLER`] so it always ends at the same offset.
    pub fn padded(&self) -> [u8; MAX_VECTOR_LEN] {
        let mut out = [FILLER; MAX_VECTOR_LEN];
        out[MAX_VECTOR_LEN - self.len()..].copy_from_slice(self.as_bytes());
        out
    }

    /// Reverse of [`TestVector::padded`]; `len` is the length of the original candidate.
    pub fn from_padded(padded: &[u8; MAX_VECTOR_LEN], len: usize) -> Result<Self, VectorError> {
        if len > MAX_VECTOR_LEN {
            return Err(VectorError::TooLong(len));
        }
        Self::new(&padded[MAX_VECTOR_LEN - len..])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl Ord for TestVector {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl PartialOrd for TestVector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Debug for TestVector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TestVector({})", self.to_hex())
    }
}

impl Display for TestVector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for TestVector {
    type Err = VectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).ok_or_else(|| VectorError::InvalidHex(s.to_string()))?;
        TestVector::new(&bytes)
    }
}

// Stored as a hex string so it can key a JSON map.
impl Serialize for TestVector {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TestVector {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Every candidate of length `1..=max_len`, in the order `i, ij, ijk, ...`.
pub fn candidate_space(max_len: usize) -> impl Iterator<Item = TestVector> {
    let max_len = max_len.min(MAX_VECTOR_LEN);
    let vector = |bytes: [u8; MAX_VECTOR_LEN], len: u8| TestVector { bytes, len };

    (0..=0xffu8).flat_map(move |i| {
        let rest = (0..=0xffu8)
            .filter(move |_| max_len > 1)
            .flat_map(move |j| {
                let triples = (0..=0xffu8)
                    .filter(move |_| max_len > 2)
                    .map(move |k| vector([i, j, k], 3));
                std::iter::once(vector([i, j, 0], 2)).chain(triples)
            });
        std::iter::once(vector([i, 0, 0], 1)).chain(rest)
    })
}

/// Size of [`candidate_space`] without walking it.
pub fn candidate_space_len(max_len: usize) -> usize {
    (1..=max_len.min(MAX_VECTOR_LEN) as u32)
        .map(|len| 256usize.pow(len))
        .sum()
}
