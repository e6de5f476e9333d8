//! Layout of the binary report a harness writes to stdout.
//!
//! The report is a flat run of little-endian 32-bit words with no framing:
//!
//! ```text
//! flags after running with flags = 0x00000000
//! flags after running with flags = 0xfffffeff
//! for each capture group:
//!     registers before the first run      (8 words, pushad order)
//!     registers after the first run       (8 words)
//!     registers after the second run      (8 words)
//! ```
//!
//! The order is fixed; checkpoints produced by earlier runs rely on it.

use crate::catalog::Register;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const WORD_SIZE: usize = 4;
pub const FLAG_WORDS: usize = 2;
pub const SNAPSHOT_WORDS: usize = 8;
pub const SNAPSHOT_SIZE: usize = SNAPSHOT_WORDS * WORD_SIZE;
pub const SNAPSHOTS_PER_GROUP: usize = 3;

/// Completed output of this size or less means the candidate never reached the captures.
pub const CRASH_FLOOR: usize = 32;

/// Number of capture groups of the standard layout.
pub const DEFAULT_CAPTURE_GROUPS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLayout {
    capture_groups: usize,
}

impl Default for OutputLayout {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTURE_GROUPS)
    }
}

impl OutputLayout {
    pub const fn new(capture_groups: usize) -> Self {
        Self { capture_groups }
    }

    /// Byte length of a complete report: 296 for the standard three groups.
    pub fn expected_len(&self) -> usize {
        FLAG_WORDS * WORD_SIZE + self.capture_groups * SNAPSHOTS_PER_GROUP * SNAPSHOT_SIZE
    }

    pub fn decode(&self, data: &[u8]) -> Result<HarnessOutput, DecodeError> {
        if data.len() != self.expected_len() {
            return Err(DecodeError::Length {
                expected: self.expected_len(),
                actual: data.len(),
            });
        }

        let set_flags = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let unset_flags = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);

        let groups = data[FLAG_WORDS * WORD_SIZE..]
            .chunks_exact(SNAPSHOTS_PER_GROUP * SNAPSHOT_SIZE)
            .map(|group| {
                let mut snapshots = group
                    .chunks_exact(SNAPSHOT_SIZE)
                    .map(RegisterSnapshot::from_bytes);
                CaptureGroup {
                    base: snapshots.next().unwrap_or_default(),
                    first_run: snapshots.next().unwrap_or_default(),
                    second_run: snapshots.next().unwrap_or_default(),
                }
            })
            .collect();

        Ok(HarnessOutput {
            set_flags,
            unset_flags,
            groups,
        })
    }
}

/// The eight general purpose registers at one instant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterSnapshot {
    pub values: [u32; SNAPSHOT_WORDS],
}

impl RegisterSnapshot {
    /// `bytes` must hold at least [`SNAPSHOT_SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut values = [0u32; SNAPSHOT_WORDS];
        for (value, word) in values.iter_mut().zip(bytes.chunks_exact(WORD_SIZE)) {
            *value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        }
        Self { values }
    }

    pub fn get(&self, register: Register) -> u32 {
        self.values[register.index()]
    }

    pub fn to_bytes(&self) -> [u8; SNAPSHOT_SIZE] {
        let mut out = [0u8; SNAPSHOT_SIZE];
        for (chunk, value) in out.chunks_exact_mut(WORD_SIZE).zip(self.values.iter()) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }
}

/// One seeded capture: registers before, after one run and after a second run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureGroup {
    pub base: RegisterSnapshot,
    pub first_run: RegisterSnapshot,
    pub second_run: RegisterSnapshot,
}

impl CaptureGroup {
    pub fn changed(&self, register: Register) -> bool {
        let base = self.base.get(register);
        base != self.first_run.get(register) || base != self.second_run.get(register)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HarnessOutput {
    pub set_flags: u32,
    pub unset_flags: u32,
    pub groups: Vec<CaptureGroup>,
}

impl HarnessOutput {
    /// Inverse of [`OutputLayout::decode`].
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.set_flags.to_le_bytes());
        out.extend_from_slice(&self.unset_flags.to_le_bytes());
        for group in &self.groups {
            out.extend_from_slice(&group.base.to_bytes());
            out.extend_from_slice(&group.first_run.to_bytes());
            out.extend_from_slice(&group.second_run.to_bytes());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Length { expected: usize, actual: usize },
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Length { expected, actual } => {
                write!(f, "Expected {} bytes of output, got {}", expected, actual)
            }
        }
    }
}

impl Error for DecodeError {}
