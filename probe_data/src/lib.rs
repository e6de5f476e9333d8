//! Data types shared by the probe pipeline.
//!
//! Nothing in here performs I/O: the harness output is handed in as raw bytes and
//! the classification is a pure function of it.

use serde::{Deserialize, Serialize};

pub mod catalog;
pub mod classify;
pub mod hex;
pub mod output;
pub mod result;
pub mod vector;

pub use catalog::{Flag, Register};
pub use result::{Effects, Outcome, ProbeResult};
pub use vector::TestVector;

/// What the execution driver observed when running one harness image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Execution {
    /// The image exited cleanly, stdout is attached.
    Completed(Vec<u8>),
    /// The image was killed after exceeding the time budget.
    TimedOut,
    /// The image terminated abnormally, with whatever it wrote before dying.
    Crashed(Vec<u8>),
}
