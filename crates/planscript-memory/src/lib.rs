//! # PlanScript Memory
//!
//! Hierarchical memory, both partitions keyed by caller-supplied name:
//!
//! - **STM**: a volatile window of summary, objective, context and recent
//!   events, shrunk by `forget` (compact / reset / keep_last).
//! - **LTM**: a keyword-indexed knowledge base built from file globs,
//!   persisted under `<project>/.ps-memory/<name>/ltm.json`.
//! - **Checkpoints**: compact milestone state that survives `forget`.

pub mod store;
pub mod types;

use thiserror::Error;

pub use store::{MemoryStore, RecallChunk};
pub use types::{Checkpoint, Ltm, Milestone, Stm, StmEvent};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("MemoryError: no memory named '{0}'")]
    UnknownKey(String),

    #[error("MemoryError: {0}")]
    Io(String),

    #[error("MemoryError: {0}")]
    Serialization(String),

    #[error(transparent)]
    Glob(#[from] planscript_core::glob::GlobError),
}

/// Token estimate used by forget accounting: `ceil(serialized_len / 4)`.
/// Not calibrated per model; callers should compare ratios, not absolute
/// counts.
pub fn estimate_tokens(serialized_len: usize) -> u64 {
    (serialized_len as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(4), 1);
        assert_eq!(estimate_tokens(5), 2);
    }
}
