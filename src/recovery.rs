//! Crash recovery: checkpoints and WAL replay.

pub mod checkpoint;
pub mod replay;

pub use checkpoint::{CheckpointManager, CheckpointMeta, CheckpointTarget};
pub use replay::{replay, ReplayStats};
