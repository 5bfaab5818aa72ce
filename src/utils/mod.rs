//! Utility modules.
//!
//! - `pool`: bounded worker pool with first-error-wins batches
//! - `random`: random project identifiers
//! - `copy`: `node:path` copy argument parsing

pub mod copy;
pub mod pool;
pub mod random;
