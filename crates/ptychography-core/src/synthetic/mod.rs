//! Deterministic synthetic ptychography data.
//!
//! Building blocks for tests, demos and benchmarks: scan patterns, a
//! Gaussian probe, a smooth phase object, and a far-field forward model
//! that produces an in-memory [`DiffractionDataset`](crate::DiffractionDataset).

mod ptycho;

pub use ptycho::*;
