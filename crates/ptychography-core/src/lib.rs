//! Core numerics and data model for ptychographic reconstruction.
//!
//! This crate provides the building blocks shared by the reconstruction
//! engines and the orchestration pipeline:
//!
//! - grid type aliases and photon-energy helpers,
//! - 2D FFTs with detector-centred shift helpers,
//! - scan / object-plane geometry,
//! - the dataset store with lazy, index-addressed frame access,
//! - probe, object and scan-position models and their initial guesses.
//!
//! Forward model (conceptually):
//! `I_j = |F{ P · O[r_j] }|²` for every scan position `r_j`.
//!
//! # Modules
//!
//! - \[`dataset`\]: datasets, frame sources, readers and the store.
//! - \[`synthetic`\]: deterministic simulated scans (tests/examples/benchmarks).
//! - \[`test_utils`\]: small shared fixtures.
//!
//! # Example
//!
//! ```no_run
//! use ptychography_core::{DatasetStore, SourceDescriptor};
//!
//! let store = DatasetStore::with_default_readers();
//! let dataset = store
//!     .load(&SourceDescriptor::new("/data/scan-0042.json", "raw"))
//!     .unwrap();
//! let frame = dataset.frame(0).unwrap();
//! assert_eq!(frame.nrows(), dataset.frame_shape().rows);
//! ```

/// Datasets, frame sources and the dataset store.
pub mod dataset;
/// Discrete Fourier transforms.
mod fft;
mod geometry;
/// Initial probe/object guesses.
mod init;
/// Grid aliases and scalar helpers.
mod math;
/// Probe, object and scan-position models.
mod models;
mod noise;
mod patch;
/// Deterministic synthetic data generation helpers.
///
/// Used in workspace tests and examples; also useful for benchmarking and
/// regression testing of engines.
pub mod synthetic;
/// Test utilities for cross-crate testing.
///
/// This module is public to allow usage in integration tests across
/// the workspace, but is not intended for production use.
pub mod test_utils;

pub use dataset::{
    DataLoadError, DatasetError, DatasetMetadata, DatasetReader, DatasetStore, DatasetSummary,
    DiffractionDataset, FrameMeta, FrameSource, IndexError, SourceDescriptor,
};
pub use fft::*;
pub use geometry::*;
pub use init::*;
pub use math::*;
pub use models::*;
pub use noise::*;
pub use patch::*;
