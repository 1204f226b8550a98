//! Diffraction datasets and the store that loads them.
//!
//! A [`DiffractionDataset`] pairs an ordered frame stack with one scan
//! position and acquisition metadata per frame. It is immutable after load
//! and shared read-only (`Arc`), so frame reads are safe from any thread.

mod error;
mod source;
mod store;

pub use error::*;
pub use source::*;
pub use store::*;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::geometry::{DetectorGeometry, ScanPoint};
use crate::math::{GridShape, Real, RealGrid};

/// Where a dataset lives and which reader understands it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub location: String,
    /// Reader name, matched case-insensitively.
    pub format: String,
}

impl SourceDescriptor {
    pub fn new(location: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            format: format.into(),
        }
    }
}

/// Per-frame acquisition metadata.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameMeta {
    pub index: usize,
    pub exposure_s: Real,
}

/// Dataset-level metadata shared by all frames.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub frame_shape: GridShape,
    pub detector: DetectorGeometry,
    pub probe_energy_ev: Real,
}

impl DatasetMetadata {
    pub fn validate(&self) -> Result<(), DataLoadError> {
        if self.frame_shape.is_empty() {
            return Err(DataLoadError::InvalidMetadata(format!(
                "empty frame shape {}",
                self.frame_shape
            )));
        }
        if !(self.probe_energy_ev.is_finite() && self.probe_energy_ev > 0.0) {
            return Err(DataLoadError::InvalidMetadata(format!(
                "probe energy {} eV",
                self.probe_energy_ev
            )));
        }
        self.detector
            .validate()
            .map_err(|e| DataLoadError::InvalidMetadata(e.to_string()))
    }
}

/// What a session remembers about the dataset it was reconstructed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub descriptor: SourceDescriptor,
    pub frame_count: usize,
    pub metadata: DatasetMetadata,
}

impl DatasetSummary {
    /// Describe why `dataset` cannot stand in for the summarised one, if it can't.
    pub fn mismatch(&self, dataset: &DiffractionDataset) -> Option<String> {
        if dataset.len() != self.frame_count {
            return Some(format!(
                "frame count {} != {}",
                dataset.len(),
                self.frame_count
            ));
        }
        if dataset.frame_shape() != self.metadata.frame_shape {
            return Some(format!(
                "frame shape {} != {}",
                dataset.frame_shape(),
                self.metadata.frame_shape
            ));
        }
        if dataset.metadata() != &self.metadata {
            return Some("detector geometry or probe energy differs".to_string());
        }
        None
    }
}

/// Immutable, lazily-read diffraction dataset.
///
/// Frames keep the zero frequency at the frame centre.
#[derive(Debug, Clone)]
pub struct DiffractionDataset {
    descriptor: SourceDescriptor,
    metadata: DatasetMetadata,
    positions: Vec<ScanPoint>,
    frame_meta: Vec<FrameMeta>,
    source: Arc<dyn FrameSource>,
}

impl DiffractionDataset {
    pub fn new(
        descriptor: SourceDescriptor,
        metadata: DatasetMetadata,
        positions: Vec<ScanPoint>,
        frame_meta: Vec<FrameMeta>,
        source: Arc<dyn FrameSource>,
    ) -> Result<Self, DataLoadError> {
        metadata.validate()?;
        if source.is_empty() {
            return Err(DataLoadError::Empty);
        }
        if source.len() != positions.len() {
            return Err(DataLoadError::CountMismatch {
                frames: source.len(),
                positions: positions.len(),
            });
        }
        if frame_meta.len() != positions.len() {
            return Err(DataLoadError::InvalidMetadata(format!(
                "{} frame metadata entries for {} frames",
                frame_meta.len(),
                positions.len()
            )));
        }
        if source.frame_shape() != metadata.frame_shape {
            return Err(DataLoadError::ShapeMismatch {
                index: 0,
                expected: metadata.frame_shape,
                actual: source.frame_shape(),
            });
        }
        if let Some(index) = positions.iter().position(|p| !p.is_finite()) {
            return Err(DataLoadError::InvalidMetadata(format!(
                "non-finite scan position at index {index}"
            )));
        }
        Ok(Self {
            descriptor,
            metadata,
            positions,
            frame_meta,
            source,
        })
    }

    /// In-memory dataset with a constant exposure time.
    pub fn from_frames(
        descriptor: SourceDescriptor,
        detector: DetectorGeometry,
        probe_energy_ev: Real,
        frames: Vec<RealGrid>,
        positions: Vec<ScanPoint>,
        exposure_s: Real,
    ) -> Result<Self, DataLoadError> {
        let source = MemoryFrameSource::new(frames)?;
        let metadata = DatasetMetadata {
            frame_shape: source.frame_shape(),
            detector,
            probe_energy_ev,
        };
        let frame_meta = (0..source.len())
            .map(|index| FrameMeta { index, exposure_s })
            .collect();
        Self::new(
            descriptor,
            metadata,
            positions,
            frame_meta,
            Arc::new(source),
        )
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    pub fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }

    pub fn frame_shape(&self) -> GridShape {
        self.metadata.frame_shape
    }

    pub fn positions(&self) -> &[ScanPoint] {
        &self.positions
    }

    pub fn frame_meta(&self, index: usize) -> Result<FrameMeta, IndexError> {
        self.check_index(index)?;
        Ok(self.frame_meta[index])
    }

    /// Read and validate frame `index`.
    pub fn frame(&self, index: usize) -> Result<Arc<RealGrid>, DatasetError> {
        self.check_index(index)?;
        let frame = self.source.read_frame(index)?;
        let actual = GridShape::of(&frame);
        if actual != self.metadata.frame_shape {
            return Err(DataLoadError::ShapeMismatch {
                index,
                expected: self.metadata.frame_shape,
                actual,
            }
            .into());
        }
        if frame.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(DataLoadError::InvalidIntensity { index }.into());
        }
        Ok(frame)
    }

    /// Pixel-wise mean over all frames.
    pub fn mean_frame(&self) -> Result<RealGrid, DatasetError> {
        let shape = self.frame_shape();
        let mut sum = RealGrid::zeros(shape.rows, shape.cols);
        for index in 0..self.len() {
            sum += &*self.frame(index)?;
        }
        Ok(sum / self.len() as Real)
    }

    pub fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            descriptor: self.descriptor.clone(),
            frame_count: self.len(),
            metadata: self.metadata,
        }
    }

    fn check_index(&self, index: usize) -> Result<(), IndexError> {
        if index < self.len() {
            Ok(())
        } else {
            Err(IndexError {
                index,
                len: self.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> SourceDescriptor {
        SourceDescriptor::new("unit", "memory")
    }

    fn positions(n: usize) -> Vec<ScanPoint> {
        (0..n).map(|i| ScanPoint::new(i as Real * 1e-7, 0.0)).collect()
    }

    #[test]
    fn frames_and_positions_line_up() {
        let frames: Vec<RealGrid> = (0..4)
            .map(|k| RealGrid::from_element(8, 8, k as Real))
            .collect();
        let dataset = DiffractionDataset::from_frames(
            descriptor(),
            DetectorGeometry::default(),
            8_000.0,
            frames,
            positions(4),
            0.1,
        )
        .unwrap();

        assert_eq!(dataset.len(), dataset.positions().len());
        for i in 0..dataset.len() {
            assert_eq!(GridShape::of(&*dataset.frame(i).unwrap()), dataset.frame_shape());
        }
        assert_eq!(dataset.mean_frame().unwrap()[(0, 0)], 1.5);
        assert_eq!(dataset.frame_meta(3).unwrap().index, 3);
    }

    #[test]
    fn out_of_range_frame_is_an_index_error() {
        let dataset = DiffractionDataset::from_frames(
            descriptor(),
            DetectorGeometry::default(),
            8_000.0,
            vec![RealGrid::zeros(4, 4)],
            positions(1),
            0.1,
        )
        .unwrap();
        match dataset.frame(1) {
            Err(DatasetError::Index(IndexError { index: 1, len: 1 })) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let result = DiffractionDataset::from_frames(
            descriptor(),
            DetectorGeometry::default(),
            8_000.0,
            vec![RealGrid::zeros(4, 4); 3],
            positions(2),
            0.1,
        );
        assert!(matches!(
            result,
            Err(DataLoadError::CountMismatch {
                frames: 3,
                positions: 2
            })
        ));
    }

    #[test]
    fn negative_intensity_is_reported_on_read() {
        let mut frame = RealGrid::zeros(4, 4);
        frame[(1, 1)] = -1.0;
        let dataset = DiffractionDataset::from_frames(
            descriptor(),
            DetectorGeometry::default(),
            8_000.0,
            vec![frame],
            positions(1),
            0.1,
        )
        .unwrap();
        assert!(matches!(
            dataset.frame(0),
            Err(DatasetError::Load(DataLoadError::InvalidIntensity { index: 0 }))
        ));
    }

    #[test]
    fn summary_detects_a_different_dataset() {
        let make = |n| {
            DiffractionDataset::from_frames(
                descriptor(),
                DetectorGeometry::default(),
                8_000.0,
                vec![RealGrid::zeros(4, 4); n],
                positions(n),
                0.1,
            )
            .unwrap()
        };
        let summary = make(3).summary();
        assert!(summary.mismatch(&make(3)).is_none());
        assert!(summary.mismatch(&make(2)).is_some());
    }
}
