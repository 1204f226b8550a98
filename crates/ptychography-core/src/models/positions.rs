use serde::{Deserialize, Serialize};

use super::ModelError;
use crate::geometry::ScanPoint;
use crate::math::Real;

/// Current estimate of the scan positions, one per frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScanPositions {
    pub points: Vec<ScanPoint>,
}

impl ScanPositions {
    pub fn new(points: Vec<ScanPoint>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.points.iter().all(ScanPoint::is_finite) {
            Ok(())
        } else {
            Err(ModelError::NonFinite {
                what: "scan positions",
            })
        }
    }

    /// Mean Euclidean distance to `other`, in metres.
    pub fn mean_displacement(&self, other: &ScanPositions) -> Real {
        if self.points.is_empty() {
            return 0.0;
        }
        let total: Real = self
            .points
            .iter()
            .zip(other.points.iter())
            .map(|(a, b)| ((a.x_m - b.x_m).powi(2) + (a.y_m - b.y_m).powi(2)).sqrt())
            .sum();
        total / self.points.len() as Real
    }
}

impl From<&[ScanPoint]> for ScanPositions {
    fn from(points: &[ScanPoint]) -> Self {
        Self::new(points.to_vec())
    }
}
