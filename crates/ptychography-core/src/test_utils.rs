use crate::dataset::DiffractionDataset;
use crate::math::GridShape;
use crate::synthetic::{SyntheticData, SyntheticScan};

/// Small, fast scan: 16 frames of 32×32 with generous overlap.
pub fn small_scan() -> SyntheticScan {
    SyntheticScan {
        frame_shape: GridShape::square(32),
        scan_rows: 4,
        scan_cols: 4,
        step_px: 8.0,
        probe_sigma_fraction: 0.18,
        ..SyntheticScan::default()
    }
}

pub fn small_synthetic() -> SyntheticData {
    small_scan()
        .simulate()
        .expect("synthetic scan parameters are valid")
}

pub fn small_dataset() -> DiffractionDataset {
    small_synthetic().dataset
}
