//! Initial guesses for probe, object and scan positions.
//!
//! The probe is normalised so that, against a unit-amplitude object, its
//! far-field power matches the mean measured frame power. The object is a
//! seeded random field around a mean amplitude, optionally split into
//! slices for multi-slice reconstruction.

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::{DatasetError, DiffractionDataset};
use crate::fft::{Fft2, fftshift, ifftshift};
use crate::geometry::{GeometryError, ObjectGeometry};
use crate::math::{Complex64, ComplexGrid, GridShape, Real, amplitude, polar, total_power};
use crate::models::{ModelError, Object, Probe, ScanPositions};
use crate::noise::SeededNoise;

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("invalid initial guess option: {0}")]
    InvalidOption(String),
}

/// Shape of the primary probe mode.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeInit {
    /// Flat disk; diameter as a fraction of the frame width.
    Disk { diameter_fraction: Real },
    /// Gaussian spot; sigma as a fraction of the frame width.
    Gaussian { sigma_fraction: Real },
    /// Back-propagated mean measured amplitude with flat phase.
    #[default]
    AveragePattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeInitOptions {
    pub model: ProbeInit,
    /// Incoherent modes beyond the primary one.
    pub additional_modes: usize,
    /// Power of each additional mode relative to the primary.
    pub mode_power_fraction: Real,
}

impl Default for ProbeInitOptions {
    fn default() -> Self {
        Self {
            model: ProbeInit::default(),
            additional_modes: 0,
            mode_power_fraction: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectInitOptions {
    /// Extra object pixels on every side beyond the scan's probe footprint.
    pub extra_padding_px: usize,
    pub amplitude_mean: Real,
    pub amplitude_deviation: Real,
    /// Standard deviation of the phase, radians.
    pub phase_deviation: Real,
    pub seed: u64,
}

impl Default for ObjectInitOptions {
    fn default() -> Self {
        Self {
            extra_padding_px: 4,
            amplitude_mean: 1.0,
            amplitude_deviation: 0.0,
            phase_deviation: 0.0,
            seed: 0,
        }
    }
}

/// Layering requested for the object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SliceLayout {
    pub layers: usize,
    pub spacing_m: Real,
}

impl Default for SliceLayout {
    fn default() -> Self {
        Self {
            layers: 1,
            spacing_m: 0.0,
        }
    }
}

/// Everything an engine needs to start iterating.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialGuess {
    pub probe: Probe,
    pub object: Object,
    pub positions: ScanPositions,
    pub geometry: ObjectGeometry,
}

impl InitialGuess {
    /// Build all three models from the dataset.
    pub fn build(
        dataset: &DiffractionDataset,
        probe_opts: &ProbeInitOptions,
        object_opts: &ObjectInitOptions,
        slices: SliceLayout,
    ) -> Result<Self, InitError> {
        let probe = build_probe(dataset, probe_opts)?;
        let geometry = object_geometry(dataset, object_opts.extra_padding_px)?;
        let object = build_object(&geometry, object_opts, slices)?;
        debug!(
            "initial guess: probe {} x{} modes, object {} x{} layers",
            probe.shape(),
            probe.num_modes(),
            object.shape(),
            object.num_layers()
        );
        Ok(Self {
            probe,
            object,
            positions: ScanPositions::from(dataset.positions()),
            geometry,
        })
    }
}

/// Object grid covering the dataset's scan with the frame-sized probe.
pub fn object_geometry(
    dataset: &DiffractionDataset,
    extra_padding_px: usize,
) -> Result<ObjectGeometry, GeometryError> {
    let meta = dataset.metadata();
    let pixel = meta
        .detector
        .object_pixel_geometry(meta.frame_shape, meta.probe_energy_ev)?;
    ObjectGeometry::covering(dataset.positions(), meta.frame_shape, pixel, extra_padding_px)
}

pub fn build_probe(
    dataset: &DiffractionDataset,
    opts: &ProbeInitOptions,
) -> Result<Probe, InitError> {
    if !(opts.mode_power_fraction.is_finite() && opts.mode_power_fraction >= 0.0) {
        return Err(InitError::InvalidOption(format!(
            "mode_power_fraction {}",
            opts.mode_power_fraction
        )));
    }
    let shape = dataset.frame_shape();
    let mean = dataset.mean_frame()?;

    let mut primary = match opts.model {
        ProbeInit::Disk { diameter_fraction } => {
            let radius = 0.5 * diameter_fraction * shape.cols as Real;
            centred_profile(shape, |r| if r <= radius { 1.0 } else { 0.0 })
        }
        ProbeInit::Gaussian { sigma_fraction } => {
            let sigma = sigma_fraction * shape.cols as Real;
            if sigma.is_nan() || sigma <= 0.0 {
                return Err(InitError::InvalidOption(format!(
                    "sigma_fraction {sigma_fraction}"
                )));
            }
            centred_profile(shape, |r| (-0.5 * (r / sigma).powi(2)).exp())
        }
        ProbeInit::AveragePattern => {
            let spectrum = ifftshift(&amplitude(&mean).map(|a| Complex64::new(a, 0.0)));
            let mut wave = spectrum;
            Fft2::new(shape).inverse(&mut wave);
            fftshift(&wave)
        }
    };

    let target_power = mean.sum() / shape.len() as Real;
    let mode_weights: Vec<Real> = std::iter::once(1.0)
        .chain(std::iter::repeat_n(
            opts.mode_power_fraction,
            opts.additional_modes,
        ))
        .collect();
    let weight_sum: Real = mode_weights.iter().sum();

    let primary_power = total_power(&primary);
    if primary_power > 0.0 && target_power > 0.0 {
        primary *= Complex64::new((target_power / (primary_power * weight_sum)).sqrt(), 0.0);
    }

    let mut modes = Vec::with_capacity(mode_weights.len());
    for (k, weight) in mode_weights.iter().enumerate() {
        if k == 0 {
            modes.push(primary.clone());
            continue;
        }
        // Higher modes: primary with alternating linear phase ramps.
        let (fr, fc) = if k % 2 == 1 { (0.0, k.div_ceil(2) as Real) } else { ((k / 2) as Real, 0.0) };
        let scale = weight.sqrt();
        modes.push(ComplexGrid::from_fn(shape.rows, shape.cols, |r, c| {
            let phase = 2.0
                * std::f64::consts::PI
                * (fr * r as Real / shape.rows as Real + fc * c as Real / shape.cols as Real);
            primary[(r, c)] * polar(scale, phase)
        }));
    }

    Ok(Probe::new(modes, dataset.metadata().probe_energy_ev)?)
}

fn centred_profile(shape: GridShape, f: impl Fn(Real) -> Real) -> ComplexGrid {
    let cr = (shape.rows / 2) as Real;
    let cc = (shape.cols / 2) as Real;
    ComplexGrid::from_fn(shape.rows, shape.cols, |r, c| {
        let dr = r as Real - cr;
        let dc = c as Real - cc;
        Complex64::new(f((dr * dr + dc * dc).sqrt()), 0.0)
    })
}

pub fn build_object(
    geometry: &ObjectGeometry,
    opts: &ObjectInitOptions,
    slices: SliceLayout,
) -> Result<Object, InitError> {
    if slices.layers == 0 {
        return Err(InitError::InvalidOption("object needs at least one layer".into()));
    }
    let noise = SeededNoise::new(opts.seed);
    let shape = geometry.shape;
    let layer = ComplexGrid::from_fn(shape.rows, shape.cols, |r, c| {
        let index = r * shape.cols + c;
        let a = (opts.amplitude_mean + opts.amplitude_deviation * noise.gaussian(0, index))
            .clamp(0.0, 1.0);
        let phi = opts.phase_deviation * noise.gaussian(1, index);
        polar(a, phi)
    });
    let object = Object::single(layer);
    if slices.layers == 1 {
        Ok(object)
    } else {
        Ok(object.to_multi_slice(slices.layers, slices.spacing_m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::small_dataset;

    #[test]
    fn average_pattern_probe_matches_measured_power() {
        let dataset = small_dataset();
        let probe = build_probe(&dataset, &ProbeInitOptions::default()).unwrap();
        let mean = dataset.mean_frame().unwrap();
        let expected = mean.sum() / dataset.frame_shape().len() as Real;
        assert_eq!(probe.shape(), dataset.frame_shape());
        assert!((probe.power() - expected).abs() < 1e-6 * expected);
    }

    #[test]
    fn additional_modes_share_the_power_budget() {
        let dataset = small_dataset();
        let opts = ProbeInitOptions {
            model: ProbeInit::Disk {
                diameter_fraction: 0.5,
            },
            additional_modes: 2,
            mode_power_fraction: 0.25,
        };
        let probe = build_probe(&dataset, &opts).unwrap();
        assert_eq!(probe.num_modes(), 3);
        let p0 = total_power(&probe.modes[0]);
        let p1 = total_power(&probe.modes[1]);
        assert!((p1 / p0 - 0.25).abs() < 1e-9);
        let mean = dataset.mean_frame().unwrap();
        let expected = mean.sum() / dataset.frame_shape().len() as Real;
        assert!((probe.power() - expected).abs() < 1e-6 * expected);
    }

    #[test]
    fn random_object_is_seeded_and_clipped() {
        let dataset = small_dataset();
        let geometry = object_geometry(&dataset, 2).unwrap();
        let opts = ObjectInitOptions {
            amplitude_mean: 0.9,
            amplitude_deviation: 0.5,
            phase_deviation: 0.2,
            seed: 3,
            ..ObjectInitOptions::default()
        };
        let a = build_object(&geometry, &opts, SliceLayout::default()).unwrap();
        let b = build_object(&geometry, &opts, SliceLayout::default()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.shape(), geometry.shape);
        assert!(a.layers[0].iter().all(|z| z.norm() <= 1.0 + 1e-12));

        let layered = build_object(
            &geometry,
            &opts,
            SliceLayout {
                layers: 2,
                spacing_m: 5e-6,
            },
        )
        .unwrap();
        assert_eq!(layered.num_layers(), 2);
        assert_eq!(layered.layer_spacing_m, vec![5e-6]);
    }

    #[test]
    fn initial_guess_is_consistent_with_the_dataset() {
        let dataset = small_dataset();
        let guess = InitialGuess::build(
            &dataset,
            &ProbeInitOptions::default(),
            &ObjectInitOptions::default(),
            SliceLayout::default(),
        )
        .unwrap();
        assert_eq!(guess.positions.len(), dataset.len());
        assert_eq!(guess.object.shape(), guess.geometry.shape);
        assert!(guess.geometry.shape.contains(guess.probe.shape()));
    }
}
