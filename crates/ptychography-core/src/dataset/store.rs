//! Reader registry and the dataset store.
//!
//! Readers are matched by the descriptor's `format`, case-insensitively.
//! User-registered readers take precedence over the built-in ones.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::error::{DataLoadError, DatasetError};
use super::source::{RawStackSource, write_raw_stack};
use super::{DatasetMetadata, DiffractionDataset, FrameMeta, SourceDescriptor};
use crate::geometry::ScanPoint;
use crate::math::Real;

/// Loads datasets of one format.
pub trait DatasetReader: Send + Sync {
    /// Format name this reader answers to.
    fn format(&self) -> &str;

    fn read(&self, descriptor: &SourceDescriptor) -> Result<DiffractionDataset, DataLoadError>;
}

/// Serves datasets previously inserted under a location name.
#[derive(Default)]
pub struct MemoryReader {
    datasets: RwLock<HashMap<String, DiffractionDataset>>,
}

impl MemoryReader {
    pub const FORMAT: &'static str = "memory";

    pub fn insert(&self, location: impl Into<String>, dataset: DiffractionDataset) {
        if let Ok(mut map) = self.datasets.write() {
            map.insert(location.into(), dataset);
        }
    }
}

impl DatasetReader for MemoryReader {
    fn format(&self) -> &str {
        Self::FORMAT
    }

    fn read(&self, descriptor: &SourceDescriptor) -> Result<DiffractionDataset, DataLoadError> {
        let map = self
            .datasets
            .read()
            .map_err(|_| DataLoadError::NotFound(descriptor.location.clone()))?;
        map.get(&descriptor.location)
            .cloned()
            .ok_or_else(|| DataLoadError::NotFound(descriptor.location.clone()))
    }
}

/// JSON header of a raw frame stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawStackHeader {
    pub metadata: DatasetMetadata,
    pub positions: Vec<ScanPoint>,
    /// One entry per frame.
    pub exposure_s: Vec<Real>,
    /// Frame stack file, relative to the header's directory.
    pub data_file: String,
}

/// Reads `location` as a [`RawStackHeader`] JSON file plus its `f32` stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawStackReader;

impl RawStackReader {
    pub const FORMAT: &'static str = "raw";
}

impl DatasetReader for RawStackReader {
    fn format(&self) -> &str {
        Self::FORMAT
    }

    fn read(&self, descriptor: &SourceDescriptor) -> Result<DiffractionDataset, DataLoadError> {
        let header_path = Path::new(&descriptor.location);
        let text = fs::read_to_string(header_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DataLoadError::NotFound(descriptor.location.clone())
            } else {
                DataLoadError::io(descriptor.location.clone(), e)
            }
        })?;
        let header: RawStackHeader =
            serde_json::from_str(&text).map_err(|e| DataLoadError::MalformedHeader {
                path: descriptor.location.clone(),
                reason: e.to_string(),
            })?;
        header.metadata.validate()?;
        if header.exposure_s.len() != header.positions.len() {
            return Err(DataLoadError::MalformedHeader {
                path: descriptor.location.clone(),
                reason: format!(
                    "{} exposure times for {} positions",
                    header.exposure_s.len(),
                    header.positions.len()
                ),
            });
        }

        let data_path = data_path(header_path, &header.data_file);
        let source = RawStackSource::open(
            &data_path,
            header.metadata.frame_shape,
            header.positions.len(),
        )?;
        let frame_meta = header
            .exposure_s
            .iter()
            .enumerate()
            .map(|(index, &exposure_s)| FrameMeta { index, exposure_s })
            .collect();
        DiffractionDataset::new(
            descriptor.clone(),
            header.metadata,
            header.positions,
            frame_meta,
            Arc::new(source),
        )
    }
}

fn data_path(header_path: &Path, data_file: &str) -> PathBuf {
    match header_path.parent() {
        Some(dir) => dir.join(data_file),
        None => PathBuf::from(data_file),
    }
}

/// Write `dataset` as a raw stack: `header_path` plus a sibling `.bin` file.
pub fn write_raw_dataset(
    header_path: impl AsRef<Path>,
    dataset: &DiffractionDataset,
) -> Result<SourceDescriptor, DatasetError> {
    let header_path = header_path.as_ref();
    let data_file = header_path
        .with_extension("bin")
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| DataLoadError::InvalidMetadata("header path has no file name".into()))?;

    let frames = (0..dataset.len())
        .map(|i| dataset.frame(i))
        .collect::<Result<Vec<_>, _>>()?;
    write_raw_stack(
        data_path(header_path, &data_file),
        frames.iter().map(|f| &**f),
    )?;

    let exposure_s = (0..dataset.len())
        .map(|i| dataset.frame_meta(i).map(|m| m.exposure_s))
        .collect::<Result<Vec<_>, _>>()?;
    let header = RawStackHeader {
        metadata: *dataset.metadata(),
        positions: dataset.positions().to_vec(),
        exposure_s,
        data_file,
    };
    let json = serde_json::to_string_pretty(&header)
        .map_err(|e| DataLoadError::InvalidMetadata(e.to_string()))?;
    let location = header_path.display().to_string();
    fs::write(header_path, json).map_err(|e| DataLoadError::io(location.clone(), e))?;
    Ok(SourceDescriptor::new(location, RawStackReader::FORMAT))
}

/// Entry point for loading datasets by descriptor.
pub struct DatasetStore {
    readers: Vec<Arc<dyn DatasetReader>>,
    memory: Arc<MemoryReader>,
}

impl Default for DatasetStore {
    fn default() -> Self {
        Self::with_default_readers()
    }
}

impl DatasetStore {
    /// Store with the `memory` and `raw` readers.
    pub fn with_default_readers() -> Self {
        let memory = Arc::new(MemoryReader::default());
        Self {
            readers: vec![
                memory.clone() as Arc<dyn DatasetReader>,
                Arc::new(RawStackReader),
            ],
            memory,
        }
    }

    /// Register a reader; it shadows any existing reader of the same format.
    pub fn register(&mut self, reader: Arc<dyn DatasetReader>) {
        debug!("registering dataset reader '{}'", reader.format());
        self.readers.insert(0, reader);
    }

    /// Make `dataset` loadable as `{location, "memory"}`.
    pub fn insert_memory(
        &self,
        location: impl Into<String>,
        dataset: DiffractionDataset,
    ) -> SourceDescriptor {
        let location = location.into();
        self.memory.insert(location.clone(), dataset);
        SourceDescriptor::new(location, MemoryReader::FORMAT)
    }

    pub fn formats(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for reader in &self.readers {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(reader.format())) {
                names.push(reader.format().to_string());
            }
        }
        names
    }

    pub fn load(&self, descriptor: &SourceDescriptor) -> Result<Arc<DiffractionDataset>, DataLoadError> {
        let reader = self
            .readers
            .iter()
            .find(|r| r.format().eq_ignore_ascii_case(&descriptor.format))
            .ok_or_else(|| DataLoadError::UnknownFormat(descriptor.format.clone()))?;
        let dataset = reader.read(descriptor)?;
        info!(
            "loaded dataset '{}' ({}): {} frames of {}",
            descriptor.location,
            reader.format(),
            dataset.len(),
            dataset.frame_shape()
        );
        Ok(Arc::new(dataset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::DetectorGeometry;
    use crate::math::RealGrid;

    fn small_dataset(location: &str) -> DiffractionDataset {
        let frames: Vec<RealGrid> = (0..5)
            .map(|k| RealGrid::from_fn(4, 6, |r, c| (k + r + c) as Real))
            .collect();
        let positions = (0..5).map(|i| ScanPoint::new(i as Real * 1e-7, 2e-7)).collect();
        DiffractionDataset::from_frames(
            SourceDescriptor::new(location, "memory"),
            DetectorGeometry::default(),
            9_000.0,
            frames,
            positions,
            0.25,
        )
        .unwrap()
    }

    #[test]
    fn memory_reader_matches_format_case_insensitively() {
        let store = DatasetStore::with_default_readers();
        store.insert_memory("scan-1", small_dataset("scan-1"));
        let dataset = store
            .load(&SourceDescriptor::new("scan-1", "MEMORY"))
            .unwrap();
        assert_eq!(dataset.len(), 5);

        assert!(matches!(
            store.load(&SourceDescriptor::new("scan-2", "memory")),
            Err(DataLoadError::NotFound(_))
        ));
        assert!(matches!(
            store.load(&SourceDescriptor::new("scan-1", "hdf5")),
            Err(DataLoadError::UnknownFormat(_))
        ));
    }

    #[test]
    fn raw_dataset_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let original = small_dataset("scan");
        let descriptor = write_raw_dataset(dir.path().join("scan.json"), &original).unwrap();
        assert_eq!(descriptor.format, "raw");

        let store = DatasetStore::default();
        let loaded = store.load(&descriptor).unwrap();
        assert_eq!(loaded.len(), original.len());
        assert_eq!(loaded.positions(), original.positions());
        for i in 0..loaded.len() {
            assert_eq!(*loaded.frame(i).unwrap(), *original.frame(i).unwrap());
        }
        assert_eq!(loaded.frame_meta(4).unwrap().exposure_s, 0.25);
    }

    #[test]
    fn malformed_header_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        let store = DatasetStore::default();
        let result = store.load(&SourceDescriptor::new(path.display().to_string(), "raw"));
        assert!(matches!(result, Err(DataLoadError::MalformedHeader { .. })));
    }

    struct EmptyReader;

    impl DatasetReader for EmptyReader {
        fn format(&self) -> &str {
            "memory"
        }

        fn read(&self, _: &SourceDescriptor) -> Result<DiffractionDataset, DataLoadError> {
            Err(DataLoadError::Empty)
        }
    }

    #[test]
    fn registered_reader_shadows_builtin() {
        let mut store = DatasetStore::with_default_readers();
        store.insert_memory("scan", small_dataset("scan"));
        store.register(Arc::new(EmptyReader));
        assert!(matches!(
            store.load(&SourceDescriptor::new("scan", "memory")),
            Err(DataLoadError::Empty)
        ));
    }
}
