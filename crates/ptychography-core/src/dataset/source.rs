//! Index-addressed frame access.
//!
//! A [`FrameSource`] hands out one frame at a time so datasets on disk are
//! never materialised eagerly. Two sources ship with the crate: an in-memory
//! stack and a raw little-endian `f32` stack read with seek-on-demand.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::error::DataLoadError;
use crate::math::{GridShape, Real, RealGrid};

const BYTES_PER_SAMPLE: usize = std::mem::size_of::<f32>();

/// Random-access provider of detector frames.
pub trait FrameSource: Send + Sync + fmt::Debug {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn frame_shape(&self) -> GridShape;

    /// Read frame `index`. Callers guarantee `index < len()`.
    fn read_frame(&self, index: usize) -> Result<Arc<RealGrid>, DataLoadError>;
}

/// Frames held in memory.
#[derive(Debug, Clone)]
pub struct MemoryFrameSource {
    frames: Vec<Arc<RealGrid>>,
    shape: GridShape,
}

impl MemoryFrameSource {
    pub fn new(frames: Vec<RealGrid>) -> Result<Self, DataLoadError> {
        let first = frames.first().ok_or(DataLoadError::Empty)?;
        let shape = GridShape::of(first);
        for (index, frame) in frames.iter().enumerate() {
            let actual = GridShape::of(frame);
            if actual != shape {
                return Err(DataLoadError::ShapeMismatch {
                    index,
                    expected: shape,
                    actual,
                });
            }
        }
        Ok(Self {
            frames: frames.into_iter().map(Arc::new).collect(),
            shape,
        })
    }
}

impl FrameSource for MemoryFrameSource {
    fn len(&self) -> usize {
        self.frames.len()
    }

    fn frame_shape(&self) -> GridShape {
        self.shape
    }

    fn read_frame(&self, index: usize) -> Result<Arc<RealGrid>, DataLoadError> {
        Ok(Arc::clone(&self.frames[index]))
    }
}

/// Row-major little-endian `f32` frame stack.
pub struct RawStackSource {
    path: PathBuf,
    file: Mutex<File>,
    shape: GridShape,
    len: usize,
}

impl fmt::Debug for RawStackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawStackSource")
            .field("path", &self.path)
            .field("shape", &self.shape)
            .field("len", &self.len)
            .finish()
    }
}

impl RawStackSource {
    /// Open a stack of `len` frames of `shape`; the file size must match exactly.
    pub fn open(path: impl AsRef<Path>, shape: GridShape, len: usize) -> Result<Self, DataLoadError> {
        let path = path.as_ref().to_path_buf();
        let display = path.display().to_string();
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DataLoadError::NotFound(display.clone())
            } else {
                DataLoadError::io(display.clone(), e)
            }
        })?;
        let size = file
            .metadata()
            .map_err(|e| DataLoadError::io(display.clone(), e))?
            .len();
        let frame_bytes = (shape.len() * BYTES_PER_SAMPLE) as u64;
        if frame_bytes == 0 || size % frame_bytes != 0 || size / frame_bytes != len as u64 {
            return Err(DataLoadError::MalformedHeader {
                path: display,
                reason: format!(
                    "frame stack holds {size} bytes, expected {len} frames of {shape} f32 samples"
                ),
            });
        }
        Ok(Self {
            path,
            file: Mutex::new(file),
            shape,
            len,
        })
    }

    fn frame_bytes(&self) -> usize {
        self.shape.len() * BYTES_PER_SAMPLE
    }
}

impl FrameSource for RawStackSource {
    fn len(&self) -> usize {
        self.len
    }

    fn frame_shape(&self) -> GridShape {
        self.shape
    }

    fn read_frame(&self, index: usize) -> Result<Arc<RealGrid>, DataLoadError> {
        let mut bytes = vec![0u8; self.frame_bytes()];
        {
            let mut file = self
                .file
                .lock()
                .map_err(|_| DataLoadError::io(self.path.display().to_string(), poisoned()))?;
            file.seek(SeekFrom::Start((index * self.frame_bytes()) as u64))
                .and_then(|_| file.read_exact(&mut bytes))
                .map_err(|e| DataLoadError::io(self.path.display().to_string(), e))?;
        }
        let values: Vec<Real> = bytes
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as Real)
            .collect();
        Ok(Arc::new(RealGrid::from_row_slice(
            self.shape.rows,
            self.shape.cols,
            &values,
        )))
    }
}

fn poisoned() -> std::io::Error {
    std::io::Error::other("frame file lock poisoned")
}

/// Write frames as a row-major little-endian `f32` stack.
pub fn write_raw_stack<'a>(
    path: impl AsRef<Path>,
    frames: impl IntoIterator<Item = &'a RealGrid>,
) -> Result<usize, DataLoadError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    let file = File::create(path).map_err(|e| DataLoadError::io(display.clone(), e))?;
    let mut out = BufWriter::new(file);
    let mut count = 0;
    for frame in frames {
        for row in frame.row_iter() {
            for v in row.iter() {
                out.write_all(&(*v as f32).to_le_bytes())
                    .map_err(|e| DataLoadError::io(display.clone(), e))?;
            }
        }
        count += 1;
    }
    out.flush().map_err(|e| DataLoadError::io(display, e))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_rejects_mixed_shapes() {
        let frames = vec![RealGrid::zeros(4, 4), RealGrid::zeros(4, 5)];
        match MemoryFrameSource::new(frames) {
            Err(DataLoadError::ShapeMismatch { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            MemoryFrameSource::new(Vec::new()),
            Err(DataLoadError::Empty)
        ));
    }

    #[test]
    fn raw_stack_reads_frames_lazily_in_row_major_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.bin");
        let frames: Vec<RealGrid> = (0..3)
            .map(|k| RealGrid::from_fn(2, 3, |r, c| (k * 100 + r * 10 + c) as Real))
            .collect();
        assert_eq!(write_raw_stack(&path, &frames).unwrap(), 3);

        let source = RawStackSource::open(&path, GridShape::new(2, 3), 3).unwrap();
        assert_eq!(source.len(), 3);
        assert_eq!(*source.read_frame(2).unwrap(), frames[2]);
        assert_eq!(*source.read_frame(0).unwrap(), frames[0]);
    }

    #[test]
    fn raw_stack_size_must_match_declared_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.bin");
        write_raw_stack(&path, &[RealGrid::zeros(2, 2)]).unwrap();
        assert!(matches!(
            RawStackSource::open(&path, GridShape::square(2), 2),
            Err(DataLoadError::MalformedHeader { .. })
        ));
        assert!(matches!(
            RawStackSource::open(dir.path().join("missing.bin"), GridShape::square(2), 1),
            Err(DataLoadError::NotFound(_))
        ));
    }
}
