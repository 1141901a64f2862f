use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use byteorder::{BigEndian, ReadBytesExt};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use super::{Batch, Dataset, ImageSet};
use crate::error::Result;

const IMAGES_MAGIC: u32 = 2051;
const LABELS_MAGIC: u32 = 2049;
const CLASSES: usize = 10;
const DEFAULT_DIR: &str = "data/mnist";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MnistSplit {
    Train,
    Test,
}

impl MnistSplit {
    fn prefix(self) -> &'static str {
        match self {
            MnistSplit::Train => "train",
            MnistSplit::Test => "t10k",
        }
    }
}

/// Handwritten digits read from the IDX files, pixels scaled to `[0, 1]`.
pub struct Mnist {
    set: ImageSet,
}

impl Mnist {
    /// Loads from `$MNIST_PATH`, or `data/mnist` when it is unset.
    pub fn from_env(split: MnistSplit, batch_size: usize) -> Result<Self> {
        let dir = std::env::var_os("MNIST_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DIR));
        Self::load(&dir, split, batch_size)
    }

    /// Expects `<split>-images-idx3-ubyte` and `<split>-labels-idx1-ubyte`, each
    /// optionally gzipped, inside `dir`.
    pub fn load(dir: &Path, split: MnistSplit, batch_size: usize) -> Result<Self> {
        let images = dir.join(format!("{}-images-idx3-ubyte", split.prefix()));
        let labels = dir.join(format!("{}-labels-idx1-ubyte", split.prefix()));
        let (pixels, dims) = read_images(open(&images)?)
            .with_context(|| format!("Failed to read mnist images from {}", images.display()))?;
        let labels = read_labels(open(&labels)?)
            .with_context(|| format!("Failed to read mnist labels from {}", labels.display()))?;
        tracing::info!(samples = labels.len(), dir = %dir.display(), "loaded mnist");
        Ok(Mnist {
            set: ImageSet::new(pixels, labels, dims, CLASSES, batch_size, 0)?,
        })
    }
}

fn open(path: &Path) -> anyhow::Result<Box<dyn Read>> {
    if path.exists() {
        return Ok(Box::new(BufReader::new(File::open(path)?)));
    }
    let gz = PathBuf::from(format!("{}.gz", path.display()));
    if gz.exists() {
        return Ok(Box::new(GzDecoder::new(BufReader::new(File::open(&gz)?))));
    }
    bail!("neither {} nor {} exists", path.display(), gz.display())
}

/// Reads exactly `len` bytes, growing the buffer only as data arrives.
fn read_payload(r: impl Read, len: usize) -> anyhow::Result<Vec<u8>> {
    let mut raw = Vec::new();
    r.take(len as u64).read_to_end(&mut raw)?;
    if raw.len() != len {
        bail!("expected {len} bytes, found {}", raw.len());
    }
    Ok(raw)
}

/// Returns the scaled pixels and `[1, rows, cols]`.
pub(crate) fn read_images(mut r: impl Read) -> anyhow::Result<(Vec<f32>, [usize; 3])> {
    let magic = r.read_u32::<BigEndian>()?;
    if magic != IMAGES_MAGIC {
        bail!("bad image file magic {magic}");
    }
    let count = r.read_u32::<BigEndian>()? as usize;
    let rows = r.read_u32::<BigEndian>()? as usize;
    let cols = r.read_u32::<BigEndian>()? as usize;
    let Some(len) = count.checked_mul(rows).and_then(|n| n.checked_mul(cols)) else {
        bail!("image header {count}x{rows}x{cols} overflows");
    };
    let raw = read_payload(r, len).context("image data is truncated")?;
    Ok((raw.into_iter().map(|p| f32::from(p) / 255.0).collect(), [1, rows, cols]))
}

pub(crate) fn read_labels(mut r: impl Read) -> anyhow::Result<Vec<usize>> {
    let magic = r.read_u32::<BigEndian>()?;
    if magic != LABELS_MAGIC {
        bail!("bad label file magic {magic}");
    }
    let count = r.read_u32::<BigEndian>()? as usize;
    let raw = read_payload(r, count).context("label data is truncated")?;
    Ok(raw.into_iter().map(usize::from).collect())
}

impl Dataset for Mnist {
    fn batch_size(&self) -> usize {
        self.set.batch_size()
    }

    fn len(&self) -> usize {
        self.set.len()
    }

    fn next_batch(&mut self, n: usize) -> Result<Option<Batch>> {
        self.set.next_batch(n)
    }

    fn reset(&mut self) {
        self.set.reset()
    }

    fn shuffle(&mut self) {
        self.set.shuffle()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use byteorder::WriteBytesExt;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::*;
    use crate::error::NetError;

    fn idx_images(count: u32, rows: u32, cols: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(IMAGES_MAGIC).unwrap();
        buf.write_u32::<BigEndian>(count).unwrap();
        buf.write_u32::<BigEndian>(rows).unwrap();
        buf.write_u32::<BigEndian>(cols).unwrap();
        buf.extend((0..count * rows * cols).map(|i| (i * 51 % 256) as u8));
        buf
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(LABELS_MAGIC).unwrap();
        buf.write_u32::<BigEndian>(labels.len() as u32).unwrap();
        buf.extend_from_slice(labels);
        buf
    }

    #[test]
    fn parses_idx_images() {
        let (pixels, dims) = read_images(Cursor::new(idx_images(2, 3, 3))).unwrap();
        assert_eq!(dims, [1, 3, 3]);
        assert_eq!(pixels.len(), 18);
        assert_eq!(pixels[5], 255.0 / 255.0);
        assert!(pixels.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn parses_gzipped_labels() {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&idx_labels(&[7, 0, 9])).unwrap();
        let bytes = gz.finish().unwrap();
        let labels = read_labels(GzDecoder::new(Cursor::new(bytes))).unwrap();
        assert_eq!(labels, vec![7, 0, 9]);
    }

    #[test]
    fn rejects_wrong_magic_and_truncation() {
        assert!(read_labels(Cursor::new(idx_images(1, 2, 2))).is_err());
        let mut short = idx_images(2, 2, 2);
        short.truncate(short.len() - 1);
        assert!(read_images(Cursor::new(short)).is_err());
    }

    #[test]
    fn oversized_headers_are_errors() {
        let mut header = Vec::new();
        header.write_u32::<BigEndian>(IMAGES_MAGIC).unwrap();
        for _ in 0..3 {
            header.write_u32::<BigEndian>(u32::MAX).unwrap();
        }
        assert!(read_images(Cursor::new(header)).is_err());

        // a plausible header over a short body fails without allocating the claim
        let mut header = Vec::new();
        header.write_u32::<BigEndian>(IMAGES_MAGIC).unwrap();
        header.write_u32::<BigEndian>(60_000).unwrap();
        header.write_u32::<BigEndian>(1024).unwrap();
        header.write_u32::<BigEndian>(1024).unwrap();
        header.extend_from_slice(&[0; 16]);
        assert!(read_images(Cursor::new(header)).is_err());

        let mut labels = Vec::new();
        labels.write_u32::<BigEndian>(LABELS_MAGIC).unwrap();
        labels.write_u32::<BigEndian>(u32::MAX).unwrap();
        assert!(read_labels(Cursor::new(labels)).is_err());
    }

    #[test]
    fn loads_a_directory() {
        let dir = std::env::temp_dir().join(format!("mnist-idx-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("t10k-images-idx3-ubyte"), idx_images(4, 28, 28)).unwrap();
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&idx_labels(&[1, 2, 3, 4])).unwrap();
        std::fs::write(dir.join("t10k-labels-idx1-ubyte.gz"), gz.finish().unwrap()).unwrap();

        let mut mnist = Mnist::load(&dir, MnistSplit::Test, 3).unwrap();
        let batch = mnist.next().unwrap().unwrap();
        assert_eq!(batch.inputs.shape().dims(), &[3, 1, 28, 28]);
        assert_eq!(batch.labels.shape().dims(), &[3, 10]);
        assert_eq!(batch.labels.argmax_rows().unwrap(), vec![1, 2, 3]);

        let err = Mnist::load(&dir, MnistSplit::Train, 3).err().unwrap();
        assert!(matches!(err, NetError::Dataset(_)));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
