//! Labeled image data fed to the training loop.
//!
//! Loaders only produce host tensors, the network moves them to its backend.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

pub mod mnist;
pub mod synthetic;

pub use mnist::{Mnist, MnistSplit};
pub use synthetic::{Synthetic, SyntheticConf};

use crate::error::{NetError, Result};
use crate::tensor::{Backend, TensorHandle};

/// Inputs `[B, C, H, W]` and one-hot labels `[B, classes]`, both on the host.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: TensorHandle,
    pub labels: TensorHandle,
}

/// A finite, restartable sequence of batches.
pub trait Dataset {
    /// Batch size used by [`Dataset::next`].
    fn batch_size(&self) -> usize;
    /// Number of samples in a full pass.
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Up to `n` samples, `None` once the pass is over. The last batch of a pass
    /// may be smaller than `n`.
    fn next_batch(&mut self, n: usize) -> Result<Option<Batch>>;
    fn next(&mut self) -> Result<Option<Batch>> {
        let n = self.batch_size();
        self.next_batch(n)
    }
    /// Rewinds to the first sample of the current order.
    fn reset(&mut self);
    /// Draws a new sample order and rewinds.
    fn shuffle(&mut self);
}

/// Images held in memory, shared by every loader.
pub struct ImageSet {
    images: Vec<f32>,
    labels: Vec<usize>,
    dims: [usize; 3],
    classes: usize,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    rng: StdRng,
}

impl ImageSet {
    /// `images` is row-major `[samples, C, H, W]`.
    pub fn new(
        images: Vec<f32>,
        labels: Vec<usize>,
        dims: [usize; 3],
        classes: usize,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self> {
        let per_sample: usize = dims.iter().product();
        if batch_size == 0 {
            return Err(NetError::InvalidConfig("dataset batch size must be positive".into()));
        }
        if per_sample == 0 || images.len() != labels.len() * per_sample {
            return Err(NetError::ShapeError(format!(
                "{} values do not make {} images of {dims:?}",
                images.len(),
                labels.len()
            )));
        }
        if let Some(bad) = labels.iter().find(|&&l| l >= classes) {
            return Err(NetError::InvalidConfig(format!("label {bad} outside of {classes} classes")));
        }
        Ok(ImageSet {
            order: (0..labels.len()).collect(),
            images,
            labels,
            dims,
            classes,
            cursor: 0,
            batch_size,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    /// `[C, H, W]` of one sample.
    pub fn sample_dims(&self) -> [usize; 3] {
        self.dims
    }
}

impl Dataset for ImageSet {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn len(&self) -> usize {
        self.labels.len()
    }

    fn next_batch(&mut self, n: usize) -> Result<Option<Batch>> {
        if n == 0 || self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + n).min(self.order.len());
        let picked = &self.order[self.cursor..end];
        let per_sample: usize = self.dims.iter().product();

        let mut inputs = Vec::with_capacity(picked.len() * per_sample);
        let mut labels = vec![0.0f32; picked.len() * self.classes];
        for (row, &i) in picked.iter().enumerate() {
            inputs.extend_from_slice(&self.images[i * per_sample..(i + 1) * per_sample]);
            labels[row * self.classes + self.labels[i]] = 1.0;
        }
        let [c, h, w] = self.dims;
        let b = picked.len();
        self.cursor = end;
        Ok(Some(Batch {
            inputs: TensorHandle::from_vec(&[b, c, h, w], inputs, Backend::Cpu)?,
            labels: TensorHandle::from_vec(&[b, self.classes], labels, Backend::Cpu)?,
        }))
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn shuffle(&mut self) {
        self.order.shuffle(&mut self.rng);
        self.cursor = 0;
    }
}

/// Builds datasets by name.
pub struct DataSetsFactory;

impl DataSetsFactory {
    /// `"Mnist"` reads the training split from `$MNIST_PATH` (default
    /// `data/mnist`), `"Synthetic"` generates a small seeded problem.
    pub fn create(name: &str, batch_size: usize) -> Result<Box<dyn Dataset>> {
        match name {
            "Mnist" => Ok(Box::new(Mnist::from_env(MnistSplit::Train, batch_size)?)),
            "Synthetic" => Ok(Box::new(Synthetic::new(SyntheticConf::default(), batch_size)?)),
            _ => Err(NetError::UnsupportedDataset(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny(batch: usize) -> ImageSet {
        let images = (0..5 * 4).map(|v| v as f32).collect();
        ImageSet::new(images, vec![0, 1, 2, 1, 0], [1, 2, 2], 3, batch, 0).unwrap()
    }

    #[test]
    fn batches_until_exhausted() {
        let mut set = tiny(2);
        let first = set.next().unwrap().unwrap();
        assert_eq!(first.inputs.shape().dims(), &[2, 1, 2, 2]);
        assert_eq!(first.labels.to_vec(), vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        assert!(set.next().unwrap().is_some());
        // one sample left
        let last = set.next().unwrap().unwrap();
        assert_eq!(last.inputs.shape().dims(), &[1, 1, 2, 2]);
        assert!(set.next().unwrap().is_none());

        set.reset();
        assert_eq!(set.next().unwrap().unwrap().inputs.to_vec(), first.inputs.to_vec());
    }

    #[test]
    fn shuffle_keeps_samples_and_labels_together() {
        let mut set = tiny(5);
        set.shuffle();
        let batch = set.next().unwrap().unwrap();
        let labels = batch.labels.argmax_rows().unwrap();
        for (image, label) in batch.inputs.to_vec().chunks(4).zip(labels) {
            let index = image[0] as usize / 4;
            assert_eq!([0, 1, 2, 1, 0][index], label);
        }
    }

    #[test]
    fn inconsistent_data_is_rejected() {
        assert!(ImageSet::new(vec![0.0; 7], vec![0, 1], [1, 2, 2], 2, 1, 0).is_err());
        assert!(ImageSet::new(vec![0.0; 8], vec![0, 2], [1, 2, 2], 2, 1, 0).is_err());
        assert!(ImageSet::new(vec![0.0; 8], vec![0, 1], [1, 2, 2], 2, 0, 0).is_err());
    }

    #[test]
    fn factory_names() {
        assert!(DataSetsFactory::create("Synthetic", 10).is_ok());
        assert!(matches!(DataSetsFactory::create("Cifar", 10), Err(NetError::UnsupportedDataset(_))));
    }
}
