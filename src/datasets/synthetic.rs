use derivative::Derivative;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{Batch, Dataset, ImageSet};
use crate::error::{NetError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
pub struct SyntheticConf {
    #[derivative(Default(value = "200"))]
    pub samples: usize,
    #[derivative(Default(value = "1"))]
    pub channels: usize,
    #[derivative(Default(value = "28"))]
    pub height: usize,
    #[derivative(Default(value = "28"))]
    pub width: usize,
    #[derivative(Default(value = "2"))]
    pub classes: usize,
    /// Amplitude of the uniform background noise.
    #[derivative(Default(value = "0.1"))]
    pub noise: f32,
    #[derivative(Default(value = "7"))]
    pub seed: u64,
}

/// Seeded toy classification problem.
///
/// Class `c` lights up quadrant `c % 4` of every channel at brightness
/// `1 / (1 + c / 4)`, everything else is noise, so classes are linearly separable.
pub struct Synthetic {
    set: ImageSet,
}

impl Synthetic {
    pub fn new(conf: SyntheticConf, batch_size: usize) -> Result<Self> {
        if conf.height < 2 || conf.width < 2 || conf.channels == 0 || conf.classes < 2 || conf.samples == 0 {
            return Err(NetError::InvalidConfig(format!("unusable synthetic dataset {conf:?}")));
        }
        let mut rng = StdRng::seed_from_u64(conf.seed);
        let (c, h, w) = (conf.channels, conf.height, conf.width);
        let mut images = Vec::with_capacity(conf.samples * c * h * w);
        let mut labels = Vec::with_capacity(conf.samples);
        for i in 0..conf.samples {
            let class = i % conf.classes;
            let quadrant = class % 4;
            let rows = if quadrant / 2 == 0 { 0..h / 2 } else { h / 2..h };
            let cols = if quadrant % 2 == 0 { 0..w / 2 } else { w / 2..w };
            let bright = 1.0 / (1.0 + (class / 4) as f32);
            for _ in 0..c {
                for y in 0..h {
                    for x in 0..w {
                        let noise = conf.noise * rng.gen::<f32>();
                        let lit = rows.contains(&y) && cols.contains(&x);
                        images.push(if lit { bright - noise } else { noise });
                    }
                }
            }
            labels.push(class);
        }
        let mut set = ImageSet::new(images, labels, [c, h, w], conf.classes, batch_size, conf.seed)?;
        set.shuffle();
        Ok(Synthetic { set })
    }
}

impl Dataset for Synthetic {
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
