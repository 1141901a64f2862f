// scale factors follow https://github.com/srenevey/neuro
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};

/// Used to generate the initial values for the parameters of a node.
///
/// Values are always drawn on the host from a seeded generator and uploaded
/// afterwards, so every backend starts from identical parameters.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum Initializer {
    /// Given constant value.
    Constant(f32),
    /// Normal distribution scaled using Glorot scale factor.
    GlorotNormal,
    /// Uniform distribution scaled using Glorot scale factor.
    GlorotUniform,
    /// Normal distribution scaled using He scale factor.
    HeNormal,
    /// Uniform distribution scaled using He scale factor.
    HeUniform,
    /// Normal distribution scaled using Lecun scale factor.
    LecunNormal,
    /// Normal distribution with given mean and standard deviation.
    NormalScaled(f32, f32),
    /// Zeros.
    Zeros,
}

impl Initializer {
    /// Draws `len` values.
    ///
    /// # Arguments
    ///
    /// * `fan_in` - The number of input units.
    /// * `fan_out` - The number of output units.
    /// * `seed` - Seed of the generator, fixed per node by the factory.
    pub(crate) fn init(self, len: usize, fan_in: usize, fan_out: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = |mean: f32, sd: f32, rng: &mut StdRng| -> Vec<f32> {
            match Normal::new(mean, sd) {
                Ok(dist) => dist.sample_iter(rng).take(len).collect(),
                Err(_) => vec![mean; len],
            }
        };
        let uniform = |limit: f32, rng: &mut StdRng| -> Vec<f32> {
            Uniform::new_inclusive(-limit, limit).sample_iter(rng).take(len).collect()
        };
        let fan_in = fan_in.max(1) as f32;
        let fan_out = fan_out.max(1) as f32;
        match self {
            Initializer::Constant(x) => vec![x; len],
            Initializer::GlorotNormal => normal(0.0, (2.0 / (fan_in + fan_out)).sqrt(), &mut rng),
            Initializer::GlorotUniform => uniform((6.0 / (fan_in + fan_out)).sqrt(), &mut rng),
            Initializer::HeNormal => normal(0.0, (2.0 / fan_in).sqrt(), &mut rng),
            Initializer::HeUniform => uniform((6.0 / fan_in).sqrt(), &mut rng),
            Initializer::LecunNormal => normal(0.0, (1.0 / fan_in).sqrt(), &mut rng),
            Initializer::NormalScaled(mean, sd) => normal(mean, sd, &mut rng),
            Initializer::Zeros => vec![0.0; len],
        }
    }
}

impl Default for Initializer {
    fn default() -> Self {
        Initializer::HeNormal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_values() {
        let a = Initializer::HeNormal.init(64, 9, 8, 7);
        let b = Initializer::HeNormal.init(64, 9, 8, 7);
        let c = Initializer::HeNormal.init(64, 9, 8, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn uniform_stays_in_bounds() {
        let limit = (6.0f32 / 16.0).sqrt();
        let v = Initializer::HeUniform.init(1000, 16, 4, 1);
        assert!(v.iter().all(|x| x.abs() <= limit));
    }

    #[test]
    fn constants() {
        assert_eq!(Initializer::Zeros.init(3, 1, 1, 0), vec![0.0; 3]);
        assert_eq!(Initializer::Constant(0.5).init(2, 1, 1, 0), vec![0.5; 2]);
    }
}
