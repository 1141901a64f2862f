use ndarray::prelude::*;
use ndarray::Zip;
use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};

/// Lower bound applied to predictions before taking logs or dividing.
pub const PROBABILITY_FLOOR: f32 = 1e-7;

/// Objective minimised by `fit`. Both variants average over the batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Loss {
    /// `0.5 * |y - t|^2`
    #[default]
    SquaredError,
    /// `-sum(t * ln y)` on probabilities, e.g. the output of a softmax dense layer.
    CrossEntropy,
}

impl Loss {
    /// expects `y` and `t` to be `[batch, classes]`
    pub fn value(self, y: &ArrayD<f32>, t: &ArrayD<f32>) -> Result<f32> {
        let batch = check(y, t)?;
        let total = match self {
            Loss::SquaredError => Zip::from(y).and(t).fold(0.0, |acc, &y, &t| acc + 0.5 * (y - t) * (y - t)),
            Loss::CrossEntropy => Zip::from(y)
                .and(t)
                .fold(0.0, |acc, &y, &t| acc - t * y.max(PROBABILITY_FLOOR).ln()),
        };
        Ok(total / batch)
    }

    /// dL/dy
    pub fn gradient(self, y: &ArrayD<f32>, t: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let batch = check(y, t)?;
        let mut grad = ArrayD::<f32>::zeros(y.raw_dim());
        match self {
            Loss::SquaredError => Zip::from(&mut grad).and(y).and(t).for_each(|g, &y, &t| *g = (y - t) / batch),
            Loss::CrossEntropy => Zip::from(&mut grad)
                .and(y)
                .and(t)
                .for_each(|g, &y, &t| *g = -t / y.max(PROBABILITY_FLOOR) / batch),
        }
        Ok(grad)
    }
}

fn check(y: &ArrayD<f32>, t: &ArrayD<f32>) -> Result<f32> {
    if y.shape() != t.shape() || y.ndim() != 2 {
        return Err(NetError::ShapeError(format!(
            "predictions {:?} and one-hot labels {:?} must both be [batch, classes]",
            y.shape(),
            t.shape()
        )));
    }
    Ok(y.shape()[0] as f32)
}
