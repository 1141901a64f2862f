use std::fmt;

use derive_more::Deref;
use itertools::Itertools;
use smallvec::SmallVec;

use crate::error::{NetError, Result};

/// Largest rank a handle can carry: batch x channel x height x width.
pub const MAX_RANK: usize = 4;

/// Ordered, strictly positive dimensions of a tensor. Row-major, batch first.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Deref)]
pub struct Shape(SmallVec<[usize; MAX_RANK]>);

impl Shape {
    pub fn new(dims: &[usize]) -> Result<Shape> {
        if dims.is_empty() {
            return Err(NetError::ShapeError("a shape needs at least one dimension".into()));
        }
        if dims.len() > MAX_RANK {
            return Err(NetError::ShapeError(format!(
                "rank {} exceeds the supported rank {MAX_RANK}",
                dims.len()
            )));
        }
        if let Some(i) = dims.iter().position(|&d| d == 0) {
            return Err(NetError::ShapeError(format!(
                "dimension {i} of [{}] is not positive",
                dims.iter().join(", ")
            )));
        }
        Ok(Shape(SmallVec::from_slice(dims)))
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn elements(&self) -> usize {
        self.0.iter().product()
    }

    /// Leading dimension.
    pub fn batch(&self) -> usize {
        self.0[0]
    }

    /// Everything after the batch dimension, multiplied out.
    pub fn sample_len(&self) -> usize {
        self.0[1..].iter().product()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.iter().join(", "))
    }
}

impl TryFrom<&[usize]> for Shape {
    type Error = NetError;
    fn try_from(dims: &[usize]) -> Result<Self> {
        Shape::new(dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_dimensions() {
        assert!(matches!(Shape::new(&[]), Err(NetError::ShapeError(_))));
        assert!(matches!(Shape::new(&[10, 0, 3]), Err(NetError::ShapeError(_))));
        assert!(matches!(Shape::new(&[1, 2, 3, 4, 5]), Err(NetError::ShapeError(_))));
    }

    #[test]
    fn counts() {
        let s = Shape::new(&[10, 1, 28, 28]).unwrap();
        assert_eq!(s.rank(), 4);
        assert_eq!(s.elements(), 7840);
        assert_eq!(s.batch(), 10);
        assert_eq!(s.sample_len(), 784);
        assert_eq!(s.to_string(), "[10, 1, 28, 28]");
    }
}
