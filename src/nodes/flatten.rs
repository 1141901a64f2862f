use std::marker::PhantomData;

use crate::backend::Device;
use crate::error::{NetError, Result};
use crate::nodes::{expect_shape, Node, NodeKind};
use crate::tensor::{Backend, Shape, TensorHandle};

/// `[N, ...]` to `[N, prod(...)]`.
pub struct Flatten<D: Device> {
    input: Option<Shape>,
    _device: PhantomData<D>,
}

impl<D: Device> Flatten<D> {
    pub fn new() -> Self {
        Flatten {
            input: None,
            _device: PhantomData,
        }
    }
}

impl<D: Device> Default for Flatten<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Device> Node for Flatten<D> {
    fn kind(&self) -> NodeKind {
        NodeKind::Flatten
    }

    fn backend(&self) -> Backend {
        D::BACKEND
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        if input.rank() < 2 {
            return Err(NetError::mismatch("Flatten", "[batch, ...]", input));
        }
        Shape::new(&[input.batch(), input.sample_len()])
    }

    fn activation(&mut self, training: bool, x: &TensorHandle) -> Result<TensorHandle> {
        self.input = None;
        D::view(x)?;
        let shape = self.output_shape(x.shape())?;
        let y = x.reshape(shape.dims())?;
        if training {
            self.input = Some(x.shape().clone());
        }
        Ok(y)
    }

    fn update(&mut self, _learning_rate: f64, grad: &TensorHandle) -> Result<TensorHandle> {
        let input = self.input.take().ok_or_else(|| NetError::no_forward_state("Flatten"))?;
        expect_shape("Flatten gradient", &self.output_shape(&input)?, grad.shape())?;
        D::view(grad)?;
        grad.reshape(input.dims())
    }

    fn parameters(&self) -> Result<Vec<TensorHandle>> {
        Ok(Vec::new())
    }
}
