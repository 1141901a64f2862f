use crate::backend::Device;
use crate::error::{NetError, Result};
use crate::nodes::conf::DenseConf;
use crate::nodes::{expect_shape, Node, NodeKind, Param};
use crate::tensor::{Backend, Shape, TensorHandle};

struct Forward<D: Device> {
    input: Shape,
    x: D::Array,
    y: D::Array,
}

/// Fully connected layer over `[batch, features]` inputs.
pub struct Dense<D: Device> {
    conf: DenseConf,
    seed: u64,
    weights: Option<(Param<D>, Param<D>)>,
    forward: Option<Forward<D>>,
}

impl<D: Device> Dense<D> {
    pub fn new(conf: DenseConf, seed: u64) -> Result<Self> {
        conf.validate()?;
        Ok(Dense {
            conf,
            seed,
            weights: None,
            forward: None,
        })
    }

    fn check_input(&self, input: &Shape) -> Result<()> {
        if input.rank() != 2 {
            return Err(NetError::mismatch("Dense", "[batch, features]", input));
        }
        if let Some((w, _)) = &self.weights {
            if w.shape[0] != input[1] {
                return Err(NetError::mismatch("Dense", format!("{} input features", w.shape[0]), input));
            }
        }
        Ok(())
    }
}

impl<D: Device> Node for Dense<D> {
    fn kind(&self) -> NodeKind {
        NodeKind::Dense
    }

    fn backend(&self) -> Backend {
        D::BACKEND
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        self.check_input(input)?;
        Shape::new(&[input[0], self.conf.outputs])
    }

    fn activation(&mut self, training: bool, x: &TensorHandle) -> Result<TensorHandle> {
        self.forward = None;
        let input = D::view(x)?;
        let shape = self.output_shape(x.shape())?;
        if self.weights.is_none() {
            let (inputs, outputs) = (x.shape()[1], self.conf.outputs);
            let w = Param::init(&[inputs, outputs], self.conf.init, inputs, outputs, self.seed)?;
            let b = Param::zeros(&[outputs])?;
            tracing::trace!(weights = %w.shape, "Dense parameters materialised");
            self.weights = Some((w, b));
        }
        let Some((w, b)) = &self.weights else {
            return Err(NetError::IllegalState("Dense parameters missing".into()));
        };

        let z = D::dense_forward(input, &w.value, &b.value)?;
        let y = D::activate(&z, self.conf.af)?;
        if training {
            self.forward = Some(Forward {
                input: x.shape().clone(),
                x: input.clone(),
                y: y.clone(),
            });
        }
        Ok(D::handle(shape, y))
    }

    fn update(&mut self, learning_rate: f64, grad: &TensorHandle) -> Result<TensorHandle> {
        let state = self.forward.take().ok_or_else(|| NetError::no_forward_state("Dense"))?;
        let expected = Shape::new(&[state.input[0], self.conf.outputs])?;
        expect_shape("Dense gradient", &expected, grad.shape())?;
        let grad = D::view(grad)?;
        let Some((w, b)) = self.weights.as_mut() else {
            return Err(NetError::no_forward_state("Dense"));
        };

        let grad = D::activate_backward(&state.y, grad, self.conf.af)?;
        let (dx, dw, db) = D::dense_backward(&state.x, &w.value, &grad)?;
        w.step(learning_rate, &dw);
        b.step(learning_rate, &db);
        Ok(D::handle(state.input, dx))
    }

    fn parameters(&self) -> Result<Vec<TensorHandle>> {
        match &self.weights {
            Some((w, b)) => Ok(vec![w.to_host()?, b.to_host()?]),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::init::Initializer;
    use crate::backend::CpuDevice;
    use crate::nodes::conf::ActivationType;

    #[test]
    fn output_shape() {
        let mut dense = Dense::<CpuDevice>::new(DenseConf::new(10), 1).unwrap();
        let x = TensorHandle::ones(&[10, 784], Backend::Cpu).unwrap();
        assert_eq!(dense.activation(true, &x).unwrap().shape().dims(), &[10, 10]);
        let flat = Shape::new(&[10, 1, 28, 28]).unwrap();
        assert!(matches!(dense.output_shape(&flat), Err(NetError::ShapeMismatch { .. })));
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let conf = DenseConf::new(4).with_af(ActivationType::Softmax);
        let mut dense = Dense::<CpuDevice>::new(conf, 2).unwrap();
        let x = TensorHandle::from_vec(&[2, 3], vec![0.5, -1.0, 2.0, 0.0, 0.3, 0.1], Backend::Cpu).unwrap();
        let y = dense.activation(false, &x).unwrap().to_vec();
        for row in y.chunks(4) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn sgd_step_on_known_values() {
        let conf = DenseConf::new(1).with_init(Initializer::Constant(1.0));
        let mut dense = Dense::<CpuDevice>::new(conf, 3).unwrap();
        let x = TensorHandle::from_vec(&[1, 2], vec![1.0, 2.0], Backend::Cpu).unwrap();
        let y = dense.activation(true, &x).unwrap();
        assert_eq!(y.to_vec(), vec![3.0]);

        let g = TensorHandle::from_vec(&[1, 1], vec![1.0], Backend::Cpu).unwrap();
        let dx = dense.update(0.5, &g).unwrap();
        assert_eq!(dx.to_vec(), vec![1.0, 1.0]);
        let params = dense.parameters().unwrap();
        assert_eq!(params[0].to_vec(), vec![0.5, 0.0]);
        assert_eq!(params[1].to_vec(), vec![-0.5]);
    }

    #[test]
    fn gradient_shape_is_checked() {
        let mut dense = Dense::<CpuDevice>::new(DenseConf::new(3), 4).unwrap();
        let x = TensorHandle::ones(&[2, 5], Backend::Cpu).unwrap();
        dense.activation(true, &x).unwrap();
        let g = TensorHandle::ones(&[2, 4], Backend::Cpu).unwrap();
        assert!(matches!(dense.update(0.1, &g), Err(NetError::ShapeMismatch { .. })));
    }
}
