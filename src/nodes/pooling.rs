use serde::{Deserialize, Serialize};

use crate::backend::{Device, PoolGeometry};
use crate::error::{NetError, Result};
use crate::nodes::conf::Pooling2dConf;
use crate::nodes::{expect_shape, Node, NodeKind};
use crate::tensor::{Backend, Shape, TensorHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolMode {
    /// Gradient goes to the first maximum of each window.
    Max,
    /// Gradient is spread evenly over each window.
    Avg,
}

struct Forward<D: Device> {
    geometry: PoolGeometry,
    argmax: Option<D::Indices>,
}

pub struct Pooling<D: Device> {
    mode: PoolMode,
    conf: Pooling2dConf,
    forward: Option<Forward<D>>,
}

impl<D: Device> Pooling<D> {
    pub fn new(mode: PoolMode, conf: Pooling2dConf) -> Result<Self> {
        conf.validate()?;
        Ok(Pooling {
            mode,
            conf,
            forward: None,
        })
    }

    fn geometry(&self, input: &Shape) -> Result<PoolGeometry> {
        if input.rank() != 4 {
            return Err(NetError::mismatch(self.kind().name(), "[batch, channels, height, width]", input));
        }
        let (window, stride) = self.conf.window(input[2], input[3]);
        PoolGeometry::new(input, window, stride)
    }
}

impl<D: Device> Node for Pooling<D> {
    fn kind(&self) -> NodeKind {
        match self.mode {
            PoolMode::Max => NodeKind::MaxPooling2d,
            PoolMode::Avg => NodeKind::AvgPooling2d,
        }
    }

    fn backend(&self) -> Backend {
        D::BACKEND
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        Shape::new(&self.geometry(input)?.output_dims())
    }

    fn activation(&mut self, training: bool, x: &TensorHandle) -> Result<TensorHandle> {
        self.forward = None;
        let input = D::view(x)?;
        let g = self.geometry(x.shape())?;
        let (y, argmax) = match self.mode {
            PoolMode::Max => {
                let (y, idx) = D::max_pool(input, &g)?;
                (y, Some(idx))
            }
            PoolMode::Avg => (D::avg_pool(input, &g)?, None),
        };
        if training {
            self.forward = Some(Forward { geometry: g, argmax });
        }
        Ok(D::handle(Shape::new(&g.output_dims())?, y))
    }

    fn update(&mut self, _learning_rate: f64, grad: &TensorHandle) -> Result<TensorHandle> {
        let state = self.forward.take().ok_or_else(|| NetError::no_forward_state(self.kind().name()))?;
        let g = state.geometry;
        expect_shape("pooling gradient", &Shape::new(&g.output_dims())?, grad.shape())?;
        let grad = D::view(grad)?;
        let dx = match &state.argmax {
            Some(idx) => D::max_pool_backward(grad, idx, &g)?,
            None => D::avg_pool_backward(grad, &g)?,
        };
        Ok(D::handle(Shape::new(&g.input_dims())?, dx))
    }

    fn parameters(&self) -> Result<Vec<TensorHandle>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuDevice;

    fn handcrafted() -> TensorHandle {
        #[rustfmt::skip]
        let data = vec![
            1.0, 5.0, 2.0, 0.0,
            3.0, 4.0, 8.0, 1.0,
            0.0, 0.0, 7.0, 7.0,
            9.0, 0.0, 7.0, 6.0,
        ];
        TensorHandle::from_vec(&[1, 1, 4, 4], data, Backend::Cpu).unwrap()
    }

    #[test]
    fn max_pool_routes_gradient_to_argmax() {
        let mut pool = Pooling::<CpuDevice>::new(PoolMode::Max, Pooling2dConf::default()).unwrap();
        let y = pool.activation(true, &handcrafted()).unwrap();
        assert_eq!(y.to_vec(), vec![5.0, 8.0, 9.0, 7.0]);

        let g = TensorHandle::from_vec(&[1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0], Backend::Cpu).unwrap();
        let dx = pool.update(0.1, &g).unwrap();
        #[rustfmt::skip]
        let expected = vec![
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 2.0, 0.0,
            0.0, 0.0, 4.0, 0.0,
            3.0, 0.0, 0.0, 0.0,
        ];
        // ties resolve to the first maximum in scan order
        assert_eq!(dx.to_vec(), expected);
    }

    #[test]
    fn avg_pool_spreads_gradient() {
        let mut pool = Pooling::<CpuDevice>::new(PoolMode::Avg, Pooling2dConf::default()).unwrap();
        let y = pool.activation(true, &handcrafted()).unwrap();
        assert_eq!(y.to_vec(), vec![3.25, 2.75, 2.25, 6.75]);

        let g = TensorHandle::from_vec(&[1, 1, 2, 2], vec![4.0, 8.0, 0.0, 2.0], Backend::Cpu).unwrap();
        let dx = pool.update(0.1, &g).unwrap().to_vec();
        assert_eq!(&dx[0..4], &[1.0, 1.0, 2.0, 2.0]);
        assert_eq!(&dx[12..16], &[0.0, 0.0, 0.5, 0.5]);
    }

    #[test]
    fn global_average() {
        let mut pool = Pooling::<CpuDevice>::new(PoolMode::Avg, Pooling2dConf::global()).unwrap();
        let y = pool.activation(false, &handcrafted()).unwrap();
        assert_eq!(y.shape().dims(), &[1, 1, 1, 1]);
        assert_eq!(y.to_vec(), vec![60.0 / 16.0]);
    }

    #[test]
    fn update_without_activation_fails() {
        let mut pool = Pooling::<CpuDevice>::new(PoolMode::Max, Pooling2dConf::default()).unwrap();
        let g = TensorHandle::ones(&[1, 1, 2, 2], Backend::Cpu).unwrap();
        assert!(matches!(pool.update(0.1, &g), Err(NetError::IllegalState(_))));
    }

    #[test]
    fn output_shape_for_mnist() {
        let pool = Pooling::<CpuDevice>::new(PoolMode::Max, Pooling2dConf::default()).unwrap();
        let s = pool.output_shape(&Shape::new(&[10, 8, 26, 26]).unwrap()).unwrap();
        assert_eq!(s.dims(), &[10, 8, 13, 13]);
    }
}
