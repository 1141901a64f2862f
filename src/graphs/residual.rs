use serde::{Deserialize, Serialize};

use super::Graph;
use crate::error::{NetError, Result};
use crate::nodes::conf::{ActivationType, Conv2dConf};
use crate::nodes::{Node, NodesFactory};
use crate::tensor::{Backend, Shape, TensorHandle};

/// How the block input reaches the merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShortcutMethod {
    /// Identity, the main path must preserve the input shape.
    SameSize,
    /// 1x1 projection with the first main stride and the last main filter count.
    Convolution,
}

/// Main path of convolutions plus a shortcut, merged by elementwise addition.
pub struct ResidualBlock {
    backend: Backend,
    method: ShortcutMethod,
    main: Vec<Box<dyn Node>>,
    projection: Option<Box<dyn Node>>,
    /// Input and output shape of the last accepted forward.
    checked: Option<(Shape, Shape)>,
}

impl ResidualBlock {
    pub fn new(
        factory: &mut NodesFactory,
        backend: Backend,
        main: Vec<Conv2dConf>,
        method: ShortcutMethod,
    ) -> Result<Self> {
        let (Some(first), Some(last)) = (main.first(), main.last()) else {
            return Err(NetError::InvalidConfig("a residual block needs at least one convolution".into()));
        };
        let projection = match method {
            ShortcutMethod::SameSize => None,
            ShortcutMethod::Convolution => {
                let conf = Conv2dConf::new([last.filters, 1, 1], first.stride);
                Some(factory.conv2d(backend, conf)?)
            }
        };
        let main = main
            .into_iter()
            .map(|conf| factory.conv2d(backend, conf))
            .collect::<Result<Vec<_>>>()?;
        let backend = main[0].backend();
        Ok(ResidualBlock {
            backend,
            method,
            main,
            projection,
            checked: None,
        })
    }

    /// Block of `[filters, kernel_h, kernel_w]` convolutions with same padding,
    /// ReLU between them and no activation on the last one.
    pub fn from_kernels(
        factory: &mut NodesFactory,
        backend: Backend,
        kernels: &[[usize; 3]],
        strides: &[[usize; 2]],
        method: ShortcutMethod,
    ) -> Result<Self> {
        if kernels.len() != strides.len() {
            return Err(NetError::InvalidConfig(format!(
                "{} kernels but {} strides",
                kernels.len(),
                strides.len()
            )));
        }
        let last = kernels.len().saturating_sub(1);
        let confs = kernels
            .iter()
            .zip(strides)
            .enumerate()
            .map(|(i, (&k, &s))| {
                let af = if i == last { ActivationType::Identity } else { ActivationType::Relu };
                Conv2dConf::new(k, s).same_padding().with_af(af)
            })
            .collect();
        Self::new(factory, backend, confs, method)
    }

    pub fn method(&self) -> ShortcutMethod {
        self.method
    }

    fn check(&mut self, input: &Shape) -> Result<()> {
        if !matches!(&self.checked, Some((i, _)) if i == input) {
            let output = self.output_shape(input)?;
            self.checked = Some((input.clone(), output));
        }
        Ok(())
    }
}

impl Graph for ResidualBlock {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        let mut main = input.clone();
        for node in &self.main {
            main = node.output_shape(&main)?;
        }
        let shortcut = match &self.projection {
            Some(p) => p.output_shape(input)?,
            None => input.clone(),
        };
        if main != shortcut {
            return Err(NetError::mismatch(
                "residual merge",
                format!("main path output {main}"),
                &shortcut,
            ));
        }
        Ok(main)
    }

    fn forward(&mut self, training: bool, x: &TensorHandle) -> Result<TensorHandle> {
        self.check(x.shape())?;
        let mut y = x.clone();
        for node in &mut self.main {
            y = node.activation(training, &y)?;
        }
        let shortcut = match &mut self.projection {
            Some(p) => p.activation(training, x)?,
            None => x.clone(),
        };
        y.elementwise_add(&shortcut)
    }

    fn backward(&mut self, learning_rate: f64, grad: &TensorHandle) -> Result<TensorHandle> {
        let mut main = grad.clone();
        for node in self.main.iter_mut().rev() {
            main = node.update(learning_rate, &main)?;
        }
        let shortcut = match &mut self.projection {
            Some(p) => p.update(learning_rate, grad)?,
            None => grad.clone(),
        };
        main.elementwise_add(&shortcut)
    }

    fn parameters(&self) -> Result<Vec<TensorHandle>> {
        let mut params = Vec::new();
        for node in self.main.iter().chain(self.projection.iter()) {
            params.extend(node.parameters()?);
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::init::Initializer;

    fn block(kernels: &[[usize; 3]], strides: &[[usize; 2]], method: ShortcutMethod) -> ResidualBlock {
        ResidualBlock::from_kernels(&mut NodesFactory::new(), Backend::Cpu, kernels, strides, method).unwrap()
    }

    #[test]
    fn same_size_keeps_the_main_shape() {
        let mut b = block(&[[4, 3, 3], [4, 3, 3]], &[[1, 1], [1, 1]], ShortcutMethod::SameSize);
        let x = TensorHandle::ones(&[2, 4, 8, 8], Backend::Cpu).unwrap();
        let y = b.forward(false, &x).unwrap();
        assert_eq!(y.shape(), x.shape());
    }

    #[test]
    fn convolution_shortcut_follows_strided_main_path() {
        let mut b = block(&[[8, 3, 3], [8, 3, 3]], &[[2, 2], [1, 1]], ShortcutMethod::Convolution);
        let x = TensorHandle::ones(&[2, 4, 8, 8], Backend::Cpu).unwrap();
        let y = b.forward(true, &x).unwrap();
        assert_eq!(y.shape().dims(), &[2, 8, 4, 4]);
        let dx = b.backward(0.01, &y).unwrap();
        assert_eq!(dx.shape(), x.shape());
        // two main convolutions and the projection, each with weights and bias
        assert_eq!(b.parameters().unwrap().len(), 6);
    }

    #[test]
    fn backward_steps_the_projection() {
        let mut b = block(&[[8, 3, 3], [8, 3, 3]], &[[2, 2], [1, 1]], ShortcutMethod::Convolution);
        let x = TensorHandle::ones(&[2, 4, 8, 8], Backend::Cpu).unwrap();
        let y = b.forward(true, &x).unwrap();
        // main weights and biases come first, then the 1x1 projection
        let before = b.parameters().unwrap();
        assert_eq!(before[4].shape().dims(), &[8, 4, 1, 1]);
        b.backward(0.1, &y).unwrap();
        let after = b.parameters().unwrap();
        assert_ne!(before[4].to_vec(), after[4].to_vec());
        assert_ne!(before[5].to_vec(), after[5].to_vec());
    }

    #[test]
    fn mismatched_same_size_fails_on_first_forward() {
        let mut b = block(&[[8, 3, 3]], &[[1, 1]], ShortcutMethod::SameSize);
        let x = TensorHandle::ones(&[1, 4, 6, 6], Backend::Cpu).unwrap();
        assert!(matches!(b.forward(true, &x), Err(NetError::ShapeMismatch { .. })));
        assert!(b.output_shape(x.shape()).is_err());
    }

    #[test]
    fn gradient_is_summed_over_both_paths() {
        let conf = Conv2dConf::new([2, 3, 3], [1, 1]).same_padding().with_init(Initializer::Zeros);
        let mut b = ResidualBlock::new(
            &mut NodesFactory::new(),
            Backend::Cpu,
            vec![conf],
            ShortcutMethod::SameSize,
        )
        .unwrap();
        let x = TensorHandle::from_vec(&[1, 2, 3, 3], (0..18).map(|v| v as f32).collect(), Backend::Cpu).unwrap();
        // zero weights make the main path vanish, leaving the identity
        let y = b.forward(true, &x).unwrap();
        assert_eq!(y.to_vec(), x.to_vec());
        let g = TensorHandle::ones(&[1, 2, 3, 3], Backend::Cpu).unwrap();
        let dx = b.backward(0.0, &g).unwrap();
        assert_eq!(dx.to_vec(), vec![1.0; 18]);
    }

    #[test]
    fn empty_or_uneven_blocks_are_rejected() {
        let mut f = NodesFactory::new();
        assert!(ResidualBlock::new(&mut f, Backend::Cpu, vec![], ShortcutMethod::SameSize).is_err());
        let r = ResidualBlock::from_kernels(&mut f, Backend::Cpu, &[[4, 3, 3]], &[], ShortcutMethod::SameSize);
        assert!(matches!(r, Err(NetError::InvalidConfig(_))));
    }
}
