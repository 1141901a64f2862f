//! Single computational units and the factory building them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::backend::init::Initializer;
use crate::backend::{CpuDevice, Device};
#[cfg(feature = "gpu")]
use crate::backend::GpuDevice;
use crate::error::{NetError, Result};
use crate::tensor::{Backend, Shape, TensorHandle};

pub mod conf;
mod conv2d;
mod dense;
mod flatten;
mod pooling;

pub use conv2d::Conv2d;
pub use dense::Dense;
pub use flatten::Flatten;
pub use pooling::{PoolMode, Pooling};

use conf::{Conv2dConf, DenseConf, LayerConf, Pooling2dConf};

/// A layer of a graph.
///
/// `activation` in training mode records what the next `update` consumes. An
/// inference-mode activation discards any recorded state, so only the most
/// recent training pass can ever be updated.
pub trait Node {
    fn kind(&self) -> NodeKind;
    fn backend(&self) -> Backend;

    /// Shape produced for an input of shape `input`, without touching any buffer.
    fn output_shape(&self, input: &Shape) -> Result<Shape>;

    fn activation(&mut self, training: bool, x: &TensorHandle) -> Result<TensorHandle>;

    /// Applies `w -= learning_rate * dL/dw` to the owned parameters and returns
    /// the gradient with respect to the input of the last training activation.
    fn update(&mut self, learning_rate: f64, grad: &TensorHandle) -> Result<TensorHandle>;

    /// Host copies of the learnable parameters, empty before the first activation.
    fn parameters(&self) -> Result<Vec<TensorHandle>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Conv2d,
    Dense,
    MaxPooling2d,
    AvgPooling2d,
    Flatten,
}

impl NodeKind {
    pub fn name(self) -> &'static str {
        match self {
            NodeKind::Conv2d => "Conv2d",
            NodeKind::Dense => "Dense",
            NodeKind::MaxPooling2d => "MaxPooling2d",
            NodeKind::AvgPooling2d => "AvgPooling2d",
            NodeKind::Flatten => "Flatten",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NodeKind {
    type Err = NetError;
    fn from_str(s: &str) -> Result<Self> {
        [
            NodeKind::Conv2d,
            NodeKind::Dense,
            NodeKind::MaxPooling2d,
            NodeKind::AvgPooling2d,
            NodeKind::Flatten,
        ]
        .into_iter()
        .find(|k| k.name() == s)
        .ok_or_else(|| NetError::UnsupportedLayer(s.to_string()))
    }
}

/// A learnable buffer on the node's device.
pub(crate) struct Param<D: Device> {
    pub shape: Shape,
    pub value: D::Array,
}

impl<D: Device> Param<D> {
    pub fn init(dims: &[usize], init: Initializer, fan_in: usize, fan_out: usize, seed: u64) -> Result<Self> {
        let shape = Shape::new(dims)?;
        let values = init.init(shape.elements(), fan_in, fan_out, seed);
        let value = D::upload(&shape, &values)?;
        Ok(Param { shape, value })
    }

    pub fn zeros(dims: &[usize]) -> Result<Self> {
        Self::init(dims, Initializer::Zeros, 1, 1, 0)
    }

    /// Gradient step.
    pub fn step(&mut self, learning_rate: f64, grad: &D::Array) {
        D::axpy(&mut self.value, -(learning_rate as f32), grad);
    }

    pub fn to_host(&self) -> Result<TensorHandle> {
        TensorHandle::from_vec(self.shape.dims(), D::download(&self.value), Backend::Cpu)
    }
}

/// Fails unless `found` is exactly `expected`.
pub(crate) fn expect_shape(context: &str, expected: &Shape, found: &Shape) -> Result<()> {
    if expected != found {
        return Err(NetError::mismatch(context, expected, found));
    }
    Ok(())
}

const DEFAULT_SEED: u64 = 0x5eed;

/// Builds nodes for a backend.
///
/// The forced backend overrides whatever backend callers request. Every created
/// node gets its own seed derived from the factory seed, so two factories with
/// the same seed build networks with identical initial parameters.
#[derive(Debug, Clone)]
pub struct NodesFactory {
    forced: Option<Backend>,
    seed: u64,
    created: u64,
}

impl Default for NodesFactory {
    fn default() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }
}

impl NodesFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(seed: u64) -> Self {
        NodesFactory {
            forced: None,
            seed,
            created: 0,
        }
    }

    /// `None` restores per-call backend selection.
    pub fn force_backend(&mut self, backend: Option<Backend>) {
        self.forced = backend;
    }

    pub fn forced_backend(&self) -> Option<Backend> {
        self.forced
    }

    /// String front end of [`NodesFactory::build`].
    pub fn create(&mut self, kind: &str, backend: &str, conf: Option<LayerConf>) -> Result<Box<dyn Node>> {
        let kind = kind.parse()?;
        let backend = backend.parse()?;
        self.build(kind, backend, conf)
    }

    pub fn build(&mut self, kind: NodeKind, backend: Backend, conf: Option<LayerConf>) -> Result<Box<dyn Node>> {
        let backend = self.forced.unwrap_or(backend);
        let seed = self.seed.wrapping_add(self.created.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        let node = match backend {
            Backend::Cpu => make::<CpuDevice>(kind, conf, seed)?,
            #[cfg(feature = "gpu")]
            Backend::Gpu => make::<GpuDevice>(kind, conf, seed)?,
            #[cfg(not(feature = "gpu"))]
            Backend::Gpu => {
                return Err(NetError::UnsupportedBackend(
                    "gpu (built without the `gpu` feature)".into(),
                ))
            }
        };
        self.created += 1;
        tracing::trace!(%kind, %backend, seed, "created node");
        Ok(node)
    }

    /// Conv2d with a concrete conf, used by residual blocks.
    pub fn conv2d(&mut self, backend: Backend, conf: Conv2dConf) -> Result<Box<dyn Node>> {
        self.build(NodeKind::Conv2d, backend, Some(conf.into()))
    }
}

fn make<D: Device>(kind: NodeKind, conf: Option<LayerConf>, seed: u64) -> Result<Box<dyn Node>> {
    let node: Box<dyn Node> = match (kind, conf) {
        (NodeKind::Conv2d, None) => Box::new(Conv2d::<D>::new(Conv2dConf::default(), seed)?),
        (NodeKind::Conv2d, Some(LayerConf::Conv2d(c))) => Box::new(Conv2d::<D>::new(c, seed)?),
        (NodeKind::Dense, None) => Box::new(Dense::<D>::new(DenseConf::default(), seed)?),
        (NodeKind::Dense, Some(LayerConf::Dense(c))) => Box::new(Dense::<D>::new(c, seed)?),
        (NodeKind::MaxPooling2d, None) => Box::new(Pooling::<D>::new(PoolMode::Max, Pooling2dConf::default())?),
        (NodeKind::MaxPooling2d, Some(LayerConf::Pooling2d(c))) => Box::new(Pooling::<D>::new(PoolMode::Max, c)?),
        (NodeKind::AvgPooling2d, None) => Box::new(Pooling::<D>::new(PoolMode::Avg, Pooling2dConf::default())?),
        (NodeKind::AvgPooling2d, Some(LayerConf::Pooling2d(c))) => Box::new(Pooling::<D>::new(PoolMode::Avg, c)?),
        (NodeKind::Flatten, None) => Box::new(Flatten::<D>::new()),
        (kind, Some(conf)) => {
            return Err(NetError::InvalidConfig(format!("{kind} cannot be built from {conf:?}")));
        }
    };
    Ok(node)
}
