//! Per-kind layer configurations. Immutable once handed to the factory.

use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::backend::init::Initializer;
use crate::error::{NetError, Result};

/// Closed set of activation functions a node can apply to its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ActivationType {
    #[default]
    #[serde(alias = "None")]
    Identity,
    Relu,
    Sigmoid,
    /// Normalises over the feature axis, dense layers only.
    Softmax,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
pub struct Conv2dConf {
    #[derivative(Default(value = "8"))]
    pub filters: usize,
    #[derivative(Default(value = "[3, 3]"))]
    pub kernel: [usize; 2],
    #[derivative(Default(value = "[1, 1]"))]
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    /// k-winners-take-all count per filter map, 0 disables it.
    pub k: usize,
    /// CPCA learning rate, 0 disables it.
    pub ratio: f64,
    pub af: ActivationType,
    pub init: Initializer,
}

impl Conv2dConf {
    /// `shape` is `[filters, kernel_h, kernel_w]`.
    pub fn new(shape: [usize; 3], stride: [usize; 2]) -> Self {
        Conv2dConf {
            filters: shape[0],
            kernel: [shape[1], shape[2]],
            stride,
            ..Default::default()
        }
    }

    /// Default convolution with kWTA (`k`) and CPCA (`ratio`) settings.
    pub fn competitive(k: usize, ratio: f64) -> Self {
        Conv2dConf {
            k,
            ratio,
            ..Default::default()
        }
    }

    pub fn with_padding(mut self, padding: [usize; 2]) -> Self {
        self.padding = padding;
        self
    }

    /// Pads so that a unit stride keeps the spatial size.
    pub fn same_padding(mut self) -> Self {
        self.padding = [self.kernel[0] / 2, self.kernel[1] / 2];
        self
    }

    pub fn with_af(mut self, af: ActivationType) -> Self {
        self.af = af;
        self
    }

    pub fn with_init(mut self, init: Initializer) -> Self {
        self.init = init;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.filters == 0 || self.kernel.contains(&0) || self.stride.contains(&0) {
            return Err(NetError::InvalidConfig(format!(
                "Conv2d needs positive filters, kernel and stride, got {self:?}"
            )));
        }
        if self.af == ActivationType::Softmax {
            return Err(NetError::InvalidConfig("Conv2d does not support softmax".into()));
        }
        if !self.ratio.is_finite() || self.ratio < 0.0 {
            return Err(NetError::InvalidConfig(format!("CPCA ratio {} is not usable", self.ratio)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
pub struct DenseConf {
    #[derivative(Default(value = "10"))]
    pub outputs: usize,
    pub af: ActivationType,
    pub init: Initializer,
}

impl DenseConf {
    pub fn new(outputs: usize) -> Self {
        DenseConf {
            outputs,
            ..Default::default()
        }
    }

    pub fn with_af(mut self, af: ActivationType) -> Self {
        self.af = af;
        self
    }

    pub fn with_init(mut self, init: Initializer) -> Self {
        self.init = init;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.outputs == 0 {
            return Err(NetError::InvalidConfig("Dense needs at least one output".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
pub struct Pooling2dConf {
    #[derivative(Default(value = "[2, 2]"))]
    pub kernel: [usize; 2],
    /// Defaults to the kernel, i.e. non-overlapping windows.
    pub stride: Option<[usize; 2]>,
    /// One window covering the whole spatial extent of the input.
    pub global: bool,
}

impl Pooling2dConf {
    pub fn new(kernel: [usize; 2]) -> Self {
        Pooling2dConf {
            kernel,
            ..Default::default()
        }
    }

    pub fn global() -> Self {
        Pooling2dConf {
            global: true,
            ..Default::default()
        }
    }

    pub fn with_stride(mut self, stride: [usize; 2]) -> Self {
        self.stride = Some(stride);
        self
    }

    /// Window and stride for an input of `height` x `width`.
    pub fn window(&self, height: usize, width: usize) -> ([usize; 2], [usize; 2]) {
        if self.global {
            ([height, width], [height, width])
        } else {
            (self.kernel, self.stride.unwrap_or(self.kernel))
        }
    }

    pub fn validate(&self) -> Result<()> {
        let stride = self.stride.unwrap_or(self.kernel);
        if !self.global && (self.kernel.contains(&0) || stride.contains(&0)) {
            return Err(NetError::InvalidConfig(format!(
                "pooling needs a positive window and stride, got {self:?}"
            )));
        }
        Ok(())
    }
}

/// Configuration accepted by the factory, one variant per parameterised kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LayerConf {
    Conv2d(Conv2dConf),
    Dense(DenseConf),
    Pooling2d(Pooling2dConf),
}

impl From<Conv2dConf> for LayerConf {
    fn from(c: Conv2dConf) -> Self {
        LayerConf::Conv2d(c)
    }
}

impl From<DenseConf> for LayerConf {
    fn from(c: DenseConf) -> Self {
        LayerConf::Dense(c)
    }
}

impl From<Pooling2dConf> for LayerConf {
    fn from(c: Pooling2dConf) -> Self {
        LayerConf::Pooling2d(c)
    }
}
