//! Kernel sets, one per backend.
//!
//! Every node is written once against [`Device`]; the factory picks the
//! implementation. Buffers follow one convention on both sides: the logical
//! row-major layout of the handle's shape. Arrayfire is column-major, so the GPU
//! side stores the same bytes under the reversed dimensions, which makes a
//! host round trip a plain copy.

use crate::error::{NetError, Result};
use crate::nodes::conf::ActivationType;
use crate::tensor::{Backend, Shape, TensorHandle};

mod cpu;
#[cfg(feature = "gpu")]
mod gpu;
pub mod init;

pub use cpu::CpuDevice;
#[cfg(feature = "gpu")]
pub use gpu::GpuDevice;

/// Tensor primitives needed by the nodes.
///
/// Conventions shared by all implementations:
/// * convolution weights are `[filters, channels, kernel_h, kernel_w]`,
/// * dense weights are `[inputs, outputs]`,
/// * biases are `[outputs]`,
/// * `im2col` output is opaque to callers and only fed back into this trait.
pub trait Device: 'static {
    const BACKEND: Backend;
    type Array: Clone + 'static;
    /// Argmax bookkeeping of max pooling.
    type Indices: 'static;

    fn upload(shape: &Shape, data: &[f32]) -> Result<Self::Array>;
    fn download(a: &Self::Array) -> Vec<f32>;

    /// Borrows the buffer of `h`, failing when `h` lives on another backend.
    fn view(h: &TensorHandle) -> Result<&Self::Array>;
    fn handle(shape: Shape, a: Self::Array) -> TensorHandle;

    fn add(a: &Self::Array, b: &Self::Array) -> Self::Array;
    fn mul(a: &Self::Array, b: &Self::Array) -> Self::Array;
    /// `y += alpha * x`
    fn axpy(y: &mut Self::Array, alpha: f32, x: &Self::Array);
    fn reshape(a: &Self::Array, shape: &Shape) -> Result<Self::Array>;

    fn im2col(x: &Self::Array, g: &ConvGeometry) -> Result<Self::Array>;
    fn conv_forward(cols: &Self::Array, w: &Self::Array, b: &Self::Array, g: &ConvGeometry) -> Result<Self::Array>;
    /// Returns `(dx, dw, db)`.
    fn conv_backward(
        cols: &Self::Array,
        w: &Self::Array,
        grad: &Self::Array,
        g: &ConvGeometry,
    ) -> Result<(Self::Array, Self::Array, Self::Array)>;
    /// Keeps, per sample and filter map, the values at or above the k-th largest.
    /// Returns the sparse output and the 0/1 mask.
    fn kwta(y: &Self::Array, k: usize, g: &ConvGeometry) -> Result<(Self::Array, Self::Array)>;
    /// Competitive weight change `(sum_p y_fp x_p - (sum_p y_fp) w_f) / P`, unscaled.
    fn cpca(cols: &Self::Array, y: &Self::Array, w: &Self::Array, g: &ConvGeometry) -> Result<Self::Array>;

    fn dense_forward(x: &Self::Array, w: &Self::Array, b: &Self::Array) -> Result<Self::Array>;
    /// Returns `(dx, dw, db)`.
    fn dense_backward(
        x: &Self::Array,
        w: &Self::Array,
        grad: &Self::Array,
    ) -> Result<(Self::Array, Self::Array, Self::Array)>;

    /// Softmax normalises over the trailing (feature) axis of a `[N, F]` buffer.
    fn activate(a: &Self::Array, af: ActivationType) -> Result<Self::Array>;
    /// Gradient through the activation given its output `y`.
    fn activate_backward(y: &Self::Array, grad: &Self::Array, af: ActivationType) -> Result<Self::Array>;

    fn max_pool(x: &Self::Array, g: &PoolGeometry) -> Result<(Self::Array, Self::Indices)>;
    fn max_pool_backward(grad: &Self::Array, idx: &Self::Indices, g: &PoolGeometry) -> Result<Self::Array>;
    fn avg_pool(x: &Self::Array, g: &PoolGeometry) -> Result<Self::Array>;
    fn avg_pool_backward(grad: &Self::Array, g: &PoolGeometry) -> Result<Self::Array>;
}

/// Sizes of one convolution over a `[N, C, H, W]` input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub filters: usize,
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub out_height: usize,
    pub out_width: usize,
}

impl ConvGeometry {
    pub fn new(
        input: &Shape,
        filters: usize,
        kernel: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Self> {
        if input.rank() != 4 {
            return Err(NetError::mismatch("Conv2d", "[batch, channels, height, width]", input));
        }
        let (h, w) = (input[2] + 2 * padding[0], input[3] + 2 * padding[1]);
        if kernel[0] > h || kernel[1] > w {
            return Err(NetError::mismatch(
                "Conv2d",
                format!("spatial dims of at least {}x{} after padding", kernel[0], kernel[1]),
                input,
            ));
        }
        Ok(ConvGeometry {
            batch: input[0],
            channels: input[1],
            height: input[2],
            width: input[3],
            filters,
            kernel,
            stride,
            padding,
            out_height: (h - kernel[0]) / stride[0] + 1,
            out_width: (w - kernel[1]) / stride[1] + 1,
        })
    }

    /// Length of one unrolled receptive field.
    pub fn patch_len(&self) -> usize {
        self.channels * self.kernel[0] * self.kernel[1]
    }

    /// Output positions per map.
    pub fn positions(&self) -> usize {
        self.out_height * self.out_width
    }

    pub fn weight_dims(&self) -> [usize; 4] {
        [self.filters, self.channels, self.kernel[0], self.kernel[1]]
    }

    pub fn input_dims(&self) -> [usize; 4] {
        [self.batch, self.channels, self.height, self.width]
    }

    pub fn output_dims(&self) -> [usize; 4] {
        [self.batch, self.filters, self.out_height, self.out_width]
    }
}

/// Sizes of one pooling pass over a `[N, C, H, W]` input. Incomplete windows at
/// the border are dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolGeometry {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub window: [usize; 2],
    pub stride: [usize; 2],
    pub out_height: usize,
    pub out_width: usize,
}

impl PoolGeometry {
    pub fn new(input: &Shape, window: [usize; 2], stride: [usize; 2]) -> Result<Self> {
        if input.rank() != 4 {
            return Err(NetError::mismatch("pooling", "[batch, channels, height, width]", input));
        }
        if window[0] > input[2] || window[1] > input[3] {
            return Err(NetError::mismatch(
                "pooling",
                format!("spatial dims of at least {}x{}", window[0], window[1]),
                input,
            ));
        }
        Ok(PoolGeometry {
            batch: input[0],
            channels: input[1],
            height: input[2],
            width: input[3],
            window,
            stride,
            out_height: (input[2] - window[0]) / stride[0] + 1,
            out_width: (input[3] - window[1]) / stride[1] + 1,
        })
    }

    pub fn area(&self) -> usize {
        self.window[0] * self.window[1]
    }

    pub fn positions(&self) -> usize {
        self.out_height * self.out_width
    }

    pub fn input_dims(&self) -> [usize; 4] {
        [self.batch, self.channels, self.height, self.width]
    }

    pub fn output_dims(&self) -> [usize; 4] {
        [self.batch, self.channels, self.out_height, self.out_width]
    }
}
