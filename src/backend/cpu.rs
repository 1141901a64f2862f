use std::cmp::Ordering;

use ndarray::linalg::general_mat_mul;
use ndarray::prelude::*;
use ndarray::{IxDyn, Zip};

use super::{ConvGeometry, Device, PoolGeometry};
use crate::error::{NetError, Result};
use crate::nodes::conf::ActivationType;
use crate::tensor::{Backend, Shape, Storage, TensorHandle};

/// Host kernels over `ndarray`.
pub struct CpuDevice;

/// Input coordinate read by output coordinate `o` at kernel offset `k`, if it
/// falls inside the unpadded input.
fn source(o: usize, stride: usize, k: usize, pad: usize, len: usize) -> Option<usize> {
    (o * stride + k).checked_sub(pad).filter(|&i| i < len)
}

/// `[N, C, H, W]` to `[N, C*kh*kw, OH*OW]`.
fn im2col(x: &ArrayView4<f32>, g: &ConvGeometry) -> Array3<f32> {
    let [kh, kw] = g.kernel;
    let mut cols = Array3::<f32>::zeros((g.batch, g.patch_len(), g.positions()));
    for n in 0..g.batch {
        for c in 0..g.channels {
            for i in 0..kh {
                for j in 0..kw {
                    let row = (c * kh + i) * kw + j;
                    for oh in 0..g.out_height {
                        let Some(ih) = source(oh, g.stride[0], i, g.padding[0], g.height) else {
                            continue;
                        };
                        for ow in 0..g.out_width {
                            if let Some(iw) = source(ow, g.stride[1], j, g.padding[1], g.width) {
                                cols[[n, row, oh * g.out_width + ow]] = x[[n, c, ih, iw]];
                            }
                        }
                    }
                }
            }
        }
    }
    cols
}

/// Inverse scatter of [`im2col`], overlapping fields accumulate.
fn col2im(cols: &ArrayView3<f32>, g: &ConvGeometry) -> Array4<f32> {
    let [kh, kw] = g.kernel;
    let mut x = Array4::<f32>::zeros(g.input_dims());
    for n in 0..g.batch {
        for c in 0..g.channels {
            for i in 0..kh {
                for j in 0..kw {
                    let row = (c * kh + i) * kw + j;
                    for oh in 0..g.out_height {
                        let Some(ih) = source(oh, g.stride[0], i, g.padding[0], g.height) else {
                            continue;
                        };
                        for ow in 0..g.out_width {
                            if let Some(iw) = source(ow, g.stride[1], j, g.padding[1], g.width) {
                                x[[n, c, ih, iw]] += cols[[n, row, oh * g.out_width + ow]];
                            }
                        }
                    }
                }
            }
        }
    }
    x
}

fn kth_largest(row: ArrayView1<f32>, k: usize) -> f32 {
    let mut values: Vec<f32> = row.iter().copied().collect();
    let (_, kth, _) = values.select_nth_unstable_by(k - 1, |a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    *kth
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

impl Device for CpuDevice {
    const BACKEND: Backend = Backend::Cpu;
    type Array = ArrayD<f32>;
    /// Flat input offsets of the selected cells, in output order.
    type Indices = Vec<usize>;

    fn upload(shape: &Shape, data: &[f32]) -> Result<ArrayD<f32>> {
        Ok(ArrayD::from_shape_vec(IxDyn(shape.dims()), data.to_vec())?)
    }

    fn download(a: &ArrayD<f32>) -> Vec<f32> {
        a.iter().copied().collect()
    }

    fn view(h: &TensorHandle) -> Result<&ArrayD<f32>> {
        match h.storage() {
            Storage::Cpu(a) => Ok(a),
            #[allow(unreachable_patterns)]
            _ => Err(NetError::BackendMismatch {
                expected: Backend::Cpu,
                found: h.backend(),
            }),
        }
    }

    fn handle(shape: Shape, a: ArrayD<f32>) -> TensorHandle {
        debug_assert_eq!(a.shape(), shape.dims());
        TensorHandle::from_storage(shape, Storage::Cpu(a))
    }

    fn add(a: &ArrayD<f32>, b: &ArrayD<f32>) -> ArrayD<f32> {
        a + b
    }

    fn mul(a: &ArrayD<f32>, b: &ArrayD<f32>) -> ArrayD<f32> {
        a * b
    }

    fn axpy(y: &mut ArrayD<f32>, alpha: f32, x: &ArrayD<f32>) {
        y.scaled_add(alpha, x);
    }

    fn reshape(a: &ArrayD<f32>, shape: &Shape) -> Result<ArrayD<f32>> {
        Ok(a.as_standard_layout().into_owned().into_shape(IxDyn(shape.dims()))?)
    }

    fn im2col(x: &ArrayD<f32>, g: &ConvGeometry) -> Result<ArrayD<f32>> {
        let x = x.view().into_dimensionality::<Ix4>()?;
        Ok(im2col(&x, g).into_dyn())
    }

    fn conv_forward(cols: &ArrayD<f32>, w: &ArrayD<f32>, b: &ArrayD<f32>, g: &ConvGeometry) -> Result<ArrayD<f32>> {
        let cols = cols.view().into_dimensionality::<Ix3>()?;
        let w = w.view().into_shape((g.filters, g.patch_len()))?;
        let b = b.view().into_shape((g.filters, 1))?;
        let mut y = Array3::<f32>::zeros((g.batch, g.filters, g.positions()));
        for (mut yn, cn) in y.outer_iter_mut().zip(cols.outer_iter()) {
            general_mat_mul(1.0, &w, &cn, 0.0, &mut yn);
            yn += &b;
        }
        Ok(y.into_shape(IxDyn(&g.output_dims()))?)
    }

    fn conv_backward(
        cols: &ArrayD<f32>,
        w: &ArrayD<f32>,
        grad: &ArrayD<f32>,
        g: &ConvGeometry,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>, ArrayD<f32>)> {
        let cols = cols.view().into_dimensionality::<Ix3>()?;
        let w = w.view().into_shape((g.filters, g.patch_len()))?;
        let grad = grad.as_standard_layout();
        let grad = grad.view().into_shape((g.batch, g.filters, g.positions()))?;

        let mut dw = Array2::<f32>::zeros((g.filters, g.patch_len()));
        let mut dcols = Array3::<f32>::zeros((g.batch, g.patch_len(), g.positions()));
        for ((gn, cn), mut dn) in grad.outer_iter().zip(cols.outer_iter()).zip(dcols.outer_iter_mut()) {
            general_mat_mul(1.0, &gn, &cn.t(), 1.0, &mut dw);
            general_mat_mul(1.0, &w.t(), &gn, 0.0, &mut dn);
        }
        let db = grad.sum_axis(Axis(2)).sum_axis(Axis(0));
        let dx = col2im(&dcols.view(), g);
        Ok((dx.into_dyn(), dw.into_shape(IxDyn(&g.weight_dims()))?, db.into_dyn()))
    }

    fn kwta(y: &ArrayD<f32>, k: usize, g: &ConvGeometry) -> Result<(ArrayD<f32>, ArrayD<f32>)> {
        let k = k.clamp(1, g.positions());
        let mut out = y.as_standard_layout().into_owned();
        let mut mask = ArrayD::<f32>::zeros(out.raw_dim());
        {
            let mut maps = out.view_mut().into_shape((g.batch * g.filters, g.positions()))?;
            let mut masks = mask.view_mut().into_shape((g.batch * g.filters, g.positions()))?;
            for (mut map, mut m) in maps.outer_iter_mut().zip(masks.outer_iter_mut()) {
                let threshold = kth_largest(map.view(), k);
                Zip::from(&mut map).and(&mut m).for_each(|v, m| {
                    if *v >= threshold {
                        *m = 1.0;
                    } else {
                        *v = 0.0;
                    }
                });
            }
        }
        Ok((out, mask))
    }

    fn cpca(cols: &ArrayD<f32>, y: &ArrayD<f32>, w: &ArrayD<f32>, g: &ConvGeometry) -> Result<ArrayD<f32>> {
        let cols = cols.view().into_dimensionality::<Ix3>()?;
        let w = w.view().into_shape((g.filters, g.patch_len()))?;
        let y = y.as_standard_layout();
        let y = y.view().into_shape((g.batch, g.filters, g.positions()))?;

        let mut hebb = Array2::<f32>::zeros((g.filters, g.patch_len()));
        for (yn, cn) in y.outer_iter().zip(cols.outer_iter()) {
            general_mat_mul(1.0, &yn, &cn.t(), 1.0, &mut hebb);
        }
        let activity = y.sum_axis(Axis(2)).sum_axis(Axis(0)).insert_axis(Axis(1));
        let samples = (g.batch * g.positions()) as f32;
        let delta = (hebb - &w * &activity) / samples;
        Ok(delta.into_shape(IxDyn(&g.weight_dims()))?)
    }

    fn dense_forward(x: &ArrayD<f32>, w: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = x.view().into_dimensionality::<Ix2>()?;
        let w = w.view().into_dimensionality::<Ix2>()?;
        let b = b.view().into_dimensionality::<Ix1>()?;
        Ok((x.dot(&w) + &b).into_dyn())
    }

    fn dense_backward(
        x: &ArrayD<f32>,
        w: &ArrayD<f32>,
        grad: &ArrayD<f32>,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>, ArrayD<f32>)> {
        let x = x.view().into_dimensionality::<Ix2>()?;
        let w = w.view().into_dimensionality::<Ix2>()?;
        let grad = grad.view().into_dimensionality::<Ix2>()?;
        let dx = grad.dot(&w.t());
        let dw = x.t().dot(&grad);
        let db = grad.sum_axis(Axis(0));
        Ok((dx.into_dyn(), dw.into_dyn(), db.into_dyn()))
    }

    fn activate(a: &ArrayD<f32>, af: ActivationType) -> Result<ArrayD<f32>> {
        Ok(match af {
            ActivationType::Identity => a.clone(),
            ActivationType::Relu => a.mapv(|v| v.max(0.0)),
            ActivationType::Sigmoid => a.mapv(sigmoid),
            ActivationType::Softmax => {
                let mut out = a.view().into_dimensionality::<Ix2>()?.to_owned();
                for mut row in out.outer_iter_mut() {
                    let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                    row.mapv_inplace(|v| (v - max).exp());
                    let sum = row.sum();
                    row /= sum;
                }
                out.into_dyn()
            }
        })
    }

    fn activate_backward(y: &ArrayD<f32>, grad: &ArrayD<f32>, af: ActivationType) -> Result<ArrayD<f32>> {
        let mut dx = ArrayD::<f32>::zeros(grad.raw_dim());
        match af {
            ActivationType::Identity => dx.assign(grad),
            ActivationType::Relu => Zip::from(&mut dx).and(y).and(grad).for_each(|d, &y, &g| {
                *d = if y > 0.0 { g } else { 0.0 };
            }),
            ActivationType::Sigmoid => Zip::from(&mut dx).and(y).and(grad).for_each(|d, &y, &g| {
                *d = g * y * (1.0 - y);
            }),
            ActivationType::Softmax => {
                let y = y.view().into_dimensionality::<Ix2>()?;
                let grad = grad.view().into_dimensionality::<Ix2>()?;
                let mut d2 = dx.view_mut().into_dimensionality::<Ix2>()?;
                for ((yr, gr), mut dr) in y.outer_iter().zip(grad.outer_iter()).zip(d2.outer_iter_mut()) {
                    let dot = yr.dot(&gr);
                    Zip::from(&mut dr).and(&yr).and(&gr).for_each(|d, &y, &g| {
                        *d = y * (g - dot);
                    });
                }
            }
        }
        Ok(dx)
    }

    fn max_pool(x: &ArrayD<f32>, g: &PoolGeometry) -> Result<(ArrayD<f32>, Vec<usize>)> {
        let x = x.view().into_dimensionality::<Ix4>()?;
        let mut y = Array4::<f32>::zeros(g.output_dims());
        let mut idx = Vec::with_capacity(y.len());
        for ((n, c, oh, ow), out) in y.indexed_iter_mut() {
            let mut best = None::<(usize, f32)>;
            for i in 0..g.window[0] {
                for j in 0..g.window[1] {
                    let (ih, iw) = (oh * g.stride[0] + i, ow * g.stride[1] + j);
                    let v = x[[n, c, ih, iw]];
                    if best.map_or(true, |(_, b)| v > b) {
                        best = Some((((n * g.channels + c) * g.height + ih) * g.width + iw, v));
                    }
                }
            }
            if let Some((at, v)) = best {
                *out = v;
                idx.push(at);
            }
        }
        Ok((y.into_dyn(), idx))
    }

    fn max_pool_backward(grad: &ArrayD<f32>, idx: &Vec<usize>, g: &PoolGeometry) -> Result<ArrayD<f32>> {
        let mut dx = vec![0.0f32; g.input_dims().iter().product()];
        for (&gv, &at) in grad.iter().zip(idx.iter()) {
            dx[at] += gv;
        }
        Ok(ArrayD::from_shape_vec(IxDyn(&g.input_dims()), dx)?)
    }

    fn avg_pool(x: &ArrayD<f32>, g: &PoolGeometry) -> Result<ArrayD<f32>> {
        let x = x.view().into_dimensionality::<Ix4>()?;
        let area = g.area() as f32;
        let mut y = Array4::<f32>::zeros(g.output_dims());
        for ((n, c, oh, ow), out) in y.indexed_iter_mut() {
            let (h0, w0) = (oh * g.stride[0], ow * g.stride[1]);
            let window = x.slice(s![n, c, h0..h0 + g.window[0], w0..w0 + g.window[1]]);
            *out = window.sum() / area;
        }
        Ok(y.into_dyn())
    }

    fn avg_pool_backward(grad: &ArrayD<f32>, g: &PoolGeometry) -> Result<ArrayD<f32>> {
        let grad = grad.view().into_dimensionality::<Ix4>()?;
        let area = g.area() as f32;
        let mut dx = Array4::<f32>::zeros(g.input_dims());
        for ((n, c, oh, ow), &gv) in grad.indexed_iter() {
            let (h0, w0) = (oh * g.stride[0], ow * g.stride[1]);
            dx.slice_mut(s![n, c, h0..h0 + g.window[0], w0..w0 + g.window[1]])
                .mapv_inplace(|d| d + gv / area);
        }
        Ok(dx.into_dyn())
    }
}
