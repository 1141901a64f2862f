//! Arrayfire kernels.
//!
//! A row-major `[d0, .., dn]` buffer is stored under the reversed arrayfire dims
//! `[dn, .., d0]`, so NCHW activations are `[W, H, C, N]` on the device, dense
//! activations are `[F, N]` and convolution weights reshape to `[K, F]` with
//! `K = (c * kh + i) * kw + j`, the same unrolled order as the host im2col.

use arrayfire::{self as af, Array, Dim4, MatProp};

use super::{ConvGeometry, Device, PoolGeometry};
use crate::error::{NetError, Result};
use crate::nodes::conf::ActivationType;
use crate::tensor::{Backend, Shape, Storage, TensorHandle};

pub struct GpuDevice;

fn dims_of(d: &[usize]) -> Dim4 {
    let mut dims = [1u64; 4];
    for (slot, &x) in dims.iter_mut().zip(d.iter().rev()) {
        *slot = x as u64;
    }
    Dim4::new(&dims)
}

fn dim4(a: u64, b: u64, c: u64, d: u64) -> Dim4 {
    Dim4::new(&[a, b, c, d])
}

/// `[OW, OH, F, N]` to `[F, L * N]`.
fn maps_to_rows(y: &Array<f32>, g: &ConvGeometry) -> Array<f32> {
    let (l, f, n) = (g.positions() as u64, g.filters as u64, g.batch as u64);
    let y = af::moddims(y, dim4(l, f, n, 1));
    let y = af::reorder_v2(&y, 1, 0, Some(vec![2]));
    af::moddims(&y, dim4(f, l * n, 1, 1))
}

/// Inverse of [`maps_to_rows`].
fn rows_to_maps(y: &Array<f32>, g: &ConvGeometry) -> Array<f32> {
    let (l, f, n) = (g.positions() as u64, g.filters as u64, g.batch as u64);
    let y = af::moddims(y, dim4(f, l, n, 1));
    let y = af::reorder_v2(&y, 1, 0, Some(vec![2]));
    af::moddims(&y, dims_of(&g.output_dims()))
}

fn weight_rows(w: &Array<f32>, g: &ConvGeometry) -> Array<f32> {
    af::moddims(w, dim4(g.patch_len() as u64, g.filters as u64, 1, 1))
}

fn pool_cols(x: &Array<f32>, g: &PoolGeometry) -> Array<f32> {
    af::unwrap(
        x,
        g.window[1] as i64,
        g.window[0] as i64,
        g.stride[1] as i64,
        g.stride[0] as i64,
        0,
        0,
        true,
    )
}

fn pool_wrap(cols: &Array<f32>, g: &PoolGeometry) -> Array<f32> {
    af::wrap(
        cols,
        g.width as i64,
        g.height as i64,
        g.window[1] as i64,
        g.window[0] as i64,
        g.stride[1] as i64,
        g.stride[0] as i64,
        0,
        0,
        true,
    )
}

impl Device for GpuDevice {
    const BACKEND: Backend = Backend::Gpu;
    type Array = Array<f32>;
    /// Position of the maximum inside each unrolled window.
    type Indices = Array<u32>;

    fn upload(shape: &Shape, data: &[f32]) -> Result<Array<f32>> {
        Ok(Array::new(data, dims_of(shape.dims())))
    }

    fn download(a: &Array<f32>) -> Vec<f32> {
        let mut values = vec![0.0f32; a.elements()];
        a.host(&mut values);
        values
    }

    fn view(h: &TensorHandle) -> Result<&Array<f32>> {
        match h.storage() {
            Storage::Gpu(a) => Ok(a),
            Storage::Cpu(_) => Err(NetError::BackendMismatch {
                expected: Backend::Gpu,
                found: Backend::Cpu,
            }),
        }
    }

    fn handle(shape: Shape, a: Array<f32>) -> TensorHandle {
        TensorHandle::from_storage(shape, Storage::Gpu(a))
    }

    fn add(a: &Array<f32>, b: &Array<f32>) -> Array<f32> {
        af::add(a, b, false)
    }

    fn mul(a: &Array<f32>, b: &Array<f32>) -> Array<f32> {
        af::mul(a, b, false)
    }

    fn axpy(y: &mut Array<f32>, alpha: f32, x: &Array<f32>) {
        let step = af::mul(x, &alpha, true);
        *y = af::add(&*y, &step, false);
        y.eval();
    }

    fn reshape(a: &Array<f32>, shape: &Shape) -> Result<Array<f32>> {
        Ok(af::moddims(a, dims_of(shape.dims())))
    }

    fn im2col(x: &Array<f32>, g: &ConvGeometry) -> Result<Array<f32>> {
        let cols = af::unwrap(
            x,
            g.kernel[1] as i64,
            g.kernel[0] as i64,
            g.stride[1] as i64,
            g.stride[0] as i64,
            g.padding[1] as i64,
            g.padding[0] as i64,
            true,
        );
        // [kw*kh, L, C, N] -> [kw*kh, C, L, N] -> [K, L*N]
        let cols = af::reorder_v2(&cols, 0, 2, Some(vec![1, 3]));
        Ok(af::moddims(
            &cols,
            dim4(g.patch_len() as u64, (g.positions() * g.batch) as u64, 1, 1),
        ))
    }

    fn conv_forward(cols: &Array<f32>, w: &Array<f32>, b: &Array<f32>, g: &ConvGeometry) -> Result<Array<f32>> {
        let w = weight_rows(w, g);
        let y = af::matmul(&w, cols, MatProp::TRANS, MatProp::NONE);
        let b = af::moddims(b, dim4(g.filters as u64, 1, 1, 1));
        let y = af::add(&y, &b, true);
        Ok(rows_to_maps(&y, g))
    }

    fn conv_backward(
        cols: &Array<f32>,
        w: &Array<f32>,
        grad: &Array<f32>,
        g: &ConvGeometry,
    ) -> Result<(Array<f32>, Array<f32>, Array<f32>)> {
        let rows = maps_to_rows(grad, g);
        let w = weight_rows(w, g);
        let dw = af::matmul(cols, &rows, MatProp::NONE, MatProp::TRANS);
        let dcols = af::matmul(&w, &rows, MatProp::NONE, MatProp::NONE);
        let db = af::sum(&rows, 1);

        let area = (g.kernel[0] * g.kernel[1]) as u64;
        let dcols = af::moddims(
            &dcols,
            dim4(area, g.channels as u64, g.positions() as u64, g.batch as u64),
        );
        let dcols = af::reorder_v2(&dcols, 0, 2, Some(vec![1, 3]));
        let dx = af::wrap(
            &dcols,
            g.width as i64,
            g.height as i64,
            g.kernel[1] as i64,
            g.kernel[0] as i64,
            g.stride[1] as i64,
            g.stride[0] as i64,
            g.padding[1] as i64,
            g.padding[0] as i64,
            true,
        );
        Ok((
            dx,
            af::moddims(&dw, dims_of(&g.weight_dims())),
            af::moddims(&db, dim4(g.filters as u64, 1, 1, 1)),
        ))
    }

    fn kwta(y: &Array<f32>, k: usize, g: &ConvGeometry) -> Result<(Array<f32>, Array<f32>)> {
        let l = g.positions() as u64;
        let k = k.clamp(1, g.positions());
        let maps = af::moddims(y, dim4(l, (g.filters * g.batch) as u64, 1, 1));
        let sorted = af::sort(&maps, 0, false);
        let threshold = af::row(&sorted, (k - 1) as i64);
        let mask: Array<f32> = af::ge(&maps, &threshold, true).cast();
        let out = af::mul(&maps, &mask, false);
        let dims = y.dims();
        Ok((af::moddims(&out, dims), af::moddims(&mask, dims)))
    }

    fn cpca(cols: &Array<f32>, y: &Array<f32>, w: &Array<f32>, g: &ConvGeometry) -> Result<Array<f32>> {
        let rows = maps_to_rows(y, g);
        let w = weight_rows(w, g);
        let hebb = af::matmul(cols, &rows, MatProp::NONE, MatProp::TRANS);
        let activity = af::moddims(&af::sum(&rows, 1), dim4(1, g.filters as u64, 1, 1));
        let decay = af::mul(&w, &activity, true);
        let samples = (g.batch * g.positions()) as f32;
        let delta = af::div(&af::sub(&hebb, &decay, false), &samples, true);
        Ok(af::moddims(&delta, dims_of(&g.weight_dims())))
    }

    fn dense_forward(x: &Array<f32>, w: &Array<f32>, b: &Array<f32>) -> Result<Array<f32>> {
        let y = af::matmul(w, x, MatProp::NONE, MatProp::NONE);
        Ok(af::add(&y, b, true))
    }

    fn dense_backward(
        x: &Array<f32>,
        w: &Array<f32>,
        grad: &Array<f32>,
    ) -> Result<(Array<f32>, Array<f32>, Array<f32>)> {
        let dx = af::matmul(w, grad, MatProp::TRANS, MatProp::NONE);
        let dw = af::matmul(grad, x, MatProp::NONE, MatProp::TRANS);
        let db = af::sum(grad, 1);
        let outputs = db.dims()[0];
        Ok((dx, dw, af::moddims(&db, dim4(outputs, 1, 1, 1))))
    }

    fn activate(a: &Array<f32>, kind: ActivationType) -> Result<Array<f32>> {
        Ok(match kind {
            ActivationType::Identity => a.copy(),
            ActivationType::Relu => af::maxof(a, &0.0f32, true),
            ActivationType::Sigmoid => af::sigmoid(a),
            ActivationType::Softmax => {
                let shifted = af::sub(a, &af::max(a, 0), true);
                let exp = af::exp(&shifted);
                af::div(&exp, &af::sum(&exp, 0), true)
            }
        })
    }

    fn activate_backward(y: &Array<f32>, grad: &Array<f32>, kind: ActivationType) -> Result<Array<f32>> {
        Ok(match kind {
            ActivationType::Identity => grad.copy(),
            ActivationType::Relu => {
                let gate: Array<f32> = af::gt(y, &0.0f32, true).cast();
                af::mul(&gate, grad, false)
            }
            ActivationType::Sigmoid => {
                let slope = af::mul(y, &af::sub(&1.0f32, y, true), false);
                af::mul(&slope, grad, false)
            }
            ActivationType::Softmax => {
                let dot = af::sum(&af::mul(grad, y, false), 0);
                af::mul(y, &af::sub(grad, &dot, true), false)
            }
        })
    }

    fn max_pool(x: &Array<f32>, g: &PoolGeometry) -> Result<(Array<f32>, Array<u32>)> {
        let cols = pool_cols(x, g);
        let (values, idx) = af::imax(&cols, 0);
        Ok((af::moddims(&values, dims_of(&g.output_dims())), idx))
    }

    fn max_pool_backward(grad: &Array<f32>, idx: &Array<u32>, g: &PoolGeometry) -> Result<Array<f32>> {
        let area = g.area() as u64;
        let dims = idx.dims();
        let spread = dim4(area, dims[1], dims[2], dims[3]);
        let tiles = dim4(area, 1, 1, 1);
        let hit: Array<f32> = af::eq(&af::range::<u32>(spread, 0), &af::tile(idx, tiles), false).cast();
        let grad = af::moddims(grad, dim4(1, dims[1], dims[2], dims[3]));
        let cols = af::mul(&hit, &af::tile(&grad, tiles), false);
        Ok(pool_wrap(&cols, g))
    }

    fn avg_pool(x: &Array<f32>, g: &PoolGeometry) -> Result<Array<f32>> {
        let cols = pool_cols(x, g);
        Ok(af::moddims(&af::mean(&cols, 0), dims_of(&g.output_dims())))
    }

    fn avg_pool_backward(grad: &Array<f32>, g: &PoolGeometry) -> Result<Array<f32>> {
        let area = g.area() as u64;
        let positions = g.positions() as u64;
        let grad = af::moddims(grad, dim4(1, positions, g.channels as u64, g.batch as u64));
        let share = af::div(&grad, &(g.area() as f32), true);
        let cols = af::tile(&share, dim4(area, 1, 1, 1));
        Ok(pool_wrap(&cols, g))
    }
}
