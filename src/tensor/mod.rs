//! Backend-tagged tensor handles.
//!
//! A [`TensorHandle`] exclusively owns its buffer. Moving data between backends
//! is always an explicit copy through [`TensorHandle::to_backend`]; operations
//! never transfer implicitly.

use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

mod shape;

pub use shape::{Shape, MAX_RANK};

use crate::backend::{CpuDevice, Device};
#[cfg(feature = "gpu")]
use crate::backend::GpuDevice;
use crate::error::{NetError, Result};

/// Execution target of a node and of the tensors it consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Backend {
    #[default]
    Cpu,
    Gpu,
}

impl Backend {
    /// Whether this build can execute on the backend.
    pub fn is_available(self) -> bool {
        match self {
            Backend::Cpu => true,
            Backend::Gpu => cfg!(feature = "gpu"),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Backend::Cpu => "cpu",
            Backend::Gpu => "gpu",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = NetError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Backend::Cpu),
            "gpu" => Ok(Backend::Gpu),
            _ => Err(NetError::UnsupportedBackend(s.to_string())),
        }
    }
}

pub(crate) enum Storage {
    Cpu(ArrayD<f32>),
    #[cfg(feature = "gpu")]
    Gpu(arrayfire::Array<f32>),
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        match self {
            Storage::Cpu(a) => Storage::Cpu(a.clone()),
            // arrayfire clones share the buffer until written, copy for real
            #[cfg(feature = "gpu")]
            Storage::Gpu(a) => Storage::Gpu(a.copy()),
        }
    }
}

/// Shape metadata plus an exclusively owned buffer on one backend.
#[derive(Clone)]
pub struct TensorHandle {
    shape: Shape,
    storage: Storage,
}

impl TensorHandle {
    /// Zero-filled handle.
    pub fn create(dims: &[usize], backend: Backend) -> Result<Self> {
        let shape = Shape::new(dims)?;
        let data = vec![0.0; shape.elements()];
        Self::upload(shape, &data, backend)
    }

    pub fn ones(dims: &[usize], backend: Backend) -> Result<Self> {
        let shape = Shape::new(dims)?;
        let data = vec![1.0; shape.elements()];
        Self::upload(shape, &data, backend)
    }

    /// Handle over row-major `data`.
    pub fn from_vec(dims: &[usize], data: Vec<f32>, backend: Backend) -> Result<Self> {
        let shape = Shape::new(dims)?;
        if data.len() != shape.elements() {
            return Err(NetError::ShapeError(format!(
                "{} values cannot fill shape {shape}",
                data.len()
            )));
        }
        Self::upload(shape, &data, backend)
    }

    fn upload(shape: Shape, data: &[f32], backend: Backend) -> Result<Self> {
        match backend {
            Backend::Cpu => {
                let a = CpuDevice::upload(&shape, data)?;
                Ok(CpuDevice::handle(shape, a))
            }
            #[cfg(feature = "gpu")]
            Backend::Gpu => {
                let a = GpuDevice::upload(&shape, data)?;
                Ok(GpuDevice::handle(shape, a))
            }
            #[cfg(not(feature = "gpu"))]
            Backend::Gpu => Err(NetError::UnsupportedBackend(
                "gpu (built without the `gpu` feature)".into(),
            )),
        }
    }

    pub(crate) fn from_storage(shape: Shape, storage: Storage) -> Self {
        TensorHandle { shape, storage }
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn backend(&self) -> Backend {
        match self.storage {
            Storage::Cpu(_) => Backend::Cpu,
            #[cfg(feature = "gpu")]
            Storage::Gpu(_) => Backend::Gpu,
        }
    }

    /// Row-major host copy of the values. Synchronous for device buffers.
    pub fn to_vec(&self) -> Vec<f32> {
        match &self.storage {
            Storage::Cpu(a) => CpuDevice::download(a),
            #[cfg(feature = "gpu")]
            Storage::Gpu(a) => GpuDevice::download(a),
        }
    }

    /// Explicit copy onto `backend`. Copies even when the backend does not change.
    pub fn to_backend(&self, backend: Backend) -> Result<Self> {
        if backend == self.backend() {
            return Ok(self.clone());
        }
        Self::upload(self.shape.clone(), &self.to_vec(), backend)
    }

    /// New handle with the same values laid out under `dims`.
    pub fn reshape(&self, dims: &[usize]) -> Result<Self> {
        let shape = Shape::new(dims)?;
        if shape.elements() != self.shape.elements() {
            return Err(NetError::mismatch(
                "reshape",
                format!("{} elements", self.shape.elements()),
                &shape,
            ));
        }
        let storage = match &self.storage {
            Storage::Cpu(a) => Storage::Cpu(CpuDevice::reshape(a, &shape)?),
            #[cfg(feature = "gpu")]
            Storage::Gpu(a) => Storage::Gpu(GpuDevice::reshape(a, &shape)?),
        };
        Ok(TensorHandle { shape, storage })
    }

    /// `a + b`; both operands must agree on shape and backend.
    pub fn elementwise_add(&self, other: &TensorHandle) -> Result<Self> {
        if self.shape != other.shape {
            return Err(NetError::mismatch("elementwise add", &self.shape, &other.shape));
        }
        let storage = match (&self.storage, &other.storage) {
            (Storage::Cpu(a), Storage::Cpu(b)) => Storage::Cpu(CpuDevice::add(a, b)),
            #[cfg(feature = "gpu")]
            (Storage::Gpu(a), Storage::Gpu(b)) => Storage::Gpu(GpuDevice::add(a, b)),
            #[cfg(feature = "gpu")]
            _ => {
                return Err(NetError::BackendMismatch {
                    expected: self.backend(),
                    found: other.backend(),
                })
            }
        };
        Ok(TensorHandle {
            shape: self.shape.clone(),
            storage,
        })
    }

    /// Index of the largest value in each sample of a `[N, F]` handle.
    pub fn argmax_rows(&self) -> Result<Vec<usize>> {
        if self.shape.rank() != 2 {
            return Err(NetError::mismatch("argmax", "[batch, features]", &self.shape));
        }
        let width = self.shape[1];
        let values = self.to_vec();
        Ok(values
            .chunks(width)
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
                    .0
            })
            .collect())
    }

    pub(crate) fn cpu_array(&self) -> Result<ArrayD<f32>> {
        let values = self.to_vec();
        Ok(ArrayD::from_shape_vec(IxDyn(self.shape.dims()), values)?)
    }
}

impl fmt::Debug for TensorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorHandle")
            .field("shape", &self.shape)
            .field("backend", &self.backend())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rejects_non_positive_dims() {
        let err = TensorHandle::create(&[10, 0, 28, 28], Backend::Cpu).unwrap_err();
        assert!(matches!(err, NetError::ShapeError(_)));
    }

    #[test]
    fn from_vec_checks_length() {
        let err = TensorHandle::from_vec(&[2, 2], vec![1.0, 2.0, 3.0], Backend::Cpu).unwrap_err();
        assert!(matches!(err, NetError::ShapeError(_)));
    }

    #[test]
    fn add_requires_identical_shapes() {
        let a = TensorHandle::ones(&[2, 3], Backend::Cpu).unwrap();
        let b = TensorHandle::ones(&[3, 2], Backend::Cpu).unwrap();
        assert!(matches!(a.elementwise_add(&b), Err(NetError::ShapeMismatch { .. })));

        let c = a.elementwise_add(&a).unwrap();
        assert_eq!(c.to_vec(), vec![2.0; 6]);
        // operands are untouched
        assert_eq!(a.to_vec(), vec![1.0; 6]);
    }

    #[test]
    fn reshape_makes_a_new_handle() {
        let a = TensorHandle::from_vec(&[2, 3], (0..6).map(|x| x as f32).collect(), Backend::Cpu).unwrap();
        let b = a.reshape(&[3, 2]).unwrap();
        assert_eq!(a.shape().dims(), &[2, 3]);
        assert_eq!(b.shape().dims(), &[3, 2]);
        assert_eq!(a.to_vec(), b.to_vec());
        assert!(a.reshape(&[4, 2]).is_err());
    }

    #[test]
    fn backend_names() {
        assert_eq!("CPU".parse::<Backend>().unwrap(), Backend::Cpu);
        assert_eq!("gpu".parse::<Backend>().unwrap(), Backend::Gpu);
        assert!(matches!("tpu".parse::<Backend>(), Err(NetError::UnsupportedBackend(_))));
    }

    #[cfg(not(feature = "gpu"))]
    #[test]
    fn gpu_is_unsupported_without_feature() {
        let err = TensorHandle::create(&[2, 2], Backend::Gpu).unwrap_err();
        assert!(matches!(err, NetError::UnsupportedBackend(_)));
    }

    #[test]
    fn argmax_per_row() {
        let a = TensorHandle::from_vec(&[2, 3], vec![0.1, 0.7, 0.2, 0.9, 0.0, 0.1], Backend::Cpu).unwrap();
        assert_eq!(a.argmax_rows().unwrap(), vec![1, 0]);
    }
}
