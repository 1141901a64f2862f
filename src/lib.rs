//! Construction and training of small convolutional graphs on a CPU (ndarray) or
//! GPU (arrayfire, `gpu` feature) backend.
//!
//! ```no_run
//! use cnn_lib::graphs::NeuralNetwork;
//! use cnn_lib::nodes::conf::DenseConf;
//! use cnn_lib::datasets::DataSetsFactory;
//!
//! # fn main() -> cnn_lib::Result<()> {
//! let mut network = NeuralNetwork::new()
//!     .add_layer("Conv2d", None)?
//!     .add_layer("MaxPooling2d", None)?
//!     .add_layer("Flatten", None)?
//!     .add_layer("Dense", Some(DenseConf::new(10).into()))?;
//! let mut data = DataSetsFactory::create("Synthetic", 20)?;
//! network.fit(data.as_mut(), 0.01, 100, 20)?;
//! let eval = network.evaluate(data.as_mut())?;
//! println!("{eval}");
//! # Ok(())
//! # }
//! ```

use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};

pub mod error;
pub mod tensor;
pub mod backend;
pub mod nodes;
pub mod graphs;
pub mod datasets;
pub mod zoo;

pub use error::{NetError, Result};
pub use tensor::{Backend, Shape, TensorHandle};
pub use nodes::{Node, NodeKind, NodesFactory};
pub use graphs::{Graph, NeuralNetwork, ResidualBlock, ShortcutMethod};

/// Anything that round-trips through a ron string.
pub trait Config: Send + Sync {
    fn config(&self) -> anyhow::Result<String>;
    fn load_config(&mut self, config: &str) -> anyhow::Result<()>;
}

impl<T: Serialize + DeserializeOwned + Send + Sync> Config for T {
    fn config(&self) -> anyhow::Result<String> {
        ron::to_string(self).context("Failed to serialize config")
    }
    fn load_config(&mut self, config: &str) -> anyhow::Result<()> {
        *self = ron::from_str(config).context(format!("Failed to load config {}", config))?;
        Ok(())
    }
}
