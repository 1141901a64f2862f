//! Composition of nodes.

use crate::error::Result;
use crate::nodes::Node;
use crate::tensor::{Backend, Shape, TensorHandle};

pub mod loss;
mod network;
mod residual;

pub use loss::Loss;
pub use network::{Evaluation, FitParams, NeuralNetwork};
pub use residual::{ResidualBlock, ShortcutMethod};

/// A sub-network that can stand in for a node.
pub trait Graph {
    fn backend(&self) -> Backend;
    fn output_shape(&self, input: &Shape) -> Result<Shape>;
    fn forward(&mut self, training: bool, x: &TensorHandle) -> Result<TensorHandle>;
    /// Updates every member in reverse order and returns the input gradient.
    fn backward(&mut self, learning_rate: f64, grad: &TensorHandle) -> Result<TensorHandle>;
    fn parameters(&self) -> Result<Vec<TensorHandle>>;
}

/// One entry of a network.
pub enum Layer {
    Node(Box<dyn Node>),
    Graph(Box<dyn Graph>),
}

impl Layer {
    pub fn backend(&self) -> Backend {
        match self {
            Layer::Node(n) => n.backend(),
            Layer::Graph(g) => g.backend(),
        }
    }

    pub fn output_shape(&self, input: &Shape) -> Result<Shape> {
        match self {
            Layer::Node(n) => n.output_shape(input),
            Layer::Graph(g) => g.output_shape(input),
        }
    }

    pub fn forward(&mut self, training: bool, x: &TensorHandle) -> Result<TensorHandle> {
        match self {
            Layer::Node(n) => n.activation(training, x),
            Layer::Graph(g) => g.forward(training, x),
        }
    }

    pub fn backward(&mut self, learning_rate: f64, grad: &TensorHandle) -> Result<TensorHandle> {
        match self {
            Layer::Node(n) => n.update(learning_rate, grad),
            Layer::Graph(g) => g.backward(learning_rate, grad),
        }
    }

    pub fn parameters(&self) -> Result<Vec<TensorHandle>> {
        match self {
            Layer::Node(n) => n.parameters(),
            Layer::Graph(g) => g.parameters(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Layer::Node(n) => n.kind().to_string(),
            Layer::Graph(_) => "Graph".to_string(),
        }
    }
}

impl From<Box<dyn Node>> for Layer {
    fn from(n: Box<dyn Node>) -> Self {
        Layer::Node(n)
    }
}
