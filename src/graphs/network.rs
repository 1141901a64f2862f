use std::fmt;
use std::time::Instant;

use derivative::Derivative;
use serde::{Deserialize, Serialize};

use super::{Graph, Layer, Loss};
use crate::datasets::{Batch, Dataset};
use crate::error::{NetError, Result};
use crate::nodes::conf::LayerConf;
use crate::nodes::{Node, NodesFactory};
use crate::tensor::{Backend, Shape, TensorHandle};

/// Training hyper-parameters, loadable from ron through [`crate::Config`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
pub struct FitParams {
    #[derivative(Default(value = "0.01"))]
    pub learning_rate: f64,
    #[derivative(Default(value = "100"))]
    pub iterations: usize,
    /// Samples drawn from the dataset per iteration.
    #[derivative(Default(value = "100"))]
    pub batch_size: usize,
    pub loss: Loss,
}

/// Result of [`NeuralNetwork::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// Mean loss per sample.
    pub loss: f64,
    /// Fraction of samples whose largest output matches the label.
    pub accuracy: f64,
    pub samples: usize,
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loss {:.5}, accuracy {:.2}% over {} samples",
            self.loss,
            self.accuracy * 100.0,
            self.samples
        )
    }
}

/// Linear chain of layers trained with plain SGD.
pub struct NeuralNetwork {
    factory: NodesFactory,
    backend: Backend,
    loss: Loss,
    layers: Vec<Layer>,
}

impl Default for NeuralNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NeuralNetwork {
    pub fn new() -> Self {
        Self::with_factory(NodesFactory::new())
    }

    pub fn with_factory(factory: NodesFactory) -> Self {
        NeuralNetwork {
            factory,
            backend: Backend::default(),
            loss: Loss::default(),
            layers: Vec::new(),
        }
    }

    /// Backend for layers added from now on, unless the factory forces one.
    pub fn on_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_loss(mut self, loss: Loss) -> Self {
        self.loss = loss;
        self
    }

    pub fn factory_mut(&mut self) -> &mut NodesFactory {
        &mut self.factory
    }

    /// Where inputs are sent before the forward pass.
    pub fn backend(&self) -> Backend {
        self.layers
            .first()
            .map(Layer::backend)
            .unwrap_or_else(|| self.factory.forced_backend().unwrap_or(self.backend))
    }

    /// Backend the next layer will be created on.
    pub fn target_backend(&self) -> Backend {
        self.factory.forced_backend().unwrap_or(self.backend)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn add_layer(mut self, kind: &str, conf: Option<LayerConf>) -> Result<Self> {
        let node = self.factory.build(kind.parse()?, self.backend, conf)?;
        self.push(Layer::Node(node))?;
        Ok(self)
    }

    pub fn add_node(mut self, node: Box<dyn Node>) -> Result<Self> {
        self.push(Layer::Node(node))?;
        Ok(self)
    }

    pub fn add_graph<G: Graph + 'static>(mut self, block: G) -> Result<Self> {
        self.push(Layer::Graph(Box::new(block)))?;
        Ok(self)
    }

    fn push(&mut self, layer: Layer) -> Result<()> {
        let expected = self.target_backend();
        if layer.backend() != expected {
            return Err(NetError::BackendMismatch {
                expected,
                found: layer.backend(),
            });
        }
        self.layers.push(layer);
        Ok(())
    }

    /// Inference-mode forward of a batch living on any backend.
    pub fn predict(&mut self, x: &TensorHandle) -> Result<TensorHandle> {
        let x = x.to_backend(self.backend())?;
        self.forward(false, &x)
    }

    /// Runs `iterations` SGD steps, each on `batch_size` samples pulled from
    /// `dataset`. The dataset is reset whenever it runs dry.
    pub fn fit(
        &mut self,
        dataset: &mut dyn Dataset,
        learning_rate: f64,
        iterations: usize,
        batch_size: usize,
    ) -> Result<()> {
        if batch_size == 0 {
            return Err(NetError::InvalidConfig("fit needs a positive batch size".into()));
        }
        let start = Instant::now();
        let mut last = f32::NAN;
        for iteration in 0..iterations {
            let batch = match dataset.next_batch(batch_size)? {
                Some(batch) => batch,
                None => {
                    dataset.reset();
                    dataset
                        .next_batch(batch_size)?
                        .ok_or_else(|| NetError::IllegalState("dataset yields no samples".into()))?
                }
            };
            if iteration == 0 {
                // fail before any parameter is touched
                self.output_shape(batch.inputs.shape())?;
            }
            last = self.step(learning_rate, &batch)?;
            tracing::debug!(iteration, loss = last, "fit step");
        }
        tracing::info!(
            iterations,
            learning_rate,
            loss = last,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "fit finished"
        );
        Ok(())
    }

    pub fn fit_with(&mut self, dataset: &mut dyn Dataset, params: &FitParams) -> Result<()> {
        self.loss = params.loss;
        self.fit(dataset, params.learning_rate, params.iterations, params.batch_size)
    }

    fn step(&mut self, learning_rate: f64, batch: &Batch) -> Result<f32> {
        let x = batch.inputs.to_backend(self.backend())?;
        let y = self.forward(true, &x)?;
        let (predicted, labels) = (y.cpu_array()?, batch.labels.cpu_array()?);
        let loss = self.loss.value(&predicted, &labels)?;
        let grad = self.loss.gradient(&predicted, &labels)?;
        let grad = TensorHandle::from_vec(y.shape().dims(), grad.into_raw_vec(), Backend::Cpu)?.to_backend(y.backend())?;
        self.backward(learning_rate, &grad)?;
        Ok(loss)
    }

    /// Inference pass over the whole dataset, leaving the dataset rewound.
    pub fn evaluate(&mut self, dataset: &mut dyn Dataset) -> Result<Evaluation> {
        dataset.reset();
        let (mut loss, mut correct, mut samples) = (0.0f64, 0usize, 0usize);
        while let Some(batch) = dataset.next()? {
            let y = self.predict(&batch.inputs)?;
            let (predicted, labels) = (y.cpu_array()?, batch.labels.cpu_array()?);
            let n = y.shape().batch();
            loss += self.loss.value(&predicted, &labels)? as f64 * n as f64;
            correct += y
                .argmax_rows()?
                .iter()
                .zip(batch.labels.argmax_rows()?)
                .filter(|(p, t)| **p == *t)
                .count();
            samples += n;
        }
        dataset.reset();

        let eval = if samples == 0 {
            Evaluation {
                loss: 0.0,
                accuracy: 0.0,
                samples,
            }
        } else {
            Evaluation {
                loss: loss / samples as f64,
                accuracy: correct as f64 / samples as f64,
                samples,
            }
        };
        tracing::info!(loss = eval.loss, accuracy = eval.accuracy, samples, "evaluation");
        Ok(eval)
    }
}

impl Graph for NeuralNetwork {
    fn backend(&self) -> Backend {
        NeuralNetwork::backend(self)
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        let mut shape = input.clone();
        for layer in &self.layers {
            shape = layer.output_shape(&shape).map_err(|e| match e {
                NetError::ShapeMismatch { context, expected, found } => NetError::ShapeMismatch {
                    context: format!("{} ({context})", layer.name()),
                    expected,
                    found,
                },
                e => e,
            })?;
        }
        Ok(shape)
    }

    fn forward(&mut self, training: bool, x: &TensorHandle) -> Result<TensorHandle> {
        let mut y = x.clone();
        for layer in &mut self.layers {
            y = layer.forward(training, &y)?;
        }
        Ok(y)
    }

    fn backward(&mut self, learning_rate: f64, grad: &TensorHandle) -> Result<TensorHandle> {
        let mut g = grad.clone();
        for layer in self.layers.iter_mut().rev() {
            g = layer.backward(learning_rate, &g)?;
        }
        Ok(g)
    }

    fn parameters(&self) -> Result<Vec<TensorHandle>> {
        let mut params = Vec::new();
        for layer in &self.layers {
            params.extend(layer.parameters()?);
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::{Synthetic, SyntheticConf};
    use crate::graphs::{ResidualBlock, ShortcutMethod};
    use crate::nodes::conf::{ActivationType, Conv2dConf, DenseConf};
    use crate::Config;

    fn synthetic(samples: usize, size: usize) -> Synthetic {
        let conf = SyntheticConf {
            samples,
            height: size,
            width: size,
            ..Default::default()
        };
        Synthetic::new(conf, 10).unwrap()
    }

    fn small() -> NeuralNetwork {
        NeuralNetwork::new()
            .add_layer("Conv2d", Some(Conv2dConf::new([4, 3, 3], [1, 1]).into()))
            .unwrap()
            .add_layer("MaxPooling2d", None)
            .unwrap()
            .add_layer("Flatten", None)
            .unwrap()
            .add_layer("Dense", Some(DenseConf::new(2).into()))
            .unwrap()
    }

    #[test]
    fn chain_shapes() {
        let net = small();
        let s = net.output_shape(&Shape::new(&[10, 1, 8, 8]).unwrap()).unwrap();
        assert_eq!(s.dims(), &[10, 2]);
        let err = net.output_shape(&Shape::new(&[10, 64]).unwrap()).unwrap_err();
        assert!(matches!(err, NetError::ShapeMismatch { .. }));
    }

    #[test]
    fn fit_changes_parameters_and_evaluate_does_not() {
        let mut net = small();
        let mut data = synthetic(40, 8);
        net.evaluate(&mut data).unwrap();
        let before: Vec<Vec<f32>> = net.parameters().unwrap().iter().map(|p| p.to_vec()).collect();
        net.evaluate(&mut data).unwrap();
        let unchanged: Vec<Vec<f32>> = net.parameters().unwrap().iter().map(|p| p.to_vec()).collect();
        assert_eq!(before, unchanged);

        net.fit(&mut data, 0.01, 5, 10).unwrap();
        let after: Vec<Vec<f32>> = net.parameters().unwrap().iter().map(|p| p.to_vec()).collect();
        assert_ne!(before, after);

        let eval = net.evaluate(&mut data).unwrap();
        assert_eq!(eval.samples, 40);
        assert!((0.0..=1.0).contains(&eval.accuracy));
        assert!(eval.loss.is_finite());
    }

    #[test]
    fn fit_wraps_around_the_dataset() {
        let mut net = small();
        let mut data = synthetic(20, 8);
        // 7 iterations of 10 samples over 20 samples needs several resets
        net.fit(&mut data, 0.01, 7, 10).unwrap();
    }

    #[test]
    fn fit_rejects_mismatched_labels_and_empty_batches() {
        let mut net = NeuralNetwork::new()
            .add_layer("Flatten", None)
            .unwrap()
            .add_layer("Dense", Some(DenseConf::new(3).into()))
            .unwrap();
        let mut data = synthetic(20, 4);
        // synthetic labels have 2 classes, the network emits 3
        assert!(net.fit(&mut data, 0.01, 1, 10).is_err());
        assert!(net.fit(&mut data, 0.01, 1, 0).is_err());
    }

    #[test]
    fn learns_synthetic_quadrants() {
        let mut net = NeuralNetwork::new()
            .with_loss(Loss::CrossEntropy)
            .add_layer("Flatten", None)
            .unwrap()
            .add_layer("Dense", Some(DenseConf::new(2).with_af(ActivationType::Softmax).into()))
            .unwrap();
        let mut data = synthetic(100, 6);
        net.fit(&mut data, 0.1, 200, 20).unwrap();
        let eval = net.evaluate(&mut data).unwrap();
        assert!(eval.accuracy > 0.9, "{eval}");
    }

    #[test]
    fn residual_blocks_nest() {
        let mut net = NeuralNetwork::new().add_layer("Conv2d", None).unwrap();
        let block = ResidualBlock::from_kernels(
            net.factory_mut(),
            Backend::Cpu,
            &[[8, 3, 3], [8, 3, 3]],
            &[[1, 1], [1, 1]],
            ShortcutMethod::SameSize,
        )
        .unwrap();
        let mut net = net
            .add_graph(block)
            .unwrap()
            .add_layer("AvgPooling2d", None)
            .unwrap()
            .add_layer("Flatten", None)
            .unwrap()
            .add_layer("Dense", Some(DenseConf::new(2).into()))
            .unwrap();
        let mut data = synthetic(20, 8);
        net.fit(&mut data, 0.01, 2, 10).unwrap();
    }

    #[test]
    fn fit_params_from_ron() {
        let mut params = FitParams::default();
        params
            .load_config("(learning_rate: 0.5, iterations: 3, batch_size: 7, loss: CrossEntropy)")
            .unwrap();
        assert_eq!(params.iterations, 3);
        assert_eq!(params.loss, Loss::CrossEntropy);
    }
}
