//! Ready-made topologies.
//!
//! Every builder appends to the network it is given, so the caller picks the
//! backend, seed and loss beforehand.

use crate::error::Result;
use crate::graphs::{NeuralNetwork, ResidualBlock, ShortcutMethod};
use crate::nodes::conf::{ActivationType, Conv2dConf, DenseConf, Pooling2dConf};

/// Conv2d -> MaxPooling2d -> Flatten -> Dense.
pub fn small_cnn(network: NeuralNetwork, conv: Conv2dConf, nb_classes: usize) -> Result<NeuralNetwork> {
    network
        .add_layer("Conv2d", Some(conv.into()))?
        .add_layer("MaxPooling2d", None)?
        .add_layer("Flatten", None)?
        .add_layer("Dense", Some(DenseConf::new(nb_classes).into()))
}

/// 18-layer residual network: a strided 7x7 stem, four stages of two blocks
/// each, global average pooling and a softmax classifier.
pub fn resnet18(network: NeuralNetwork, nb_classes: usize) -> Result<NeuralNetwork> {
    let mut network = network
        .add_layer("Conv2d", Some(Conv2dConf::new([64, 7, 7], [2, 2]).into()))?
        .add_layer("MaxPooling2d", Some(Pooling2dConf::new([3, 3]).into()))?;

    for (stage, filters) in [64, 128, 256, 512].into_iter().enumerate() {
        for block in 0..2 {
            let downsample = stage > 0 && block == 0;
            let first_stride = if downsample { [2, 2] } else { [1, 1] };
            let method = if downsample {
                ShortcutMethod::Convolution
            } else {
                ShortcutMethod::SameSize
            };
            let backend = network.target_backend();
            let residual = ResidualBlock::from_kernels(
                network.factory_mut(),
                backend,
                &[[filters, 3, 3], [filters, 3, 3]],
                &[first_stride, [1, 1]],
                method,
            )?;
            network = network.add_graph(residual)?;
        }
    }

    network
        .add_layer("AvgPooling2d", Some(Pooling2dConf::global().into()))?
        .add_layer("Flatten", None)?
        .add_layer(
            "Dense",
            Some(DenseConf::new(nb_classes).with_af(ActivationType::Softmax).into()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphs::Graph;
    use crate::tensor::Shape;

    #[test]
    fn resnet18_on_mnist_shapes() {
        let net = resnet18(NeuralNetwork::new(), 10).unwrap();
        // stem, pool, 8 blocks, pool, flatten, dense
        assert_eq!(net.len(), 13);
        let out = net.output_shape(&Shape::new(&[2, 1, 28, 28]).unwrap()).unwrap();
        assert_eq!(out.dims(), &[2, 10]);
        let out = net.output_shape(&Shape::new(&[1, 3, 224, 224]).unwrap()).unwrap();
        assert_eq!(out.dims(), &[1, 10]);
    }

    #[test]
    fn small_cnn_on_mnist_shapes() {
        let net = small_cnn(NeuralNetwork::new(), Conv2dConf::competitive(3, 0.01), 10).unwrap();
        let out = net.output_shape(&Shape::new(&[20, 1, 28, 28]).unwrap()).unwrap();
        assert_eq!(out.dims(), &[20, 10]);
    }
}
