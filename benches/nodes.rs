use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cnn_lib::datasets::{Synthetic, SyntheticConf};
use cnn_lib::graphs::NeuralNetwork;
use cnn_lib::nodes::conf::{Conv2dConf, DenseConf};
use cnn_lib::{zoo, Backend, NodeKind, NodesFactory, TensorHandle};

pub fn node_training(c: &mut Criterion) {
    let mut factory = NodesFactory::new();
    let x = TensorHandle::ones(&[10, 1, 28, 28], Backend::Cpu).unwrap();

    for (name, conf) in [
        ("conv2d", Conv2dConf::default()),
        ("conv2d kwta", Conv2dConf::competitive(3, 0.0)),
        ("conv2d cpca", Conv2dConf::competitive(0, 0.01)),
        ("conv2d kwta cpca", Conv2dConf::competitive(3, 0.01)),
    ] {
        let mut node = factory.conv2d(Backend::Cpu, conf).unwrap();
        c.bench_function(name, |b| {
            b.iter(|| {
                let y = node.activation(true, black_box(&x)).unwrap();
                node.update(0.01, &y).unwrap();
            })
        });
    }

    let mut pool = factory.build(NodeKind::MaxPooling2d, Backend::Cpu, None).unwrap();
    c.bench_function("max pooling", |b| {
        b.iter(|| {
            let y = pool.activation(true, black_box(&x)).unwrap();
            pool.update(0.01, &y).unwrap();
        })
    });

    let flat = TensorHandle::ones(&[10, 784], Backend::Cpu).unwrap();
    let mut dense = factory
        .build(NodeKind::Dense, Backend::Cpu, Some(DenseConf::new(10).into()))
        .unwrap();
    c.bench_function("dense", |b| {
        b.iter(|| {
            let y = dense.activation(true, black_box(&flat)).unwrap();
            dense.update(0.01, &y).unwrap();
        })
    });
}

pub fn network_training(c: &mut Criterion) {
    let conf = SyntheticConf {
        samples: 100,
        classes: 4,
        ..Default::default()
    };
    let mut data = Synthetic::new(conf, 20).unwrap();
    let mut network = zoo::small_cnn(NeuralNetwork::new(), Conv2dConf::competitive(3, 0.01), 4).unwrap();
    c.bench_function("small cnn fit", |b| {
        b.iter(|| network.fit(&mut data, 0.01, 1, 20).unwrap())
    });
}

criterion_group!(benches, node_training, network_training);
criterion_main!(benches);
