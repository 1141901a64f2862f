//! Benchmarks between the CPU and GPU backends.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use tracing::error;
use tracing_subscriber::EnvFilter;

use cnn_lib::datasets::DataSetsFactory;
use cnn_lib::graphs::{FitParams, NeuralNetwork};
use cnn_lib::nodes::conf::{Conv2dConf, DenseConf, LayerConf};
use cnn_lib::{zoo, Backend, Config, Node, NodeKind, NodesFactory, TensorHandle};

const AFTER_HELP: &str = "\
Layer tests:
   1  Conv2d
   2  Conv2d + kWTA
   3  Conv2d + CPCA
   4  Conv2d + CPCA + kWTA
   5  Dense
   6  MaxPooling2d

Network tests (layer 1 -> MaxPooling2d -> Flatten -> Dense):
   1  Conv2d
   2  Conv2d + kWTA
   3  Conv2d + CPCA
   4  Conv2d + CPCA + kWTA
   5  ResNet18

Example:
   cpu_vs_gpu -t=layer:1 -d=cpu -n=100";

#[derive(Parser)]
#[command(name = "cpu_vs_gpu", about = "Run benchmarks between CPU and GPU", after_help = AFTER_HELP)]
struct Cli {
    /// Type of test and its id, i.e. layer:<id> or network:<id>
    #[arg(short = 't', long = "test")]
    test: TestId,

    /// Type of device, i.e. cpu or gpu
    #[arg(short = 'd', long = "device")]
    device: Backend,

    /// Number of iterations to run, any positive integer
    #[arg(short = 'n', long = "iterations", value_parser = clap::value_parser!(u64).range(1..))]
    iterations: u64,

    /// ron file overriding the dataset and training parameters
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
struct BenchConfig {
    #[derivative(Default(value = "\"Mnist\".to_string()"))]
    dataset: String,
    #[derivative(Default(value = "20"))]
    dataset_batch_size: usize,
    /// `iterations` is always taken from the command line.
    fit: FitParams,
    #[derivative(Default(value = "0x5eed"))]
    seed: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LayerTest {
    Conv2d,
    Conv2dKwta,
    Conv2dCpca,
    Conv2dCpcaKwta,
    Dense,
    MaxPooling2d,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NetworkTest {
    Conv2d,
    Conv2dKwta,
    Conv2dCpca,
    Conv2dCpcaKwta,
    ResNet18,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TestId {
    Layer(LayerTest),
    Network(NetworkTest),
}

impl FromStr for TestId {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s.split_once(':').ok_or_else(|| format!("expected <type>:<id>, got `{s}`"))?;
        let id: u32 = id.parse().map_err(|_| format!("`{id}` is not a test id"))?;
        let test = match (kind, id) {
            ("layer", 1) => TestId::Layer(LayerTest::Conv2d),
            ("layer", 2) => TestId::Layer(LayerTest::Conv2dKwta),
            ("layer", 3) => TestId::Layer(LayerTest::Conv2dCpca),
            ("layer", 4) => TestId::Layer(LayerTest::Conv2dCpcaKwta),
            ("layer", 5) => TestId::Layer(LayerTest::Dense),
            ("layer", 6) => TestId::Layer(LayerTest::MaxPooling2d),
            ("network", 1) => TestId::Network(NetworkTest::Conv2d),
            ("network", 2) => TestId::Network(NetworkTest::Conv2dKwta),
            ("network", 3) => TestId::Network(NetworkTest::Conv2dCpca),
            ("network", 4) => TestId::Network(NetworkTest::Conv2dCpcaKwta),
            ("network", 5) => TestId::Network(NetworkTest::ResNet18),
            _ => return Err(format!("no test `{s}`")),
        };
        Ok(test)
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, id) = match self {
            TestId::Layer(t) => ("layer", *t as u32 + 1),
            TestId::Network(t) => ("network", *t as u32 + 1),
        };
        write!(f, "{kind}:{id}")
    }
}

impl LayerTest {
    fn describe(self) -> &'static str {
        match self {
            LayerTest::Conv2d => "Conv2d",
            LayerTest::Conv2dKwta => "Conv2d with kWTA",
            LayerTest::Conv2dCpca => "Conv2d with CPCA",
            LayerTest::Conv2dCpcaKwta => "Conv2d with kWTA and CPCA",
            LayerTest::Dense => "Dense",
            LayerTest::MaxPooling2d => "MaxPooling2d",
        }
    }

    /// Node under test and the shape of its ones input.
    fn node(self) -> (NodeKind, Option<LayerConf>, Vec<usize>) {
        let image = vec![10, 1, 28, 28];
        match self {
            LayerTest::Conv2d => (NodeKind::Conv2d, None, image),
            LayerTest::Conv2dKwta => (NodeKind::Conv2d, Some(Conv2dConf::competitive(3, 0.0).into()), image),
            LayerTest::Conv2dCpca => (NodeKind::Conv2d, Some(Conv2dConf::competitive(0, 0.01).into()), image),
            LayerTest::Conv2dCpcaKwta => (NodeKind::Conv2d, Some(Conv2dConf::competitive(3, 0.01).into()), image),
            LayerTest::Dense => (NodeKind::Dense, Some(DenseConf::new(10).into()), vec![10, 784]),
            LayerTest::MaxPooling2d => (NodeKind::MaxPooling2d, None, image),
        }
    }
}

impl NetworkTest {
    fn describe(self) -> &'static str {
        match self {
            NetworkTest::Conv2d => "Conv2d -> MaxPooling2d -> Flatten -> Dense",
            NetworkTest::Conv2dKwta => "Conv2d with kWTA -> MaxPooling2d -> Flatten -> Dense",
            NetworkTest::Conv2dCpca => "Conv2d with CPCA -> MaxPooling2d -> Flatten -> Dense",
            NetworkTest::Conv2dCpcaKwta => "Conv2d with kWTA and CPCA -> MaxPooling2d -> Flatten -> Dense",
            NetworkTest::ResNet18 => "ResNet18",
        }
    }

    fn build(self, network: NeuralNetwork) -> cnn_lib::Result<NeuralNetwork> {
        match self {
            NetworkTest::Conv2d => zoo::small_cnn(network, Conv2dConf::default(), 10),
            NetworkTest::Conv2dKwta => zoo::small_cnn(network, Conv2dConf::competitive(3, 0.0), 10),
            NetworkTest::Conv2dCpca => zoo::small_cnn(network, Conv2dConf::competitive(0, 0.01), 10),
            NetworkTest::Conv2dCpcaKwta => zoo::small_cnn(network, Conv2dConf::competitive(3, 0.01), 10),
            NetworkTest::ResNet18 => zoo::resnet18(network, 10),
        }
    }
}

fn load_bench_config(path: Option<&Path>) -> anyhow::Result<BenchConfig> {
    let mut config = BenchConfig::default();
    if let Some(path) = path {
        let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        config.load_config(&text)?;
    }
    Ok(config)
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1e3
}

fn benchmark_layer(mut node: Box<dyn Node>, dims: &[usize], iterations: usize) -> anyhow::Result<()> {
    let x = TensorHandle::ones(dims, node.backend())?;
    let start = Instant::now();
    for _ in 0..iterations {
        let y = node.activation(true, &x)?;
        node.update(0.01, &y)?;
    }
    println!("Training of node conducted in: {:.3}ms", elapsed_ms(start));
    Ok(())
}

fn benchmark_network(mut network: NeuralNetwork, config: &BenchConfig, iterations: usize) -> anyhow::Result<()> {
    let mut data = DataSetsFactory::create(&config.dataset, config.dataset_batch_size)?;
    let params = FitParams {
        iterations,
        ..config.fit.clone()
    };
    let start = Instant::now();
    network.fit_with(data.as_mut(), &params)?;
    println!("Training of network conducted in: {:.3}ms", elapsed_ms(start));

    let eval = network.evaluate(data.as_mut())?;
    println!("Evaluation: {eval}");
    Ok(())
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = load_bench_config(cli.config.as_deref())?;
    let iterations = cli.iterations as usize;
    let mut factory = NodesFactory::with_seed(config.seed);
    match cli.test {
        TestId::Layer(test) => {
            println!("Node type: {}.", test.describe());
            let (kind, conf, dims) = test.node();
            let node = factory.build(kind, cli.device, conf)?;
            benchmark_layer(node, &dims, iterations)
        }
        TestId::Network(test) => {
            println!("Network: {}.", test.describe());
            factory.force_backend(Some(cli.device));
            let network = test.build(NeuralNetwork::with_factory(factory))?;
            benchmark_network(network, &config, iterations)
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            eprintln!("{e}");
            let _ = Cli::command().print_long_help();
            std::process::exit(1);
        }
    };

    println!(
        "Start {} on {} for {} iterations.",
        cli.test, cli.device, cli.iterations
    );
    if let Err(e) = run(&cli) {
        error!("{e:#}");
        println!("Benchmark failed.");
        std::process::exit(1);
    }
    println!("Done.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_closed() {
        assert_eq!("layer:6".parse::<TestId>().unwrap(), TestId::Layer(LayerTest::MaxPooling2d));
        assert_eq!("network:5".parse::<TestId>().unwrap(), TestId::Network(NetworkTest::ResNet18));
        assert!("layer:7".parse::<TestId>().is_err());
        assert!("network:0".parse::<TestId>().is_err());
        assert!("graph:1".parse::<TestId>().is_err());
        assert!("layer".parse::<TestId>().is_err());
        assert_eq!(TestId::Layer(LayerTest::Dense).to_string(), "layer:5");
    }

    #[test]
    fn cli_parses_equals_syntax() {
        let cli = Cli::try_parse_from(["cpu_vs_gpu", "-t=layer:1", "-d=cpu", "-n=100"]).unwrap();
        assert_eq!(cli.test, TestId::Layer(LayerTest::Conv2d));
        assert_eq!(cli.device, Backend::Cpu);
        assert_eq!(cli.iterations, 100);
        assert!(Cli::try_parse_from(["cpu_vs_gpu", "-t=layer:1", "-d=tpu", "-n=100"]).is_err());
        assert!(Cli::try_parse_from(["cpu_vs_gpu", "-t=layer:1", "-d=cpu", "-n=0"]).is_err());
        assert!(Cli::try_parse_from(["cpu_vs_gpu", "-t=layer:1", "-d=cpu"]).is_err());
    }

    #[test]
    fn bench_config_defaults_and_ron() {
        let config = BenchConfig::default();
        assert_eq!(config.dataset, "Mnist");
        assert_eq!(config.dataset_batch_size, 20);
        assert_eq!(config.fit.batch_size, 100);

        let mut config = BenchConfig::default();
        config
            .load_config(
                "(dataset: \"Synthetic\", dataset_batch_size: 10, seed: 1, \
                 fit: (learning_rate: 0.1, iterations: 1, batch_size: 5, loss: SquaredError))",
            )
            .unwrap();
        assert_eq!(config.dataset, "Synthetic");
    }

    #[test]
    fn layer_benchmarks_run_on_cpu() {
        let mut factory = NodesFactory::new();
        for id in 1..=6 {
            let TestId::Layer(test) = format!("layer:{id}").parse::<TestId>().unwrap() else {
                unreachable!()
            };
            let (kind, conf, dims) = test.node();
            let node = factory.build(kind, Backend::Cpu, conf).unwrap();
            benchmark_layer(node, &dims, 1).unwrap();
        }
    }

    #[test]
    fn network_benchmark_on_synthetic_data() {
        let config = BenchConfig {
            dataset: "Synthetic".into(),
            dataset_batch_size: 10,
            ..Default::default()
        };
        let network = NetworkTest::Conv2dCpcaKwta
            .build(NeuralNetwork::new())
            .unwrap();
        benchmark_network(network, &config, 2).unwrap();
    }
}
