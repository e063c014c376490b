use anyhow::Context;
use clap::Parser;
use image_predict::{config::{top_k_from_arg, DeviceRequest, PredictConfig}, data::ImageNetPreprocessor, inference::{self, PredictionReport}};
use tracing_subscriber::EnvFilter;

/// Loads a trained classifier checkpoint, predicts the class of an image and prints the most
/// likely classes with their probabilities.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Location of the image to classify
    image_path: String,

    /// Saved model checkpoint (.mpk.gz, .mpk, .json or .bin)
    checkpoint_file: String,

    /// Number of most likely classes to report
    #[arg(long = "top_k", default_value_t = 5, allow_negative_numbers = true)]
    top_k: i64,

    /// JSON file mapping class identifiers to names
    #[arg(long = "category_names_file", default_value = "")]
    category_names_file: String,

    /// "gpu" runs inference on an accelerator when one is available
    #[arg(long, default_value = "cpu")]
    gpu: String,
}

impl Args {
    fn into_config(self) -> image_predict::Result<PredictConfig> {
        let top_k = top_k_from_arg(self.top_k)?;
        let category_names_file = Some(self.category_names_file).filter(|path| !path.is_empty());

        Ok(PredictConfig::new(self.image_path, self.checkpoint_file)
            .with_top_k(top_k)
            .with_category_names_file(category_names_file)
            .with_device(DeviceRequest::from_flag(&self.gpu)))
    }
}

#[cfg(feature = "tch")]
fn run(config: &PredictConfig) -> image_predict::Result<PredictionReport> {
    use burn::backend::{libtorch::LibTorchDevice, LibTorch};
    use image_predict::config::ComputeDevice;

    let accelerator = tch::Cuda::is_available().then_some(0);
    let compute = config.device.resolve(accelerator);
    println!("Device selected  :  {compute}");

    let device = match compute {
        ComputeDevice::Cpu => LibTorchDevice::Cpu,
        ComputeDevice::Cuda(index) => LibTorchDevice::Cuda(index),
    };
    inference::infer::<LibTorch<f32>, _>(config, &ImageNetPreprocessor::default(), &device)
}

#[cfg(not(feature = "tch"))]
fn run(config: &PredictConfig) -> image_predict::Result<PredictionReport> {
    use burn::backend::{ndarray::NdArrayDevice, NdArray};

    // no accelerator backend compiled in without the `tch` feature
    let compute = config.device.resolve(None);
    println!("Device selected  :  {compute}");

    inference::infer::<NdArray<f32>, _>(config, &ImageNetPreprocessor::default(), &NdArrayDevice::Cpu)
}

fn print_report(report: &PredictionReport) {
    println!("\n\n ** prediction - results **");
    for (rank, (entry, name)) in report.rows().enumerate() {
        println!("{:>3}. {:>8.4}%  {:<10} {}", rank + 1, entry.probability * 100.0, entry.class, name);
    }

    if let (Some(best), Some(name)) = (report.prediction.best(), report.names.first()) {
        println!();
        println!("Class name : {name}");
        println!("Class number : {}", best.class);
        println!("Probability : {}\n", best.probability);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Args::parse().into_config().context("invalid arguments")?;
    println!("image_path : {}", config.image_path);

    let report = run(&config).with_context(|| format!("prediction for {} failed", config.image_path))?;
    print_report(&report);

    Ok(())
}
