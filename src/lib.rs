#![recursion_limit = "256"]

mod types;
mod csv_loader;

pub mod model;
pub mod ml;

pub use csv_loader::load_csv;
pub use types::{BirdRecord, ClassTable};

use anyhow::{Context, Result};
use burn::backend::{Autodiff, Wgpu};
use burn::data::dataloader::DataLoaderBuilder;
use burn::data::dataset::Dataset;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::WgpuDevice;
use clap::{Parser, Subcommand};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use ml::{BirdBatcher, BirdDataset, BirdDatasetSmall, BirdItem, InferenceEngine, LabeledDataset};
use model::{AppConfig, DeviceType};

#[derive(Parser)]
#[command(version, about = "Bird species image classifier")]
struct Cli {
    #[arg(short, long, help = "Path of the JSON config file [default: config.json]")]
    config: Option<PathBuf>,
    #[arg(
        short,
        long,
        help = "Write JSON traces to the specified file after truncating or creating it"
    )]
    trace_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Train the model on an image bundle and save the weights")]
    Train {
        #[arg(long, help = "Image bundle (.tar.gz)")]
        bundle: Option<PathBuf>,
        #[arg(long, help = "Directory to write the weights file to")]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        learning_rate: Option<f64>,
        #[arg(long, value_enum)]
        device: Option<DeviceType>,
    },
    #[command(about = "Report the accuracy of saved weights on a CSV dataset or an image bundle")]
    Evaluate {
        model: PathBuf,
        #[arg(help = "CSV (filepath,label,class) or image bundle (.tar.gz)")]
        data: PathBuf,
        #[arg(long, default_value = "val")]
        name: String,
        #[arg(long, value_enum)]
        device: Option<DeviceType>,
    },
    #[command(about = "Predict the label of each image")]
    Predict {
        model: PathBuf,
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[arg(long, value_enum)]
        device: Option<DeviceType>,
    },
    #[command(
        about = "Pack a '<label> - <CLASS>' directory tree into an image bundle",
        long_about = "Pack a directory tree into an image bundle.\n\n\
            SOURCE_DIR must contain one '<label> - <CLASS NAME>' directory per class \
            (e.g. '0 - BALTIMORE ORIOLE/0_35.jpg'). Labels must run from 0 without gaps. \
            Bundles made with 'tar czf' that keep one shared root directory are read as well."
    )]
    Pack { source_dir: PathBuf, output: PathBuf },
    #[command(about = "Print the metadata stored in a weights file")]
    Inspect { model: PathBuf },
    #[command(about = "Write the default configuration to the config path")]
    InitConfig,
}

fn initialize_tracing(trace_file: Option<PathBuf>) -> Result<()> {
    match trace_file {
        Some(trace_file) => {
            let subscriber = tracing_subscriber::fmt()
                .with_writer(File::create(trace_file)?)
                .event_format(tracing_subscriber::fmt::format().without_time().json())
                .with_thread_ids(true)
                .with_max_level(Level::TRACE)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
                )
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

fn run_train<B: AutodiffBackend>(
    config: &AppConfig,
    bundle: &Path,
    output_dir: &Path,
    device: B::Device,
) -> Result<()> {
    let path = ml::train_model::<B>(config, bundle, output_dir, &device)?;
    tracing::info!(path = %path.display(), "training finished");
    Ok(())
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
}

fn evaluate_dataset<B, D>(
    engine: &InferenceEngine<B>,
    dataset: D,
    batch_size: usize,
    name: &str,
    device: B::Device,
) where
    B: Backend,
    D: Dataset<BirdItem> + 'static,
{
    let size = engine.metadata().image_size;
    let loader = DataLoaderBuilder::new(BirdBatcher::<B>::new(device, size))
        .batch_size(batch_size)
        .build(dataset);
    ml::evaluate(engine.model(), &loader, name);
}

fn run_evaluate<B: Backend>(
    config: &AppConfig,
    model_path: &Path,
    data: &Path,
    name: &str,
    device: B::Device,
) -> Result<()> {
    let engine = InferenceEngine::<B>::load(model_path, device.clone())?;
    let batch_size = config.training.batch_size;

    if is_csv(data) {
        let dataset = BirdDatasetSmall::from_csv(data)?;
        check_classes(engine.metadata().classes.as_slice(), dataset.classes());
        evaluate_dataset(&engine, dataset, batch_size, name, device);
    } else {
        let dataset = BirdDataset::from_bundle(data, ml::transform::Compose::new())?;
        check_classes(engine.metadata().classes.as_slice(), dataset.classes());
        evaluate_dataset(&engine, dataset, batch_size, name, device);
    }
    Ok(())
}

fn check_classes(model_classes: &[String], data_classes: &[String]) {
    if model_classes != data_classes {
        tracing::warn!(
            model = model_classes.len(),
            data = data_classes.len(),
            "class names of the data differ from the model's"
        );
    }
}

fn run_predict<B: Backend>(model_path: &Path, images: &[PathBuf], device: B::Device) -> Result<()> {
    let engine = InferenceEngine::<B>::load(model_path, device)?;

    for image in images {
        let label = engine
            .predict(image)
            .with_context(|| format!("Failed to classify {}", image.display()))?;
        let class_name = engine
            .metadata()
            .classes
            .get(label)
            .map(String::as_str)
            .unwrap_or("?");
        println!("{}: {} ({})", image.display(), label, class_name);
    }
    Ok(())
}

fn resolve_device(config: &AppConfig, device: Option<DeviceType>) -> DeviceType {
    let device = device.unwrap_or(config.device_type);
    tracing::info!(%device, "selected device");
    device
}

pub fn cli() -> Result<()> {
    let cli = Cli::parse();

    initialize_tracing(cli.trace_file)?;

    let config_path = cli.config.unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_default(&config_path);

    match cli.command {
        Command::Train {
            bundle,
            output_dir,
            epochs,
            batch_size,
            learning_rate,
            device,
        } => {
            if let Some(epochs) = epochs {
                config.training.num_epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.training.batch_size = batch_size;
            }
            if let Some(learning_rate) = learning_rate {
                config.training.learning_rate = learning_rate;
            }
            config.validate().context("Invalid configuration")?;
            let bundle = bundle.unwrap_or_else(|| config.paths.bundle_path.clone());
            let output_dir = output_dir.unwrap_or_else(|| config.paths.output_dir.clone());
            config.display();

            match resolve_device(&config, device) {
                DeviceType::Wgpu => run_train::<Autodiff<Wgpu>>(
                    &config,
                    &bundle,
                    &output_dir,
                    WgpuDevice::default(),
                ),
                DeviceType::Cpu => run_train::<Autodiff<NdArray>>(
                    &config,
                    &bundle,
                    &output_dir,
                    NdArrayDevice::Cpu,
                ),
            }
        }
        Command::Evaluate {
            model,
            data,
            name,
            device,
        } => {
            config.validate().context("Invalid configuration")?;
            match resolve_device(&config, device) {
                DeviceType::Wgpu => {
                    run_evaluate::<Wgpu>(&config, &model, &data, &name, WgpuDevice::default())
                }
                DeviceType::Cpu => {
                    run_evaluate::<NdArray>(&config, &model, &data, &name, NdArrayDevice::Cpu)
                }
            }
        }
        Command::Predict {
            model,
            images,
            device,
        } => match resolve_device(&config, device) {
            DeviceType::Wgpu => run_predict::<Wgpu>(&model, &images, WgpuDevice::default()),
            DeviceType::Cpu => run_predict::<NdArray>(&model, &images, NdArrayDevice::Cpu),
        },
        Command::Pack { source_dir, output } => {
            let count = ml::bundle::pack_bundle(&source_dir, &output)?;
            println!("Packed {} images into {}", count, output.display());
            Ok(())
        }
        Command::Inspect { model } => {
            let metadata = model::load_metadata(&model)?;
            model::print_metadata_info(&metadata);
            Ok(())
        }
        Command::InitConfig => {
            AppConfig::default()
                .save(&config_path)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
            println!("Wrote default configuration to {}", config_path.display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_train_overrides() {
        let cli = Cli::try_parse_from([
            "bird_classifier",
            "--config",
            "birds.json",
            "train",
            "--epochs",
            "2",
            "--device",
            "cpu",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("birds.json")));
        match cli.command {
            Command::Train { epochs, device, .. } => {
                assert_eq!(epochs, Some(2));
                assert_eq!(device, Some(DeviceType::Cpu));
            }
            _ => panic!("expected train command"),
        }
    }

    #[test]
    fn test_predict_requires_images() {
        assert!(Cli::try_parse_from(["bird_classifier", "predict", "model.tar.gz"]).is_err());
    }

    #[test]
    fn test_is_csv() {
        assert!(is_csv(Path::new("small_data.csv")));
        assert!(is_csv(Path::new("SMALL.CSV")));
        assert!(!is_csv(Path::new("bird_data.tar.gz")));
    }
}
