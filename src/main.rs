#[macro_use]
extern crate serde_derive;

use std::error;
use std::path;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use updown_captioning::caption;
use updown_captioning::config::Config;
use updown_captioning::dataset::{DataLoader, InferenceDataset};
use updown_captioning::device::Device;
use updown_captioning::features::FeatureReader;
use updown_captioning::inference;
use updown_captioning::model::{Captioner, DataParallel, ModelDims, OnnxCaptioner};
use updown_captioning::vocab::Vocabulary;

const USAGE: &'static str = r#"
Run inference using UpDown Captioner on a store of precomputed image features.

Usage:
  updown-captioning --config=<path> --gpu-ids=<id>... --checkpoint-path=<path> --output-path=<path> [--config-override=<kv>...] [--cpu-workers=<n>] [--in-memory]
  updown-captioning (-h | --help)

Options:
  -h --help                 Show this screen.
  --config=<path>           Config file with all configuration parameters.
  --config-override=<kv>    Override one config entry as KEY.PATH=VALUE.
  --gpu-ids=<id>            GPU IDs to use, -1 for CPU. Repeat the flag or
                            separate ids with commas.
  --cpu-workers=<n>         Number of CPU workers for data loading [default: 0].
  --in-memory               Load image features in memory.
  --checkpoint-path=<path>  ONNX checkpoint to run inference with.
  --output-path=<path>      Path to save predictions (as a JSON).
"#;

const SAMPLE: usize = 25;

#[derive(Debug, Deserialize)]
struct Args {
    flag_config: path::PathBuf,
    flag_config_override: Vec<String>,
    flag_gpu_ids: Vec<String>,
    flag_cpu_workers: usize,
    flag_in_memory: bool,
    flag_checkpoint_path: path::PathBuf,
    flag_output_path: path::PathBuf,
}

fn main() -> Result<(), Box<dyn (error::Error)>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Args = docopt::Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    // immutable from here on
    let config = Config::load(&args.flag_config, &args.flag_config_override)?;
    info!("config:\n{}", config);
    info!("{:<20}: {}", "config", args.flag_config.display());
    info!("{:<20}: {:?}", "config_override", args.flag_config_override);
    info!("{:<20}: {:?}", "gpu_ids", args.flag_gpu_ids);
    info!("{:<20}: {}", "cpu_workers", args.flag_cpu_workers);
    info!("{:<20}: {}", "in_memory", args.flag_in_memory);
    info!("{:<20}: {}", "checkpoint_path", args.flag_checkpoint_path.display());
    info!("{:<20}: {}", "output_path", args.flag_output_path.display());
    info!("random seed {} (inference is deterministic)", config.random_seed);

    let devices = Device::from_gpu_ids(&Device::parse_ids(&args.flag_gpu_ids)?)?;

    let vocab = Vocabulary::from_files(&config.data.vocabulary)?;
    let reader = FeatureReader::open(
        &config.data.test_features,
        config.model.image_feature_size,
        args.flag_in_memory,
    )?;
    info!(
        "{} images, up to {} boxes each",
        reader.len(),
        reader.max_boxes()
    );
    let max_boxes = reader.max_boxes();
    let loader = DataLoader::new(
        InferenceDataset::new(reader),
        config.optim.batch_size,
        args.flag_cpu_workers,
    )?;

    let mut captioner = build_captioner(&args.flag_checkpoint_path, &config, &devices, max_boxes)?;
    let progress = ProgressBar::new(loader.len() as u64);
    progress.set_style(
        ProgressStyle::with_template(
            "{spinner} [{elapsed_precise}] [{bar:40}] {pos}/{len} batches ({eta})",
        )?
        .progress_chars("#>-"),
    );
    let predictions = inference::run(&loader, &mut captioner, &vocab, &progress)?;

    for p in caption::sample(&predictions, SAMPLE) {
        println!("{} {}", p.image_id, p.caption);
    }
    caption::write_predictions(&args.flag_output_path, &predictions)?;
    info!(
        "wrote {} predictions to {}",
        predictions.len(),
        args.flag_output_path.display()
    );

    Ok(())
}

fn build_captioner(
    checkpoint: &path::Path,
    config: &Config,
    devices: &[Device],
    max_boxes: usize,
) -> updown_captioning::Result<Box<dyn Captioner>> {
    let replicas = devices.len();
    let dims = ModelDims {
        batch_capacity: (config.optim.batch_size + replicas - 1) / replicas,
        max_boxes,
        feature_size: config.model.image_feature_size,
        max_caption_length: config.data.max_caption_length,
    };
    let checkpoint = checkpoint.to_owned();
    let model = config.model.clone();
    let build = move |device: Device| -> updown_captioning::Result<OnnxCaptioner> {
        info!("loading {} on {}", checkpoint.display(), device);
        OnnxCaptioner::from_onnx(
            &checkpoint,
            &model.input_name,
            &model.output_name,
            &model.backend,
            &device.backend_config(&model.backend_config)?,
            dims,
        )
    };

    if devices.iter().any(|d| *d != Device::Cpu) && !Device::placed_by(&config.model.backend) {
        warn!(
            "backend {} ignores device_id, {} replica(s) will share the CPU",
            config.model.backend, replicas
        );
    }

    if replicas == 1 {
        Ok(Box::new(build(devices[0])?))
    } else {
        Ok(Box::new(DataParallel::new(devices, build)?))
    }
}
