use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pdsn_core::{
    Backbone, BackboneConfig, BioPdsn, CropConfig, DetectorConfig, Device, DiffMaskConfig, FaceDetector, NetMode,
    PdsnWeights,
};
use pdsn_train::{PairDataset, TrainConfig};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "pdsn", about = "Occlusion-aware pairwise face verification")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a checkpoint into the model and switch it to evaluation mode
    Test {
        #[command(flatten)]
        model: ModelArgs,
        /// Checkpoint to load
        #[arg(short, long)]
        weights_path: PathBuf,
    },
    /// Compare the faces in two images
    Verify {
        /// Source image
        source: PathBuf,
        /// Target image
        target: PathBuf,
        #[command(flatten)]
        model: ModelArgs,
        /// Checkpoint to load; a freshly seeded branch is used without one
        #[arg(short, long)]
        weights_path: Option<PathBuf>,
    },
    /// Write a freshly initialized checkpoint
    Init {
        /// Output checkpoint path
        #[arg(short, long)]
        out: PathBuf,
        /// Crop size as HEIGHT,WIDTH (or C,HEIGHT,WIDTH)
        #[arg(short, long, default_value = "112,96", value_parser = parse_input_size)]
        input_size: (u32, u32),
        /// Initialization seed
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Report the stratified train/validation split of a pair dataset
    Split {
        /// Dataset file (JSON or JSON Lines)
        dataset: PathBuf,
        /// Training config supplying the seed and validation fraction
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// Backbone and pipeline options shared by the model commands.
#[derive(Args)]
struct ModelArgs {
    /// Crop size as HEIGHT,WIDTH (or C,HEIGHT,WIDTH)
    #[arg(short, long, default_value = "112,96", value_parser = parse_input_size)]
    input_size: (u32, u32),
    /// Backbone embedding size
    #[arg(short, long, default_value_t = 512)]
    embedding_size: usize,
    /// Use MobileFaceNet instead of the IR family
    #[arg(short, long)]
    use_mobilefacenet: bool,
    /// IR depth: 50, 100 or 152
    #[arg(short = 'd', long, default_value_t = 50)]
    net_depth: usize,
    /// ir, ir_se or mobilefacenet
    #[arg(short = 'n', long, default_value = "ir_se")]
    net_mode: NetMode,
    /// Maximum embedding distance for a match
    #[arg(long, default_value_t = 0.5)]
    threshold: f32,
    /// Dropout ratio the backbone was trained with
    #[arg(long, default_value_t = 0.6)]
    drop_ratio: f32,
    /// cpu, gpu or cuda:<id>
    #[arg(long, default_value = "cpu")]
    device: Device,
    /// Standardize face crops before embedding
    #[arg(long)]
    transform: bool,
    /// Output pixels of context kept around each face crop
    #[arg(long, default_value_t = 0)]
    margin: u32,
    /// Pick the most confident face instead of the one with the largest box
    #[arg(long)]
    select_most_confident: bool,
    /// Keep every detected face instead of only the selected one
    #[arg(long)]
    keep_all: bool,
}

impl ModelArgs {
    fn backbone_config(&self) -> BackboneConfig {
        BackboneConfig {
            input_height: self.input_size.0 as usize,
            input_width: self.input_size.1 as usize,
            embedding_size: self.embedding_size,
            net_mode: if self.use_mobilefacenet {
                NetMode::MobileFaceNet
            } else {
                self.net_mode
            },
            net_depth: self.net_depth,
            drop_ratio: self.drop_ratio,
            ..BackboneConfig::default()
        }
    }

    fn crop_config(&self) -> CropConfig {
        CropConfig {
            height: self.input_size.0,
            width: self.input_size.1,
            margin: self.margin,
            post_process: self.transform,
            select_largest: !self.select_most_confident,
            keep_all: self.keep_all,
        }
    }
}

/// Parse `H,W` or `C,H,W`.
fn parse_input_size(s: &str) -> Result<(u32, u32), String> {
    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid input size '{s}': {e}"))?;
    match parts.as_slice() {
        [h, w] | [_, h, w] if *h > 0 && *w > 0 => Ok((*h, *w)),
        _ => Err(format!("input size must be HEIGHT,WIDTH or C,HEIGHT,WIDTH, got '{s}'")),
    }
}

fn build_model(args: &ModelArgs, config: &Config) -> Result<BioPdsn> {
    let backbone_config = args.backbone_config();
    backbone_config.validate()?;

    let detector_config = DetectorConfig {
        confidence_threshold: config.detection_threshold,
        min_face_size: config.min_face_size,
        ..DetectorConfig::default()
    };
    let detector = FaceDetector::load(&config.detector_model, args.device, config.intra_threads, detector_config)
        .context("loading face detector")?;

    let backbone_path = config.backbone_model_path(&backbone_config.model_file_name());
    let backbone = Backbone::load(&backbone_path, args.device, config.intra_threads, backbone_config)
        .context("loading backbone")?;

    Ok(BioPdsn::new(detector, backbone, args.crop_config(), 42))
}

fn open_rgb(path: &Path) -> Result<image::RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("opening {}", path.display()))?
        .to_rgb8())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Test { model, weights_path } => {
            let config = Config::from_env();
            let mut pdsn = build_model(&model, &config)?;
            pdsn.weights
                .load_checkpoint(&weights_path)
                .with_context(|| format!("loading {}", weights_path.display()))?;
            pdsn.eval();
            tracing::info!(device = %model.device, threshold = model.threshold, "model ready");
            println!("Model loaded successfully from {}", weights_path.display());
        }
        Commands::Verify {
            source,
            target,
            model,
            weights_path,
        } => {
            let config = Config::from_env();
            let source_image = open_rgb(&source)?;
            let target_image = open_rgb(&target)?;

            let mut pdsn = build_model(&model, &config)?;
            match &weights_path {
                Some(path) => pdsn
                    .weights
                    .load_checkpoint(path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => tracing::warn!("no checkpoint given, using freshly initialized branch weights"),
            }
            pdsn.eval();

            let verdict = pdsn.verify(&source_image, &target_image, model.threshold)?;
            println!("{}", serde_json::to_string_pretty(&verdict)?);
        }
        Commands::Init { out, input_size, seed } => {
            let backbone = BackboneConfig {
                input_height: input_size.0 as usize,
                input_width: input_size.1 as usize,
                ..BackboneConfig::default()
            };
            backbone.validate()?;
            let (channels, height, width) = backbone.feature_shape();
            let weights = PdsnWeights::new(DiffMaskConfig {
                channels,
                height,
                width,
                seed,
                ..DiffMaskConfig::default()
            });
            let digest = weights.save_checkpoint(&out)?;
            println!("Wrote {} (sha256 {digest})", out.display());
        }
        Commands::Split { dataset, config } => {
            let train_config = match &config {
                Some(path) => TrainConfig::from_file(path)?,
                None => TrainConfig::default(),
            };
            let data = PairDataset::load(&dataset)?;
            let labels = data.labels();
            let split = pdsn_train::stratified_split(&labels, train_config.val_fraction, train_config.seed);
            let report = serde_json::json!({
                "train": split.train.len(),
                "val": split.val.len(),
                "seed": train_config.seed,
                "classes": split.class_counts(&labels),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input_size() {
        assert_eq!(parse_input_size("112,96"), Ok((112, 96)));
        assert_eq!(parse_input_size("3, 112, 112"), Ok((112, 112)));
        assert!(parse_input_size("112").is_err());
        assert!(parse_input_size("112,x").is_err());
        assert!(parse_input_size("0,96").is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["pdsn", "test", "-w", "model.safetensors"]).unwrap();
        let Commands::Test { model, weights_path } = cli.command else {
            panic!("expected test command");
        };
        assert_eq!(weights_path, PathBuf::from("model.safetensors"));
        let backbone = model.backbone_config();
        assert_eq!(backbone.net_mode, NetMode::IrSe);
        assert_eq!(backbone.net_depth, 50);
        assert_eq!(backbone.feature_shape(), (512, 7, 6));
        assert_eq!(model.device, Device::Cpu);
        assert!(!model.crop_config().post_process);
        assert!(model.crop_config().select_largest);
        assert_eq!(model.crop_config().margin, 0);
    }

    #[test]
    fn test_face_selection_flags() {
        let cli = Cli::try_parse_from([
            "pdsn",
            "test",
            "-w",
            "m.safetensors",
            "--select-most-confident",
            "--margin",
            "20",
        ])
        .unwrap();
        let Commands::Test { model, .. } = cli.command else {
            panic!("expected test command");
        };
        let crop = model.crop_config();
        assert!(!crop.select_largest);
        assert_eq!(crop.margin, 20);
    }

    #[test]
    fn test_mobilefacenet_flag_overrides_mode() {
        let cli = Cli::try_parse_from(["pdsn", "test", "-w", "m.safetensors", "-u", "--device", "gpu", "--transform"]).unwrap();
        let Commands::Test { model, .. } = cli.command else {
            panic!("expected test command");
        };
        assert_eq!(model.backbone_config().net_mode, NetMode::MobileFaceNet);
        assert_eq!(model.device, Device::Cuda { device_id: 0 });
        assert!(model.crop_config().post_process);
    }

    #[test]
    fn test_invalid_net_mode_rejected() {
        assert!(Cli::try_parse_from(["pdsn", "test", "-w", "m.safetensors", "-n", "resnet"]).is_err());
    }
}
