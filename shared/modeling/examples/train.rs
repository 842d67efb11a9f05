use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use itertools::{iproduct, Itertools};
use speedy_core::{OptimizerConfig, RunConfig, SequenceConfig, ValuePathway};
use speedy_data_provider::{load_token_splits, TokenSize, UniformSampler};
use speedy_logging::{logging, LogOutput};
use speedy_modeling::{
    train, AttentionImplementation, MetricsRecorder, MetricsSink, NoopSink, TrainDevice,
    TrainOptions,
};
use std::path::{Path, PathBuf};
use tch::{Device, Kind};
use tracing::{info, warn};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum AttnImpl {
    Eager,
    Sdpa,
}

impl From<AttnImpl> for AttentionImplementation {
    fn from(val: AttnImpl) -> Self {
        match val {
            AttnImpl::Eager => AttentionImplementation::Eager,
            AttnImpl::Sdpa => AttentionImplementation::Sdpa,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Pathway {
    Gated,
    Linear,
}

impl From<Pathway> for ValuePathway {
    fn from(val: Pathway) -> Self {
        match val {
            Pathway::Gated => ValuePathway::Gated,
            Pathway::Linear => ValuePathway::Linear,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum Precision {
    F32,
    Bf16,
}

#[derive(Clone, Copy, Debug)]
enum ModelSize {
    Scale(f64),
    Explicit { depth: usize, width: usize },
}

#[derive(Parser, Debug, Clone)]
struct Args {
    /// Directory of .bin/.npy/.ds token files; files with "val" in the name are held out
    #[arg(long, default_value = "data")]
    data_path: PathBuf,

    #[arg(long, default_value_t = 2)]
    token_size: usize,

    #[arg(long, default_value_t = 50304)]
    vocab_size: usize,

    /// Model scales to sweep; ignored when --depth and --width are given
    #[arg(long, value_delimiter = ',', default_value = "1.0")]
    scale: Vec<f64>,

    #[arg(long, value_delimiter = ',')]
    depth: Vec<usize>,

    #[arg(long, value_delimiter = ',')]
    width: Vec<usize>,

    #[arg(long, value_delimiter = ',', default_value = "1")]
    num_heads: Vec<usize>,

    #[arg(long, value_delimiter = ',', default_value = "gated")]
    value_pathway: Vec<Pathway>,

    /// Number of repeated runs per configuration, each with its own seed
    #[arg(long, default_value_t = 1)]
    runs: u64,

    #[arg(long, default_value_t = 100)]
    seed: u64,

    /// Fraction of the reference GPU token budget to use
    #[arg(long, default_value_t = 1.0)]
    capacity_scalar: f64,

    #[arg(long, default_value_t = 1024)]
    max_sequence_length: usize,

    #[arg(long, default_value_t = 32)]
    initial_sequence_length: usize,

    #[arg(long, default_value_t = 1000)]
    total_steps: u32,

    #[arg(long, default_value_t = 0.25)]
    max_epochs_between_evals: f64,

    #[arg(
        long,
        help = "Device to train on: auto, cpu, mps, cuda, cuda:N",
        default_value = "auto"
    )]
    device: TrainDevice,

    #[arg(long, value_enum, default_value_t = Precision::F32)]
    precision: Precision,

    #[arg(long, value_enum, default_value_t = AttnImpl::Sdpa)]
    attn_implementation: AttnImpl,

    /// Path to write train and eval rows (JSONL format)
    #[arg(long)]
    metrics_output: Option<PathBuf>,

    /// Path to save the trained weights to; suffixed with the run index when sweeping
    #[arg(long)]
    save_weights: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogOutput::Console)]
    log: LogOutput,

    #[arg(long)]
    write_log: Option<PathBuf>,
}

impl Args {
    fn model_sizes(&self) -> Result<Vec<ModelSize>> {
        match (self.depth.is_empty(), self.width.is_empty()) {
            (true, true) => Ok(self.scale.iter().copied().map(ModelSize::Scale).collect()),
            (false, false) => Ok(self
                .depth
                .iter()
                .cartesian_product(&self.width)
                .map(|(&depth, &width)| ModelSize::Explicit { depth, width })
                .collect()),
            _ => bail!("--depth and --width must be given together"),
        }
    }

    fn kind(&self, device: Device) -> Kind {
        match self.precision {
            Precision::F32 => Kind::Float,
            Precision::Bf16 if device == Device::Cpu => {
                warn!("bf16 requested on CPU, training in f32 instead");
                Kind::Float
            }
            Precision::Bf16 => Kind::BFloat16,
        }
    }
}

fn run_config(
    args: &Args,
    size: ModelSize,
    num_heads: usize,
    pathway: Pathway,
    seed: u64,
) -> Result<RunConfig> {
    let builder = RunConfig::builder()
        .num_heads(num_heads)
        .value_pathway(pathway.into())
        .vocab_size(args.vocab_size)
        .max_sequence_length(args.max_sequence_length)
        .capacity_scalar(args.capacity_scalar)
        .seed(seed)
        .sequence(SequenceConfig {
            initial_length: args.initial_sequence_length,
            ..Default::default()
        })
        .optimizer(OptimizerConfig {
            total_steps: args.total_steps,
            max_epochs_between_evals: args.max_epochs_between_evals,
            ..Default::default()
        });
    let builder = match size {
        ModelSize::Scale(scale) => builder.scale(scale),
        ModelSize::Explicit { depth, width } => builder.depth(Some(depth)).width(Some(width)),
    };
    Ok(builder.build()?)
}

fn weights_path(base: &Path, index: usize, total: usize) -> PathBuf {
    if total == 1 {
        return base.to_path_buf();
    }
    let stem = base.file_stem().unwrap_or_default().to_string_lossy();
    let name = match base.extension() {
        Some(ext) => format!("{stem}-{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{index}"),
    };
    base.with_file_name(name)
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging()
        .with_output(args.log)
        .with_log_file(args.write_log.clone())
        .init()?;

    if !args.device.is_available() {
        bail!("device {} is not available", args.device);
    }
    let device = args.device.device();
    let kind = args.kind(device);
    let options = TrainOptions {
        device,
        kind,
        attn_implementation: args.attn_implementation.into(),
    };

    let token_size = TokenSize::from_bytes(args.token_size)
        .with_context(|| format!("unsupported token size {}", args.token_size))?;
    let splits = load_token_splits(&args.data_path, token_size)
        .with_context(|| "Failed to load token data")?;

    let sweep = iproduct!(
        args.model_sizes()?,
        args.num_heads.iter().copied(),
        args.value_pathway.iter().copied(),
        0..args.runs
    )
    .collect::<Vec<_>>();
    info!(runs = sweep.len(), ?device, ?kind, "Starting sweep");

    let mut recorder = args
        .metrics_output
        .as_ref()
        .map(|path| MetricsRecorder::new(path.clone()))
        .transpose()?;

    for (index, (size, num_heads, pathway, repeat)) in sweep.iter().copied().enumerate() {
        let seed = args.seed + repeat;
        let config = run_config(&args, size, num_heads, pathway, seed)
            .with_context(|| format!("invalid configuration for run {index}: {size:?}"))?;
        info!(index, ?size, num_heads, ?pathway, seed, "Run");

        let mut sampler = UniformSampler::new(splits.clone(), seed);
        let mut noop = NoopSink;
        let sink: &mut dyn MetricsSink = match recorder.as_mut() {
            Some(recorder) => {
                recorder.write_header(&serde_json::json!({ "run": index, "config": config }))?;
                recorder
            }
            None => &mut noop,
        };

        let output = train(&config, None, &mut sampler, sink, &options)?;
        if let Some(eval) = &output.final_eval {
            info!(
                index,
                step = eval.step,
                val_loss = eval.val_loss,
                val_acc = eval.val_acc,
                val_pplx = eval.val_pplx,
                t_secs = eval.t_secs,
                "Final eval"
            );
        }

        if let Some(base) = &args.save_weights {
            let path = weights_path(base, index, sweep.len());
            output
                .model
                .var_store()
                .save(&path)
                .with_context(|| format!("saving weights to {}", path.display()))?;
            info!(path = %path.display(), "Saved weights");
        }
    }

    Ok(())
}
