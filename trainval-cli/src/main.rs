//! trainval CLI: run and inspect resumable training sessions.

mod commands;

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use trainval_core::{ConfigOverrides, RunLayout};

/// trainval: resumable train/validate sessions for detection models
#[derive(Parser, Debug)]
#[command(name = "trainval", version, about, long_about = None)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a training session on the synthetic reference dataset
    Train(TrainArgs),
    /// Inspect saved checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum CheckpointAction {
    /// List the checkpoints of a run, oldest first
    List {
        /// Run to list (defaults to the configured train_id)
        #[arg(short, long)]
        train_id: Option<String>,
    },
    /// Load and verify a checkpoint file
    Inspect {
        /// Path to the checkpoint JSON
        path: PathBuf,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Write the default configuration to a file
    Init {
        /// Destination file
        #[arg(default_value = "trainval.toml")]
        path: PathBuf,
    },
}

/// Session options. Each flag overrides the config file and `TRAINVAL_*`
/// environment variables.
#[derive(clap::Args, Debug, Default)]
struct TrainArgs {
    /// Run name; results go to <results-root>/<train-id>
    #[arg(long)]
    train_id: Option<String>,
    /// Network variant: vgg16 or res50
    #[arg(long)]
    net: Option<String>,
    /// Optimizer: sgd
    #[arg(long)]
    optimizer: Option<String>,
    /// Images per batch (only 1 is supported)
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    max_epochs: Option<u32>,
    #[arg(long)]
    max_iterations: Option<u64>,
    #[arg(long)]
    learning_rate: Option<f64>,
    /// Decay fires when iteration % (lr-decay-step + 1) == 0
    #[arg(long)]
    lr_decay_step: Option<u64>,
    #[arg(long)]
    lr_decay_gamma: Option<f64>,
    #[arg(long)]
    momentum: Option<f64>,
    #[arg(long)]
    weight_decay: Option<f64>,
    /// Train bias parameters at twice the base rate (true/false)
    #[arg(long)]
    double_bias: Option<bool>,
    /// Apply weight decay to bias parameters (true/false)
    #[arg(long)]
    bias_decay: Option<bool>,
    /// Log every N iterations
    #[arg(long)]
    disp_interval: Option<u64>,
    #[arg(long)]
    num_workers: Option<usize>,
    /// Resume from a checkpoint of this run
    #[arg(long)]
    resume: bool,
    /// Checkpoint file to resume from (latest when omitted)
    #[arg(long)]
    model_name: Option<String>,
    /// Place batches on the accelerator
    #[arg(long)]
    use_accelerator: bool,
    #[arg(long)]
    rng_seed: Option<u64>,
    #[arg(long)]
    results_root: Option<PathBuf>,
    /// Max gradient norm for networks that clip
    #[arg(long)]
    clip_norm: Option<f64>,

    #[command(flatten)]
    data: DataArgs,
}

/// Shape of the synthetic dataset.
#[derive(clap::Args, Debug, Clone)]
struct DataArgs {
    /// Feature dimension of each sample
    #[arg(long, default_value = "8")]
    features: usize,
    /// Number of object classes
    #[arg(long, default_value = "4")]
    classes: usize,
    #[arg(long, default_value = "64")]
    train_samples: usize,
    #[arg(long, default_value = "16")]
    val_samples: usize,
    /// Do not write log/scalars.csv
    #[arg(long)]
    no_telemetry: bool,
}

impl Default for DataArgs {
    fn default() -> Self {
        Self {
            features: 8,
            classes: 4,
            train_samples: 64,
            val_samples: 16,
            no_telemetry: false,
        }
    }
}

impl TrainArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            train_id: self.train_id.clone(),
            net: self.net.clone(),
            optimizer: self.optimizer.clone(),
            batch_size: self.batch_size,
            max_epochs: self.max_epochs,
            max_iterations: self.max_iterations,
            learning_rate: self.learning_rate,
            lr_decay_step: self.lr_decay_step,
            lr_decay_gamma: self.lr_decay_gamma,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
            double_bias: self.double_bias,
            bias_decay: self.bias_decay,
            disp_interval: self.disp_interval,
            num_workers: self.num_workers,
            resume: self.resume.then_some(true),
            model_name: self.model_name.clone(),
            use_accelerator: self.use_accelerator.then_some(true),
            rng_seed: self.rng_seed,
            results_root: self.results_root.clone(),
            clip_norm: self.clip_norm,
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    match cli.command {
        Commands::Train(args) => {
            let config = commands::load_train_config(cli.config.as_deref(), &args.overrides())?;
            let log_dir = RunLayout::from_config(&config).log_dir();
            let _guard = init_tracing(filter, Some(&log_dir))?;
            commands::run_training(&config, &args.data)
        }
        Commands::Checkpoints { action } => {
            let _guard = init_tracing(filter, None)?;
            commands::handle_checkpoints(action, cli.config.as_deref())
        }
        Commands::Config { action } => {
            let _guard = init_tracing(filter, None)?;
            commands::handle_config(action, cli.config.as_deref())
        }
    }
}

/// Human-readable stderr output, plus JSON lines in the run's log
/// directory when `log_dir` is given. The returned guard flushes the file
/// writer on drop.
fn init_tracing(filter: &str, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let (json_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, "trainval.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    Ok(guard)
}
