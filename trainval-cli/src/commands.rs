//! CLI subcommand handlers.

use crate::CheckpointAction;
use crate::ConfigAction;
use crate::DataArgs;
use std::path::Path;

use trainval_core::synthetic::{SyntheticDetector, SyntheticScorer, synthetic_split};
use trainval_core::{
    CheckpointStore, Collaborators, ConfigOverrides, CsvScalarSink, InMemoryProducer,
    OptimizerKind, RunLayout, Sgd, TelemetrySink, TrainingConfig, TrainingLoopController,
    TrainingSummary, load_config,
};

/// Load and validate the session configuration. Nothing is created on disk
/// when validation fails.
pub fn load_train_config(
    file: Option<&Path>,
    overrides: &ConfigOverrides,
) -> anyhow::Result<TrainingConfig> {
    let config = load_config(file, Some(overrides))
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    Ok(config)
}

/// Train the synthetic detector under `config` and print a summary.
pub fn run_training(config: &TrainingConfig, data: &DataArgs) -> anyhow::Result<()> {
    let summary = train(config, data)?;
    print_summary(&summary);
    Ok(())
}

fn train(config: &TrainingConfig, data: &DataArgs) -> anyhow::Result<TrainingSummary> {
    let split = synthetic_split(
        config.rng_seed,
        data.features,
        data.classes,
        data.train_samples,
        data.val_samples,
    )?;
    tracing::info!(
        train_id = %config.train_id,
        features = data.features,
        classes = data.classes,
        train_samples = data.train_samples,
        val_samples = data.val_samples,
        "synthetic dataset ready"
    );

    let telemetry = if data.no_telemetry {
        None
    } else {
        open_telemetry(&RunLayout::from_config(config).log_dir())
    };

    let collaborators: Collaborators<Vec<f32>> = Collaborators {
        train: Box::new(InMemoryProducer::shuffled(split.train, config.rng_seed)),
        val: Box::new(InMemoryProducer::sequential(split.val)),
        scorer: Box::new(SyntheticScorer::new(split.val_labels, data.classes)),
        telemetry,
    };

    let (features, classes) = (data.features, data.classes);
    let mut controller = TrainingLoopController::build(
        config,
        |_| Ok(SyntheticDetector::new(features, classes)),
        |groups, cfg| match cfg.optimizer_kind()? {
            OptimizerKind::Sgd => Ok(Sgd::new(groups, cfg.momentum)),
        },
        collaborators,
    )?;

    Ok(controller.run()?)
}

/// Telemetry is optional: a sink that cannot be opened leaves training
/// untouched.
fn open_telemetry(log_dir: &Path) -> Option<Box<dyn TelemetrySink>> {
    match CsvScalarSink::open(log_dir) {
        Ok(sink) => {
            tracing::info!(path = %sink.path().display(), "recording scalars");
            Some(Box::new(sink))
        }
        Err(e) => {
            tracing::warn!(error = %e, "telemetry disabled, could not open scalar log");
            None
        }
    }
}

fn print_summary(summary: &TrainingSummary) {
    println!("Training finished ({:?})", summary.termination);
    println!(
        "  Epochs:      {} this session, {} total",
        summary.epochs_completed, summary.final_epoch
    );
    println!(
        "  Iterations:  {} ({} -> {})",
        summary.iterations_run, summary.start_iteration, summary.global_iteration
    );
    println!("  Train time:  {:.2}s", summary.train_seconds);
    if let Some(best) = summary.best_report() {
        println!(
            "  Best eval:   epoch {} loss {:.4} mcls_ap {:.4} mins_ap {:.4}",
            best.epoch,
            best.mean_loss,
            best.scores.per_class.precision,
            best.scores.per_instance.precision
        );
    }
    for path in &summary.checkpoints {
        println!("  Saved:       {}", path.display());
    }
}

pub fn handle_checkpoints(
    action: CheckpointAction,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    let config = load_config(config_file, None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    let store = CheckpointStore::from_config(&config);

    match action {
        CheckpointAction::List { train_id } => {
            let train_id = train_id.unwrap_or_else(|| config.train_id.clone());
            let entries = store.list(&train_id)?;
            if entries.is_empty() {
                println!("No checkpoints found for run '{}'.", train_id);
                return Ok(());
            }
            println!("{:<8} {:<12} PATH", "EPOCH", "ITERATION");
            for entry in entries {
                println!(
                    "{:<8} {:<12} {}",
                    entry.epoch,
                    entry.global_iteration,
                    entry.path.display()
                );
            }
            Ok(())
        }
        CheckpointAction::Inspect { path } => {
            let checkpoint = store.load(&path)?;
            let or_dash = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
            let run = if checkpoint.train_id.is_empty() {
                "-"
            } else {
                checkpoint.train_id.as_str()
            };

            println!("Checkpoint: {}", path.display());
            println!("  Run:              {}", run);
            println!("  Epoch:            {}", checkpoint.epoch);
            println!(
                "  Global iteration: {}",
                or_dash(checkpoint.global_iteration.map(|i| i.to_string()))
            );
            println!(
                "  Learning rate:    {}",
                or_dash(checkpoint.learning_rate.map(|r| r.to_string()))
            );
            println!(
                "  Train seconds:    {}",
                or_dash(checkpoint.train_seconds.map(|s| format!("{s:.2}")))
            );
            println!(
                "  Saved at:         {}",
                or_dash(checkpoint.saved_at.map(|t| t.to_rfc3339()))
            );
            println!(
                "  Digest:           {}",
                match &checkpoint.digest {
                    Some(d) => format!("{d} (verified)"),
                    None => "-".to_string(),
                }
            );
            println!(
                "  Model state:      {} bytes",
                serde_json::to_vec(&checkpoint.model_state)?.len()
            );
            println!(
                "  Optimizer state:  {} bytes",
                serde_json::to_vec(&checkpoint.optimizer_state)?.len()
            );
            Ok(())
        }
    }
}

pub fn handle_config(action: ConfigAction, config_file: Option<&Path>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_file, None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
        ConfigAction::Init { path } => {
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            let toml_str = toml::to_string_pretty(&TrainingConfig::default())?;
            std::fs::write(&path, &toml_str)?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn small_data() -> DataArgs {
        DataArgs {
            features: 3,
            classes: 2,
            train_samples: 4,
            val_samples: 3,
            no_telemetry: false,
        }
    }

    fn config(dir: &TempDir) -> TrainingConfig {
        TrainingConfig {
            train_id: "cli".to_string(),
            results_root: dir.path().to_path_buf(),
            max_epochs: 2,
            disp_interval: 2,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn test_train_writes_checkpoints_and_scalars() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let summary = train(&cfg, &small_data()).unwrap();

        assert_eq!(summary.final_epoch, 2);
        assert_eq!(summary.checkpoints.len(), 2);
        assert!(dir.path().join("cli/model/checkpoint2_9.json").is_file());

        let csv = std::fs::read_to_string(dir.path().join("cli/log/scalars.csv")).unwrap();
        assert!(csv.starts_with("step,key,value\n"));
        assert!(csv.contains(",eval_loss,"));
        assert!(csv.contains(",mins_ap,"));
    }

    #[test]
    fn test_train_resumes_latest() {
        let dir = TempDir::new().unwrap();
        let cfg = TrainingConfig {
            max_epochs: 1,
            ..config(&dir)
        };
        train(&cfg, &small_data()).unwrap();

        let resumed = TrainingConfig {
            max_epochs: 2,
            resume: true,
            ..cfg
        };
        let summary = train(&resumed, &small_data()).unwrap();
        assert_eq!(summary.start_iteration, 5);
        assert_eq!(summary.epochs_completed, 1);
    }

    #[test]
    fn test_unopenable_scalar_log_does_not_stop_training() {
        let dir = TempDir::new().unwrap();
        let cfg = TrainingConfig {
            max_epochs: 1,
            ..config(&dir)
        };
        std::fs::create_dir_all(dir.path().join("cli/log/scalars.csv")).unwrap();

        let summary = train(&cfg, &small_data()).unwrap();
        assert_eq!(summary.final_epoch, 1);
        assert_eq!(summary.iterations_run, 4);
        assert!(dir.path().join("cli/model/checkpoint1_5.json").is_file());
        assert!(dir.path().join("cli/log/scalars.csv").is_dir());
    }

    #[test]
    fn test_invalid_batch_size_rejected_before_disk() {
        let dir = TempDir::new().unwrap();
        let overrides = ConfigOverrides {
            batch_size: Some(2),
            results_root: Some(dir.path().to_path_buf()),
            ..ConfigOverrides::default()
        };
        let err = load_train_config(None, &overrides).unwrap_err();
        assert!(err.to_string().contains("batch size must be 1"), "{err}");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_config_init_writes_loadable_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trainval.toml");
        handle_config(ConfigAction::Init { path: path.clone() }, None).unwrap();

        let loaded = load_config(Some(&path), None).unwrap();
        assert_eq!(loaded, TrainingConfig::default());
    }
}
