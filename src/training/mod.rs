pub mod callbacks;
pub mod early_stop;
pub mod meter;
pub mod run_log;
pub mod scheduler;
pub mod startup;
pub mod trainer;

use crate::utils::validation;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use early_stop::{EarlyStopping, Goal, Signal};
pub use meter::AverageMeter;
pub use scheduler::{Granularity, LearningRateScheduler, LrPolicy, ScheduleState};

/// Periodic trigger for validation and checkpointing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tick {
    /// Every `n` completed epochs
    Epochs(usize),
    /// Every `n` processed training batches
    Iterations(usize),
}

impl Tick {
    /// Whether the tick fires after finishing `epoch`
    pub fn fires_on_epoch(&self, epoch: usize) -> bool {
        matches!(*self, Tick::Epochs(n) if n > 0 && epoch % n == 0)
    }

    /// Whether the tick fires after global iteration `iteration`
    pub fn fires_on_iteration(&self, iteration: usize) -> bool {
        matches!(*self, Tick::Iterations(n) if n > 0 && iteration % n == 0)
    }
}

/// Metric fed to early stopping and checkpoint naming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Monitor {
    /// Average validation loss
    Loss,
    /// Exact-match accuracy (recognition adapters only)
    Accuracy,
}

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Run identifier used in checkpoint and log file names
    pub run_id: String,
    /// Last epoch to train (inclusive)
    pub max_epoch: usize,
    /// Base learning rate
    pub learning_rate: f64,
    /// Step decay factor
    pub decay_rate: f64,
    /// Ticks between decays
    pub decay_step: u64,
    /// Whether the schedule ticks per batch or per epoch
    pub lr_granularity: Granularity,
    /// Validations without improvement tolerated before stopping
    pub patience: usize,
    /// Minimum change counted as an improvement
    pub min_delta: f64,
    /// Improvement direction of the monitored metric
    pub goal: Goal,
    /// Monitored metric
    pub monitor: Monitor,
    /// Log a training line every `print_step` batches
    pub print_step: usize,
    /// When to validate
    pub validation: Tick,
    /// Optional periodic checkpoint trigger
    pub checkpoint_every: Option<Tick>,
    /// Checkpoint directory
    pub checkpoint_dir: PathBuf,
    /// Directory for the structured run log
    pub log_dir: Option<PathBuf>,
    /// Write every validation prediction to the run's prediction log
    pub log_predictions: bool,
    /// Validate once before the first epoch of a fresh run
    pub validate_first: bool,
    /// Draw a progress bar over training batches
    pub progress: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            run_id: "ocrt".to_string(),
            max_epoch: 100,
            learning_rate: 1e-3,
            decay_rate: 0.5,
            decay_step: 1000,
            lr_granularity: Granularity::Batch,
            patience: 5,
            min_delta: 1e-6,
            goal: Goal::Minimize,
            monitor: Monitor::Loss,
            print_step: 100,
            validation: Tick::Epochs(1),
            checkpoint_every: None,
            checkpoint_dir: PathBuf::from("checkpoints"),
            log_dir: Some(PathBuf::from("logs")),
            log_predictions: false,
            validate_first: false,
            progress: false,
        }
    }
}

impl TrainingConfig {
    /// Create configuration for quick testing
    pub fn quick_test() -> Self {
        Self {
            max_epoch: 5,
            print_step: 1,
            patience: 2,
            log_dir: None,
            ..Default::default()
        }
    }

    /// Detection setup: monitor validation loss, decay per epoch
    pub fn detection() -> Self {
        Self {
            run_id: "aeast".to_string(),
            max_epoch: 1800,
            learning_rate: 1e-3,
            decay_rate: 0.1,
            decay_step: 45,
            lr_granularity: Granularity::Epoch,
            patience: 6,
            ..Default::default()
        }
    }

    /// Recognition setup: monitor accuracy, validate on an iteration tick
    pub fn recognition() -> Self {
        Self {
            run_id: "recognition".to_string(),
            max_epoch: 100,
            learning_rate: 1.0,
            decay_rate: 0.9,
            decay_step: 10_000,
            goal: Goal::Maximize,
            monitor: Monitor::Accuracy,
            validation: Tick::Iterations(1000),
            checkpoint_every: Some(Tick::Iterations(5000)),
            log_predictions: true,
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        Ok(config)
    }

    /// Write configuration as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config file {:?}", path))?;
        Ok(())
    }

    /// Reject configurations the trainer cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.run_id.trim().is_empty() {
            anyhow::bail!("run_id must not be empty");
        }
        validation::positive(self.max_epoch, "max_epoch")?;
        validation::positive(self.learning_rate, "learning_rate")?;
        validation::in_range(self.decay_rate, 0.0, 1.0, "decay_rate")?;
        validation::positive(self.decay_step, "decay_step")?;
        validation::positive(self.print_step, "print_step")?;
        validation::tick(self.validation, "validation")?;
        if let Some(tick) = self.checkpoint_every {
            validation::tick(tick, "checkpoint_every")?;
        }
        if self.min_delta < 0.0 {
            anyhow::bail!("min_delta must not be negative, got {}", self.min_delta);
        }
        Ok(())
    }
}

/// Training state
#[derive(Debug, Clone, Default)]
pub struct TrainingState {
    /// Last completed epoch
    pub epoch: usize,
    /// Processed training batches across all epochs
    pub global_step: usize,
    /// Best monitored metric
    pub best_metric: Option<f64>,
    /// Average training loss per epoch (`None` for empty epochs)
    pub train_loss_history: Vec<Option<f64>>,
    /// Monitored validation metric per validation
    pub val_metric_history: Vec<Option<f64>>,
    /// Learning rate at the end of each epoch
    pub lr_history: Vec<f64>,
}

impl TrainingState {
    /// Create new training state
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished training epoch
    pub fn finish_epoch(&mut self, epoch: usize, train_loss: Option<f64>, lr: f64) {
        self.epoch = epoch;
        self.train_loss_history.push(train_loss);
        self.lr_history.push(lr);
    }
}

/// Why the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// All configured epochs ran
    Completed,
    /// Early stopping triggered during `epoch`
    EarlyStopped { epoch: usize },
}

/// Training result
#[derive(Debug, Clone)]
pub struct TrainingResult {
    /// Final training state
    pub state: TrainingState,
    /// How the run ended
    pub stop_reason: StopReason,
    /// Path to the last improving checkpoint
    pub best_checkpoint: Option<PathBuf>,
    /// Training duration in seconds
    pub duration_secs: f64,
}

impl TrainingResult {
    /// A run truncated by early stopping is still a success
    pub fn early_stopped(&self) -> bool {
        matches!(self.stop_reason, StopReason::EarlyStopped { .. })
    }
}

/// Outcome of one pass over the validation source
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Epoch the validation ran in (0 before training)
    pub epoch: usize,
    /// Training batches processed when validation ran
    pub global_step: usize,
    /// Average validation loss, `None` for an empty source
    pub loss: Option<f64>,
    /// Exact-match accuracy over decoded samples
    pub accuracy: Option<f64>,
    /// Mean normalized edit distance over decoded samples
    pub edit_distance: Option<f64>,
    /// Decoded samples matching their target
    pub correct: usize,
    /// Decoded samples
    pub total: usize,
    /// Value of the monitored metric fed to early stopping
    pub metric: Option<f64>,
    /// Early stopping decision for this validation
    pub signal: Signal,
    /// Snapshot written because the metric improved
    pub checkpoint: Option<PathBuf>,
    /// `(prediction, target)` pairs, in source order
    pub transcriptions: Vec<(String, String)>,
}
