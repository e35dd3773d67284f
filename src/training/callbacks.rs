use crate::training::run_log::{LogRecord, RunLog, Split};
use crate::training::{TrainingConfig, TrainingResult, TrainingState, ValidationReport};
use crate::utils::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Snapshot passed to callbacks after every training batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchProgress {
    pub epoch: usize,
    /// 1-based batch index inside the epoch
    pub iteration: usize,
    /// Batches per epoch, when the source knows
    pub total: Option<usize>,
    /// Batches processed since the start of the run
    pub global_step: usize,
    pub loss: f64,
    /// Running epoch average
    pub avg_loss: Option<f64>,
    pub learning_rate: f64,
}

/// Training callback trait
///
/// Callbacks observe the loop; they cannot influence control flow. A
/// callback that fails must report the failure itself and carry on.
pub trait TrainingCallback: Send {
    /// Called once before the first epoch
    fn on_train_begin(&mut self, _config: &TrainingConfig) {}

    /// Called at the start of each epoch with the rate in effect
    fn on_epoch_begin(&mut self, _epoch: usize, _learning_rate: f64) {}

    /// Called after each optimizer step
    fn on_batch_end(&mut self, _progress: &BatchProgress) {}

    /// Called after every validation pass
    fn on_validation_end(&mut self, _report: &ValidationReport) {}

    /// Called after the training batches of an epoch (and its validation, if any)
    fn on_epoch_end(&mut self, _epoch: usize, _state: &TrainingState) {}

    /// Called once when the loop ends normally
    fn on_train_end(&mut self, _result: &TrainingResult) {}
}

/// Callback manager that handles multiple callbacks
#[derive(Default)]
pub struct CallbackManager {
    callbacks: Vec<Box<dyn TrainingCallback>>,
}

impl CallbackManager {
    /// Create new callback manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback
    pub fn add_callback<C: TrainingCallback + 'static>(&mut self, callback: C) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn on_train_begin(&mut self, config: &TrainingConfig) {
        for callback in &mut self.callbacks {
            callback.on_train_begin(config);
        }
    }

    pub fn on_epoch_begin(&mut self, epoch: usize, learning_rate: f64) {
        for callback in &mut self.callbacks {
            callback.on_epoch_begin(epoch, learning_rate);
        }
    }

    pub fn on_batch_end(&mut self, progress: &BatchProgress) {
        for callback in &mut self.callbacks {
            callback.on_batch_end(progress);
        }
    }

    pub fn on_validation_end(&mut self, report: &ValidationReport) {
        for callback in &mut self.callbacks {
            callback.on_validation_end(report);
        }
    }

    pub fn on_epoch_end(&mut self, epoch: usize, state: &TrainingState) {
        for callback in &mut self.callbacks {
            callback.on_epoch_end(epoch, state);
        }
    }

    pub fn on_train_end(&mut self, result: &TrainingResult) {
        for callback in &mut self.callbacks {
            callback.on_train_end(result);
        }
    }
}

fn fmt_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.4}", v))
}

/// Human-readable progress lines
pub struct ProgressLogger {
    print_step: usize,
    last_lr: Option<f64>,
}

impl ProgressLogger {
    /// Log a training line every `print_step` batches
    pub fn new(print_step: usize) -> Self {
        Self {
            print_step: print_step.max(1),
            last_lr: None,
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(config.print_step)
    }
}

impl TrainingCallback for ProgressLogger {
    fn on_epoch_begin(&mut self, epoch: usize, learning_rate: f64) {
        if let Some(previous) = self.last_lr {
            if previous != learning_rate {
                info!("Learning rate - Epoch: [{}]: {}", epoch, learning_rate);
            }
        }
        self.last_lr = Some(learning_rate);
    }

    fn on_batch_end(&mut self, progress: &BatchProgress) {
        if progress.iteration % self.print_step != 0 {
            return;
        }
        let total = progress
            .total
            .map_or_else(|| "?".to_string(), |t| t.to_string());
        info!(
            "Training loss - Epoch: [{}][{}/{}] Loss {:.4} Avg Loss {}",
            progress.epoch,
            progress.iteration,
            total,
            progress.loss,
            fmt_metric(progress.avg_loss)
        );
    }

    fn on_validation_end(&mut self, report: &ValidationReport) {
        info!(
            "Validate Loss - Epoch: [{}]  Avg Loss {}",
            report.epoch,
            fmt_metric(report.loss)
        );
        if report.total > 0 {
            info!("correct / total: {} / {}", report.correct, report.total);
            info!("levenshtein distance: {}", fmt_metric(report.edit_distance));
            info!(
                "Test loss: {}, accuracy: {}",
                fmt_metric(report.loss),
                fmt_metric(report.accuracy)
            );
        }
        if let Some(path) = &report.checkpoint {
            info!("Saved improving checkpoint {:?}", path);
        }
    }

    fn on_train_end(&mut self, result: &TrainingResult) {
        info!(
            "Training finished after epoch {} ({:?}) in {}",
            result.state.epoch,
            result.stop_reason,
            format_duration(result.duration_secs)
        );
    }
}

/// Feeds the structured run log
pub struct RunLogCallback {
    log: RunLog,
    print_step: usize,
}

impl RunLogCallback {
    /// Write a training row every `print_step` batches
    pub fn new(log: RunLog, print_step: usize) -> Self {
        Self {
            log,
            print_step: print_step.max(1),
        }
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }
}

impl TrainingCallback for RunLogCallback {
    fn on_train_begin(&mut self, _config: &TrainingConfig) {
        debug!("Writing run log to {:?}", self.log.path());
    }

    fn on_batch_end(&mut self, progress: &BatchProgress) {
        if progress.iteration % self.print_step != 0 {
            return;
        }
        let record = LogRecord {
            split: Split::Training,
            epoch: progress.epoch,
            iteration: progress.iteration,
            total: progress.total,
            loss: Some(progress.loss),
            avg_loss: progress.avg_loss,
            learning_rate: Some(progress.learning_rate),
        };
        if let Err(e) = self.log.record(&record) {
            warn!("Failed to write run log: {:#}", e);
        }
    }

    fn on_validation_end(&mut self, report: &ValidationReport) {
        let record = LogRecord {
            split: Split::Validation,
            epoch: report.epoch,
            iteration: report.global_step,
            total: Some(report.total),
            loss: report.loss,
            avg_loss: report.loss,
            learning_rate: None,
        };
        if let Err(e) = self.log.record(&record) {
            warn!("Failed to write run log: {:#}", e);
        }
        if let Err(e) = self
            .log
            .record_predictions(report.epoch, &report.transcriptions)
        {
            warn!("Failed to write prediction log: {:#}", e);
        }
    }
}

/// Progress bar over the training batches of each epoch
pub struct ProgressBarCallback {
    bar: Option<ProgressBar>,
}

impl ProgressBarCallback {
    pub fn new() -> Self {
        Self { bar: None }
    }

    fn create_bar(total: Option<usize>, epoch: usize) -> ProgressBar {
        let bar = match total {
            Some(total) => ProgressBar::new(total as u64),
            None => ProgressBar::new_spinner(),
        };
        let style = ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {per_sec}")
            .map(|style| style.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(format!("Epoch {}", epoch));
        bar
    }
}

impl Default for ProgressBarCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingCallback for ProgressBarCallback {
    fn on_batch_end(&mut self, progress: &BatchProgress) {
        let bar = self
            .bar
            .get_or_insert_with(|| Self::create_bar(progress.total, progress.epoch));
        bar.set_position(progress.iteration as u64);
    }

    fn on_epoch_end(&mut self, _epoch: usize, _state: &TrainingState) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }

    fn on_train_end(&mut self, _result: &TrainingResult) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

/// Timer callback that tracks training time
#[derive(Default)]
pub struct TimerCallback {
    start_time: Option<Instant>,
    epoch_start: Option<Instant>,
    epoch_times: Vec<Duration>,
}

impl TimerCallback {
    /// Create new timer callback
    pub fn new() -> Self {
        Self::default()
    }

    /// Get average epoch time
    pub fn average_epoch_time(&self) -> Option<Duration> {
        if self.epoch_times.is_empty() {
            None
        } else {
            let total: Duration = self.epoch_times.iter().sum();
            Some(total / self.epoch_times.len() as u32)
        }
    }

    pub fn epochs_timed(&self) -> usize {
        self.epoch_times.len()
    }
}

impl TrainingCallback for TimerCallback {
    fn on_train_begin(&mut self, _config: &TrainingConfig) {
        self.start_time = Some(Instant::now());
    }

    fn on_epoch_begin(&mut self, _epoch: usize, _learning_rate: f64) {
        self.epoch_start = Some(Instant::now());
    }

    fn on_epoch_end(&mut self, epoch: usize, _state: &TrainingState) {
        if let Some(start) = self.epoch_start.take() {
            let elapsed = start.elapsed();
            self.epoch_times.push(elapsed);
            debug!(
                "Epoch {} took {}",
                epoch,
                format_duration(elapsed.as_secs_f64())
            );
        }
    }

    fn on_train_end(&mut self, _result: &TrainingResult) {
        if let (Some(start), Some(avg)) = (self.start_time, self.average_epoch_time()) {
            info!(
                "Wall time {} ({} per epoch)",
                format_duration(start.elapsed().as_secs_f64()),
                format_duration(avg.as_secs_f64())
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::StopReason;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn progress(iteration: usize) -> BatchProgress {
        BatchProgress {
            epoch: 1,
            iteration,
            total: Some(4),
            global_step: iteration,
            loss: 0.5,
            avg_loss: Some(0.5),
            learning_rate: 0.1,
        }
    }

    fn result() -> TrainingResult {
        TrainingResult {
            state: TrainingState::new(),
            stop_reason: StopReason::Completed,
            best_checkpoint: None,
            duration_secs: 1.0,
        }
    }

    /// Records every hook it sees
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl TrainingCallback for Recorder {
        fn on_train_begin(&mut self, _config: &TrainingConfig) {
            self.0.lock().unwrap().push("train_begin".into());
        }
        fn on_batch_end(&mut self, progress: &BatchProgress) {
            self.0.lock().unwrap().push(format!("batch {}", progress.iteration));
        }
        fn on_train_end(&mut self, _result: &TrainingResult) {
            self.0.lock().unwrap().push("train_end".into());
        }
    }

    #[test]
    fn test_callback_manager_dispatches_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut manager = CallbackManager::new();
        manager.add_callback(Recorder(events.clone()));
        manager.add_callback(ProgressLogger::new(1));
        manager.add_callback(TimerCallback::new());
        assert_eq!(manager.len(), 3);

        let config = TrainingConfig::quick_test();
        manager.on_train_begin(&config);
        manager.on_epoch_begin(1, 0.1);
        manager.on_batch_end(&progress(1));
        manager.on_validation_end(&ValidationReport::default());
        manager.on_epoch_end(1, &TrainingState::new());
        manager.on_train_end(&result());

        assert_eq!(
            *events.lock().unwrap(),
            vec!["train_begin", "batch 1", "train_end"]
        );
    }

    #[test]
    fn test_timer_records_epochs() {
        let mut timer = TimerCallback::new();
        timer.on_train_begin(&TrainingConfig::quick_test());
        assert!(timer.average_epoch_time().is_none());
        timer.on_epoch_begin(1, 0.1);
        timer.on_epoch_end(1, &TrainingState::new());
        assert_eq!(timer.epochs_timed(), 1);
        assert!(timer.average_epoch_time().is_some());
    }

    #[test]
    fn test_run_log_callback_respects_print_step() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::open(dir.path(), "run", "tick", true).unwrap();
        let mut callback = RunLogCallback::new(log, 2);

        for iteration in 1..=4 {
            callback.on_batch_end(&progress(iteration));
        }
        callback.on_validation_end(&ValidationReport {
            epoch: 1,
            global_step: 4,
            loss: Some(0.25),
            total: 1,
            transcriptions: vec![("a".into(), "b".into())],
            ..Default::default()
        });

        let text = std::fs::read_to_string(callback.log().path()).unwrap();
        let rows: Vec<&str> = text.lines().skip(1).collect();
        assert_eq!(
            rows,
            vec![
                "Training,1,2,4,0.5,0.5,0.1",
                "Training,1,4,4,0.5,0.5,0.1",
                "Validation,1,4,1,0.25,0.25,",
            ]
        );
        let predictions =
            std::fs::read_to_string(callback.log().predictions_path().unwrap()).unwrap();
        assert_eq!(predictions, "1\ta\tb\n");
    }

    #[test]
    fn test_progress_bar_lifecycle() {
        let mut callback = ProgressBarCallback::new();
        callback.on_batch_end(&progress(1));
        assert!(callback.bar.is_some());
        callback.on_epoch_end(1, &TrainingState::new());
        assert!(callback.bar.is_none());
    }
}
