use crate::data::BatchSource;
use crate::model::checkpoint::{Checkpoint, CheckpointKey, CheckpointStore};
use crate::model::loss::metrics::RecognitionStats;
use crate::model::loss::ScalarLoss;
use crate::model::optim::Optimizer;
use crate::model::{Mode, Model};
use crate::training::callbacks::{
    BatchProgress, CallbackManager, ProgressBarCallback, ProgressLogger, RunLogCallback,
    TimerCallback, TrainingCallback,
};
use crate::training::run_log::RunLog;
use crate::training::startup::Startup;
use crate::training::{
    AverageMeter, EarlyStopping, LearningRateScheduler, Monitor, Signal, StopReason, Tick,
    TrainingConfig, TrainingResult, TrainingState, ValidationReport,
};
use crate::treatment::{Posttreated, Treatment};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Generic training loop.
///
/// The trainer owns the model, its optimizer and the model-specific
/// [`Treatment`]; everything else (schedule, early stopping, checkpoints,
/// logging) is handled here and is the same for every architecture.
pub struct Trainer<M, T, O>
where
    M: Model,
    T: Treatment<M>,
    O: Optimizer<M, Loss = T::Loss>,
{
    config: TrainingConfig,
    model: M,
    treatment: T,
    optimizer: O,
    scheduler: LearningRateScheduler,
    early_stopping: EarlyStopping,
    store: CheckpointStore,
    callbacks: CallbackManager,
    mode: Mode,
    /// First epoch `fit` will run
    start_epoch: usize,
    global_step: usize,
    resumed: bool,
}

impl<M, T, O> Trainer<M, T, O>
where
    M: Model,
    T: Treatment<M>,
    O: Optimizer<M, Loss = T::Loss>,
{
    /// Create new trainer
    pub fn new(config: TrainingConfig, model: M, treatment: T, optimizer: O) -> Result<Self> {
        config.validate().context("Invalid training configuration")?;

        let mut callbacks = CallbackManager::new();
        callbacks.add_callback(ProgressLogger::from_config(&config));
        callbacks.add_callback(TimerCallback::new());
        if config.progress {
            callbacks.add_callback(ProgressBarCallback::new());
        }

        Ok(Self {
            scheduler: LearningRateScheduler::from_config(&config),
            early_stopping: EarlyStopping::from_config(&config, None),
            store: CheckpointStore::from_config(&config),
            callbacks,
            mode: Mode::Train,
            start_epoch: 1,
            global_step: 0,
            resumed: false,
            config,
            model,
            treatment,
            optimizer,
        })
    }

    /// Write checkpoints somewhere other than `config.checkpoint_dir`
    pub fn with_checkpoint_store(mut self, store: CheckpointStore) -> Self {
        self.store = store;
        self
    }

    /// Add an observer
    pub fn with_callback<C: TrainingCallback + 'static>(mut self, callback: C) -> Self {
        self.callbacks.add_callback(callback);
        self
    }

    /// Restore every piece of state from `checkpoint` and continue after its epoch
    pub fn resume(mut self, checkpoint: Checkpoint) -> Result<Self> {
        self.model = self
            .model
            .load_bytes(&checkpoint.model)
            .context("Failed to restore model weights")?;
        self.optimizer
            .load_bytes(&checkpoint.optimizer)
            .context("Failed to restore optimizer state")?;
        self.scheduler.load_state(checkpoint.schedule);
        self.early_stopping = EarlyStopping::from_config(&self.config, checkpoint.best_metric);
        self.start_epoch = checkpoint.epoch + 1;
        self.global_step = checkpoint.global_step;
        self.resumed = true;

        info!(
            "Resumed at epoch {} (step {}, lr {}, best {:?})",
            checkpoint.epoch,
            checkpoint.global_step,
            self.scheduler.lr(),
            checkpoint.best_metric
        );
        Ok(self)
    }

    /// Initialize the model from the weights of `checkpoint`, nothing else
    pub fn load_pretrained(mut self, checkpoint: &Checkpoint) -> Result<Self> {
        self.model = self
            .model
            .load_bytes(&checkpoint.model)
            .context("Failed to load pretrained weights")?;
        info!("Loaded pretrained weights (epoch {})", checkpoint.epoch);
        Ok(self)
    }

    /// Apply a resolved [`Startup`]
    pub fn with_startup(self, startup: Startup) -> Result<Self> {
        match startup {
            Startup::Fresh => Ok(self),
            Startup::Resume { checkpoint, .. } => self.resume(checkpoint),
            Startup::Pretrain { checkpoint, .. } => self.load_pretrained(&checkpoint),
        }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    /// Mode the model is currently driven in
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn scheduler(&self) -> &LearningRateScheduler {
        &self.scheduler
    }

    pub fn early_stopping(&self) -> &EarlyStopping {
        &self.early_stopping
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Run epochs `start..=max_epoch`, validating and checkpointing on the configured ticks
    pub fn fit<S, V>(&mut self, train: &mut S, val: &mut V) -> Result<TrainingResult>
    where
        S: BatchSource<Batch = T::Batch>,
        V: BatchSource<Batch = T::Batch>,
    {
        info!(
            "Starting run {:?}: epochs {}..={}, base lr {}",
            self.config.run_id,
            self.start_epoch,
            self.config.max_epoch,
            self.config.learning_rate
        );
        let start_time = Instant::now();

        self.open_run_log();

        let mut state = TrainingState::new();
        state.epoch = self.start_epoch.saturating_sub(1);
        state.global_step = self.global_step;
        state.best_metric = self.early_stopping.best();

        self.callbacks.on_train_begin(&self.config);

        let mut best_checkpoint = None;

        if self.config.validate_first && !self.resumed {
            let report = self.validate(val, 0)?;
            if report.signal.stop {
                debug!("Ignoring stop signal from the pre-training validation");
            }
            self.record_validation(&mut state, &report, &mut best_checkpoint);
        }

        let mut stop_reason = StopReason::Completed;
        for epoch in self.start_epoch..=self.config.max_epoch {
            self.callbacks.on_epoch_begin(epoch, self.scheduler.lr());

            let total = train.len_hint();
            let mut meter = AverageMeter::new();
            let mut iteration = 0;
            let mut stop = false;

            for batch in train.batches() {
                let batch = batch.with_context(|| {
                    format!("Failed to load training batch {} of epoch {}", iteration + 1, epoch)
                })?;
                iteration += 1;

                let (loss, lr) = self.train_step(&batch).with_context(|| {
                    format!("Training failed at epoch {} batch {}", epoch, iteration)
                })?;
                meter.update(loss, self.treatment.batch_size(&batch));
                self.global_step += 1;

                self.callbacks.on_batch_end(&BatchProgress {
                    epoch,
                    iteration,
                    total,
                    global_step: self.global_step,
                    loss,
                    avg_loss: meter.avg(),
                    learning_rate: lr,
                });

                if self.config.validation.fires_on_iteration(self.global_step) {
                    let report = self.validate(val, epoch)?;
                    stop = report.signal.stop;
                    self.record_validation(&mut state, &report, &mut best_checkpoint);
                }
                if self.periodic_tick(|tick| tick.fires_on_iteration(self.global_step)) {
                    self.save_periodic(epoch)?;
                }
                if stop {
                    break;
                }
            }

            let lr = self.scheduler.lr();
            self.scheduler.on_epoch();
            state.global_step = self.global_step;
            state.finish_epoch(epoch, meter.avg(), lr);
            if iteration == 0 {
                debug!("Epoch {} had no training batches", epoch);
            }

            if !stop && self.config.validation.fires_on_epoch(epoch) {
                let report = self.validate(val, epoch)?;
                stop = report.signal.stop;
                self.record_validation(&mut state, &report, &mut best_checkpoint);
            }
            if self.periodic_tick(|tick| tick.fires_on_epoch(epoch)) {
                self.save_periodic(epoch)?;
            }

            self.callbacks.on_epoch_end(epoch, &state);

            if stop {
                info!("Early stopping at epoch {}", epoch);
                stop_reason = StopReason::EarlyStopped { epoch };
                break;
            }
        }

        let result = TrainingResult {
            state,
            stop_reason,
            best_checkpoint,
            duration_secs: start_time.elapsed().as_secs_f64(),
        };
        self.callbacks.on_train_end(&result);
        Ok(result)
    }

    /// One optimization step: pretreatment, forward, posttreatment, schedule, update.
    ///
    /// Returns the loss value and the learning rate used.
    fn train_step(&mut self, batch: &T::Batch) -> Result<(f64, f64)> {
        let (input, artifacts) = self.treatment.pretreatment(batch)?;
        let output = self.model.forward(&input, Mode::Train)?;
        let loss = self
            .treatment
            .posttreatment(output, artifacts, batch, Mode::Train)?
            .into_loss();
        let value = loss.value();

        let lr = self.scheduler.on_batch();
        self.optimizer.zero_grad();
        self.optimizer.backward(loss, &self.model)?;
        self.optimizer.step(&mut self.model, lr)?;
        Ok((value, lr))
    }

    /// Validate, feed early stopping and persist an improving snapshot.
    ///
    /// The model runs in `Eval` mode for the pass and is back in `Train` mode
    /// when this returns, whether or not the pass succeeded.
    pub fn validate<V>(&mut self, val: &mut V, epoch: usize) -> Result<ValidationReport>
    where
        V: BatchSource<Batch = T::Batch>,
    {
        let mut report = self.evaluate(val, epoch)?;

        let metric = match self.config.monitor {
            Monitor::Loss => report.loss,
            Monitor::Accuracy => report.accuracy,
        };
        report.metric = metric;
        report.signal = match metric {
            Some(score) => self.early_stopping.observe(score),
            None => {
                warn!(
                    "Validation at epoch {} produced no {:?} value; early stopping not updated",
                    epoch, self.config.monitor
                );
                Signal::default()
            }
        };

        if report.signal.save {
            let key = CheckpointKey::new(&self.config.run_id, epoch, self.global_step, metric);
            let checkpoint = self.snapshot(epoch)?;
            let path = self
                .store
                .save_best(&checkpoint, &key)
                .context("Failed to save improving checkpoint")?;
            report.checkpoint = Some(path);
        }

        self.callbacks.on_validation_end(&report);
        Ok(report)
    }

    /// One pass over the validation source without touching early stopping
    pub fn evaluate<V>(&mut self, val: &mut V, epoch: usize) -> Result<ValidationReport>
    where
        V: BatchSource<Batch = T::Batch>,
    {
        self.mode = Mode::Eval;
        let result = self.evaluation_pass(val, epoch);
        self.mode = Mode::Train;
        result
    }

    fn evaluation_pass<V>(&mut self, val: &mut V, epoch: usize) -> Result<ValidationReport>
    where
        V: BatchSource<Batch = T::Batch>,
    {
        let mut meter = AverageMeter::new();
        let mut stats = RecognitionStats::new();
        let mut transcriptions = Vec::new();

        for (i, batch) in val.batches().enumerate() {
            let batch = batch.with_context(|| format!("Failed to load validation batch {}", i + 1))?;
            let (input, artifacts) = self.treatment.pretreatment(&batch)?;
            let output = self.model.forward(&input, self.mode)?;
            let outcome = self
                .treatment
                .posttreatment(output, artifacts, &batch, Mode::Eval)?;

            meter.update(outcome.loss().value(), self.treatment.batch_size(&batch));
            if let Posttreated::Decoded {
                predictions,
                targets,
                ..
            } = outcome
            {
                for (prediction, target) in predictions.into_iter().zip(targets) {
                    stats.add(&prediction, &target);
                    transcriptions.push((prediction, target));
                }
            }
        }

        Ok(ValidationReport {
            epoch,
            global_step: self.global_step,
            loss: meter.avg(),
            accuracy: stats.accuracy(),
            edit_distance: stats.mean_distance(),
            correct: stats.correct,
            total: stats.total,
            transcriptions,
            ..Default::default()
        })
    }

    fn snapshot(&self, epoch: usize) -> Result<Checkpoint> {
        Ok(Checkpoint {
            epoch,
            global_step: self.global_step,
            model: self.model.to_bytes().context("Failed to serialize model")?,
            optimizer: self
                .optimizer
                .to_bytes()
                .context("Failed to serialize optimizer")?,
            schedule: self.scheduler.state(),
            best_metric: self.early_stopping.best(),
        })
    }

    fn periodic_tick(&self, fires: impl Fn(Tick) -> bool) -> bool {
        self.config.checkpoint_every.map_or(false, fires)
    }

    /// Periodic snapshot.
    ///
    /// A file under the same key can only be the improving snapshot written
    /// at this very step, which already holds this state.
    fn save_periodic(&self, epoch: usize) -> Result<()> {
        let key = CheckpointKey::new(
            &self.config.run_id,
            epoch,
            self.global_step,
            self.early_stopping.best(),
        );
        if self.store.dir().join(key.file_name()).exists() {
            debug!("Checkpoint {} already written at this step", key.file_name());
            return Ok(());
        }
        let checkpoint = self.snapshot(epoch)?;
        self.store
            .save(&checkpoint, &key)
            .context("Failed to save periodic checkpoint")?;
        Ok(())
    }

    fn record_validation(
        &self,
        state: &mut TrainingState,
        report: &ValidationReport,
        best_checkpoint: &mut Option<PathBuf>,
    ) {
        state.val_metric_history.push(report.metric);
        state.best_metric = self.early_stopping.best();
        if let Some(path) = &report.checkpoint {
            *best_checkpoint = Some(path.clone());
        }
    }

    fn open_run_log(&mut self) {
        match RunLog::create(&self.config) {
            Ok(Some(log)) => {
                info!("Run log: {:?}", log.path());
                self.callbacks
                    .add_callback(RunLogCallback::new(log, self.config.print_step));
            }
            Ok(None) => {}
            Err(e) => warn!("Run log disabled: {:#}", e),
        }
    }
}
