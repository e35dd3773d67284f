use crate::training::TrainingConfig;
use serde::{Deserialize, Serialize};

/// Step decay policy: `multiplier(n) = rate ^ (n / step)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrPolicy {
    /// Decay factor applied every `step` ticks
    pub rate: f64,
    /// Number of ticks between decays
    pub step: u64,
}

impl LrPolicy {
    /// Create new policy
    pub fn new(rate: f64, step: u64) -> Self {
        Self { rate, step }
    }

    /// Multiplicative factor for the given cumulative tick count
    pub fn multiplier(&self, ticks: u64) -> f64 {
        let exponent = ticks / self.step.max(1);
        self.rate.powi(exponent.min(i32::MAX as u64) as i32)
    }
}

/// When the schedule advances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// Once per processed batch
    Batch,
    /// Once per completed epoch
    Epoch,
}

impl Default for Granularity {
    fn default() -> Self {
        Granularity::Batch
    }
}

/// Serializable scheduler position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduleState {
    /// Base learning rate given at construction
    pub base_lr: f64,
    /// Ticks consumed so far
    pub ticks: u64,
}

/// Learning rate schedule applied on top of a fixed base rate.
///
/// The scheduler is advanced by the trainer with [`on_batch`](Self::on_batch)
/// and [`on_epoch`](Self::on_epoch); only the call matching the configured
/// [`Granularity`] moves it.
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    policy: LrPolicy,
    granularity: Granularity,
    base_lr: f64,
    ticks: u64,
}

impl LearningRateScheduler {
    /// Create new scheduler
    pub fn new(base_lr: f64, policy: LrPolicy, granularity: Granularity) -> Self {
        Self {
            policy,
            granularity,
            base_lr,
            ticks: 0,
        }
    }

    /// Build the scheduler described by a training configuration
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(
            config.learning_rate,
            LrPolicy::new(config.decay_rate, config.decay_step),
            config.lr_granularity,
        )
    }

    /// Current learning rate
    pub fn lr(&self) -> f64 {
        self.base_lr * self.policy.multiplier(self.ticks)
    }

    /// Learning rate after `ticks` advances, without touching the scheduler
    pub fn lr_at(&self, ticks: u64) -> f64 {
        self.base_lr * self.policy.multiplier(ticks)
    }

    /// Advance for one processed batch; returns the rate to use for it
    pub fn on_batch(&mut self) -> f64 {
        if self.granularity == Granularity::Batch {
            self.ticks += 1;
        }
        self.lr()
    }

    /// Advance for one completed epoch
    pub fn on_epoch(&mut self) -> f64 {
        if self.granularity == Granularity::Epoch {
            self.ticks += 1;
        }
        self.lr()
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn policy(&self) -> LrPolicy {
        self.policy
    }

    /// Snapshot of the scheduler position
    pub fn state(&self) -> ScheduleState {
        ScheduleState {
            base_lr: self.base_lr,
            ticks: self.ticks,
        }
    }

    /// Restore a previously captured position
    pub fn load_state(&mut self, state: ScheduleState) {
        self.base_lr = state.base_lr;
        self.ticks = state.ticks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_decay_multiplier() {
        let policy = LrPolicy::new(0.5, 1000);
        assert_eq!(policy.multiplier(0), 1.0);
        assert_eq!(policy.multiplier(999), 1.0);
        assert_eq!(policy.multiplier(1000), 0.5);
        assert_eq!(policy.multiplier(2500), 0.25);
    }

    #[test]
    fn test_multiplier_is_non_increasing() {
        let policy = LrPolicy::new(0.9, 7);
        let mut previous = f64::INFINITY;
        for n in 0..200 {
            let m = policy.multiplier(n);
            assert!(m <= previous);
            previous = m;
        }
    }

    #[test]
    fn test_batch_granularity() {
        let mut scheduler = LearningRateScheduler::new(0.1, LrPolicy::new(0.5, 2), Granularity::Batch);
        assert_eq!(scheduler.on_batch(), 0.1); // tick 1
        assert_eq!(scheduler.on_batch(), 0.05); // tick 2
        assert_eq!(scheduler.on_epoch(), 0.05);
        assert_eq!(scheduler.state().ticks, 2);
    }

    #[test]
    fn test_epoch_granularity() {
        let mut scheduler = LearningRateScheduler::new(1.0, LrPolicy::new(0.1, 1), Granularity::Epoch);
        for _ in 0..10 {
            scheduler.on_batch();
        }
        assert_eq!(scheduler.lr(), 1.0);
        scheduler.on_epoch();
        assert!((scheduler.lr() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_state_round_trip() {
        let mut scheduler = LearningRateScheduler::new(0.01, LrPolicy::new(0.5, 3), Granularity::Batch);
        for _ in 0..7 {
            scheduler.on_batch();
        }
        let state = scheduler.state();

        let mut restored = LearningRateScheduler::new(0.01, LrPolicy::new(0.5, 3), Granularity::Batch);
        restored.load_state(state);
        assert_eq!(restored.lr(), scheduler.lr());
        assert_eq!(restored.state(), state);
    }

    #[test]
    fn test_zero_step_does_not_panic() {
        let policy = LrPolicy::new(0.5, 0);
        assert_eq!(policy.multiplier(3), 0.125);
    }
}
