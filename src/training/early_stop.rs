use crate::training::TrainingConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Direction in which the monitored metric improves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    Minimize,
    Maximize,
}

impl Default for Goal {
    fn default() -> Self {
        Goal::Minimize
    }
}

/// Decision produced for one validation score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Signal {
    /// Training should halt
    pub stop: bool,
    /// The score is a new best and should be persisted
    pub save: bool,
}

/// Early stopping tracker.
///
/// Each call to [`observe`](Self::observe) compares the score with the best
/// seen so far. An improvement larger than `min_delta` (or the first score
/// when no best exists) resets the patience counter and asks for a save.
/// Anything else increments the counter; once it reaches `patience` the
/// tracker signals a stop.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    goal: Goal,
    best: Option<f64>,
    counter: usize,
    stopped: bool,
}

impl EarlyStopping {
    /// Create new tracker, optionally seeded with the best score of a prior run
    pub fn new(patience: usize, goal: Goal, best: Option<f64>) -> Self {
        Self {
            patience,
            min_delta: 0.0,
            goal,
            best,
            counter: 0,
            stopped: false,
        }
    }

    /// Build the tracker described by a training configuration
    pub fn from_config(config: &TrainingConfig, best: Option<f64>) -> Self {
        Self::new(config.patience, config.goal, best).with_min_delta(config.min_delta)
    }

    /// Set minimum change counted as an improvement
    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta.abs();
        self
    }

    fn improves(&self, score: f64) -> bool {
        match self.best {
            None => true,
            Some(best) => match self.goal {
                Goal::Minimize => score < best - self.min_delta,
                Goal::Maximize => score > best + self.min_delta,
            },
        }
    }

    /// Feed one validation score
    pub fn observe(&mut self, score: f64) -> Signal {
        if self.improves(score) {
            debug!("Monitored metric improved: {:?} -> {:.6}", self.best, score);
            self.best = Some(score);
            self.counter = 0;
            return Signal { stop: false, save: true };
        }

        self.counter += 1;
        debug!(
            "No improvement for {} validation(s) (patience {})",
            self.counter, self.patience
        );

        if self.counter >= self.patience {
            if !self.stopped {
                info!(
                    "Early stopping: no improvement for {} validations (best {:?})",
                    self.counter, self.best
                );
            }
            self.stopped = true;
            Signal { stop: true, save: false }
        } else {
            Signal::default()
        }
    }

    /// Best score seen so far
    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Consecutive validations without improvement
    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn patience(&self) -> usize {
        self.patience
    }

    /// Whether a stop has been signalled
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}
