//! # OCRT: OCR training loops
//!
//! OCRT drives the training of OCR networks (text detection and sequence
//! recognition) through one generic loop. The loop owns epoch iteration,
//! optimizer stepping, learning-rate scheduling, early stopping and
//! checkpointing; everything model specific lives in a [`treatment::Treatment`].
//!
//! ## Features
//!
//! - Pluggable pretreatment/posttreatment around a fixed train/validate loop
//! - Detection, CTC and attention (optionally bidirectional) adapters
//! - Step-decay learning rate per batch or per epoch
//! - Patience-based early stopping on loss or accuracy
//! - Resumable checkpoints with a best-checkpoint pointer
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use ocrt::data::VecSource;
//! use ocrt::model::optim::BurnOptimizer;
//! use ocrt::training::{trainer::Trainer, TrainingConfig};
//! use ocrt::treatment::DetectionTreatment;
//!
//! // `model` implements `ocrt::Model`, `criterion` a `DetectionCriterion`
//! let treatment = DetectionTreatment::new(criterion, [3, 512, 512], [7, 128, 128], device.clone());
//! let optimizer = BurnOptimizer::new(AdamConfig::new().init(), device);
//! let config = TrainingConfig::detection();
//! let mut trainer = Trainer::new(config, model, treatment, optimizer)?;
//!
//! let mut train = VecSource::new(train, 8)?.with_shuffle(2024);
//! let mut val = VecSource::new(val, 8)?;
//! let result = trainer.fit(&mut train, &mut val)?;
//! println!("stopped: {:?}, best: {:?}", result.stop_reason, result.best_checkpoint);
//! ```

pub mod cli;
pub mod data;
pub mod model;
pub mod training;
pub mod treatment;
pub mod utils;

/// Default backend type
pub type DefaultBackend = burn::backend::NdArray<f32>;

/// Backend used for training
pub type DefaultAutodiffBackend = burn::backend::Autodiff<DefaultBackend>;

/// Re-export commonly used types
pub use data::{BatchSource, DetectionSample, TextSample, VecSource};
pub use model::checkpoint::{Checkpoint, CheckpointStore};
pub use model::{Mode, Model};
pub use training::trainer::Trainer;
pub use training::{TrainingConfig, TrainingResult};
pub use treatment::{Posttreated, Treatment};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get library information
pub fn info() -> String {
    format!("{} v{} - OCR training loops", NAME, VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_info() {
        let info_str = info();
        assert!(info_str.contains("ocrt"));
        assert!(info_str.contains(VERSION));
    }
}
