use burn::nn::loss::{CrossEntropyLossConfig, MseLoss, Reduction};
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Int, Tensor};

/// Loss value that can be read back as a scalar for logging and averaging
pub trait ScalarLoss {
    fn value(&self) -> f64;
}

impl ScalarLoss for f64 {
    fn value(&self) -> f64 {
        *self
    }
}

impl<B: Backend> ScalarLoss for Tensor<B, 1> {
    fn value(&self) -> f64 {
        self.clone().into_scalar().elem::<f64>()
    }
}

/// Loss between a dense prediction map and its ground-truth map
pub trait DetectionCriterion<B: Backend> {
    fn compute(&self, target: Tensor<B, 4>, prediction: Tensor<B, 4>) -> Tensor<B, 1>;
}

/// Alignment-free sequence loss (CTC) over `[time, batch, classes]` outputs
pub trait CtcCriterion<B: Backend> {
    fn compute(
        &self,
        log_probs: Tensor<B, 3>,
        targets: Tensor<B, 1, Int>,
        input_lengths: Tensor<B, 1, Int>,
        target_lengths: Tensor<B, 1, Int>,
    ) -> Tensor<B, 1>;
}

/// Per-step classification loss over concatenated decoder outputs
pub trait SequenceCriterion<B: Backend> {
    fn compute(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1>;
}

/// Mean squared error between prediction and ground-truth maps
#[derive(Debug, Clone, Default)]
pub struct MseCriterion;

impl<B: Backend> DetectionCriterion<B> for MseCriterion {
    fn compute(&self, target: Tensor<B, 4>, prediction: Tensor<B, 4>) -> Tensor<B, 1> {
        MseLoss::new().forward(prediction, target, Reduction::Mean)
    }
}

/// Cross entropy over decoder steps
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyCriterion;

impl<B: Backend> SequenceCriterion<B> for CrossEntropyCriterion {
    fn compute(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits, targets)
    }
}

/// Metrics for evaluation
pub mod metrics {
    /// Levenshtein distance over characters
    pub fn edit_distance(a: &str, b: &str) -> usize {
        let a: Vec<char> = a.chars().collect();
        let b: Vec<char> = b.chars().collect();
        if a.is_empty() {
            return b.len();
        }

        let mut row: Vec<usize> = (0..=b.len()).collect();
        for (i, ca) in a.iter().enumerate() {
            let mut diagonal = row[0];
            row[0] = i + 1;
            for (j, cb) in b.iter().enumerate() {
                let substitution = diagonal + usize::from(ca != cb);
                diagonal = row[j + 1];
                row[j + 1] = substitution.min(row[j] + 1).min(diagonal + 1);
            }
        }
        row[b.len()]
    }

    /// Edit distance divided by the longer length; 0 for two empty strings
    pub fn normalized_edit_distance(prediction: &str, target: &str) -> f64 {
        let longest = prediction.chars().count().max(target.chars().count());
        if longest == 0 {
            return 0.0;
        }
        edit_distance(prediction, target) as f64 / longest as f64
    }

    /// Exact match against the lowercased target
    pub fn is_match(prediction: &str, target: &str) -> bool {
        prediction == target.to_lowercase()
    }

    /// Running recognition statistics over a validation pass
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct RecognitionStats {
        pub correct: usize,
        pub total: usize,
        pub distance_sum: f64,
    }

    impl RecognitionStats {
        pub fn new() -> Self {
            Self::default()
        }

        /// Account for one prediction/target pair
        pub fn add(&mut self, prediction: &str, target: &str) {
            if is_match(prediction, target) {
                self.correct += 1;
            }
            self.distance_sum += normalized_edit_distance(prediction, target);
            self.total += 1;
        }

        /// Exact-match accuracy, `None` when nothing was scored
        pub fn accuracy(&self) -> Option<f64> {
            (self.total > 0).then(|| self.correct as f64 / self.total as f64)
        }

        /// Mean normalized edit distance, `None` when nothing was scored
        pub fn mean_distance(&self) -> Option<f64> {
            (self.total > 0).then(|| self.distance_sum / self.total as f64)
        }
    }
}
