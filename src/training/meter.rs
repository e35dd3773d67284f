/// Weighted running average of a scalar metric.
///
/// `update(value, weight)` accumulates `value * weight`; the average is
/// `sum / count`. A meter that has seen no weight has no average.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AverageMeter {
    /// Last observed value
    val: Option<f64>,
    /// Weighted sum of observed values
    sum: f64,
    /// Sum of weights
    count: f64,
}

impl AverageMeter {
    /// Create empty meter
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` observed over `weight` samples
    pub fn update(&mut self, value: f64, weight: usize) {
        self.val = Some(value);
        self.sum += value * weight as f64;
        self.count += weight as f64;
    }

    /// Clear all accumulated state
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Most recent value, if any
    pub fn val(&self) -> Option<f64> {
        self.val
    }

    /// Current weighted mean, `None` until some weight was observed
    pub fn avg(&self) -> Option<f64> {
        if self.count > 0.0 {
            Some(self.sum / self.count)
        } else {
            None
        }
    }

    /// Total weight observed
    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }
}
