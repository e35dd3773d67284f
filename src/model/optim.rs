use crate::model::record::{record_from_bytes, record_to_bytes};
use anyhow::{anyhow, Result};
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer as BurnOptim};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;
use std::marker::PhantomData;

/// Parameter update capability used by the trainer.
///
/// The trainer calls `zero_grad`, `backward` and `step` in that order for
/// every training batch.
pub trait Optimizer<M> {
    /// Loss value the gradients are taken from
    type Loss;

    /// Drop gradients accumulated for the previous batch
    fn zero_grad(&mut self);

    /// Compute gradients of `loss` with respect to `model`'s parameters
    fn backward(&mut self, loss: Self::Loss, model: &M) -> Result<()>;

    /// Apply accumulated gradients using learning rate `lr`
    fn step(&mut self, model: &mut M, lr: f64) -> Result<()>;

    /// Serialize optimizer state (moments, step counters)
    fn to_bytes(&self) -> Result<Vec<u8>>;

    /// Restore state produced by [`to_bytes`](Self::to_bytes)
    fn load_bytes(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Adapter exposing a burn optimizer through [`Optimizer`].
///
/// burn folds backward, gradient mapping and update into value-passing calls;
/// this keeps the gradients of the current batch between `backward` and
/// `step`.
pub struct BurnOptimizer<O, M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: BurnOptim<M, B>,
{
    inner: Option<O>,
    grads: Option<GradientsParams>,
    device: B::Device,
    _module: PhantomData<M>,
}

impl<O, M, B> BurnOptimizer<O, M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: BurnOptim<M, B>,
{
    /// Wrap an initialized burn optimizer
    pub fn new(optimizer: O, device: B::Device) -> Self {
        Self {
            inner: Some(optimizer),
            grads: None,
            device,
            _module: PhantomData,
        }
    }

    /// Whether gradients are waiting for `step`
    pub fn has_gradients(&self) -> bool {
        self.grads.is_some()
    }

    fn inner(&self) -> Result<&O> {
        self.inner
            .as_ref()
            .ok_or_else(|| anyhow!("Optimizer state was lost during a failed restore"))
    }
}

impl<O, M, B> Optimizer<M> for BurnOptimizer<O, M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: BurnOptim<M, B>,
{
    type Loss = Tensor<B, 1>;

    fn zero_grad(&mut self) {
        self.grads = None;
    }

    fn backward(&mut self, loss: Tensor<B, 1>, model: &M) -> Result<()> {
        let grads = loss.backward();
        self.grads = Some(GradientsParams::from_grads(grads, model));
        Ok(())
    }

    fn step(&mut self, model: &mut M, lr: f64) -> Result<()> {
        let Some(grads) = self.grads.take() else {
            return Ok(());
        };
        let optimizer = self
            .inner
            .as_mut()
            .ok_or_else(|| anyhow!("Optimizer state was lost during a failed restore"))?;
        *model = optimizer.step(lr, model.clone(), grads);
        Ok(())
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        record_to_bytes::<B, O::Record>(self.inner()?.to_record())
    }

    fn load_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let record = record_from_bytes::<B, O::Record>(bytes, &self.device)?;
        let optimizer = self
            .inner
            .take()
            .ok_or_else(|| anyhow!("Optimizer state was lost during a failed restore"))?;
        self.inner = Some(optimizer.load_record(record));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::loss::ScalarLoss;
    use burn::backend::{Autodiff, NdArray};
    use burn::nn::{Linear, LinearConfig};
    use burn::optim::{AdamConfig, SgdConfig};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn squared_error(model: &Linear<TestBackend>) -> Tensor<TestBackend, 1> {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::from_floats([[1.0], [2.0]], &device);
        let y = Tensor::<TestBackend, 2>::from_floats([[2.0], [4.0]], &device);
        (model.forward(x) - y).powf_scalar(2.0).mean()
    }

    #[test]
    fn test_step_reduces_loss() {
        let device = Default::default();
        let mut model: Linear<TestBackend> = LinearConfig::new(1, 1).init(&device);
        let mut optimizer =
            BurnOptimizer::new(SgdConfig::new().init::<TestBackend, Linear<TestBackend>>(), device);

        let before = squared_error(&model).value();
        for _ in 0..5 {
            optimizer.zero_grad();
            optimizer.backward(squared_error(&model), &model).unwrap();
            optimizer.step(&mut model, 0.05).unwrap();
        }
        let after = squared_error(&model).value();

        assert!(after < before, "loss did not decrease: {} -> {}", before, after);
    }

    #[test]
    fn test_step_without_gradients_is_noop() {
        let device = Default::default();
        let mut model: Linear<TestBackend> = LinearConfig::new(1, 1).init(&device);
        let mut optimizer =
            BurnOptimizer::new(SgdConfig::new().init::<TestBackend, Linear<TestBackend>>(), device);

        let before = squared_error(&model).value();
        optimizer.zero_grad();
        optimizer.step(&mut model, 0.05).unwrap();
        assert_eq!(squared_error(&model).value(), before);
        assert!(!optimizer.has_gradients());
    }

    #[test]
    fn test_state_round_trip() {
        let device: <TestBackend as burn::tensor::backend::Backend>::Device = Default::default();
        let mut model: Linear<TestBackend> = LinearConfig::new(1, 1).init(&device);
        let mut optimizer = BurnOptimizer::new(
            AdamConfig::new().init::<TestBackend, Linear<TestBackend>>(),
            device.clone(),
        );

        optimizer.zero_grad();
        optimizer.backward(squared_error(&model), &model).unwrap();
        optimizer.step(&mut model, 0.01).unwrap();

        let bytes = optimizer.to_bytes().unwrap();
        let mut restored = BurnOptimizer::new(
            AdamConfig::new().init::<TestBackend, Linear<TestBackend>>(),
            device,
        );
        restored.load_bytes(&bytes).unwrap();
        // Record maps are keyed by parameter id, entry order is not stable
        assert_eq!(restored.to_bytes().unwrap().len(), bytes.len());
    }
}
