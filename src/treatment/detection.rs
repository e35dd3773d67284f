use super::{stack_images, Posttreated, Treatment};
use crate::data::DetectionSample;
use crate::model::loss::DetectionCriterion;
use crate::model::{Mode, Model};
use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use std::marker::PhantomData;

/// Adapter for dense-map detectors.
///
/// The network maps `[n, c, h, w]` images to `[n, k, h', w']` score maps and
/// the loss is taken directly against the ground-truth map. Nothing is decoded.
#[derive(Debug, Clone)]
pub struct DetectionTreatment<B: Backend, C> {
    criterion: C,
    image_shape: [usize; 3],
    map_shape: [usize; 3],
    device: B::Device,
    _backend: PhantomData<B>,
}

impl<B: Backend, C: DetectionCriterion<B>> DetectionTreatment<B, C> {
    /// `image_shape` and `map_shape` are per-sample `[channels, height, width]`
    pub fn new(criterion: C, image_shape: [usize; 3], map_shape: [usize; 3], device: B::Device) -> Self {
        Self {
            criterion,
            image_shape,
            map_shape,
            device,
            _backend: PhantomData,
        }
    }
}

impl<B, C, M> Treatment<M> for DetectionTreatment<B, C>
where
    B: Backend,
    C: DetectionCriterion<B>,
    M: Model<Input = Tensor<B, 4>, Output = Tensor<B, 4>>,
{
    type Batch = Vec<DetectionSample>;
    type Artifacts = Tensor<B, 4>;
    type Loss = Tensor<B, 1>;

    fn pretreatment(&self, batch: &Self::Batch) -> Result<(Tensor<B, 4>, Tensor<B, 4>)> {
        let images = stack_images(
            batch.iter().map(|s| s.image.as_slice()),
            self.image_shape,
            &self.device,
        )
        .context("Malformed detection image batch")?;
        let ground_truth = stack_images(
            batch.iter().map(|s| s.ground_truth.as_slice()),
            self.map_shape,
            &self.device,
        )
        .context("Malformed ground-truth batch")?;
        Ok((images, ground_truth))
    }

    fn posttreatment(
        &self,
        output: Tensor<B, 4>,
        ground_truth: Tensor<B, 4>,
        _batch: &Self::Batch,
        _mode: Mode,
    ) -> Result<Posttreated<Tensor<B, 1>>> {
        let (expected, actual) = (ground_truth.dims(), output.dims());
        if expected != actual {
            anyhow::bail!(
                "Prediction shape {:?} does not match ground truth {:?}",
                actual,
                expected
            );
        }
        Ok(Posttreated::Loss(self.criterion.compute(ground_truth, output)))
    }

    fn batch_size(&self, batch: &Self::Batch) -> usize {
        batch.len()
    }
}
