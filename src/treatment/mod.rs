//! Model-specific adapters around the generic training loop.
//!
//! A [`Treatment`] turns a raw batch into network input (pretreatment) and
//! the network output back into a loss and, when evaluating, decoded text
//! (posttreatment).

pub mod attention;
pub mod ctc;
pub mod detection;

use crate::model::loss::ScalarLoss;
use crate::model::{Mode, Model};
use anyhow::{anyhow, bail, Result};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};

pub use attention::{AttentionInput, AttentionOutput, AttentionTreatment};
pub use ctc::CtcTreatment;
pub use detection::DetectionTreatment;

/// Posttreatment result
#[derive(Debug, Clone)]
pub enum Posttreated<L> {
    /// Loss only (training, or models without a decoder)
    Loss(L),
    /// Loss plus decoded predictions and their ground truth, in batch order
    Decoded {
        loss: L,
        predictions: Vec<String>,
        targets: Vec<String>,
    },
}

impl<L> Posttreated<L> {
    pub fn loss(&self) -> &L {
        match self {
            Posttreated::Loss(loss) | Posttreated::Decoded { loss, .. } => loss,
        }
    }

    pub fn into_loss(self) -> L {
        match self {
            Posttreated::Loss(loss) | Posttreated::Decoded { loss, .. } => loss,
        }
    }
}

/// Strategy converting batches to model input and model output to a loss
pub trait Treatment<M: Model> {
    /// Raw batch yielded by the data source
    type Batch;
    /// Values produced by pretreatment that posttreatment needs (encoded targets)
    type Artifacts;
    /// Loss handed to the optimizer
    type Loss: ScalarLoss;

    /// Build network input from a raw batch
    fn pretreatment(&self, batch: &Self::Batch) -> Result<(M::Input, Self::Artifacts)>;

    /// Compute the loss, decoding predictions when `mode` is `Eval`
    fn posttreatment(
        &self,
        output: M::Output,
        artifacts: Self::Artifacts,
        batch: &Self::Batch,
        mode: Mode,
    ) -> Result<Posttreated<Self::Loss>>;

    /// Number of samples in `batch`, used to weight loss averages
    fn batch_size(&self, batch: &Self::Batch) -> usize;
}

/// Stack flattened `[c, h, w]` samples into a `[n, c, h, w]` tensor
pub(crate) fn stack_images<'a, B: Backend>(
    images: impl ExactSizeIterator<Item = &'a [f32]>,
    shape: [usize; 3],
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let n = images.len();
    let per_sample = shape.iter().product::<usize>();
    let mut flat = Vec::with_capacity(n * per_sample);
    for (i, image) in images.enumerate() {
        if image.len() != per_sample {
            bail!(
                "Sample {} has {} values, expected {} for shape {:?}",
                i,
                image.len(),
                per_sample,
                shape
            );
        }
        flat.extend_from_slice(image);
    }
    Ok(Tensor::from_data(
        TensorData::new(flat, [n, shape[0], shape[1], shape[2]]),
        device,
    ))
}

/// Host copy of integer class indices
pub(crate) fn int_tensor<B: Backend>(values: Vec<i64>, device: &B::Device) -> Tensor<B, 1, Int> {
    let n = values.len();
    Tensor::from_data(TensorData::new(values, [n]), device)
}

/// Flatten a float tensor to host memory
pub(crate) fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("Failed to read tensor: {:?}", e))
}

/// Flatten an integer tensor to host memory
pub(crate) fn to_host_int<B: Backend, const D: usize>(
    tensor: Tensor<B, D, Int>,
) -> Result<Vec<i64>> {
    tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| anyhow!("Failed to read tensor: {:?}", e))
}
