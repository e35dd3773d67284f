use super::{int_tensor, stack_images, to_host, to_host_int, Posttreated, Treatment};
use crate::data::label::AttentionConverter;
use crate::data::TextSample;
use crate::model::loss::SequenceCriterion;
use crate::model::{Mode, Model};
use anyhow::{bail, Context, Result};
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use std::marker::PhantomData;

/// Network input for attention recognizers
#[derive(Debug, Clone)]
pub struct AttentionInput<B: Backend> {
    pub images: Tensor<B, 4>,
    /// Concatenated target indices used for teacher forcing
    pub text: Tensor<B, 1, Int>,
    /// Reversed targets, present for bidirectional decoders
    pub text_rev: Option<Tensor<B, 1, Int>>,
    /// Decoding steps per sample, end marker included
    pub lengths: Vec<usize>,
}

/// Step scores concatenated over the batch, `[sum(lengths), classes]`
#[derive(Debug, Clone)]
pub struct AttentionOutput<B: Backend> {
    pub forward: Tensor<B, 2>,
    pub reverse: Option<Tensor<B, 2>>,
}

/// Targets kept from pretreatment
#[derive(Debug, Clone)]
pub struct AttentionTargets<B: Backend> {
    pub text: Tensor<B, 1, Int>,
    pub text_rev: Option<Tensor<B, 1, Int>>,
    pub lengths: Vec<usize>,
}

/// One decoded direction of one sample
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionalDecode {
    /// Text before the end marker, in decoding order
    pub text: String,
    /// Mean step probability up to and including the end marker
    pub confidence: f64,
}

/// Pick the more confident direction.
///
/// A reverse-direction result is flipped back to reading order. Ties go to
/// the reverse decoder.
pub fn select_direction(forward: DirectionalDecode, reverse: DirectionalDecode) -> String {
    if forward.confidence > reverse.confidence {
        forward.text
    } else {
        reverse.text.chars().rev().collect()
    }
}

/// Decode each sample from its own slot of the concatenated step outputs.
///
/// The confidence window never leaves `[offset, offset + length)`, so a
/// sample's score cannot pick up steps belonging to its neighbour.
pub fn decode_slots(
    converter: &AttentionConverter,
    indices: &[i64],
    probs: &[f32],
    lengths: &[usize],
) -> Result<Vec<DirectionalDecode>> {
    let total: usize = lengths.iter().sum();
    if indices.len() != total || probs.len() != total {
        bail!(
            "Decoder produced {} steps ({} scores) for {} expected",
            indices.len(),
            probs.len(),
            total
        );
    }

    let mut decoded = Vec::with_capacity(lengths.len());
    let mut offset = 0;
    for &length in lengths {
        let slot = offset..offset + length;
        let steps = converter.decoded_steps(&indices[slot.clone()]);
        let confidence = if steps == 0 {
            0.0
        } else {
            probs[offset..offset + steps].iter().map(|&p| p as f64).sum::<f64>() / steps as f64
        };
        decoded.push(DirectionalDecode {
            text: converter.decode(&indices[slot]),
            confidence,
        });
        offset += length;
    }
    Ok(decoded)
}

/// Adapter for attention recognizers (MORAN), optionally bidirectional.
#[derive(Debug, Clone)]
pub struct AttentionTreatment<B: Backend, C> {
    criterion: C,
    converter: AttentionConverter,
    image_shape: [usize; 3],
    bidirectional: bool,
    device: B::Device,
    _backend: PhantomData<B>,
}

impl<B: Backend, C: SequenceCriterion<B>> AttentionTreatment<B, C> {
    pub fn new(
        criterion: C,
        converter: AttentionConverter,
        image_shape: [usize; 3],
        device: B::Device,
    ) -> Self {
        Self {
            criterion,
            converter,
            image_shape,
            bidirectional: false,
            device,
            _backend: PhantomData,
        }
    }

    /// Train and decode a reversed decoder alongside the forward one
    pub fn with_bidirectional(mut self, bidirectional: bool) -> Self {
        self.bidirectional = bidirectional;
        self
    }

    pub fn is_bidirectional(&self) -> bool {
        self.bidirectional
    }

    fn decode_direction(&self, scores: Tensor<B, 2>, lengths: &[usize]) -> Result<Vec<DirectionalDecode>> {
        let (probs, indices) = softmax(scores, 1).max_dim_with_indices(1);
        decode_slots(
            &self.converter,
            &to_host_int(indices)?,
            &to_host(probs)?,
            lengths,
        )
    }
}

impl<B, C, M> Treatment<M> for AttentionTreatment<B, C>
where
    B: Backend,
    C: SequenceCriterion<B>,
    M: Model<Input = AttentionInput<B>, Output = AttentionOutput<B>>,
{
    type Batch = Vec<TextSample>;
    type Artifacts = AttentionTargets<B>;
    type Loss = Tensor<B, 1>;

    fn pretreatment(&self, batch: &Self::Batch) -> Result<(AttentionInput<B>, AttentionTargets<B>)> {
        let images = stack_images(
            batch.iter().map(|s| s.image.as_slice()),
            self.image_shape,
            &self.device,
        )
        .context("Malformed recognition image batch")?;

        let labels: Vec<&str> = batch.iter().map(|s| s.label.as_str()).collect();
        let encoded = self.converter.encode(&labels)?;
        let text = int_tensor(encoded.indices, &self.device);

        let text_rev = if self.bidirectional {
            let reversed: Vec<String> = labels.iter().map(|l| l.chars().rev().collect()).collect();
            let encoded = self.converter.encode(&reversed)?;
            Some(int_tensor(encoded.indices, &self.device))
        } else {
            None
        };

        let input = AttentionInput {
            images,
            text: text.clone(),
            text_rev: text_rev.clone(),
            lengths: encoded.lengths.clone(),
        };
        let targets = AttentionTargets {
            text,
            text_rev,
            lengths: encoded.lengths,
        };
        Ok((input, targets))
    }

    fn posttreatment(
        &self,
        output: AttentionOutput<B>,
        targets: AttentionTargets<B>,
        batch: &Self::Batch,
        mode: Mode,
    ) -> Result<Posttreated<Tensor<B, 1>>> {
        let expected: usize = targets.lengths.iter().sum();
        let [steps, classes] = output.forward.dims();
        if steps != expected {
            bail!("Decoder produced {} steps, targets need {}", steps, expected);
        }

        let reverse = match (self.bidirectional, output.reverse, targets.text_rev) {
            (true, Some(scores), Some(text_rev)) => {
                let [reverse_steps, reverse_classes] = scores.dims();
                if reverse_steps != expected || reverse_classes != classes {
                    bail!(
                        "Reverse decoder produced [{}, {}] scores, expected [{}, {}]",
                        reverse_steps,
                        reverse_classes,
                        expected,
                        classes
                    );
                }
                Some((scores, text_rev))
            }
            (true, _, _) => bail!("Bidirectional decoding needs reverse scores and targets"),
            (false, _, _) => None,
        };

        let loss = match &reverse {
            Some((scores, text_rev)) => self.criterion.compute(
                Tensor::cat(vec![output.forward.clone(), scores.clone()], 0),
                Tensor::cat(vec![targets.text, text_rev.clone()], 0),
            ),
            None => self.criterion.compute(output.forward.clone(), targets.text),
        };

        if mode.is_train() {
            return Ok(Posttreated::Loss(loss));
        }

        let forward = self.decode_direction(output.forward, &targets.lengths)?;
        let predictions = match reverse {
            Some((scores, _)) => {
                let reverse = self.decode_direction(scores, &targets.lengths)?;
                forward
                    .into_iter()
                    .zip(reverse)
                    .map(|(f, r)| select_direction(f, r))
                    .collect()
            }
            None => forward.into_iter().map(|f| f.text).collect(),
        };

        Ok(Posttreated::Decoded {
            loss,
            predictions,
            targets: batch.iter().map(|s| s.label.clone()).collect(),
        })
    }

    fn batch_size(&self, batch: &Self::Batch) -> usize {
        batch.len()
    }
}
