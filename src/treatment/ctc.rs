use super::{int_tensor, stack_images, to_host_int, Posttreated, Treatment};
use crate::data::label::CtcConverter;
use crate::data::TextSample;
use crate::model::loss::CtcCriterion;
use crate::model::{Mode, Model};
use anyhow::{bail, Context, Result};
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use std::marker::PhantomData;

/// Encoded transcriptions of one batch
#[derive(Debug, Clone)]
pub struct CtcTargets<B: Backend> {
    /// Concatenated class indices
    pub targets: Tensor<B, 1, Int>,
    /// Length of each transcription
    pub target_lengths: Tensor<B, 1, Int>,
}

/// Adapter for CTC recognizers (CRNN, GRCNN).
///
/// The network returns per-step class scores shaped `[time, batch, classes]`.
/// Scores are log-softmaxed before the criterion; evaluation decodes the
/// best path greedily.
#[derive(Debug, Clone)]
pub struct CtcTreatment<B: Backend, C> {
    criterion: C,
    converter: CtcConverter,
    image_shape: [usize; 3],
    device: B::Device,
    _backend: PhantomData<B>,
}

impl<B: Backend, C: CtcCriterion<B>> CtcTreatment<B, C> {
    pub fn new(
        criterion: C,
        converter: CtcConverter,
        image_shape: [usize; 3],
        device: B::Device,
    ) -> Self {
        Self {
            criterion,
            converter,
            image_shape,
            device,
            _backend: PhantomData,
        }
    }

    pub fn converter(&self) -> &CtcConverter {
        &self.converter
    }

    /// Greedy decode of `[time, batch, classes]` scores, one string per sample
    pub fn decode(&self, scores: Tensor<B, 3>) -> Result<Vec<String>> {
        let [steps, batch, _] = scores.dims();
        let best = to_host_int(scores.argmax(2))?;

        Ok((0..batch)
            .map(|n| {
                let path: Vec<i64> = (0..steps).map(|t| best[t * batch + n]).collect();
                self.converter.decode(&path)
            })
            .collect())
    }
}

impl<B, C, M> Treatment<M> for CtcTreatment<B, C>
where
    B: Backend,
    C: CtcCriterion<B>,
    M: Model<Input = Tensor<B, 4>, Output = Tensor<B, 3>>,
{
    type Batch = Vec<TextSample>;
    type Artifacts = CtcTargets<B>;
    type Loss = Tensor<B, 1>;

    fn pretreatment(&self, batch: &Self::Batch) -> Result<(Tensor<B, 4>, CtcTargets<B>)> {
        let images = stack_images(
            batch.iter().map(|s| s.image.as_slice()),
            self.image_shape,
            &self.device,
        )
        .context("Malformed recognition image batch")?;

        let labels: Vec<&str> = batch.iter().map(|s| s.label.as_str()).collect();
        let encoded = self.converter.encode(&labels)?;
        let lengths = encoded.lengths.iter().map(|&l| l as i64).collect();

        Ok((
            images,
            CtcTargets {
                targets: int_tensor(encoded.indices, &self.device),
                target_lengths: int_tensor(lengths, &self.device),
            },
        ))
    }

    fn posttreatment(
        &self,
        output: Tensor<B, 3>,
        artifacts: CtcTargets<B>,
        batch: &Self::Batch,
        mode: Mode,
    ) -> Result<Posttreated<Tensor<B, 1>>> {
        let [steps, n, classes] = output.dims();
        if n != batch.len() {
            bail!("Model returned {} sequences for a batch of {}", n, batch.len());
        }
        if classes != self.converter.num_classes() {
            bail!(
                "Model emits {} classes, alphabet needs {}",
                classes,
                self.converter.num_classes()
            );
        }

        let input_lengths = int_tensor(vec![steps as i64; n], &self.device);
        let loss = self.criterion.compute(
            log_softmax(output.clone(), 2),
            artifacts.targets,
            input_lengths,
            artifacts.target_lengths,
        );

        if mode.is_train() {
            return Ok(Posttreated::Loss(loss));
        }

        Ok(Posttreated::Decoded {
            loss,
            predictions: self.decode(output)?,
            targets: batch.iter().map(|s| s.label.clone()).collect(),
        })
    }

    fn batch_size(&self, batch: &Self::Batch) -> usize {
        batch.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::loss::ScalarLoss;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    /// Negative mean log-probability; stands in for a real CTC loss
    struct MeanNll;

    impl<B: Backend> CtcCriterion<B> for MeanNll {
        fn compute(
            &self,
            log_probs: Tensor<B, 3>,
            _targets: Tensor<B, 1, Int>,
            _input_lengths: Tensor<B, 1, Int>,
            _target_lengths: Tensor<B, 1, Int>,
        ) -> Tensor<B, 1> {
            log_probs.mean().neg()
        }
    }

    /// Returns fixed scores regardless of input
    struct FixedScores {
        scores: Vec<f32>,
        shape: [usize; 3],
    }

    impl Model for FixedScores {
        type Input = Tensor<TestBackend, 4>;
        type Output = Tensor<TestBackend, 3>;

        fn forward(&self, input: &Self::Input, _mode: Mode) -> Result<Self::Output> {
            Ok(Tensor::from_data(
                TensorData::new(self.scores.clone(), self.shape),
                &input.device(),
            ))
        }

        fn to_bytes(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn load_bytes(self, _bytes: &[u8]) -> Result<Self> {
            Ok(self)
        }
    }

    fn one_hot_scores(paths: &[&[usize]], classes: usize) -> (Vec<f32>, [usize; 3]) {
        let steps = paths[0].len();
        let batch = paths.len();
        let mut scores = vec![0.0; steps * batch * classes];
        for (n, path) in paths.iter().enumerate() {
            for (t, &class) in path.iter().enumerate() {
                scores[(t * batch + n) * classes + class] = 10.0;
            }
        }
        (scores, [steps, batch, classes])
    }

    fn treatment() -> CtcTreatment<TestBackend, MeanNll> {
        let converter = CtcConverter::new("abc", true).unwrap();
        CtcTreatment::new(MeanNll, converter, [1, 1, 2], Default::default())
    }

    #[test]
    fn test_pretreatment_encodes_labels() {
        let treatment = treatment();
        let batch = vec![
            TextSample::new(vec![0.0, 1.0], "ab"),
            TextSample::new(vec![1.0, 0.0], "C"),
        ];

        let (images, targets) = Treatment::<FixedScores>::pretreatment(&treatment, &batch).unwrap();
        assert_eq!(images.dims(), [2, 1, 1, 2]);
        assert_eq!(to_host_int(targets.targets).unwrap(), vec![1, 2, 3]);
        assert_eq!(to_host_int(targets.target_lengths).unwrap(), vec![2, 1]);

        let bad = vec![TextSample::new(vec![0.0, 1.0], "abz")];
        assert!(Treatment::<FixedScores>::pretreatment(&treatment, &bad).is_err());
    }

    #[test]
    fn test_eval_decodes_best_path() {
        let treatment = treatment();
        let batch = vec![
            TextSample::new(vec![0.0, 0.0], "Cab"),
            TextSample::new(vec![0.0, 0.0], "a"),
        ];
        let (scores, shape) = one_hot_scores(&[&[3, 3, 0, 1, 2, 0], &[1, 0, 0, 0, 1, 1]], 4);
        let model = FixedScores { scores, shape };

        let (input, artifacts) = Treatment::<FixedScores>::pretreatment(&treatment, &batch).unwrap();
        let output = model.forward(&input, Mode::Eval).unwrap();
        let result =
            Treatment::<FixedScores>::posttreatment(&treatment, output, artifacts, &batch, Mode::Eval)
                .unwrap();

        match result {
            Posttreated::Decoded {
                loss,
                predictions,
                targets,
            } => {
                assert!(loss.value() > 0.0);
                assert_eq!(predictions, vec!["cab".to_string(), "aa".to_string()]);
                assert_eq!(targets, vec!["Cab".to_string(), "a".to_string()]);
            }
            Posttreated::Loss(_) => panic!("evaluation must decode"),
        }
    }

    #[test]
    fn test_train_returns_loss_only() {
        let treatment = treatment();
        let batch = vec![TextSample::new(vec![0.0, 0.0], "a")];
        let (scores, shape) = one_hot_scores(&[&[1, 0]], 4);
        let model = FixedScores { scores, shape };

        let (input, artifacts) = Treatment::<FixedScores>::pretreatment(&treatment, &batch).unwrap();
        let output = model.forward(&input, Mode::Train).unwrap();
        let result =
            Treatment::<FixedScores>::posttreatment(&treatment, output, artifacts, &batch, Mode::Train)
                .unwrap();
        assert!(matches!(result, Posttreated::Loss(_)));
    }

    #[test]
    fn test_class_count_mismatch() {
        let treatment = treatment();
        let batch = vec![TextSample::new(vec![0.0, 0.0], "a")];
        let (scores, shape) = one_hot_scores(&[&[1, 0]], 6);
        let model = FixedScores { scores, shape };

        let (input, artifacts) = Treatment::<FixedScores>::pretreatment(&treatment, &batch).unwrap();
        let output = model.forward(&input, Mode::Train).unwrap();
        let result =
            Treatment::<FixedScores>::posttreatment(&treatment, output, artifacts, &batch, Mode::Train);
        assert!(result.is_err());
    }
}
