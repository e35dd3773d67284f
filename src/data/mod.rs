pub mod label;

use anyhow::{bail, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Finite, restartable sequence of batches.
///
/// Each call to [`batches`](BatchSource::batches) starts a new pass; the
/// trainer consumes exactly one pass per epoch and never reorders it.
pub trait BatchSource {
    type Batch;

    /// Number of batches in one pass, if known up front
    fn len_hint(&self) -> Option<usize>;

    /// Begin a new pass over the data
    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Self::Batch>> + '_>;
}

/// Image with a dense ground-truth map, both flattened channel-major
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionSample {
    pub image: Vec<f32>,
    pub ground_truth: Vec<f32>,
}

/// Text-line image with its transcription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextSample {
    /// Pixels, flattened channel-major
    pub image: Vec<f32>,
    pub label: String,
}

impl TextSample {
    pub fn new(image: Vec<f32>, label: impl Into<String>) -> Self {
        Self {
            image,
            label: label.into(),
        }
    }
}

/// In-memory samples cut into fixed-size batches.
///
/// With a seed set, every pass is shuffled by a ChaCha stream seeded from
/// `seed + pass`, so runs are reproducible and consecutive epochs differ.
#[derive(Debug, Clone)]
pub struct VecSource<T> {
    samples: Vec<T>,
    batch_size: usize,
    drop_last: bool,
    seed: Option<u64>,
    pass: u64,
}

impl<T: Clone> VecSource<T> {
    /// Create source yielding batches of up to `batch_size` samples
    pub fn new(samples: Vec<T>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            bail!("batch_size must be positive");
        }
        Ok(Self {
            samples,
            batch_size,
            drop_last: false,
            seed: None,
            pass: 0,
        })
    }

    /// Shuffle every pass
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Skip a trailing batch smaller than `batch_size`
    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn order(&mut self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if let Some(seed) = self.seed {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(self.pass));
            order.shuffle(&mut rng);
        }
        self.pass += 1;
        order
    }
}

impl<T: Clone> BatchSource for VecSource<T> {
    type Batch = Vec<T>;

    fn len_hint(&self) -> Option<usize> {
        let full = self.samples.len() / self.batch_size;
        let partial = self.samples.len() % self.batch_size != 0;
        Some(if partial && !self.drop_last { full + 1 } else { full })
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Vec<T>>> + '_> {
        let order = self.order();
        let batch_size = self.batch_size;
        let drop_last = self.drop_last;
        let samples = &self.samples;
        let len = order.len();

        // Samples are cloned one batch at a time as the pass advances
        let batches = (0..len)
            .step_by(batch_size)
            .filter(move |&start| !drop_last || start + batch_size <= len)
            .map(move |start| -> Result<Vec<T>> {
                let end = (start + batch_size).min(len);
                Ok(order[start..end].iter().map(|&i| samples[i].clone()).collect())
            });
        Box::new(batches)
    }
}

/// Source backed by a closure producing one pass per call.
///
/// The closure receives the zero-based pass number. Useful for streaming
/// readers that reopen their input every epoch.
pub struct EpochFn<F> {
    make: F,
    len: Option<usize>,
    pass: usize,
}

impl<F> EpochFn<F> {
    pub fn new(make: F) -> Self {
        Self {
            make,
            len: None,
            pass: 0,
        }
    }

    /// Advertise the number of batches per pass
    pub fn with_len(mut self, len: usize) -> Self {
        self.len = Some(len);
        self
    }
}

impl<F, I, T> BatchSource for EpochFn<F>
where
    F: FnMut(usize) -> I,
    I: Iterator<Item = Result<T>> + 'static,
{
    type Batch = T;

    fn len_hint(&self) -> Option<usize> {
        self.len
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<T>> + '_> {
        let pass = self.pass;
        self.pass += 1;
        Box::new((self.make)(pass))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect<S: BatchSource>(source: &mut S) -> Vec<S::Batch> {
        source.batches().collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_vec_source_batches_in_order() {
        let mut source = VecSource::new((0..7).collect::<Vec<u32>>(), 3).unwrap();
        assert_eq!(source.len_hint(), Some(3));
        assert_eq!(
            collect(&mut source),
            vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]
        );
        // Restartable without shuffling
        assert_eq!(collect(&mut source).len(), 3);
    }

    #[test]
    fn test_vec_source_drop_last() {
        let mut source = VecSource::new((0..7).collect::<Vec<u32>>(), 3)
            .unwrap()
            .with_drop_last(true);
        assert_eq!(source.len_hint(), Some(2));
        assert_eq!(collect(&mut source), vec![vec![0, 1, 2], vec![3, 4, 5]]);
    }

    #[test]
    fn test_vec_source_shuffle_is_seeded() {
        let samples: Vec<u32> = (0..32).collect();
        let mut a = VecSource::new(samples.clone(), 4).unwrap().with_shuffle(7);
        let mut b = VecSource::new(samples.clone(), 4).unwrap().with_shuffle(7);

        let first = collect(&mut a);
        assert_eq!(first, collect(&mut b));
        assert_ne!(first, collect(&mut a));

        let mut seen: Vec<u32> = first.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, samples);
    }

    /// Counts how often it is cloned
    struct Tracked(std::rc::Rc<std::cell::Cell<usize>>);

    impl Clone for Tracked {
        fn clone(&self) -> Self {
            self.0.set(self.0.get() + 1);
            Tracked(self.0.clone())
        }
    }

    #[test]
    fn test_vec_source_clones_per_batch() {
        let clones = std::rc::Rc::new(std::cell::Cell::new(0));
        let samples = (0..6).map(|_| Tracked(clones.clone())).collect::<Vec<_>>();
        let mut source = VecSource::new(samples, 2).unwrap();

        let mut batches = source.batches();
        let first = batches.next().unwrap().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(clones.get(), 2);

        assert_eq!(batches.count(), 2);
        assert_eq!(clones.get(), 6);
    }

    #[test]
    fn test_empty_source() {
        let mut source = VecSource::new(Vec::<u32>::new(), 4).unwrap();
        assert!(source.is_empty());
        assert_eq!(source.len_hint(), Some(0));
        assert!(collect(&mut source).is_empty());
        assert!(VecSource::new(vec![1u32], 0).is_err());
    }

    #[test]
    fn test_epoch_fn_counts_passes() {
        let mut source =
            EpochFn::new(|pass: usize| (0..pass + 1).map(|i| Ok::<usize, anyhow::Error>(i)))
                .with_len(1);
        assert_eq!(source.len_hint(), Some(1));
        assert_eq!(collect(&mut source), vec![0]);
        assert_eq!(collect(&mut source), vec![0, 1]);
    }
}
