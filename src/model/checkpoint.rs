use crate::training::{ScheduleState, TrainingConfig};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// File extension of checkpoint snapshots
pub const CHECKPOINT_EXT: &str = "ckpt";

const MAGIC: &[u8; 4] = b"OCRT";
const FORMAT_VERSION: u8 = 1;

/// Errors raised by [`CheckpointStore`]
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0:?}")]
    NotFound(PathBuf),

    #[error("checkpoint {path:?} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("I/O error on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode checkpoint: {0}")]
    Encode(String),
}

pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;

/// Point-in-time snapshot of a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last completed epoch
    pub epoch: usize,
    /// Processed training batches at save time
    pub global_step: usize,
    /// Model weights
    pub model: Vec<u8>,
    /// Optimizer state
    pub optimizer: Vec<u8>,
    /// Learning rate schedule position
    pub schedule: ScheduleState,
    /// Best monitored metric seen so far
    pub best_metric: Option<f64>,
}

/// Structured checkpoint name: `{run_id}_{epoch}_{step}_{metric}.ckpt`
///
/// `step` is the global training step at save time, so two snapshots of the
/// same run never share a name.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointKey {
    pub run_id: String,
    pub epoch: usize,
    /// Global step the snapshot was taken at
    pub step: usize,
    /// Metric the snapshot was taken at; `None` for periodic saves without one
    pub metric: Option<f64>,
}

impl CheckpointKey {
    pub fn new(run_id: impl Into<String>, epoch: usize, step: usize, metric: Option<f64>) -> Self {
        Self {
            run_id: run_id.into(),
            epoch,
            step,
            metric,
        }
    }

    /// Deterministic file name, metric rendered with four decimals
    pub fn file_name(&self) -> String {
        let metric = match self.metric {
            Some(value) => format!("{:.4}", value),
            None => "none".to_string(),
        };
        format!(
            "{}_{}_{}_{}.{}",
            self.run_id, self.epoch, self.step, metric, CHECKPOINT_EXT
        )
    }

    /// Parse a name produced by [`file_name`](Self::file_name).
    ///
    /// The run id may itself contain underscores, so fields are split from
    /// the right.
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(&format!(".{}", CHECKPOINT_EXT))?;
        let mut parts = stem.rsplitn(4, '_');
        let metric = parts.next()?;
        let step = parts.next()?.parse().ok()?;
        let epoch = parts.next()?.parse().ok()?;
        let run_id = parts.next()?;
        if run_id.is_empty() {
            return None;
        }

        let metric = match metric {
            "none" => None,
            value => Some(value.parse().ok()?),
        };
        Some(Self::new(run_id, epoch, step, metric))
    }
}

/// Contents of `{run_id}_best.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestPointer {
    /// Checkpoint file name, relative to the store directory
    pub file: String,
    pub epoch: usize,
    pub step: usize,
    pub metric: Option<f64>,
}

/// Directory of checkpoint snapshots.
///
/// Files are gzip-compressed bincode behind a short magic/version header.
/// Every write goes to a temporary sibling first and is renamed into place;
/// existing snapshots are never rewritten or removed.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Create store rooted at `dir`; the directory is created on first save
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(&config.checkpoint_dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist `checkpoint` under the name derived from `key`
    pub fn save(&self, checkpoint: &Checkpoint, key: &CheckpointKey) -> CheckpointResult<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.dir.join(key.file_name());
        write_atomic(&path, &encode(checkpoint)?)?;
        info!("Saved checkpoint: {:?}", path);
        Ok(path)
    }

    /// Persist an improving snapshot and point `{run_id}_best.json` at it
    pub fn save_best(
        &self,
        checkpoint: &Checkpoint,
        key: &CheckpointKey,
    ) -> CheckpointResult<PathBuf> {
        let path = self.save(checkpoint, key)?;

        let pointer = BestPointer {
            file: key.file_name(),
            epoch: key.epoch,
            step: key.step,
            metric: key.metric,
        };
        let json = serde_json::to_vec_pretty(&pointer)
            .map_err(|e| CheckpointError::Encode(e.to_string()))?;
        let pointer_path = self.best_pointer_path(&key.run_id);
        write_atomic(&pointer_path, &json)?;
        debug!("Updated best pointer {:?} -> {}", pointer_path, pointer.file);

        Ok(path)
    }

    /// Read a snapshot
    pub fn load<P: AsRef<Path>>(&self, path: P) -> CheckpointResult<Checkpoint> {
        load_file(path.as_ref())
    }

    /// Resolve and read the latest best snapshot of `run_id`
    pub fn load_best(&self, run_id: &str) -> CheckpointResult<(PathBuf, Checkpoint)> {
        let path = self.best_path(run_id)?;
        let checkpoint = load_file(&path)?;
        Ok((path, checkpoint))
    }

    /// Path the best pointer of `run_id` currently names
    pub fn best_path(&self, run_id: &str) -> CheckpointResult<PathBuf> {
        let pointer_path = self.best_pointer_path(run_id);
        let json = read_file(&pointer_path)?;
        let pointer: BestPointer =
            serde_json::from_slice(&json).map_err(|e| CheckpointError::Corrupt {
                path: pointer_path.clone(),
                reason: e.to_string(),
            })?;
        Ok(self.dir.join(pointer.file))
    }

    /// Snapshots belonging to `run_id`, ordered by epoch and step
    pub fn list(&self, run_id: &str) -> CheckpointResult<Vec<(CheckpointKey, PathBuf)>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).map_err(|source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut checkpoints = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CheckpointError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            let Some(key) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(CheckpointKey::parse)
            else {
                continue;
            };
            if key.run_id == run_id {
                checkpoints.push((key, path));
            }
        }

        checkpoints.sort_by(|(a, pa), (b, pb)| {
            (a.epoch, a.step).cmp(&(b.epoch, b.step)).then_with(|| pa.cmp(pb))
        });
        Ok(checkpoints)
    }

    fn best_pointer_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}_best.json", run_id))
    }
}

/// Read a snapshot from an arbitrary path
pub fn load_file(path: &Path) -> CheckpointResult<Checkpoint> {
    let bytes = read_file(path)?;
    decode(path, &bytes)
}

fn encode(checkpoint: &Checkpoint) -> CheckpointResult<Vec<u8>> {
    let payload = bincode::serialize(checkpoint).map_err(|e| CheckpointError::Encode(e.to_string()))?;

    let mut buffer = Vec::with_capacity(payload.len() / 2 + MAGIC.len() + 1);
    buffer.extend_from_slice(MAGIC);
    buffer.push(FORMAT_VERSION);

    let mut encoder = GzEncoder::new(buffer, Compression::default());
    encoder
        .write_all(&payload)
        .map_err(|e| CheckpointError::Encode(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CheckpointError::Encode(e.to_string()))
}

fn decode(path: &Path, bytes: &[u8]) -> CheckpointResult<Checkpoint> {
    let corrupt = |reason: String| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let header = MAGIC.len() + 1;
    if bytes.len() < header || &bytes[..MAGIC.len()] != MAGIC {
        return Err(corrupt("missing checkpoint header".to_string()));
    }
    let version = bytes[MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported format version {}", version)));
    }

    let mut payload = Vec::new();
    GzDecoder::new(&bytes[header..])
        .read_to_end(&mut payload)
        .map_err(|e| corrupt(e.to_string()))?;
    bincode::deserialize(&payload).map_err(|e| corrupt(e.to_string()))
}

fn read_file(path: &Path) -> CheckpointResult<Vec<u8>> {
    fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            CheckpointError::NotFound(path.to_path_buf())
        } else {
            CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> CheckpointResult<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("checkpoint");
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    fs::write(&tmp, bytes).map_err(|source| CheckpointError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })
}
