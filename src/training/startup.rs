//! How a run starts: from scratch, resuming a snapshot, or from pretrained weights.

use crate::model::checkpoint::{load_file, Checkpoint, CheckpointStore};
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Which snapshot to resume from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeFrom {
    /// Whatever `{run_id}_best.json` points at
    Best,
    /// An explicit checkpoint file
    Path(PathBuf),
}

/// Resolved starting point of a run
#[derive(Debug, Clone)]
pub enum Startup {
    Fresh,
    /// Restore everything and continue after the snapshot's epoch
    Resume { path: PathBuf, checkpoint: Checkpoint },
    /// Take only the model weights of a snapshot
    Pretrain { path: PathBuf, checkpoint: Checkpoint },
}

impl Startup {
    /// Load whatever the flags ask for, failing before any training happens
    pub fn resolve(
        resume: Option<ResumeFrom>,
        pretrain: Option<&Path>,
        store: &CheckpointStore,
        run_id: &str,
    ) -> Result<Self> {
        match (resume, pretrain) {
            (Some(_), Some(_)) => bail!("--resume and --pretrain cannot be combined"),
            (Some(ResumeFrom::Best), None) => {
                let (path, checkpoint) = store
                    .load_best(run_id)
                    .with_context(|| format!("Failed to resume best checkpoint of run {:?}", run_id))?;
                info!("Resuming from {:?} (epoch {})", path, checkpoint.epoch);
                Ok(Startup::Resume { path, checkpoint })
            }
            (Some(ResumeFrom::Path(path)), None) => {
                let checkpoint = load_file(&path)
                    .with_context(|| format!("Failed to load resume checkpoint {:?}", path))?;
                info!("Resuming from {:?} (epoch {})", path, checkpoint.epoch);
                Ok(Startup::Resume { path, checkpoint })
            }
            (None, Some(path)) => {
                let checkpoint = load_file(path)
                    .with_context(|| format!("Failed to load pretrained weights {:?}", path))?;
                info!("Loading pretrained weights from {:?}", path);
                Ok(Startup::Pretrain {
                    path: path.to_path_buf(),
                    checkpoint,
                })
            }
            (None, None) => Ok(Startup::Fresh),
        }
    }

    pub fn is_resume(&self) -> bool {
        matches!(self, Startup::Resume { .. })
    }

    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            Startup::Fresh => "fresh run".to_string(),
            Startup::Resume { path, checkpoint } => {
                format!("resume from {:?} at epoch {}", path, checkpoint.epoch)
            }
            Startup::Pretrain { path, .. } => format!("pretrained weights from {:?}", path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::checkpoint::CheckpointKey;
    use crate::training::ScheduleState;
    use tempfile::TempDir;

    fn checkpoint(epoch: usize) -> Checkpoint {
        Checkpoint {
            epoch,
            global_step: epoch * 10,
            model: vec![1, 2, 3],
            optimizer: vec![4],
            schedule: ScheduleState {
                base_lr: 0.1,
                ticks: 3,
            },
            best_metric: Some(0.5),
        }
    }

    #[test]
    fn test_fresh() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let startup = Startup::resolve(None, None, &store, "run").unwrap();
        assert!(matches!(startup, Startup::Fresh));
        assert!(!startup.is_resume());
    }

    #[test]
    fn test_conflicting_flags() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let result = Startup::resolve(
            Some(ResumeFrom::Best),
            Some(Path::new("weights.ckpt")),
            &store,
            "run",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_files_fail_fast() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let missing = dir.path().join("missing.ckpt");

        assert!(Startup::resolve(Some(ResumeFrom::Best), None, &store, "run").is_err());
        assert!(
            Startup::resolve(Some(ResumeFrom::Path(missing.clone())), None, &store, "run").is_err()
        );
        assert!(Startup::resolve(None, Some(&missing), &store, "run").is_err());
    }

    #[test]
    fn test_resume_best_and_pretrain() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let path = store
            .save_best(&checkpoint(4), &CheckpointKey::new("run", 4, 40, Some(0.5)))
            .unwrap();

        match Startup::resolve(Some(ResumeFrom::Best), None, &store, "run").unwrap() {
            Startup::Resume {
                path: resolved,
                checkpoint,
            } => {
                assert_eq!(resolved, path);
                assert_eq!(checkpoint.epoch, 4);
            }
            other => panic!("unexpected startup {:?}", other),
        }

        let startup = Startup::resolve(None, Some(&path), &store, "other").unwrap();
        assert!(matches!(startup, Startup::Pretrain { .. }));
        assert!(startup.describe().starts_with("pretrained"));
    }
}
