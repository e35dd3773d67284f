//! Structured per-run log files.
//!
//! One CSV file per run, named after the run id and the wall-clock tick the
//! run started at, receives a row per logged training step and per
//! validation. Rows are flushed immediately so a crashed run keeps its log.

use crate::training::TrainingConfig;
use crate::utils::ensure_dir;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Timestamp format used in log file names
pub const TICK_FORMAT: &str = "%Y%m%d-%H-%M-%S";

/// Current local time rendered with [`TICK_FORMAT`]
pub fn run_tick() -> String {
    chrono::Local::now().format(TICK_FORMAT).to_string()
}

/// Which loop produced a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Split {
    Training,
    Validation,
}

/// One row of the run log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub split: Split,
    pub epoch: usize,
    /// Batch index inside the epoch (training) or global step (validation)
    pub iteration: usize,
    /// Batches per epoch when known
    pub total: Option<usize>,
    pub loss: Option<f64>,
    pub avg_loss: Option<f64>,
    pub learning_rate: Option<f64>,
}

/// Append-only CSV log plus optional prediction dump
pub struct RunLog {
    path: PathBuf,
    writer: csv::Writer<File>,
    predictions: Option<(PathBuf, BufWriter<File>)>,
}

impl RunLog {
    /// Open the log files for a run; `None` when `log_dir` is unset
    pub fn create(config: &TrainingConfig) -> Result<Option<Self>> {
        let Some(dir) = config.log_dir.as_deref() else {
            return Ok(None);
        };
        Self::open(dir, &config.run_id, &run_tick(), config.log_predictions).map(Some)
    }

    /// Open `{dir}/{run_id}_{tick}.csv` and, if asked, the prediction log
    pub fn open(dir: &Path, run_id: &str, tick: &str, predictions: bool) -> Result<Self> {
        ensure_dir(dir)?;

        let path = dir.join(format!("{}_{}.csv", run_id, tick));
        let exists = path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open run log {:?}", path))?;
        let writer = csv::WriterBuilder::new()
            .has_headers(!exists)
            .from_writer(file);

        let predictions = if predictions {
            let path = dir.join(format!("{}_{}_predictions.txt", run_id, tick));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open prediction log {:?}", path))?;
            Some((path, BufWriter::new(file)))
        } else {
            None
        };

        Ok(Self {
            path,
            writer,
            predictions,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn predictions_path(&self) -> Option<&Path> {
        self.predictions.as_ref().map(|(path, _)| path.as_path())
    }

    /// Append a row
    pub fn record(&mut self, record: &LogRecord) -> Result<()> {
        self.writer
            .serialize(record)
            .with_context(|| format!("Failed to write run log {:?}", self.path))?;
        self.writer.flush().context("Failed to flush run log")?;
        Ok(())
    }

    /// Append `epoch<TAB>prediction<TAB>target` lines; no-op without a prediction log
    pub fn record_predictions(&mut self, epoch: usize, pairs: &[(String, String)]) -> Result<()> {
        let Some((path, writer)) = self.predictions.as_mut() else {
            return Ok(());
        };
        for (prediction, target) in pairs {
            writeln!(writer, "{}\t{}\t{}", epoch, prediction, target)
                .with_context(|| format!("Failed to write prediction log {:?}", path))?;
        }
        writer.flush().context("Failed to flush prediction log")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(split: Split, epoch: usize, loss: Option<f64>) -> LogRecord {
        LogRecord {
            split,
            epoch,
            iteration: 1,
            total: Some(10),
            loss,
            avg_loss: loss,
            learning_rate: Some(0.1),
        }
    }

    #[test]
    fn test_run_tick_format() {
        let tick = run_tick();
        assert_eq!(tick.len(), "20240101-00-00-00".len());
        assert!(chrono::NaiveDateTime::parse_from_str(&tick, TICK_FORMAT).is_ok());
    }

    #[test]
    fn test_disabled_without_log_dir() {
        let config = TrainingConfig {
            log_dir: None,
            ..Default::default()
        };
        assert!(RunLog::create(&config).unwrap().is_none());
    }

    #[test]
    fn test_rows_are_appended() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = RunLog::open(dir.path(), "east", "tick", false).unwrap();
            log.record(&row(Split::Training, 1, Some(0.5))).unwrap();
            log.record(&row(Split::Validation, 1, None)).unwrap();
            assert!(log.predictions_path().is_none());
        }
        {
            // Reopening the same run appends without a second header
            let mut log = RunLog::open(dir.path(), "east", "tick", false).unwrap();
            log.record(&row(Split::Training, 2, Some(0.25))).unwrap();
        }

        let text = std::fs::read_to_string(dir.path().join("east_tick.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "split,epoch,iteration,total,loss,avg_loss,learning_rate",
                "Training,1,1,10,0.5,0.5,0.1",
                "Validation,1,1,10,,,0.1",
                "Training,2,1,10,0.25,0.25,0.1",
            ]
        );
    }

    #[test]
    fn test_prediction_log() {
        let dir = TempDir::new().unwrap();
        let mut log = RunLog::open(dir.path(), "moran", "tick", true).unwrap();
        log.record_predictions(3, &[("helo".to_string(), "hello".to_string())])
            .unwrap();

        let path = log.predictions_path().unwrap().to_path_buf();
        assert_eq!(path.file_name().unwrap(), "moran_tick_predictions.txt");
        assert_eq!(std::fs::read_to_string(path).unwrap(), "3\thelo\thello\n");
    }
}
