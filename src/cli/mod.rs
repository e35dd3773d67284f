use crate::training::startup::ResumeFrom;
use crate::training::TrainingConfig;
use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// OCRT: training loops for OCR detection and recognition networks
#[derive(Parser, Debug)]
#[command(name = "ocrt")]
#[command(about = "Training loops for OCR detection and recognition networks")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a training configuration and its startup flags
    Check(TrainArgs),

    /// Show the contents of a checkpoint file
    Inspect(InspectArgs),

    /// List the checkpoints of a run
    List(ListArgs),

    /// Preview the learning rate schedule of a configuration
    Schedule(ScheduleArgs),

    /// Write a configuration file with default values
    InitConfig(InitConfigArgs),
}

/// Training startup arguments
#[derive(Parser, Debug)]
pub struct TrainArgs {
    /// Training configuration file (JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Resume from a checkpoint; without a path, from the run's best checkpoint
    #[arg(long, num_args = 0..=1, value_name = "CHECKPOINT")]
    pub resume: Option<Option<PathBuf>>,

    /// Initialize the model from the weights of a checkpoint
    #[arg(long, value_name = "CHECKPOINT", conflicts_with = "resume")]
    pub pretrain: Option<PathBuf>,

    /// Validate once before training
    #[arg(long)]
    pub valpre: bool,

    /// Override the run identifier
    #[arg(long)]
    pub run_id: Option<String>,

    /// Override the checkpoint directory
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Override the maximum number of epochs
    #[arg(short, long)]
    pub epochs: Option<usize>,

    /// Quick test mode (few epochs, no run log)
    #[arg(long)]
    pub quick: bool,
}

impl TrainArgs {
    /// Configuration file (or defaults) with command-line overrides applied
    pub fn load_config(&self) -> Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::from_file(path)?,
            None if self.quick => TrainingConfig::quick_test(),
            None => TrainingConfig::default(),
        };

        if let Some(run_id) = &self.run_id {
            config.run_id = run_id.clone();
        }
        if let Some(dir) = &self.checkpoint_dir {
            config.checkpoint_dir = dir.clone();
        }
        if let Some(epochs) = self.epochs {
            config.max_epoch = epochs;
        }
        if self.valpre {
            config.validate_first = true;
        }
        Ok(config)
    }

    /// Which snapshot `--resume` asks for
    pub fn resume_from(&self) -> Option<ResumeFrom> {
        match &self.resume {
            None => None,
            Some(None) => Some(ResumeFrom::Best),
            Some(Some(path)) => Some(ResumeFrom::Path(path.clone())),
        }
    }
}

/// Checkpoint inspection arguments
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Checkpoint file
    pub checkpoint: PathBuf,
}

/// Checkpoint listing arguments
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Checkpoint directory
    #[arg(short, long, default_value = "checkpoints")]
    pub dir: PathBuf,

    /// Run identifier
    #[arg(short, long, required = true)]
    pub run_id: String,
}

/// Schedule preview arguments
#[derive(Parser, Debug)]
pub struct ScheduleArgs {
    /// Training configuration file (JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of rows to print
    #[arg(short, long, default_value = "10")]
    pub rows: usize,

    /// Ticks between rows (defaults to the decay step)
    #[arg(long)]
    pub every: Option<u64>,
}

/// Built-in configuration presets
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Preset {
    Default,
    Detection,
    Recognition,
}

impl Preset {
    pub fn config(self) -> TrainingConfig {
        match self {
            Preset::Default => TrainingConfig::default(),
            Preset::Detection => TrainingConfig::detection(),
            Preset::Recognition => TrainingConfig::recognition(),
        }
    }
}

/// Configuration template arguments
#[derive(Parser, Debug)]
pub struct InitConfigArgs {
    /// Output file
    #[arg(short, long, default_value = "ocrt.json")]
    pub output: PathBuf,

    /// Preset to start from
    #[arg(short, long, value_enum, default_value = "default")]
    pub preset: Preset,

    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}

/// Parse CLI arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Setup logging based on verbosity; `RUST_LOG` takes precedence
pub fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_parse() {
        let cli = Cli::parse_from(["ocrt", "check", "-c", "moran.json", "--valpre"]);

        match cli.command {
            Commands::Check(args) => {
                assert_eq!(args.config, Some(PathBuf::from("moran.json")));
                assert!(args.valpre);
                assert!(args.resume_from().is_none());
                assert!(args.pretrain.is_none());
            }
            _ => panic!("Expected Check command"),
        }
    }

    #[test]
    fn test_resume_flag_forms() {
        let cli = Cli::parse_from(["ocrt", "check", "--resume"]);
        match cli.command {
            Commands::Check(args) => assert_eq!(args.resume_from(), Some(ResumeFrom::Best)),
            _ => panic!("Expected Check command"),
        }

        let cli = Cli::parse_from(["ocrt", "check", "--resume", "run_3_30_0.5000.ckpt"]);
        match cli.command {
            Commands::Check(args) => assert_eq!(
                args.resume_from(),
                Some(ResumeFrom::Path(PathBuf::from("run_3_30_0.5000.ckpt")))
            ),
            _ => panic!("Expected Check command"),
        }
    }

    #[test]
    fn test_resume_conflicts_with_pretrain() {
        let result = Cli::try_parse_from([
            "ocrt",
            "check",
            "--resume",
            "a.ckpt",
            "--pretrain",
            "b.ckpt",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::parse_from([
            "ocrt", "check", "--quick", "--run-id", "crnn", "-e", "3", "--valpre",
        ]);
        let Commands::Check(args) = cli.command else {
            panic!("Expected Check command");
        };
        let config = args.load_config().unwrap();
        assert_eq!(config.run_id, "crnn");
        assert_eq!(config.max_epoch, 3);
        assert!(config.validate_first);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_init_config_preset() {
        let cli = Cli::parse_from(["ocrt", "init-config", "-p", "recognition", "-o", "r.json"]);
        match cli.command {
            Commands::InitConfig(args) => {
                assert_eq!(args.preset, Preset::Recognition);
                assert_eq!(args.output, PathBuf::from("r.json"));
                assert!(!args.force);
            }
            _ => panic!("Expected InitConfig command"),
        }
    }

    #[test]
    fn test_list_requires_run_id() {
        assert!(Cli::try_parse_from(["ocrt", "list"]).is_err());
        let cli = Cli::parse_from(["ocrt", "list", "-r", "aeast", "-d", "ckpt"]);
        match cli.command {
            Commands::List(args) => {
                assert_eq!(args.run_id, "aeast");
                assert_eq!(args.dir, PathBuf::from("ckpt"));
            }
            _ => panic!("Expected List command"),
        }
    }
}
