use anyhow::{bail, Context, Result};
use ocrt::cli::{
    parse_args, setup_logging, Commands, InitConfigArgs, InspectArgs, ListArgs, ScheduleArgs,
    TrainArgs,
};
use ocrt::model::checkpoint::{load_file, CheckpointKey, CheckpointStore};
use ocrt::training::startup::Startup;
use ocrt::training::{LearningRateScheduler, TrainingConfig};
use ocrt::utils::format_bytes;
use tracing::{error, info, warn};

fn main() {
    let cli = parse_args();

    setup_logging(cli.verbose);

    info!("{}", ocrt::info());

    let result = match cli.command {
        Commands::Check(args) => run_check(args),
        Commands::Inspect(args) => run_inspect(args),
        Commands::List(args) => run_list(args),
        Commands::Schedule(args) => run_schedule(args),
        Commands::InitConfig(args) => run_init_config(args),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_check(args: TrainArgs) -> Result<()> {
    let config = args.load_config()?;
    config.validate().context("Invalid training configuration")?;

    info!("Run: {}", config.run_id);
    info!("Epochs: {}", config.max_epoch);
    info!(
        "Learning rate: {} (x{} every {} {:?} ticks)",
        config.learning_rate, config.decay_rate, config.decay_step, config.lr_granularity
    );
    info!("Validation: {:?}, monitor {:?} ({:?})", config.validation, config.monitor, config.goal);
    info!("Patience: {}", config.patience);
    info!("Checkpoints: {:?}", config.checkpoint_dir);
    if let Some(tick) = config.checkpoint_every {
        info!("Periodic checkpoints: {:?}", tick);
    }
    match &config.log_dir {
        Some(dir) => info!("Run log directory: {:?}", dir),
        None => info!("Run log disabled"),
    }

    let store = CheckpointStore::from_config(&config);
    let startup = Startup::resolve(
        args.resume_from(),
        args.pretrain.as_deref(),
        &store,
        &config.run_id,
    )?;
    info!("Startup: {}", startup.describe());
    if config.validate_first {
        if startup.is_resume() {
            warn!("Validation before training is skipped when resuming");
        } else {
            info!("Validating before the first epoch");
        }
    }

    info!("Configuration OK");
    Ok(())
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    let checkpoint = load_file(&args.checkpoint)
        .with_context(|| format!("Failed to read checkpoint {:?}", args.checkpoint))?;

    let key = args
        .checkpoint
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(CheckpointKey::parse);
    if let Some(key) = key {
        info!("Run: {}", key.run_id);
    }
    info!("Epoch: {}", checkpoint.epoch);
    info!("Global step: {}", checkpoint.global_step);
    match checkpoint.best_metric {
        Some(metric) => info!("Best metric: {:.6}", metric),
        None => info!("Best metric: none"),
    }
    info!(
        "Schedule: base lr {}, {} ticks",
        checkpoint.schedule.base_lr, checkpoint.schedule.ticks
    );
    info!("Model weights: {}", format_bytes(checkpoint.model.len()));
    info!("Optimizer state: {}", format_bytes(checkpoint.optimizer.len()));
    Ok(())
}

fn run_list(args: ListArgs) -> Result<()> {
    let store = CheckpointStore::new(&args.dir);
    let checkpoints = store
        .list(&args.run_id)
        .with_context(|| format!("Failed to list {:?}", args.dir))?;

    if checkpoints.is_empty() {
        info!("No checkpoints for run {:?} in {:?}", args.run_id, args.dir);
        return Ok(());
    }

    let best = store.best_path(&args.run_id).ok();
    for (key, path) in &checkpoints {
        let metric = key
            .metric
            .map(|m| format!("{:.4}", m))
            .unwrap_or_else(|| "-".to_string());
        let marker = if best.as_ref() == Some(path) { " (best)" } else { "" };
        info!(
            "epoch {:>5}  step {:>8}  metric {:>10}  {:?}{}",
            key.epoch, key.step, metric, path, marker
        );
    }
    info!("{} checkpoint(s)", checkpoints.len());
    Ok(())
}

fn run_schedule(args: ScheduleArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => TrainingConfig::from_file(path)?,
        None => TrainingConfig::default(),
    };
    config.validate().context("Invalid training configuration")?;

    let scheduler = LearningRateScheduler::from_config(&config);
    let every = args.every.unwrap_or(config.decay_step).max(1);
    info!("{:?} ticks:", scheduler.granularity());
    for row in 0..args.rows as u64 {
        let ticks = row * every;
        info!("{:>10}  {:.6e}", ticks, scheduler.lr_at(ticks));
    }
    Ok(())
}

fn run_init_config(args: InitConfigArgs) -> Result<()> {
    if args.output.exists() && !args.force {
        bail!("{:?} already exists (use --force to overwrite)", args.output);
    }
    args.preset.config().save(&args.output)?;
    info!("Wrote {:?} configuration to {:?}", args.preset, args.output);
    Ok(())
}
