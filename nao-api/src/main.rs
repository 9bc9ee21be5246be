use anyhow::Result;
use clap::{Parser, Subcommand};
use nao_api::{algorithm::Algorithm, config::NaoConfig, default_registry, drivers::Runner};
use nao_core::cancel::CancellationToken;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Train, pretrain and watch agents on the simulated Nao")]
struct Cli {
    /// TOML run configuration. Defaults apply to everything it leaves out.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Start from the single environment, million step chunk settings instead of the defaults.
    #[arg(long, conflicts_with = "config")]
    legacy: bool,

    /// Overrides the configured agent (PPO2, DDPG or GAIL).
    #[arg(long, short)]
    agent: Option<Algorithm>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the agent and save it under the models directory.
    Train {
        #[arg(long, default_value_t = 1_000_000)]
        timesteps: usize,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        model_path: Option<PathBuf>,
    },
    /// Record demonstrations of the scripted walking controller.
    Collect { dataset: String },
    /// Behaviour clone a fresh agent on recorded demonstrations.
    Pretrain { dataset: String },
    /// Play a saved model until interrupted.
    Visualize { model: PathBuf },
}

fn load_config(cli: &Cli) -> Result<NaoConfig> {
    let mut config = match &cli.config {
        Some(path) => NaoConfig::load(path)?,
        None if cli.legacy => NaoConfig::legacy(),
        None => NaoConfig::default(),
    };
    if let Some(agent) = cli.agent {
        config.agent = agent;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let token = CancellationToken::from_ctrl_c();
    let registry = default_registry(&config);
    let runner = Runner::new(config, registry, token)?;
    match cli.command {
        Command::Train {
            timesteps,
            seed,
            model_path,
        } => {
            let seed = seed.unwrap_or(runner.config().seed);
            let model_path = model_path.unwrap_or_else(|| runner.config().paths.models.clone());
            let report = runner.train(timesteps, seed, &model_path)?;
            tracing::info!(
                outcome = ?report.outcome,
                timesteps = report.timesteps,
                checkpoints = report.checkpoints.len(),
                log_dir = %report.log_dir.display(),
                "training finished"
            );
        }
        Command::Collect { dataset } => {
            let path = runner.collect_pretrained_dataset(&dataset)?;
            println!("{}", path.display());
        }
        Command::Pretrain { dataset } => {
            let outcome = runner.pretrained_model_and_save(&dataset)?;
            println!("{}", outcome.checkpoint.display());
        }
        Command::Visualize { model } => {
            for frame in runner.visualize(&model)? {
                let frame = frame?;
                if frame.done {
                    tracing::info!(step = frame.step, "episode finished");
                }
            }
        }
    }
    Ok(())
}
