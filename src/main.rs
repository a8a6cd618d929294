//! Redfire IVR Replay main application

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use redfire_ivr_replay::{
    config::{DisplayNamePolicy, ReplayConfig},
    core::{prepare_cases, ReplayRunner},
    utils::setup_logging,
    Error, Result,
};

#[derive(Parser)]
#[command(name = "redfire-ivr-replay")]
#[command(about = "Capture driven SIP/RTP replay and IVR conformance tester")]
#[command(version = redfire_ivr_replay::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true, env = "IVR_REPLAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay cases against the destination
    Run(RunArgs),
    /// Template traces and refresh their caches
    Parse {
        /// Traces, case directories or case lists
        inputs: Vec<PathBuf>,
        /// Re-parse even when the cache is current
        #[arg(short, long)]
        force: bool,
    },
    /// Validate configuration
    ValidateConfig,
    /// Generate default configuration
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Traces, case directories or case lists (default: the case directory)
    inputs: Vec<PathBuf>,
    /// Re-parse traces even when their cache is current
    #[arg(long)]
    force_parse: bool,
    /// Loop over the cases until interrupted
    #[arg(long)]
    stress: bool,
    /// Number of concurrent channels
    #[arg(short = 'n', long)]
    channels: Option<usize>,
    /// Present the caller through P-Asserted-Identity
    #[arg(long)]
    privacy: bool,
    /// Display name put in every From header
    #[arg(long, value_name = "NAME", conflicts_with = "clear_display_name")]
    display_name: Option<String>,
    /// Send every From header without a display name
    #[arg(long)]
    clear_display_name: bool,
    /// Do not draw the call flow of unpassed dialogs on screen
    #[arg(long)]
    no_call_flow: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut ReplayConfig) {
        let replay = &mut config.replay;
        replay.force_parse |= self.force_parse;
        replay.privacy |= self.privacy;
        if self.no_call_flow {
            replay.draw_call_flow = false;
        }
        if let Some(name) = &self.display_name {
            replay.display_name = DisplayNamePolicy::Override(name.clone());
        } else if self.clear_display_name {
            replay.display_name = DisplayNamePolicy::Clear;
        }

        config.run.stress_test |= self.stress;
        if let Some(channels) = self.channels {
            config.run.channel_count = channels;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_configuration(&cli)?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Commands::Run(args) = &cli.command {
        args.apply(&mut config);
    }
    config.validate()?;

    let _log_guard = setup_logging(&config.logging)?;
    info!("Starting {} v{}", redfire_ivr_replay::NAME, redfire_ivr_replay::VERSION);

    match cli.command {
        Commands::Run(args) => run_replay(config, args.inputs).await,
        Commands::Parse { inputs, force } => parse_traces(&config, &inputs, force).await,
        Commands::ValidateConfig => validate_configuration(&config),
        Commands::GenerateConfig { output } => generate_default_config(output),
    }
}

fn load_configuration(cli: &Cli) -> Result<ReplayConfig> {
    let config = match &cli.config {
        Some(path) => ReplayConfig::load_from_file(path)?,
        None => ReplayConfig::load_from_env().unwrap_or_else(|_| ReplayConfig::default_config()),
    };
    Ok(config)
}

async fn run_replay(config: ReplayConfig, inputs: Vec<PathBuf>) -> Result<()> {
    let runner = ReplayRunner::new(config);
    let statistics = runner.run(&inputs).await?;
    info!(
        "Run complete: {} dialog(s) started, {} ended",
        statistics.started, statistics.ended
    );
    Ok(())
}

async fn parse_traces(config: &ReplayConfig, inputs: &[PathBuf], force: bool) -> Result<()> {
    let config = config.clone();
    let inputs = inputs.to_vec();
    let prepared = tokio::task::spawn_blocking(move || prepare_cases(&config, &inputs, force))
        .await
        .map_err(|e| Error::internal(format!("parsing panicked: {}", e)))??;

    for case in &prepared {
        let status = if case.reused {
            "cached".dimmed()
        } else {
            "parsed".green()
        };
        println!("{} {} ({} dialog(s))", status, case.trace.display(), case.info.dialog_numbers.len());
        for (index, numbers) in case.info.dialog_numbers.iter().enumerate() {
            println!("    #{:<3} {} -> {}", index, numbers.calling, numbers.called);
        }
    }
    Ok(())
}

fn validate_configuration(config: &ReplayConfig) -> Result<()> {
    config.validate()?;

    println!("✓ Configuration is valid");
    println!("  Destination: {}:{}", config.run.destination, config.sip.remote_port);
    println!("  Source: {}:{}", config.run.source, config.sip.local_port);
    println!("  Channels: {}", config.run.channel_count);
    println!("  Stress test: {}", config.run.stress_test);
    println!("  Case directory: {}", config.paths.case_dir.display());
    println!("  Result directory: {}", config.paths.result_dir.display());
    Ok(())
}

fn generate_default_config(output_path: Option<PathBuf>) -> Result<()> {
    let config = ReplayConfig::default_config();
    let toml_content = toml::to_string_pretty(&config)
        .map_err(|e| Error::internal(format!("Failed to serialize config: {}", e)))?;

    match output_path {
        Some(path) => {
            std::fs::write(&path, toml_content)?;
            println!("✓ Default configuration written to: {}", path.display());
        }
        None => println!("{}", toml_content),
    }
    Ok(())
}
