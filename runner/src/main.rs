use clap::{Args, Parser, Subcommand};
use potline_analysis::tables::{cell, render_table};
use potline_runner::{
    config::{error_chain, PipelineConfig},
    manager::DispatchSettings,
    pipeline::{Sequencer, Stage, StageSelection},
    sync::{install_interrupt_handler, CancellationToken},
};
use std::{
    env,
    path::{Path, PathBuf},
    process::ExitCode,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Fit, select, convert and benchmark interatomic potentials
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// More logging, repeat for trace output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the enabled stages in this process, waiting for every job
    Run {
        #[command(flatten)]
        stages: StageFlags,
    },
    /// Submit every enabled stage as a chained watch job and return
    Submit {
        #[command(flatten)]
        stages: StageFlags,
    },
    /// Print the best candidates of a sweep
    Select {
        #[arg(short, long)]
        config: PathBuf,
        /// Rank search results even when deep training results exist
        #[arg(long)]
        from_search: bool,
    },
    /// Only run the preflight checks for the enabled stages
    Check {
        #[command(flatten)]
        stages: StageFlags,
    },
}

#[derive(Args, Debug)]
struct StageFlags {
    #[arg(short, long)]
    config: PathBuf,
    #[arg(long)]
    no_search: bool,
    #[arg(long)]
    no_deep: bool,
    #[arg(long)]
    no_conversion: bool,
    #[arg(long)]
    no_inference: bool,
    #[arg(long)]
    no_properties: bool,
    /// Run a single stage, overrides the other flags
    #[arg(long, value_enum)]
    only: Option<Stage>,
}

impl StageFlags {
    fn selection(&self) -> StageSelection {
        if let Some(stage) = self.only {
            return StageSelection::only(stage);
        }

        let disabled = [
            (self.no_search, Stage::Search),
            (self.no_deep, Stage::DeepTrain),
            (self.no_conversion, Stage::Convert),
            (self.no_inference, Stage::Inference),
            (self.no_properties, Stage::Properties),
        ]
        .into_iter()
        .filter_map(|(off, stage)| off.then_some(stage))
        .collect::<Vec<_>>();

        StageSelection::without(&disabled)
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn prepare(
    config: &Path,
    stages: &[Stage],
    token: CancellationToken,
) -> Result<Sequencer, Box<dyn std::error::Error>> {
    let config = PipelineConfig::load(config)?;
    config.preflight_checks(stages)?;
    let settings = DispatchSettings::from_config(&config, token)?;

    Ok(Sequencer::new(config, settings)?)
}

fn execute(command: Command, token: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Run { stages } => {
            let selection = stages.selection();
            let mut sequencer = prepare(&stages.config, selection.stages(), token)?;
            sequencer.run(&selection)?;
            info!(sweep = ?sequencer.sweep(), "Pipeline finished");
        }
        Command::Submit { stages } => {
            let selection = stages.selection();
            let mut sequencer = prepare(&stages.config, selection.stages(), token)?;

            if !sequencer.is_remote() {
                warn!("No cluster configured, running the stages in this process");
                sequencer.run(&selection)?;
                return Ok(());
            }

            let exe = env::current_exe()?;
            let config_path = stages.config.canonicalize()?;
            for (stage, handle) in sequencer.submit(&selection, &config_path, &exe)? {
                println!("{stage}\t{}", handle.id);
            }
        }
        Command::Select {
            config,
            from_search,
        } => {
            let sequencer = prepare(&config, &[Stage::Filter], token)?;
            let survivors = sequencer.select(from_search)?;

            let keys = survivors
                .first()
                .map(|tracker| tracker.parameters().keys().cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            let mut rows = vec![["iteration", "subiteration", "energy", "force", "directory"]
                .into_iter()
                .map(str::to_owned)
                .chain(keys.iter().cloned())
                .collect::<Vec<_>>()];
            for tracker in &survivors {
                let losses = tracker.validation_losses();
                rows.push(
                    [
                        tracker.id().iteration.to_string(),
                        tracker.id().subiteration.to_string(),
                        losses.map(|l| l.energy.to_string()).unwrap_or_default(),
                        losses.map(|l| l.force.to_string()).unwrap_or_default(),
                        tracker.model().directory().display().to_string(),
                    ]
                    .into_iter()
                    .chain(keys.iter().map(|key| {
                        tracker.parameters().get(key).map(cell).unwrap_or_default()
                    }))
                    .collect(),
                );
            }
            print!("{}", render_table(&rows));
        }
        Command::Check { stages } => {
            prepare(&stages.config, stages.selection().stages(), token)?;
            info!("Configuration is valid");
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // before any other thread exists, the signal mask is inherited
    let token = CancellationToken::new();
    if let Err(e) = install_interrupt_handler(token.clone()) {
        warn!("Failed to install the interrupt handler: {e}");
    }

    match execute(cli.command, token) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", error_chain(e.as_ref()));
            ExitCode::FAILURE
        }
    }
}
