//! `roundctl`: drive adaptive sampling rounds on a batch cluster.
//!
//! Each round runs the head-node generator against a short-lived store and,
//! when the generator asks for it, submits one batch job and waits for it.
//! The exit code tells the calling workflow whether to start the next round.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::error;

use roundctl::core::params::{DataHome, RoundParams, Workload};
use roundctl::core::status::{StatusClass, decode_status};
use roundctl::exit_codes;
use roundctl::io::barrier::{CancelToken, SystemClock};
use roundctl::io::config::{ControllerConfig, load_config, write_config};
use roundctl::io::generator::CommandGenerator;
use roundctl::io::relocate::CommandRelocator;
use roundctl::io::scheduler::SlurmScheduler;
use roundctl::io::store::ProcessStore;
use roundctl::logging;
use roundctl::looping::{LoopStop, run_rounds};
use roundctl::round::{RoundError, RoundOutcome, RoundServices, run_round};

#[derive(Parser)]
#[command(
    name = "roundctl",
    version,
    about = "Run generator and batch-job rounds against an ephemeral store"
)]
struct Cli {
    /// Controller configuration (TOML). Defaults apply when the file is missing.
    #[arg(long, global = true, default_value = "roundctl.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single round.
    Round(RoundArgs),
    /// Run rounds with increasing numbers until one skips or fails.
    Loop {
        #[command(flatten)]
        round: RoundArgs,
        /// Stop after this many completed rounds.
        #[arg(long)]
        max_rounds: Option<u32>,
    },
    /// Decode a status from stdin and print its classification.
    Decode,
    /// Write the default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args, Debug, Clone)]
struct RoundArgs {
    /// Round number.
    round: u32,
    /// Workload category: traj, model or all.
    workload: Workload,
    /// Number of tasks to generate.
    tasks: u32,
    /// Steps per task.
    steps: u32,
    /// Wall-clock minutes requested for the batch job.
    minutes: u32,
    /// Data home, optionally suffixed with `:PORT` for the store.
    data_home: DataHome,
    /// Platform profile from the configuration.
    #[arg(long, default_value = "local")]
    platform: String,
    /// Override the profile's node count.
    #[arg(long)]
    nodes: Option<u32>,
}

impl RoundArgs {
    fn into_params(self) -> RoundParams {
        RoundParams {
            round: self.round,
            workload: self.workload,
            tasks: self.tasks,
            steps: self.steps,
            minutes: self.minutes,
            data_home: self.data_home.path,
            port: self.data_home.port,
            platform: self.platform,
            nodes: self.nodes,
        }
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if !err.use_stderr() => err.exit(),
        Err(err) => {
            let _ = err.print();
            std::process::exit(exit_codes::FATAL);
        }
    };

    logging::init();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::FATAL);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Round(args) => {
            let config = load_config(&cli.config)?;
            cmd_round(args.into_params(), &config)
        }
        Command::Loop { round, max_rounds } => {
            let config = load_config(&cli.config)?;
            cmd_loop(round.into_params(), max_rounds, &config)
        }
        Command::Decode => cmd_decode(),
        Command::InitConfig { force } => cmd_init_config(&cli.config, force),
    }
}

/// Real collaborators built from the configuration. The round's
/// [`CancelToken`] stays unset; signals end the process instead.
struct Services {
    store: ProcessStore,
    generator: CommandGenerator,
    scheduler: SlurmScheduler,
    relocator: CommandRelocator,
}

impl Services {
    fn from_config(config: &ControllerConfig) -> Self {
        Self {
            store: ProcessStore::new(config.store.clone(), config.paths.clone()),
            generator: CommandGenerator::new(config.generator.clone()),
            scheduler: SlurmScheduler::new(config.scheduler.clone()),
            relocator: CommandRelocator::new(config.relocate.clone()),
        }
    }
}

fn cmd_round(params: RoundParams, config: &ControllerConfig) -> Result<i32> {
    let services = Services::from_config(config);
    let round_services = RoundServices {
        store: &services.store,
        generator: &services.generator,
        scheduler: &services.scheduler,
        clock: &SystemClock,
        relocator: &services.relocator,
        cancel: CancelToken::new(),
    };

    match run_round(&params, config, &round_services) {
        Ok(RoundOutcome::Continue { job, job_status }) => {
            println!("continue job={job} status={job_status}");
            Ok(exit_codes::OK)
        }
        Ok(RoundOutcome::Skip { status }) => {
            println!("skip status={status}");
            Ok(exit_codes::OK)
        }
        Err(err) => Ok(report_round_error(&err)),
    }
}

fn cmd_loop(first: RoundParams, max_rounds: Option<u32>, config: &ControllerConfig) -> Result<i32> {
    let services = Services::from_config(config);
    let round_services = RoundServices {
        store: &services.store,
        generator: &services.generator,
        scheduler: &services.scheduler,
        clock: &SystemClock,
        relocator: &services.relocator,
        cancel: CancelToken::new(),
    };

    let result = run_rounds(first, max_rounds, config, &round_services, |params, outcome| {
        if let RoundOutcome::Continue { job, job_status } = outcome {
            println!("round {} continue job={job} status={job_status}", params.round);
        }
    });
    match result {
        Ok(outcome) => {
            match outcome.stop {
                LoopStop::Skipped { round, status } => {
                    println!("round {round} skip status={status}");
                }
                LoopStop::MaxRounds { max_rounds } => {
                    println!("stopped after {max_rounds} rounds");
                }
            }
            Ok(exit_codes::OK)
        }
        Err(err) => Ok(report_round_error(&err)),
    }
}

fn report_round_error(err: &RoundError) -> i32 {
    error!(err = %err, "round failed");
    eprintln!("{err}");
    err.exit_code()
}

fn cmd_decode() -> Result<i32> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("read stdin")?;
    match decode_status(&input) {
        Ok(status) => {
            let class = status.class();
            println!("{class} {status}");
            Ok(match class {
                StatusClass::Fatal => exit_codes::FATAL,
                StatusClass::Proceed | StatusClass::Skip => exit_codes::OK,
            })
        }
        Err(err) => {
            eprintln!("{err}");
            Ok(exit_codes::FATAL)
        }
    }
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &ControllerConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}
