mod config;
mod executors;
mod schedule;
mod submit;
mod trial;

use clap::{ArgAction, Parser, Subcommand};
use config::{load_campaign, parse_run_tuples, ConfigErrors, Environment};
use executors::{local::LocalDispatcher, ExecutorError};
use std::path::{Path, PathBuf};
use std::process::exit;
use submit::SubmitConfig;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use trial::TrialSpec;

#[derive(Error, Debug)]
enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("failed to write submission scripts")]
    Scripts(#[from] std::io::Error),
    #[error("{0} trials could not be executed")]
    TrialsFailed(usize),
}

#[derive(Parser, Debug)]
#[command(
    name = "faultline",
    about = "Batch scheduler and dispatcher for fault injection trial campaigns",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pack a campaign into wall-clock chunks and emit one submission
    /// script per job group
    Schedule {
        /// YAML list of trials with runtime estimates
        #[arg(short, long)]
        campaign: PathBuf,
        /// wall clock limit per chunk in seconds
        #[arg(short = 'l', long)]
        time_limit: f64,
        /// maximum nodes per submission
        #[arg(short = 'N', long)]
        nodes: usize,
        /// batch queue partition
        #[arg(short, long)]
        partition: String,
        /// worker threads each trial uses
        #[arg(long, default_value_t = 1)]
        threads: usize,
        /// physical cores per node
        #[arg(long, default_value_t = 16)]
        cores_per_node: usize,
        /// instrumentation tool variant, selects the LD_LIBRARY_PATH override
        #[arg(short, long)]
        tool: Option<String>,
        /// extra environment override forwarded to every trial
        #[arg(short, long, num_args = 2, value_names = ["NAME", "VALUE"], action = ArgAction::Append)]
        env: Vec<String>,
        /// directory receiving the submission scripts
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,
        /// tag embedded in the script file names
        #[arg(long, default_value = "campaign")]
        label: String,
    },
    /// Run a list of trials on a local pool of worker slots
    Run {
        /// concurrent worker slots, defaults to the core count
        #[arg(short, long)]
        slots: Option<usize>,
        /// environment override applied to every trial
        #[arg(short, long, num_args = 2, value_names = ["NAME", "VALUE"], action = ArgAction::Append)]
        env: Vec<String>,
        /// trial tuple: rank, directory, timeout, command, cleanup
        #[arg(
            short,
            long,
            num_args = 5,
            value_names = ["RANK", "DIR", "TIMEOUT", "COMMAND", "CLEANUP"],
            action = ArgAction::Append,
            required = true
        )]
        run: Vec<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(error) = dispatch(Cli::parse()) {
        error!(%error, "Exiting with failure");
        exit(1);
    }
}

fn dispatch(cli: Cli) -> Result<(), RunnerError> {
    match cli.command {
        Commands::Schedule {
            campaign,
            time_limit,
            nodes,
            partition,
            threads,
            cores_per_node,
            tool,
            env,
            out_dir,
            label,
        } => schedule_campaign(
            &campaign,
            time_limit,
            nodes,
            partition,
            threads,
            cores_per_node,
            tool,
            pair_env(env),
            &out_dir,
            label,
        ),
        Commands::Run { slots, env, run } => dispatch_locally(slots, pair_env(env), &run),
    }
}

/// clap guarantees pairs via `num_args = 2`
fn pair_env(args: Vec<String>) -> Vec<(String, String)> {
    args.chunks(2)
        .filter(|pair| pair.len() == 2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn schedule_campaign(
    campaign: &Path,
    time_limit: f64,
    nodes: usize,
    partition: String,
    threads: usize,
    cores_per_node: usize,
    tool: Option<String>,
    mut env: Vec<(String, String)>,
    out_dir: &Path,
    label: String,
) -> Result<(), RunnerError> {
    let environment = Environment::from_env()?;

    let mut trials = load_campaign(campaign)?;
    let total = trials.len();
    trials.retain(|trial| !trial.is_done());
    info!(total, pending = trials.len(), "Loaded campaign");

    // descending estimates make the first-fit packer behave like FFD
    trials.sort_by(|a, b| b.estimate.total_cmp(&a.estimate));

    let chunks = schedule::pack(trials, time_limit, schedule::DEFAULT_ESTIMATE);
    let slots_per_node = schedule::slots_for_threads(threads, cores_per_node);
    let groups = schedule::group(chunks, nodes, slots_per_node);

    if threads > 1 {
        env.push(("OMP_NUM_THREADS".to_owned(), threads.to_string()));
    }
    if let Some(ref tool) = tool {
        env.push((
            "LD_LIBRARY_PATH".to_owned(),
            environment.ld_library_path(Some(tool)),
        ));
    }

    let submit_config = SubmitConfig {
        partition,
        slots_per_node,
        label,
        env,
        dispatcher: "faultline".to_owned(),
    };
    let scripts = submit::write_scripts(&submit_config, &groups, out_dir)?;

    info!(
        groups = groups.len(),
        scripts = scripts.len(),
        slots_per_node,
        "Campaign scheduled"
    );

    Ok(())
}

fn dispatch_locally(
    slots: Option<usize>,
    env: Vec<(String, String)>,
    run: &[String],
) -> Result<(), RunnerError> {
    executors::install_interrupt_handler();

    let environment = Environment::from_env()?;
    let tuples = parse_run_tuples(run)?;

    // a worker only runs the slice tagged with its own rank
    let trials: Vec<TrialSpec> = match environment.rank {
        Some(rank) => tuples
            .into_iter()
            .filter(|(tagged, _)| *tagged == rank)
            .map(|(_, trial)| trial)
            .collect(),
        None => tuples.into_iter().map(|(_, trial)| trial).collect(),
    };

    let slots = slots.unwrap_or_else(num_cpus::get);
    let summary = LocalDispatcher::new(slots, env).execute(trials)?;

    info!(
        executed = summary.executed,
        skipped = summary.skipped,
        failed = summary.failed,
        "Worker finished"
    );

    // classified outcomes are completions; only setup failures count here
    if summary.failed > 0 {
        return Err(RunnerError::TrialsFailed(summary.failed));
    }

    Ok(())
}
