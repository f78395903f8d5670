mod inspect;
mod scenario;
mod setup;
mod simulate;

use crate::inspect::{print_jobs, summarize_jobs};
use crate::scenario::Scenario;
use crate::setup::setup_logging;
use crate::simulate::Simulation;
use clap::{CommandFactory, FromArgMatches, Parser};
use jobres::job::load_state_from_file;
use std::path::PathBuf;

#[derive(Parser)]
struct CommonOpts {
    /// Enables more detailed log output
    #[arg(
        long,
        env = "JOBRES_DEBUG",
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    debug: bool,
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version,
    disable_help_subcommand(true),
    help_expected(true)
)]
struct RootOptions {
    #[clap(flatten)]
    common: CommonOpts,

    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser)]
enum SubCommand {
    /// Replays step operations of a scenario file against its jobs
    Simulate(SimulateOpts),
    /// Prints jobs, steps and resource usage stored in a state file
    Inspect(InspectOpts),
}

#[derive(Parser)]
struct SimulateOpts {
    /// Scenario file (TOML)
    #[arg(value_hint = clap::ValueHint::FilePath)]
    scenario: PathBuf,

    /// Saves the resulting job state into this file
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    save: Option<PathBuf>,

    /// Stops at the first failed operation
    #[arg(long)]
    strict: bool,

    /// Prints the resulting jobs as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct InspectOpts {
    /// State file
    #[arg(value_hint = clap::ValueHint::FilePath)]
    file: PathBuf,

    /// Does not rebuild memory usage of legacy state files
    #[arg(long)]
    no_track_memory: bool,

    /// Prints the jobs as JSON
    #[arg(long)]
    json: bool,
}

fn command_simulate(opts: SimulateOpts) -> anyhow::Result<()> {
    let scenario = Scenario::load(&opts.scenario)?;
    log::debug!(
        "Scenario with {} node(s), {} job(s) and {} operation(s)",
        scenario.nodes.len(),
        scenario.jobs.len(),
        scenario.ops.len()
    );
    let mut simulation = Simulation::new(&scenario)?;
    let report = simulation.run(&scenario.ops, opts.strict)?;
    log::info!(
        "{} operation(s) applied, {} busy, {} rejected",
        report.applied,
        report.busy,
        report.rejected
    );
    print_jobs(&summarize_jobs(simulation.jobs()), opts.json)?;
    if let Some(path) = opts.save {
        simulation.save(&path)?;
    }
    Ok(())
}

fn command_inspect(opts: InspectOpts) -> anyhow::Result<()> {
    let jobs = load_state_from_file(&opts.file, !opts.no_track_memory)?;
    log::debug!("Loaded {} job(s) from {}", jobs.len(), opts.file.display());
    print_jobs(&summarize_jobs(&jobs), opts.json)
}

fn main() {
    let matches = RootOptions::command().get_matches();
    let top_opts = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    setup_logging(top_opts.common.debug);

    let result = match top_opts.subcmd {
        SubCommand::Simulate(opts) => command_simulate(opts),
        SubCommand::Inspect(opts) => command_inspect(opts),
    };

    if let Err(e) = result {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}
