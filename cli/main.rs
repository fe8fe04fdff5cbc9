#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;

use gformula::config::{Scenario, ScenarioConfig};
use gformula::data::{load_cohort, write_pool};
use gformula::history::prepare_observed;
use gformula::pool::Pool;
use gformula::risk::{
    CovariateTrajectory, covariate_means, observed_summary, risk_difference, risk_ratio,
    summary_columns,
};
use gformula::{Estimate, SimulationOutcome, Simulator};

#[derive(Parser)]
#[command(
    name = "gformula",
    about = "Parametric g-formula simulation of time-varying treatment strategies",
    long_about = "Simulates a cohort forward in time under the natural course and under \
                 user-defined interventions, using previously fitted models, and reports \
                 the resulting risk curves or end-of-follow-up means."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
pub struct SimulateArgs {
    /// Scenario file (TOML) with covariates, models and interventions
    #[arg(long, value_name = "TOML")]
    pub config: PathBuf,

    /// Person-time table (TSV, or CSV with a .csv extension)
    #[arg(long, value_name = "PATH")]
    pub data: PathBuf,

    /// Override the simulation seed from the scenario file
    #[arg(long, value_name = "N")]
    pub seed: Option<u64>,

    /// Override the number of simulated time points
    #[arg(long, value_name = "N")]
    pub time_points: Option<usize>,

    /// Simulate interventions one after another instead of in parallel
    #[arg(long)]
    pub sequential: bool,

    /// Print natural-course covariate means next to the observed ones
    #[arg(long)]
    pub covariate_means: bool,

    /// Directory receiving one simulated table per intervention
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct CheckArgs {
    /// Scenario file (TOML) to validate
    #[arg(long, value_name = "TOML")]
    pub config: PathBuf,

    /// Optional person-time table supplying observed bounds
    #[arg(long, value_name = "PATH")]
    pub data: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate every intervention in a scenario
    #[command(about = "Simulate the natural course and every configured intervention")]
    Simulate(SimulateArgs),

    /// Validate a scenario without simulating
    #[command(about = "Validate a scenario file (and optionally its data)")]
    Check(CheckArgs),

    /// Display version information
    #[command(about = "Display version information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Simulate(args)) => simulate(args),
        Some(Commands::Check(args)) => check(args),
        Some(Commands::Version) => {
            println!("gformula {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => {
            let mut command = Cli::command();
            if let Err(e) = command.print_help() {
                eprintln!("Error: {e}");
            }
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Loads the cohort named by the scenario and builds the scenario against it.
fn load_scenario(
    config: &ScenarioConfig,
    data: &Path,
) -> Result<(Scenario, Pool), Box<dyn std::error::Error>> {
    let mut cohort = load_cohort(data, &config.id, &config.time, &[])?;
    let scenario = config.build(Some(&cohort))?;
    prepare_observed(&mut cohort, &scenario.spec)?;
    Ok((scenario, cohort))
}

pub fn simulate(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ScenarioConfig::load(&args.config)?;
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(time_points) = args.time_points {
        config.time_points = time_points;
    }
    let (scenario, cohort) = load_scenario(&config, &args.data)?;
    let Scenario {
        spec,
        models,
        interventions,
        seed,
        reference,
        parallel,
        ..
    } = scenario;

    let simulator = Simulator::new(spec, models)?;
    let outcomes = simulator.run_all(&cohort, &interventions, seed, parallel && !args.sequential)?;

    let spec = simulator.spec();
    let columns = summary_columns(spec, &cohort)?;
    let observed = observed_summary(&cohort, spec, simulator.models(), &columns)?;
    if observed.weights.is_some() {
        println!("Observed estimates are weighted by inverse probability of remaining uncensored.");
    }
    print_estimates(&outcomes, reference, &observed.estimate);

    if args.covariate_means {
        let simulated = covariate_means(
            &outcomes[0].pool,
            &columns,
            &spec.outcome,
            spec.simulated_competing().is_some(),
            spec.time_points,
        )?;
        println!("\nCovariate means under the natural course (observed / simulated):");
        for ((name, observed), (_, simulated)) in observed.covariates.iter().zip(&simulated) {
            print_trajectories(name, observed, simulated);
        }
    }

    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir)?;
        for (index, outcome) in outcomes.iter().enumerate() {
            let path = dir.join(format!("intervention_{index}.tsv"));
            write_pool(&outcome.pool, &path)?;
            println!("Wrote '{}' to {}", outcome.intervention, path.display());
        }
    }
    Ok(())
}

fn print_estimates(outcomes: &[SimulationOutcome], reference: usize, observed: &Estimate) {
    let reference_values = outcomes[reference].estimate.values();
    let label = match observed {
        Estimate::Risk(_) => "risk",
        Estimate::Mean(_) => "mean",
    };

    if let Estimate::Risk(curve) = &outcomes[0].estimate {
        println!("\nCumulative risk by time point:");
        print!("  {:<6} {:>10}", "t", "observed");
        for outcome in outcomes {
            print!(" {:>16.16}", outcome.intervention);
        }
        println!();
        let observed_curve = observed.values();
        for t in 0..curve.len() {
            print!("  {t:<6} {:>10.4}", observed_curve.get(t).copied().unwrap_or(f64::NAN));
            for outcome in outcomes {
                print!(" {:>16.4}", outcome.estimate.values()[t]);
            }
            println!();
        }
    }

    println!("\nObserved {label}: {:.4}", observed.final_value());
    println!(
        "{:<32} {:>10} {:>10} {:>10}",
        "Intervention", label, "ratio", "difference"
    );
    for outcome in outcomes {
        let values = outcome.estimate.values();
        let last = values.len().saturating_sub(1);
        let ratio = risk_ratio(&values, &reference_values);
        let difference = risk_difference(&values, &reference_values);
        println!(
            "{:<32} {:>10.4} {:>10.4} {:>10.4}",
            outcome.intervention,
            outcome.estimate.final_value(),
            ratio.get(last).copied().unwrap_or(f64::NAN),
            difference.get(last).copied().unwrap_or(f64::NAN),
        );
    }
}

fn print_trajectories(name: &str, observed: &CovariateTrajectory, simulated: &CovariateTrajectory) {
    match (observed, simulated) {
        (CovariateTrajectory::Mean(observed), CovariateTrajectory::Mean(simulated)) => {
            println!("  {name}");
            print_series(observed, simulated);
        }
        (CovariateTrajectory::Levels(observed), CovariateTrajectory::Levels(simulated)) => {
            for ((level, observed), (_, simulated)) in observed.iter().zip(simulated) {
                println!("  {name} = {level}");
                print_series(observed, simulated);
            }
        }
        _ => {}
    }
}

fn print_series(observed: &[f64], simulated: &[f64]) {
    for (t, (observed, simulated)) in observed.iter().zip(simulated).enumerate() {
        println!("    t={t:<4} {observed:>10.4} {simulated:>10.4}");
    }
}

fn check(args: CheckArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = ScenarioConfig::load(&args.config)?;
    let scenario = match &args.data {
        Some(data) => load_scenario(&config, data)?.0,
        None => config.build(None)?,
    };
    println!(
        "Scenario is valid: {} covariate(s), {} intervention(s), {} time point(s).",
        scenario.spec.covariates.len(),
        scenario.interventions.len(),
        scenario.spec.time_points
    );
    Ok(())
}
