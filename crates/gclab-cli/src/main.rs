use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use gclab_core::{batch_number_for, AutoGate, BatchGate, StdinGate};
use gclab_measure::SyntheticMeter;
use gclab_runner::{
    mock_mode_from_env, parse_result_file, run_plan, DriverOptions, ExecutionMode,
    ExperimentConfig, GcEnergyExperiment, RemoteSession, SubjectRouter, TrialStatus,
};
use serde_json::json;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gclab", version, about = "Java GC energy experiment orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the generated trial plan and batch layout.
    Plan {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Execute the experiment against the DUT (or the synthetic model).
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Use the synthetic measurement model instead of the DUT.
        #[arg(long)]
        mock: bool,
        /// Confirm batch continuations automatically (unattended run).
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, default_value = "experiments")]
        output: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Draw synthetic measurements for one factor combination.
    Simulate {
        #[arg(long)]
        gc: String,
        #[arg(long)]
        workload: String,
        #[arg(long, default_value = "openjdk")]
        jdk: String,
        #[arg(long, default_value_t = gclab_measure::DEFAULT_SEED)]
        seed: u64,
        #[arg(long, default_value_t = 1)]
        trials: u32,
        #[arg(long)]
        json: bool,
    },
    /// Parse a retrieved result directory into a structured record.
    Parse {
        dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Plan { config, json } => cmd_plan(config, json),
        Commands::Run {
            config,
            mock,
            yes,
            seed,
            output,
            json,
        } => cmd_run(config, mock, yes, seed, output, json),
        Commands::Simulate {
            gc,
            workload,
            jdk,
            seed,
            trials,
            json,
        } => cmd_simulate(&gc, &workload, &jdk, seed, trials, json),
        Commands::Parse { dir, json } => cmd_parse(&dir, json),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<ExperimentConfig> {
    match path {
        Some(path) => ExperimentConfig::load(&path),
        None => Ok(ExperimentConfig::default_study()),
    }
}

fn cmd_plan(config: Option<PathBuf>, json: bool) -> Result<()> {
    let config = load_config(config)?;
    let plan = config.build_plan()?;
    // Routing problems should surface here, not mid-experiment.
    let _router = SubjectRouter::resolve(&config)?;

    if json {
        let rows: Vec<_> = plan
            .iter()
            .map(|spec| {
                json!({
                    "sequence": spec.sequence(),
                    "batch": batch_number_for(spec.sequence(), config.batch_size),
                    "repetition": spec.repetition(),
                    "assignment": spec.assignment(),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "experiment": config.name,
                "trials": plan.len(),
                "batch_size": config.batch_size,
                "plan": rows,
            }))?
        );
        return Ok(());
    }

    println!(
        "experiment {}: {} trials, batch size {}",
        config.name,
        plan.len(),
        config.batch_size
    );
    for spec in &plan {
        println!(
            "  #{:<4} batch {:<3} rep {} {}",
            spec.sequence(),
            batch_number_for(spec.sequence(), config.batch_size),
            spec.repetition(),
            spec.assignment()
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(" "),
        );
    }
    Ok(())
}

fn cmd_run(
    config: Option<PathBuf>,
    mock: bool,
    yes: bool,
    seed: Option<u64>,
    output: PathBuf,
    json: bool,
) -> Result<()> {
    let config = load_config(config)?;
    let plan = config.build_plan()?;
    let router = SubjectRouter::resolve(&config)?;
    let session = RemoteSession::from_env()?;
    let gate = BatchGate::new(config.batch_size)?;

    let mode = if mock || mock_mode_from_env() {
        ExecutionMode::Mock
    } else {
        ExecutionMode::Remote
    };
    let results_root = output.join(format!(
        "{}_{}",
        config.name,
        Utc::now().format("%Y%m%d_%H%M%S")
    ));

    let mut experiment =
        GcEnergyExperiment::new(session, router, gate, mode, results_root.clone())
            .with_seed(seed.unwrap_or(config.seed));
    if yes {
        experiment = experiment.with_operator(Box::new(AutoGate));
    } else {
        experiment = experiment.with_operator(Box::new(StdinGate));
    }

    let options = DriverOptions {
        results_root: results_root.clone(),
        batch_size: config.batch_size,
        cooldown: config.cooldown(),
    };
    let results = run_plan(&mut experiment, &plan, &options)?;

    let succeeded = results
        .iter()
        .filter(|r| r.status == TrialStatus::Success)
        .count();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "experiment": config.name,
                "results_root": results_root.display().to_string(),
                "trials": results.len(),
                "succeeded": succeeded,
                "failed": results.len() - succeeded,
            }))?
        );
    } else {
        println!(
            "{}: {} of {} trials succeeded; run table at {}",
            config.name,
            succeeded,
            results.len(),
            results_root.join(gclab_runner::RUN_TABLE_FILENAME).display()
        );
    }
    Ok(())
}

fn cmd_simulate(
    gc: &str,
    workload: &str,
    jdk: &str,
    seed: u64,
    trials: u32,
    json: bool,
) -> Result<()> {
    let mut meter = SyntheticMeter::new(seed);
    for trial in 0..trials {
        let m = meter.simulate(gc, workload, jdk);
        if json {
            println!(
                "{}",
                json!({
                    "trial": trial,
                    "gc": gc,
                    "workload": workload,
                    "jdk": jdk,
                    "seed": seed,
                    "energy_joules": m.energy_joules,
                    "runtime_seconds": m.runtime_seconds,
                    "power_watts": m.power_watts,
                    "synthetic": true,
                })
            );
        } else {
            println!(
                "trial {}: {:.3} J over {:.3} s ({:.3} W) [synthetic]",
                trial, m.energy_joules, m.runtime_seconds, m.power_watts
            );
        }
    }
    Ok(())
}

fn cmd_parse(dir: &PathBuf, json: bool) -> Result<()> {
    let record = parse_result_file(dir);
    if json {
        println!(
            "{}",
            json!({
                "runtime_s": record.runtime_s,
                "energy_j": record.energy_j,
                "status": record.status.as_str(),
            })
        );
    } else {
        println!(
            "status {}: runtime {:?} s, energy {:?} J",
            record.status.as_str(),
            record.runtime_s,
            record.energy_j
        );
    }
    Ok(())
}
