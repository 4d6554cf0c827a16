use std::process::ExitCode;

use hexrd::config::PopulationConfig;
use hexrd::observer::SimulationAdapter;
use hexrd::prelude::*;
use tracing::{error, info};

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        None | Some("--help") | Some("-h") | Some("help") => {
            print_help();
            ExitCode::SUCCESS
        }
        Some("example-config") => match example_config() {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("{e}");
                ExitCode::FAILURE
            }
        },
        Some("run") => {
            let Some(path) = args.get(2) else {
                eprintln!("run: missing config path");
                print_help();
                return ExitCode::from(2);
            };
            match run(path) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("{e}");
                    ExitCode::FAILURE
                }
            }
        }
        Some(other) => {
            eprintln!("Unknown command: {other}");
            print_help();
            ExitCode::from(2)
        }
    }
}

fn print_help() {
    println!(
        "hexrd - competitive reaction-diffusion on a hex mesh

USAGE:
  hexrd run <config.json>    Run the simulation described by a JSON run file
  hexrd example-config       Print a two-population run file to start from
  hexrd help                 Show this help"
    );
}

fn run(path: &str) -> Result<(), SimError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| SimError::Config(format!("cannot read {path}: {e}")))?;
    let cfg = RunConfig::from_json_str(&text)?;
    let mut sim = cfg.build()?;
    info!(
        cells = sim.mesh().len(),
        populations = sim.population_count(),
        channels = sim.channel_count(),
        steps = cfg.steps,
        "starting run"
    );

    let log_every = cfg.log_every.max(1);
    for _ in 0..cfg.steps {
        sim.step()?;
        if sim.step_count() % log_every == 0 {
            log_progress(&sim);
        }
    }

    let labels = SimulationAdapter::new(&sim).labels();
    for (i, p) in sim.populations().iter().enumerate() {
        let area = labels.iter().filter(|&&l| l == i).count();
        info!(population = %p.name, cells = area, "territory");
    }
    Ok(())
}

fn log_progress(sim: &Simulation) {
    let budget = sim.budget();
    let diag = sim.diagnostics();
    for (i, p) in sim.populations().iter().enumerate() {
        info!(
            step = diag.step,
            population = %p.name,
            sum_a = budget.sum_a[i],
            sum_c = budget.sum_c[i],
            "progress"
        );
    }
    if diag.clamped_connections > 0 {
        info!(
            step = diag.step,
            clamped = diag.clamped_connections,
            "connection clamps"
        );
    }
}

fn example_config() -> Result<String, SimError> {
    let channel = GuidanceChannel::new(FieldShape::Linear1D)
        .with_width(1.0)
        .with_gain(1.0);
    let population = |name: &str, x: Real, gamma: Real| PopulationConfig {
        population: Population::new(name)
            .with_growth(3.0, 20.0)
            .with_epsilon(0.5)
            .with_init(InitialMask::gaussian(1.0, 0.05, x, 0.0)),
        gamma: vec![gamma],
    };
    let run = RunConfig {
        steps: 2000,
        log_every: 200,
        model: SimConfig {
            params: ModelParams::default()
                .with_dt(1e-4)
                .with_competition(Competition::PowerLaw { l: 3.0 })
                .with_transfer(Transfer::DivisiveSubtractConnections)
                .with_seed(1),
            populations: vec![population("west", -0.1, 1.0), population("east", 0.1, -1.0)],
            guidance: vec![channel],
        },
        ..Default::default()
    };
    Ok(serde_json::to_string_pretty(&run)?)
}
