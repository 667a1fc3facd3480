use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
#[cfg(not(feature = "mpi"))]
use rust_afqmc::spawn_ranks;
use rust_afqmc::{Afqmc, AfqmcResults, Config};

#[derive(Parser, Debug)]
#[command(version, about = "Auxiliary-field quantum Monte Carlo for the Hubbard model", long_about = None)]
struct Args {
    /// YAML run configuration; built-in defaults are used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of in-process ranks
    #[arg(short, long, default_value_t = 1)]
    ranks: usize,

    /// Override the configured random seed
    #[arg(short, long)]
    seed: Option<u64>,
}

fn run(args: &Args) -> rust_afqmc::Result<AfqmcResults> {
    let mut config = match &args.config {
        Some(path) => Config::read(path)?,
        None => Config::default(),
    };
    if let Some(seed) = args.seed {
        config.qmc.seed = seed;
    }
    let afqmc = Afqmc::new(config)?;
    run_ranks(&afqmc, args.ranks)
}

#[cfg(not(feature = "mpi"))]
fn run_ranks(afqmc: &Afqmc, ranks: usize) -> rust_afqmc::Result<AfqmcResults> {
    let mut results = spawn_ranks(ranks, |comm| afqmc.run(&comm))?;
    Ok(results.swap_remove(0))
}

#[cfg(feature = "mpi")]
fn run_ranks(afqmc: &Afqmc, _ranks: usize) -> rust_afqmc::Result<AfqmcResults> {
    let universe = mpi::initialize().ok_or_else(|| rust_afqmc::AfqmcError::CommunicationFailure {
        rank: 0,
        message: "MPI already initialised".to_string(),
    })?;
    afqmc.run(&rust_afqmc::population::MpiComm::new(universe.world()))
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    if args.ranks == 0 {
        eprintln!("error: --ranks must be at least 1");
        return ExitCode::FAILURE;
    }

    match run(&args) {
        Ok(results) => {
            println!("AFQMC Results for Hubbard Model");
            println!("-------------------------------");
            match results.energy() {
                Some((energy, error)) => println!("Mixed energy: {:.8} ± {:.8}", energy, error),
                None => println!("Mixed energy: no live walkers"),
            }
            if let Some(last) = results.back_propagated.last() {
                println!("Back-propagated energy (last window): {:.8}", last.energy);
            }
            println!("Final total weight: {:.6e}", results.total_weight);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
