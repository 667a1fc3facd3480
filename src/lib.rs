//! Rust AFQMC - auxiliary-field quantum Monte Carlo walker populations in Rust
//!
//! This crate provides the walker core of AFQMC simulations: Slater-determinant
//! walkers with Sherman–Morrison maintained Green's functions, discrete and
//! continuous Hubbard–Stratonovich propagators, finite-temperature walkers,
//! comb population control across ranks and back-propagated estimators.

pub mod error;
pub mod linalg;
pub mod systems;
pub mod wavefunction;
pub mod walkers;
pub mod propagation;
pub mod population;
pub mod estimators;
pub mod io;
pub mod afqmc;

// Re-export commonly used types at crate root
pub use error::{AfqmcError, Result};
pub use systems::{EnergyEvaluator, HsType, Hubbard, ModelParameters};
pub use wavefunction::Trial;
pub use walkers::{Walker, WalkerOptions, WalkerType};
pub use propagation::{Propagator, PropagatorOptions, Reweighting};
pub use population::{spawn_ranks, Communicator, FakeComm, ThreadComm, Walkers};
pub use estimators::{BackPropagatedEstimate, BackPropagation, MixedEstimator, RestoreWeights};
pub use io::Config;
pub use afqmc::{Afqmc, AfqmcResults};
