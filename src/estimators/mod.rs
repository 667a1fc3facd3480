//! Estimators module - energies and density matrices from the walker population.

mod mixed;
mod back_propagation;

pub use mixed::MixedEstimator;
pub use back_propagation::{BackPropagatedEstimate, BackPropagation, RestoreWeights};
