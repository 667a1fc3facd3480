//! Systems module - model Hamiltonians feeding the AFQMC core.

mod traits;
mod params;
mod hubbard;

pub use traits::EnergyEvaluator;
pub use params::{HsType, ModelParameters};
pub use hubbard::Hubbard;
