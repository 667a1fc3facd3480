//! Precomputed propagator data handed from the model to the propagators.

use num_complex::Complex64;

use crate::linalg::CMatrix;

/// Which Hubbard–Stratonovich decomposition the two-body step uses.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HsType {
    /// Ising-like spin decomposition with two field values per site.
    #[default]
    Discrete,
    /// Charge decomposition with one Gaussian field per site.
    Continuous,
}

/// One-body propagators and auxiliary-field tables for a fixed time step.
#[derive(Clone, Debug)]
pub struct ModelParameters {
    pub dt: f64,
    pub nbasis: usize,
    pub nup: usize,
    pub ndown: usize,
    /// `exp(-dt/2 H1)`
    pub bt2: CMatrix,
    /// `exp(-dt H1)`
    pub bt: CMatrix,
    /// `exp(+dt H1)`
    pub bt_inv: CMatrix,
    /// Discrete field factors, indexed `[field value][spin]`.
    pub auxf: [[f64; 2]; 2],
    /// Continuous field coupling; the site factor is `exp(coupling * x)`.
    pub coupling: Complex64,
}

impl ModelParameters {
    /// `auxf - 1` for field value `xi`, one entry per spin.
    pub fn discrete_deltas(&self, xi: usize) -> [Complex64; 2] {
        [
            Complex64::new(self.auxf[xi][0] - 1.0, 0.0),
            Complex64::new(self.auxf[xi][1] - 1.0, 0.0),
        ]
    }

    /// Site factor minus one for a continuous field value, equal for both spins.
    pub fn continuous_deltas(&self, x: f64) -> [Complex64; 2] {
        let delta = (self.coupling * x).exp() - 1.0;
        [delta, delta]
    }
}
