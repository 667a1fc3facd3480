//! Traits the walker core needs from a model Hamiltonian.

use num_complex::Complex64;

use crate::linalg::CMatrix;

/// Local energy from one-particle Green's functions.
///
/// Implementations must not panic on ill-conditioned input. A non-finite
/// return value is treated upstream as walker death.
pub trait EnergyEvaluator {
    /// Energy from spin-resolved Green's functions `[G↑, G↓]`.
    fn local_energy(&self, greens: &[CMatrix]) -> Complex64;

    /// Energy from a spin-combined `2N × 2N` Green's function.
    fn local_energy_ghf(&self, greens: &CMatrix) -> Complex64;
}
