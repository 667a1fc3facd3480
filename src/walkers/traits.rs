//! Capability set shared by every walker variant.

use num_complex::Complex64;

use crate::error::Result;
use crate::linalg::CMatrix;
use crate::systems::EnergyEvaluator;
use crate::walkers::buffer::BufferReader;
use crate::wavefunction::Trial;

/// State shape specific part of a walker.
///
/// Implementors keep their Green's functions consistent with their
/// wavefunction after every mutating call; a method that returns an error may
/// leave the state untouched but never half-updated.
pub(crate) trait WalkerBackend {
    /// Current overlap with the trial, `⟨Ψ_T|φ⟩`.
    fn trial_overlap(&self) -> Complex64;

    /// Green's functions used for measurement.
    fn greens_function(&self) -> &[CMatrix];

    /// Determinant blocks of the walker (empty for density-matrix walkers).
    fn wavefunction(&self) -> &[CMatrix];

    /// Overlap ratio that scaling site `site` by `1 + deltas[σ]` would produce.
    fn field_ratio(&self, site: usize, deltas: [Complex64; 2]) -> Complex64;

    /// Scale site `site` by `1 + deltas[σ]`, returning the overlap ratio.
    fn apply_field_update(&mut self, site: usize, deltas: [Complex64; 2], trial: &Trial) -> Result<Complex64>;

    /// Left-multiply every spin block by `b`, returning the overlap ratio.
    fn apply_one_body(&mut self, b: &CMatrix, trial: &Trial) -> Result<Complex64>;

    /// QR-stabilise the wavefunction, returning `det R`.
    fn reorthogonalize(&mut self, trial: &Trial) -> Result<Complex64>;

    /// Replace the wavefunction and rebuild everything derived from it.
    fn set_wavefunction(&mut self, phi: Vec<CMatrix>, trial: &Trial) -> Result<()>;

    fn local_energy(&self, evaluator: &dyn EnergyEvaluator) -> Complex64;

    fn pack(&self, buf: &mut Vec<Complex64>);

    fn unpack(&mut self, reader: &mut BufferReader) -> Result<()>;
}
