//! One-body half step `φ ← exp(-dt/2 H1) φ`.

use num_complex::Complex64;

use crate::error::Result;
use crate::propagation::Reweighting;
use crate::systems::ModelParameters;
use crate::walkers::Walker;
use crate::wavefunction::Trial;

/// Apply the half-step propagator and reweight by the exact overlap ratio.
/// A degenerate overlap kills the walker.
pub(crate) fn half_step(
    walker: &mut Walker,
    params: &ModelParameters,
    trial: &Trial,
    reweighting: Reweighting,
) -> Result<()> {
    if let Some(ratio) = propagate(walker, params, trial)? {
        reweighting.fold(walker, ratio);
    }
    Ok(())
}

/// Apply the half-step propagator without touching the weight. Returns the
/// overlap ratio, or `None` if the walker is (or just became) dead.
pub(crate) fn propagate(walker: &mut Walker, params: &ModelParameters, trial: &Trial) -> Result<Option<Complex64>> {
    if !walker.is_alive() {
        return Ok(None);
    }
    match walker.apply_one_body(&params.bt2, trial) {
        Ok(ratio) => Ok(Some(ratio)),
        Err(e) if e.is_walker_death() => {
            log::trace!("walker died in one-body step: {e}");
            walker.kill();
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::ONE;
    use crate::systems::Hubbard;
    use crate::walkers::{WalkerOptions, WalkerType};
    use approx::assert_relative_eq;

    #[test]
    fn test_free_electron_half_step_scales_by_eigenvalue() {
        // The trial is an eigenstate of the hopping, so the ratio is exp(-dt/2 Σ ε).
        let system = Hubbard::new(4, 1, 1.0, 4.0, 1, 1);
        let trial = Trial::free_electron(&system);
        let params = system.model_parameters(0.1);
        let mut walker = Walker::new(&WalkerOptions::default(), &trial, &params, &system).unwrap();
        half_step(&mut walker, &params, &trial, Reweighting::Phaseless).unwrap();
        // Two electrons in the k = 0 orbital with ε = -2t.
        assert_relative_eq!(walker.weight, (0.05_f64 * 4.0).exp(), max_relative = 1e-10);
        assert_relative_eq!(walker.overlap.re, walker.weight, max_relative = 1e-10);
        assert_eq!(walker.phase, ONE);
    }

    #[test]
    fn test_ghf_half_step_matches_uhf() {
        let system = Hubbard::new(4, 2, 1.0, 4.0, 3, 2);
        let trial = Trial::free_electron(&system);
        let ghf = trial.to_ghf();
        let params = system.model_parameters(0.05);
        let mut uhf_walker = Walker::new(&WalkerOptions::default(), &trial, &params, &system).unwrap();
        let opts = WalkerOptions::default().with_type(WalkerType::MultiGhf);
        let mut ghf_walker = Walker::new(&opts, &ghf, &params, &system).unwrap();
        half_step(&mut uhf_walker, &params, &trial, Reweighting::Phaseless).unwrap();
        half_step(&mut ghf_walker, &params, &ghf, Reweighting::Phaseless).unwrap();
        assert_relative_eq!(uhf_walker.weight, ghf_walker.weight, max_relative = 1e-10);
    }
}
