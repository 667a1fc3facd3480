//! Discrete (spin) Hubbard–Stratonovich two-body step.
//!
//! Sites are visited in order. For each site both field values are scored by
//! their overlap ratio, one is drawn with probability proportional to its
//! score, and the walker weight picks up the normalisation.

use num_complex::Complex64;
use rand::Rng;

use crate::error::Result;
use crate::linalg::{ONE, OVERLAP_FLOOR};
use crate::propagation::{update_or_kill, Reweighting};
use crate::systems::ModelParameters;
use crate::walkers::Walker;
use crate::wavefunction::Trial;

#[derive(Clone, Debug)]
pub struct DiscreteHs {
    reweighting: Reweighting,
}

impl DiscreteHs {
    pub fn new(reweighting: Reweighting) -> Self {
        Self { reweighting }
    }

    /// Sample one field per site and record the row in the walker's history.
    pub fn two_body_step<R: Rng + ?Sized>(
        &self,
        walker: &mut Walker,
        params: &ModelParameters,
        trial: &Trial,
        rng: &mut R,
    ) -> Result<()> {
        let mut fields = Vec::with_capacity(params.nbasis);
        let mut cos_fac = 1.0;
        let mut weight_fac = ONE;
        for site in 0..params.nbasis {
            if !walker.is_alive() {
                break;
            }
            let deltas = [params.discrete_deltas(0), params.discrete_deltas(1)];
            let p = [
                walker.field_ratio(site, deltas[0]) * 0.5,
                walker.field_ratio(site, deltas[1]) * 0.5,
            ];
            let probs = [self.reweighting.probability(p[0]), self.reweighting.probability(p[1])];
            let norm = probs[0] + probs[1];
            if !norm.is_finite() || norm <= OVERLAP_FLOOR {
                walker.kill();
                break;
            }
            walker.weight *= norm;
            let r: f64 = rng.gen();
            let xi = if r < probs[0] / norm { 0 } else { 1 };
            let chosen = p[xi];
            if chosen.norm() > 0.0 {
                let unit = chosen / chosen.norm();
                match self.reweighting {
                    Reweighting::Phaseless => cos_fac *= unit.re,
                    Reweighting::FreeProjection => walker.phase *= unit,
                }
                weight_fac *= unit;
            }
            if update_or_kill(walker, site, deltas[xi], trial)?.is_none() {
                break;
            }
            fields.push(Complex64::new(xi as f64, 0.0));
        }
        walker.record_step(&fields, cos_fac, weight_fac);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systems::Hubbard;
    use crate::walkers::WalkerOptions;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_step_records_one_field_per_site() {
        let system = Hubbard::new(4, 2, 1.0, 4.0, 3, 3);
        let trial = Trial::free_electron(&system);
        let params = system.model_parameters(0.05);
        let opts = WalkerOptions::default().with_history(3, 3);
        let mut walker = Walker::new(&opts, &trial, &params, &system).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let scheme = DiscreteHs::new(Reweighting::Phaseless);
        scheme.two_body_step(&mut walker, &params, &trial, &mut rng).unwrap();
        assert!(walker.is_alive());
        assert_eq!(walker.field_configs.step(), 1);
        // Real Hubbard fields keep every probability real and positive.
        assert_eq!(walker.phase, ONE);
        let rows = walker.field_configs.block_rows();
        assert!(rows[0].iter().all(|x| x.re == 0.0 || x.re == 1.0));
    }

    #[test]
    fn test_running_overlap_matches_determinant() {
        let system = Hubbard::new(4, 1, 1.0, 2.0, 2, 2);
        let trial = Trial::free_electron(&system);
        let params = system.model_parameters(0.05);
        let mut walker = Walker::new(&WalkerOptions::default(), &trial, &params, &system).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        DiscreteHs::new(Reweighting::Phaseless)
            .two_body_step(&mut walker, &params, &trial, &mut rng)
            .unwrap();
        let direct: Complex64 = trial
            .leading()
            .iter()
            .zip(walker.wavefunction())
            .map(|(psi, phi)| (psi.adjoint() * phi).determinant())
            .product();
        assert!((direct - walker.overlap).norm() < 1e-10 * direct.norm());
        assert!((direct - walker.trial_overlap()).norm() < 1e-10 * direct.norm());
    }
}
