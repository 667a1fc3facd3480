//! Continuous (charge) Hubbard–Stratonovich two-body step.
//!
//! Every site gets a Gaussian field `x` acting as `exp(c x)` on both spins.
//! Under the phaseless projection the walker is reweighted only by the local
//! energies before and after the step and the cosine of the overlap phase
//! change over the whole step. Free projection keeps the full overlap ratio.

use num_complex::Complex64;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::Result;
use crate::linalg::ONE;
use crate::propagation::{kinetic, update_or_kill, Reweighting};
use crate::systems::{EnergyEvaluator, ModelParameters};
use crate::walkers::Walker;
use crate::wavefunction::Trial;

#[derive(Clone, Debug)]
pub struct ContinuousHs {
    reweighting: Reweighting,
    energy_shift: f64,
}

impl ContinuousHs {
    pub fn new(reweighting: Reweighting, energy_shift: f64) -> Self {
        Self { reweighting, energy_shift }
    }

    /// One full step: half kinetic, fields, half kinetic, then the weight
    /// update for the whole-step overlap ratio.
    pub fn propagate_walker<R: Rng + ?Sized>(
        &self,
        walker: &mut Walker,
        params: &ModelParameters,
        trial: &Trial,
        evaluator: &dyn EnergyEvaluator,
        rng: &mut R,
    ) -> Result<()> {
        if !walker.is_alive() {
            walker.record_step(&[], 0.0, ONE);
            return Ok(());
        }
        let mut ratio = kinetic::propagate(walker, params, trial)?.unwrap_or(ONE);
        let (fields, r) = self.two_body_step(walker, params, trial, rng)?;
        ratio *= r;
        ratio *= kinetic::propagate(walker, params, trial)?.unwrap_or(ONE);
        if walker.is_alive() {
            let (cos_fac, weight_fac) = phase_factors(ratio);
            walker.record_step(&fields, cos_fac, weight_fac);
            self.reweight(walker, ratio, params, evaluator);
        } else {
            walker.record_step(&fields, 0.0, ONE);
        }
        Ok(())
    }

    /// Sample and apply one field per site. Returns the sampled fields and
    /// the product of the update ratios. Stops early if the walker dies.
    pub fn two_body_step<R: Rng + ?Sized>(
        &self,
        walker: &mut Walker,
        params: &ModelParameters,
        trial: &Trial,
        rng: &mut R,
    ) -> Result<(Vec<Complex64>, Complex64)> {
        let mut fields = Vec::with_capacity(params.nbasis);
        let mut ratio = ONE;
        for site in 0..params.nbasis {
            if !walker.is_alive() {
                break;
            }
            let x: f64 = rng.sample(StandardNormal);
            match update_or_kill(walker, site, params.continuous_deltas(x), trial)? {
                Some(r) => ratio *= r,
                None => break,
            }
            fields.push(Complex64::new(x, 0.0));
        }
        Ok((fields, ratio))
    }

    /// Weight update for a whole step with overlap ratio `ratio`. The
    /// phaseless weight only sees the local energies and the phase change.
    pub fn reweight(&self, walker: &mut Walker, ratio: Complex64, params: &ModelParameters, evaluator: &dyn EnergyEvaluator) {
        if !walker.is_alive() {
            return;
        }
        let e_new = walker.local_energy(evaluator);
        if !e_new.is_finite() {
            log::warn!("non-finite local energy, killing walker");
            walker.kill();
            return;
        }
        let e_old = walker.e_local;
        walker.e_local = e_new;
        match self.reweighting {
            Reweighting::Phaseless => {
                let (cos_fac, _) = phase_factors(ratio);
                let importance = (-0.5 * params.dt * (e_old.re + e_new.re - 2.0 * self.energy_shift)).exp();
                walker.weight *= importance * cos_fac;
            }
            Reweighting::FreeProjection => {
                walker.weight *= (params.dt * self.energy_shift).exp();
                self.reweighting.fold(walker, ratio);
            }
        }
        if walker.weight <= 0.0 {
            walker.kill();
        }
    }
}

/// `(max(0, cos Δθ), e^{iΔθ})` for the overlap phase change of a step.
fn phase_factors(ratio: Complex64) -> (f64, Complex64) {
    let dtheta = ratio.arg();
    (dtheta.cos().max(0.0), Complex64::from_polar(1.0, dtheta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::{Propagator, PropagatorOptions};
    use crate::systems::{HsType, Hubbard};
    use crate::walkers::WalkerOptions;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_phase_factors() {
        let (c, w) = phase_factors(Complex64::new(0.0, 2.0));
        assert_relative_eq!(c, 0.0, epsilon = 1e-15);
        assert!((w - Complex64::new(0.0, 1.0)).norm() < 1e-15);
        let (c, _) = phase_factors(Complex64::new(-1.0, 0.1));
        assert_eq!(c, 0.0);
        let (c, w) = phase_factors(Complex64::new(3.0, 0.0));
        assert_eq!(c, 1.0);
        assert_eq!(w, ONE);
    }

    #[test]
    fn test_reweight_uses_local_energies() {
        let system = Hubbard::new(4, 1, 1.0, 4.0, 2, 2);
        let trial = Trial::free_electron(&system);
        let params = system.model_parameters(0.05);
        let mut walker = Walker::new(&WalkerOptions::default(), &trial, &params, &system).unwrap();
        let e0 = walker.local_energy(&system).re;
        assert!(e0 < 0.0);
        assert_eq!(walker.e_local.re, e0);
        let scheme = ContinuousHs::new(Reweighting::Phaseless, 0.0);
        scheme.reweight(&mut walker, ONE, &params, &system);
        assert_relative_eq!(walker.weight, (-0.05 * e0).exp(), max_relative = 1e-12);
    }

    #[test]
    fn test_reweight_with_energy_shift() {
        let system = Hubbard::new(4, 1, 1.0, 4.0, 2, 2);
        let trial = Trial::free_electron(&system);
        let params = system.model_parameters(0.05);
        let mut walker = Walker::new(&WalkerOptions::default(), &trial, &params, &system).unwrap();
        let e0 = walker.e_local.re;
        let scheme = ContinuousHs::new(Reweighting::Phaseless, 0.5);
        scheme.reweight(&mut walker, Complex64::new(2.0, 0.0), &params, &system);
        let expected = (-0.5 * 0.05 * (2.0 * e0 - 1.0)).exp();
        assert_relative_eq!(walker.weight, expected, max_relative = 1e-12);
    }

    #[test]
    fn test_fields_are_gaussian() {
        let system = Hubbard::new(4, 2, 1.0, 4.0, 3, 3);
        let trial = Trial::free_electron(&system);
        let params = system.model_parameters(0.01);
        let mut walker = Walker::new(&WalkerOptions::default(), &trial, &params, &system).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(13);
        let scheme = ContinuousHs::new(Reweighting::Phaseless, 0.0);
        let (fields, ratio) = scheme.two_body_step(&mut walker, &params, &trial, &mut rng).unwrap();
        assert!((ratio - walker.overlap).norm() < 1e-10 * ratio.norm());
        assert_eq!(fields.len(), 8);
        assert!(fields.iter().all(|x| x.im == 0.0 && x.re.abs() < 10.0));
        assert!(fields.iter().any(|x| x.re != 0.0));
    }

    #[test]
    fn test_full_step_weight_from_fresh_walker() {
        let system = Hubbard::new(4, 2, 1.0, 4.0, 3, 3);
        let trial = Trial::free_electron(&system);
        let params = system.model_parameters(0.01);
        let opts = WalkerOptions::default().with_history(1, 1);
        let propagator = Propagator::new(
            PropagatorOptions::default().with_hs_type(HsType::Continuous),
            params.clone(),
            &opts,
        )
        .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        for _ in 0..5 {
            let mut walker = Walker::new(&opts, &trial, &params, &system).unwrap();
            let e_old = walker.e_local.re;
            let overlap_old = walker.overlap;
            propagator.propagate_walker(&mut walker, &trial, &system, &mut rng).unwrap();

            let e_new = walker.local_energy(&system).re;
            let cos_fac = (walker.overlap / overlap_old).arg().cos().max(0.0);
            let expected = (-0.5 * 0.01 * (e_old + e_new)).exp() * cos_fac;
            assert_relative_eq!(walker.weight, expected, max_relative = 1e-12);
            assert_eq!(walker.e_local.re, e_new);
            let (recorded, _) = walker.field_configs.block_factors();
            assert_relative_eq!(recorded, cos_fac, epsilon = 1e-12);
        }
    }
}
