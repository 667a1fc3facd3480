//! Mixed estimator of the energy, `Σ w E_L / Σ w`.

use num_complex::Complex64;

use crate::error::Result;
use crate::linalg::ZERO;
use crate::population::{Communicator, Walkers};
use crate::systems::EnergyEvaluator;

#[derive(Clone, Debug, Default)]
pub struct MixedEstimator {
    numerator: Complex64,
    denominator: Complex64,
}

impl MixedEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate the current population. Dead walkers and walkers with a
    /// non-finite local energy do not contribute.
    pub fn update(&mut self, walkers: &Walkers, evaluator: &dyn EnergyEvaluator) {
        for walker in walkers.walkers.iter().filter(|w| w.is_alive()) {
            let e = walker.local_energy(evaluator);
            if !e.is_finite() {
                log::warn!("skipping walker with non-finite local energy");
                continue;
            }
            let w = walker.phase * walker.weight;
            self.numerator += w * e;
            self.denominator += w;
        }
    }

    /// Local estimate, `None` before any live walker was seen.
    pub fn energy(&self) -> Option<f64> {
        (self.denominator.norm() > 0.0).then(|| (self.numerator / self.denominator).re)
    }

    /// Sum over ranks and restart accumulation. Every rank gets the result.
    pub fn reduce<C: Communicator + ?Sized>(&mut self, comm: &C) -> Result<Option<f64>> {
        let local = [self.numerator.re, self.numerator.im, self.denominator.re, self.denominator.im];
        let global = comm.all_reduce_sum(&local)?;
        self.numerator = ZERO;
        self.denominator = ZERO;
        let numerator = Complex64::new(global[0], global[1]);
        let denominator = Complex64::new(global[2], global[3]);
        Ok((denominator.norm() > 0.0).then(|| (numerator / denominator).re))
    }
}
