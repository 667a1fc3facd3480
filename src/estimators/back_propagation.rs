//! Back-propagated estimates of the energy and one-body density matrix.
//!
//! Every `nmax` steps each walker's last block of auxiliary fields is replayed
//! in reverse on the trial determinant. The resulting `φ_bp` is paired with the
//! walker's wavefunction from the start of the block, which gives a Green's
//! function with the trial's mixed-estimator bias removed.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::{AfqmcError, Result};
use crate::linalg::{gab, reorthonormalize, scale_row, CMatrix, ONE, ZERO};
use crate::population::{Communicator, Walkers};
use crate::propagation::Propagator;
use crate::systems::EnergyEvaluator;
use crate::walkers::Walker;
use crate::wavefunction::Trial;

/// Which factors dropped by the phaseless projection are put back.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestoreWeights {
    #[default]
    None,
    /// Multiply by the dropped phases.
    Phase,
    /// Multiply by the dropped phases and divide out the cosine factors.
    Full,
}

#[derive(Clone, Debug)]
pub struct BackPropagation {
    nmax: usize,
    nstblz: usize,
    restore: RestoreWeights,
    weighted_energy: Complex64,
    weight: Complex64,
    weighted_greens: Vec<CMatrix>,
}

/// Globally reduced back-propagated estimates.
#[derive(Clone, Debug)]
pub struct BackPropagatedEstimate {
    pub energy: f64,
    pub weight: f64,
    /// One-body Green's functions `[G↑, G↓]`.
    pub greens: Vec<CMatrix>,
}

impl BackPropagation {
    pub fn new(tau_bp: f64, dt: f64, nstblz: usize, restore: RestoreWeights, nbasis: usize) -> Result<Self> {
        let nmax = (tau_bp / dt).round() as usize;
        if nmax == 0 || nstblz == 0 {
            return Err(AfqmcError::Config(format!(
                "back-propagation needs tau_bp >= dt and nstblz > 0, got tau_bp {tau_bp}, dt {dt}"
            )));
        }
        Ok(Self {
            nmax,
            nstblz,
            restore,
            weighted_energy: ZERO,
            weight: ZERO,
            weighted_greens: vec![CMatrix::zeros(nbasis, nbasis); 2],
        })
    }

    /// Steps per back-propagation window.
    pub fn nmax(&self) -> usize {
        self.nmax
    }

    pub fn is_due(&self, step: usize) -> bool {
        step > 0 && step % self.nmax == 0
    }

    /// Accumulate one window for every walker, then clear the field histories
    /// and open a new window at the current wavefunctions.
    pub fn update(
        &mut self,
        walkers: &mut Walkers,
        propagator: &Propagator,
        trial: &Trial,
        evaluator: &dyn EnergyEvaluator,
    ) -> Result<()> {
        if walkers.walkers.iter().any(|w| w.is_ghf() || w.is_thermal()) {
            return Err(AfqmcError::Unsupported("back-propagation of GHF or thermal walkers"));
        }
        for walker in walkers.walkers.iter_mut() {
            if walker.is_alive() && walker.field_configs.completed_block().is_some() {
                self.accumulate(walker, propagator, trial, evaluator)?;
            }
            walker.field_configs.reset();
            walker.snapshot_window();
        }
        Ok(())
    }

    fn accumulate(
        &mut self,
        walker: &Walker,
        propagator: &Propagator,
        trial: &Trial,
        evaluator: &dyn EnergyEvaluator,
    ) -> Result<()> {
        let phi_bp = back_propagate(walker, propagator, trial, self.nstblz);
        let mut greens = Vec::with_capacity(2);
        for (bp, old) in phi_bp.iter().zip(walker.phi_old()) {
            match gab(bp, old) {
                Ok(g) => greens.push(g.transpose()),
                Err(e) if e.is_walker_death() => {
                    log::debug!("skipping walker with singular back-propagated overlap");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        let energy = evaluator.local_energy(&greens);
        if !energy.is_finite() {
            return Ok(());
        }
        let weight = self.restored_weight(walker);
        self.weighted_energy += weight * energy;
        self.weight += weight;
        for (acc, g) in self.weighted_greens.iter_mut().zip(&greens) {
            *acc += g * weight;
        }
        Ok(())
    }

    fn restored_weight(&self, walker: &Walker) -> Complex64 {
        let w = Complex64::new(walker.weight, 0.0);
        let (cos_fac, weight_fac) = walker.field_configs.block_factors();
        match self.restore {
            RestoreWeights::None => w,
            RestoreWeights::Phase => w * weight_fac,
            RestoreWeights::Full if cos_fac == 0.0 => ZERO,
            RestoreWeights::Full => w * weight_fac / cos_fac,
        }
    }

    /// Sum over ranks and restart accumulation. `None` when no walker contributed.
    pub fn reduce<C: Communicator + ?Sized>(&mut self, comm: &C) -> Result<Option<BackPropagatedEstimate>> {
        let mut local = vec![self.weighted_energy.re, self.weighted_energy.im, self.weight.re, self.weight.im];
        for g in &self.weighted_greens {
            local.extend(g.iter().flat_map(|z| [z.re, z.im]));
        }
        let global = comm.all_reduce_sum(&local)?;
        let energy = Complex64::new(global[0], global[1]);
        let weight = Complex64::new(global[2], global[3]);
        let mut entries = global[4..].chunks(2).map(|c| Complex64::new(c[0], c[1]));
        let greens: Vec<CMatrix> = self
            .weighted_greens
            .iter()
            .map(|g| CMatrix::from_iterator(g.nrows(), g.ncols(), entries.by_ref().take(g.len())))
            .collect();

        self.weighted_energy = ZERO;
        self.weight = ZERO;
        for g in self.weighted_greens.iter_mut() {
            g.fill(ZERO);
        }

        if weight.norm() == 0.0 {
            return Ok(None);
        }
        Ok(Some(BackPropagatedEstimate {
            energy: (energy / weight).re,
            weight: weight.re,
            greens: greens.into_iter().map(|g| g / weight).collect(),
        }))
    }
}

/// Replay the walker's last completed block in reverse with `B^†` on the
/// trial's leading determinant.
fn back_propagate(walker: &Walker, propagator: &Propagator, trial: &Trial, nstblz: usize) -> Vec<CMatrix> {
    let bt2 = &propagator.params().bt2;
    let mut phi_bp = trial.leading().to_vec();
    for (k, row) in walker.field_configs.block_rows().into_iter().rev().enumerate() {
        for (s, phi) in phi_bp.iter_mut().enumerate() {
            let mut b = bt2.clone();
            for (site, &field) in row.iter().enumerate() {
                scale_row(&mut b, site, ONE + propagator.field_deltas(field)[s]);
            }
            let b = bt2 * b;
            *phi = b.adjoint() * &*phi;
        }
        if (k + 1) % nstblz == 0 {
            for phi in phi_bp.iter_mut() {
                *phi = reorthonormalize(phi).0;
            }
        }
    }
    phi_bp
}
