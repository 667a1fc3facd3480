//! UHF walker guided by a multi-determinant trial.
//!
//! Every trial determinant `k` keeps its own inverse overlap and Green's
//! function. Measurements are reduced with the weights
//! `w_k = c_k^* ⟨ψ_k|φ⟩`, so the mixed Green's function is
//! `Σ_k w_k G_k / Σ_k w_k`.

use num_complex::Complex64;

use crate::error::{AfqmcError, Result};
use crate::linalg::{
    greens_from_inverse, inverse, reorthonormalize, row_vector, scale_row, sherman_morrison, CMatrix, ONE,
    OVERLAP_FLOOR,
};
use crate::systems::EnergyEvaluator;
use crate::walkers::buffer::{push_matrix, BufferReader};
use crate::walkers::WalkerBackend;
use crate::wavefunction::Trial;

#[derive(Clone, Debug)]
pub struct MultiDet {
    phi: Vec<CMatrix>,
    /// `[det][spin]`
    inv_ovlp: Vec<Vec<CMatrix>>,
    /// `[det][spin]`
    gi: Vec<Vec<CMatrix>>,
    ots: Vec<Complex64>,
    weights: Vec<Complex64>,
    greens: Vec<CMatrix>,
    ot: Complex64,
}

impl MultiDet {
    pub fn new(trial: &Trial) -> Result<Self> {
        Self::from_wavefunction(trial.leading().to_vec(), trial)
    }

    pub fn from_wavefunction(phi: Vec<CMatrix>, trial: &Trial) -> Result<Self> {
        let ndets = trial.ndets();
        let inv: Vec<CMatrix> = phi.iter().map(|p| CMatrix::zeros(p.ncols(), p.ncols())).collect();
        let g: Vec<CMatrix> = phi.iter().map(|p| CMatrix::zeros(p.nrows(), p.nrows())).collect();
        let mut walker = Self {
            inv_ovlp: vec![inv; ndets],
            gi: vec![g.clone(); ndets],
            ots: vec![ONE; ndets],
            weights: vec![ONE; ndets],
            greens: g,
            phi,
            ot: ONE,
        };
        walker.refresh(trial)?;
        Ok(walker)
    }

    /// Per-determinant Green's functions `[det][spin]`.
    pub fn determinant_greens(&self) -> &[Vec<CMatrix>] {
        &self.gi
    }

    fn refresh(&mut self, trial: &Trial) -> Result<()> {
        let mut inv_ovlp = Vec::with_capacity(trial.ndets());
        let mut ots = Vec::with_capacity(trial.ndets());
        for det in &trial.dets {
            let mut ot = ONE;
            let mut inv = Vec::with_capacity(2);
            for (p, f) in det.iter().zip(&self.phi) {
                let ovlp = p.adjoint() * f;
                ot *= ovlp.determinant();
                inv.push(inverse(&ovlp)?);
            }
            inv_ovlp.push(inv);
            ots.push(ot);
        }
        self.inv_ovlp = inv_ovlp;
        self.ots = ots;
        self.reduce(trial)
    }

    /// Rebuild per-determinant and mixed Green's functions plus weights.
    fn reduce(&mut self, trial: &Trial) -> Result<()> {
        for (k, det) in trial.dets.iter().enumerate() {
            for s in 0..2 {
                self.gi[k][s] = greens_from_inverse(&self.phi[s], &self.inv_ovlp[k][s], &det[s]);
            }
            self.weights[k] = trial.coeffs[k].conj() * self.ots[k];
        }
        let ot: Complex64 = self.weights.iter().sum();
        if !ot.is_finite() || ot.norm() < OVERLAP_FLOOR {
            return Err(AfqmcError::NumericalDegeneracy(format!("multi-determinant overlap {ot}")));
        }
        self.ot = ot;
        for s in 0..2 {
            let mut g = CMatrix::zeros(self.greens[s].nrows(), self.greens[s].ncols());
            for (w, gi) in self.weights.iter().zip(&self.gi) {
                g += &gi[s] * (*w / ot);
            }
            self.greens[s] = g;
        }
        Ok(())
    }
}

impl WalkerBackend for MultiDet {
    fn trial_overlap(&self) -> Complex64 {
        self.ot
    }

    fn greens_function(&self) -> &[CMatrix] {
        &self.greens
    }

    fn wavefunction(&self) -> &[CMatrix] {
        &self.phi
    }

    fn field_ratio(&self, site: usize, deltas: [Complex64; 2]) -> Complex64 {
        let num: Complex64 = self
            .weights
            .iter()
            .zip(&self.gi)
            .map(|(w, gi)| *w * (0..2).map(|s| ONE + deltas[s] * gi[s][(site, site)]).product::<Complex64>())
            .sum();
        num / self.ot
    }

    fn apply_field_update(&mut self, site: usize, deltas: [Complex64; 2], trial: &Trial) -> Result<Complex64> {
        let old = self.ot;
        let mut inv_ovlp = Vec::with_capacity(trial.ndets());
        let mut ots = Vec::with_capacity(trial.ndets());
        for (k, det) in trial.dets.iter().enumerate() {
            let mut ot = self.ots[k];
            let mut inv = Vec::with_capacity(2);
            for s in 0..2 {
                let u = row_vector(&det[s], site).map(|z| z.conj());
                let vt = row_vector(&self.phi[s], site) * deltas[s];
                let (next, denom) = sherman_morrison(&self.inv_ovlp[k][s], &u, &vt)?;
                inv.push(next);
                ot *= denom;
            }
            inv_ovlp.push(inv);
            ots.push(ot);
        }
        let previous = (self.phi.clone(), std::mem::replace(&mut self.inv_ovlp, inv_ovlp));
        let previous_ots = std::mem::replace(&mut self.ots, ots);
        for s in 0..2 {
            scale_row(&mut self.phi[s], site, ONE + deltas[s]);
        }
        if let Err(e) = self.reduce(trial) {
            self.phi = previous.0;
            self.inv_ovlp = previous.1;
            self.ots = previous_ots;
            self.reduce(trial)?;
            return Err(e);
        }
        Ok(self.ot / old)
    }

    fn apply_one_body(&mut self, b: &CMatrix, trial: &Trial) -> Result<Complex64> {
        let old = self.ot;
        let phi: Vec<CMatrix> = self.phi.iter().map(|p| b * p).collect();
        let previous = std::mem::replace(&mut self.phi, phi);
        if let Err(e) = self.refresh(trial) {
            self.phi = previous;
            self.refresh(trial)?;
            return Err(e);
        }
        Ok(self.ot / old)
    }

    fn reorthogonalize(&mut self, trial: &Trial) -> Result<Complex64> {
        let mut det = ONE;
        for p in self.phi.iter_mut().filter(|p| p.ncols() > 0) {
            let (q, _, d) = reorthonormalize(p);
            *p = q;
            det *= d;
        }
        self.refresh(trial)?;
        Ok(det)
    }

    fn set_wavefunction(&mut self, phi: Vec<CMatrix>, trial: &Trial) -> Result<()> {
        self.phi = phi;
        self.refresh(trial)
    }

    fn local_energy(&self, evaluator: &dyn EnergyEvaluator) -> Complex64 {
        let num: Complex64 = self
            .weights
            .iter()
            .zip(&self.gi)
            .map(|(w, gi)| *w * evaluator.local_energy(gi))
            .sum();
        num / self.ot
    }

    fn pack(&self, buf: &mut Vec<Complex64>) {
        buf.push(self.ot);
        buf.extend_from_slice(&self.ots);
        buf.extend_from_slice(&self.weights);
        for s in 0..2 {
            push_matrix(buf, &self.phi[s]);
            push_matrix(buf, &self.greens[s]);
        }
        for (inv, gi) in self.inv_ovlp.iter().zip(&self.gi) {
            for s in 0..2 {
                push_matrix(buf, &inv[s]);
                push_matrix(buf, &gi[s]);
            }
        }
    }

    fn unpack(&mut self, reader: &mut BufferReader) -> Result<()> {
        self.ot = reader.complex()?;
        reader.slice_into(&mut self.ots)?;
        reader.slice_into(&mut self.weights)?;
        for s in 0..2 {
            reader.matrix_into(&mut self.phi[s])?;
            reader.matrix_into(&mut self.greens[s])?;
        }
        for (inv, gi) in self.inv_ovlp.iter_mut().zip(self.gi.iter_mut()) {
            for s in 0..2 {
                reader.matrix_into(&mut inv[s])?;
                reader.matrix_into(&mut gi[s])?;
            }
        }
        Ok(())
    }
}
