//! Spin-combined (GHF) walker guided by one or more GHF determinants.
//!
//! The wavefunction is a single `2N × n_e` block, spin-up rows first. A
//! Hubbard field on site `i` touches rows `i` and `N + i`, so every field
//! update is two successive rank-1 updates.

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
pub struct MultiGhf {
    nbasis: usize,
    phi: Vec<CMatrix>,
    inv_ovlp: Vec<CMatrix>,
    gi: Vec<CMatrix>,
    ots: Vec<Complex64>,
    weights: Vec<Complex64>,
    greens: Vec<CMatrix>,
    ot: Complex64,
}

impl MultiGhf {
    pub fn new(trial: &Trial) -> Result<Self> {
        Self::from_wavefunction(trial.leading().to_vec(), trial)
    }

    pub fn from_wavefunction(phi: Vec<CMatrix>, trial: &Trial) -> Result<Self> {
        if phi.len() != 1 || phi[0].nrows() != 2 * trial.nbasis {
            return Err(AfqmcError::Config("GHF walker needs one 2N x n_e block".to_string()));
        }
        let ndets = trial.ndets();
        let (m, ne) = (phi[0].nrows(), phi[0].ncols());
        let mut walker = Self {
            nbasis: trial.nbasis,
            inv_ovlp: vec![CMatrix::zeros(ne, ne); ndets],
            gi: vec![CMatrix::zeros(m, m); ndets],
            ots: vec![ONE; ndets],
            weights: vec![ONE; ndets],
            greens: vec![CMatrix::zeros(m, m)],
            phi,
            ot: ONE,
        };
        walker.refresh(trial)?;
        Ok(walker)
    }

    pub fn determinant_greens(&self) -> &[CMatrix] {
        &self.gi
    }

    fn refresh(&mut self, trial: &Trial) -> Result<()> {
        let mut inv_ovlp = Vec::with_capacity(trial.ndets());
        let mut ots = Vec::with_capacity(trial.ndets());
        for det in &trial.dets {
            let ovlp = det[0].adjoint() * &self.phi[0];
            ots.push(ovlp.determinant());
            inv_ovlp.push(inverse(&ovlp)?);
        }
        self.inv_ovlp = inv_ovlp;
        self.ots = ots;
        self.reduce(trial)
    }

    fn reduce(&mut self, trial: &Trial) -> Result<()> {
        for (k, det) in trial.dets.iter().enumerate() {
            self.gi[k] = greens_from_inverse(&self.phi[0], &self.inv_ovlp[k], &det[0]);
            self.weights[k] = trial.coeffs[k].conj() * self.ots[k];
        }
        let ot: Complex64 = self.weights.iter().sum();
        if !ot.is_finite() || ot.norm() < OVERLAP_FLOOR {
            return Err(AfqmcError::NumericalDegeneracy(format!("GHF overlap {ot}")));
        }
        self.ot = ot;
        let m = self.phi[0].nrows();
        let mut g = CMatrix::zeros(m, m);
        for (w, gi) in self.weights.iter().zip(&self.gi) {
            g += gi * (*w / ot);
        }
        self.greens[0] = g;
        Ok(())
    }

    /// Apply `b` to the spin-up and spin-down row blocks separately.
    fn one_body_product(&self, b: &CMatrix) -> CMatrix {
        let n = self.nbasis;
        let phi = &self.phi[0];
        let mut out = phi.clone();
        out.rows_mut(0, n).copy_from(&(b * phi.rows(0, n)));
        out.rows_mut(n, n).copy_from(&(b * phi.rows(n, n)));
        out
    }
}

impl WalkerBackend for MultiGhf {
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
        let (i, j) = (site, self.nbasis + site);
        let [du, dd] = deltas;
        let num: Complex64 = self
            .weights
            .iter()
            .zip(&self.gi)
            .map(|(w, g)| {
                let a = ONE + du * g[(i, i)];
                let b = du * g[(j, i)];
                let c = dd * g[(i, j)];
                let d = ONE + dd * g[(j, j)];
                *w * (a * d - b * c)
            })
            .sum();
        num / self.ot
    }

    fn apply_field_update(&mut self, site: usize, deltas: [Complex64; 2], trial: &Trial) -> Result<Complex64> {
        let old = self.ot;
        let rows = [site, self.nbasis + site];
        let mut inv_ovlp = Vec::with_capacity(trial.ndets());
        let mut ots = Vec::with_capacity(trial.ndets());
        for (k, det) in trial.dets.iter().enumerate() {
            let mut inv = self.inv_ovlp[k].clone();
            let mut ot = self.ots[k];
            for (row, delta) in rows.into_iter().zip(deltas) {
                let u = row_vector(&det[0], row).map(|z| z.conj());
                let vt = row_vector(&self.phi[0], row) * delta;
                let (next, denom) = sherman_morrison(&inv, &u, &vt)?;
                inv = next;
                ot *= denom;
            }
            inv_ovlp.push(inv);
            ots.push(ot);
        }
        let previous = (self.phi.clone(), std::mem::replace(&mut self.inv_ovlp, inv_ovlp));
        let previous_ots = std::mem::replace(&mut self.ots, ots);
        for (row, delta) in rows.into_iter().zip(deltas) {
            scale_row(&mut self.phi[0], row, ONE + delta);
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
        let phi = self.one_body_product(b);
        let previous = std::mem::replace(&mut self.phi[0], phi);
        if let Err(e) = self.refresh(trial) {
            self.phi[0] = previous;
            self.refresh(trial)?;
            return Err(e);
        }
        Ok(self.ot / old)
    }

    fn reorthogonalize(&mut self, trial: &Trial) -> Result<Complex64> {
        let (q, _, det) = reorthonormalize(&self.phi[0]);
        self.phi[0] = q;
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
            .map(|(w, g)| *w * evaluator.local_energy_ghf(g))
            .sum();
        num / self.ot
    }

    fn pack(&self, buf: &mut Vec<Complex64>) {
        buf.push(self.ot);
        buf.extend_from_slice(&self.ots);
        buf.extend_from_slice(&self.weights);
        push_matrix(buf, &self.phi[0]);
        push_matrix(buf, &self.greens[0]);
        for (inv, gi) in self.inv_ovlp.iter().zip(&self.gi) {
            push_matrix(buf, inv);
            push_matrix(buf, gi);
        }
    }

    fn unpack(&mut self, reader: &mut BufferReader) -> Result<()> {
        self.ot = reader.complex()?;
        reader.slice_into(&mut self.ots)?;
        reader.slice_into(&mut self.weights)?;
        reader.matrix_into(&mut self.phi[0])?;
        reader.matrix_into(&mut self.greens[0])?;
        for (inv, gi) in self.inv_ovlp.iter_mut().zip(self.gi.iter_mut()) {
            reader.matrix_into(inv)?;
            reader.matrix_into(gi)?;
        }
        Ok(())
    }
}
