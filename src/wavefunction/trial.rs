//! Trial wavefunctions: one or more weighted Slater determinants.
//!
//! UHF determinants carry one `N × n_σ` block per spin. GHF determinants are a
//! single spin-combined `2N × (n_up + n_down)` block with the spin-up rows
//! first.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::{AfqmcError, Result};
use crate::linalg::CMatrix;
use crate::systems::Hubbard;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialKind {
    Uhf,
    Ghf,
}

/// Read-only trial wavefunction `Σ_k c_k |ψ_k⟩`.
#[derive(Clone, Debug)]
pub struct Trial {
    /// Determinant blocks: `[ψ↑, ψ↓]` for UHF, `[ψ]` for GHF.
    pub dets: Vec<Vec<CMatrix>>,
    pub coeffs: Vec<Complex64>,
    pub kind: TrialKind,
    pub nbasis: usize,
    pub nup: usize,
    pub ndown: usize,
}

impl Trial {
    /// Single UHF determinant.
    pub fn uhf(psi_up: CMatrix, psi_down: CMatrix) -> Self {
        Self {
            nbasis: psi_up.nrows(),
            nup: psi_up.ncols(),
            ndown: psi_down.ncols(),
            dets: vec![vec![psi_up, psi_down]],
            coeffs: vec![Complex64::new(1.0, 0.0)],
            kind: TrialKind::Uhf,
        }
    }

    /// Free-electron determinant of a Hubbard lattice.
    pub fn free_electron(system: &Hubbard) -> Self {
        let [up, down] = system.free_electron_orbitals();
        Self::uhf(up, down)
    }

    /// Weighted sum of UHF determinants.
    pub fn multi_uhf(dets: Vec<[CMatrix; 2]>, coeffs: Vec<Complex64>) -> Result<Self> {
        if dets.is_empty() || dets.len() != coeffs.len() {
            return Err(AfqmcError::Config(format!(
                "{} determinants but {} coefficients",
                dets.len(),
                coeffs.len()
            )));
        }
        let (nbasis, nup, ndown) = (dets[0][0].nrows(), dets[0][0].ncols(), dets[0][1].ncols());
        if dets.iter().any(|[u, d]| u.shape() != (nbasis, nup) || d.shape() != (nbasis, ndown)) {
            return Err(AfqmcError::Config("determinant shapes differ".to_string()));
        }
        Ok(Self {
            dets: dets.into_iter().map(|[u, d]| vec![u, d]).collect(),
            coeffs,
            kind: TrialKind::Uhf,
            nbasis,
            nup,
            ndown,
        })
    }

    /// Weighted sum of spin-combined determinants.
    pub fn multi_ghf(dets: Vec<CMatrix>, coeffs: Vec<Complex64>, nup: usize, ndown: usize) -> Result<Self> {
        if dets.is_empty() || dets.len() != coeffs.len() {
            return Err(AfqmcError::Config(format!(
                "{} determinants but {} coefficients",
                dets.len(),
                coeffs.len()
            )));
        }
        let nbasis = dets[0].nrows() / 2;
        if dets.iter().any(|d| d.shape() != (2 * nbasis, nup + ndown)) {
            return Err(AfqmcError::Config("GHF determinants must be 2N x (nup + ndown)".to_string()));
        }
        Ok(Self {
            dets: dets.into_iter().map(|d| vec![d]).collect(),
            coeffs,
            kind: TrialKind::Ghf,
            nbasis,
            nup,
            ndown,
        })
    }

    /// Embed every UHF determinant as a block-diagonal GHF determinant.
    pub fn to_ghf(&self) -> Self {
        if self.kind == TrialKind::Ghf {
            return self.clone();
        }
        let (n, nup, ndown) = (self.nbasis, self.nup, self.ndown);
        let dets = self
            .dets
            .iter()
            .map(|det| {
                let mut g = CMatrix::zeros(2 * n, nup + ndown);
                g.view_mut((0, 0), (n, nup)).copy_from(&det[0]);
                g.view_mut((n, nup), (n, ndown)).copy_from(&det[1]);
                vec![g]
            })
            .collect();
        Self {
            dets,
            coeffs: self.coeffs.clone(),
            kind: TrialKind::Ghf,
            nbasis: n,
            nup,
            ndown,
        }
    }

    pub fn ndets(&self) -> usize {
        self.dets.len()
    }

    /// Blocks of the leading determinant.
    pub fn leading(&self) -> &[CMatrix] {
        &self.dets[0]
    }

    pub fn nelec(&self) -> usize {
        self.nup + self.ndown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_ghf_layout() {
        let system = Hubbard::new(4, 1, 1.0, 4.0, 2, 1);
        let trial = Trial::free_electron(&system).to_ghf();
        assert_eq!(trial.kind, TrialKind::Ghf);
        let g = &trial.leading()[0];
        assert_eq!(g.shape(), (8, 3));
        for i in 0..4 {
            assert_eq!(g[(i, 2)], Complex64::new(0.0, 0.0));
            assert_eq!(g[(4 + i, 0)], Complex64::new(0.0, 0.0));
        }
    }

    #[test]
    fn test_multi_uhf_rejects_mismatched_coefficients() {
        let system = Hubbard::new(4, 1, 1.0, 4.0, 1, 1);
        let [up, down] = system.free_electron_orbitals();
        let err = Trial::multi_uhf(vec![[up, down]], vec![]).unwrap_err();
        assert!(matches!(err, AfqmcError::Config(_)));
    }
}
