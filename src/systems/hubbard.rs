//! Hubbard model on a periodic square lattice.
//!
//! H = -t Σ_<ij>σ c†_iσ c_jσ + U Σ_i n_i↑ n_i↓ - μ Σ_iσ n_iσ
//!
//! The lattice only supplies the pieces the walker core consumes: the hopping
//! matrix, the one-body propagators for a time step, the Hubbard–Stratonovich
//! tables and the local energy from a Green's function.

use nalgebra::DMatrix;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::linalg::{exp_symmetric, to_complex, CMatrix};
use crate::systems::{EnergyEvaluator, ModelParameters};

/// Hubbard lattice parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hubbard {
    pub nx: usize,
    pub ny: usize,
    /// Hopping amplitude
    pub t: f64,
    /// On-site repulsion
    pub u: f64,
    /// Chemical potential, only enters the one-body propagators
    #[serde(default)]
    pub mu: f64,
    pub nup: usize,
    pub ndown: usize,
}

impl Hubbard {
    pub fn new(nx: usize, ny: usize, t: f64, u: f64, nup: usize, ndown: usize) -> Self {
        Self { nx, ny, t, u, mu: 0.0, nup, ndown }
    }

    pub fn with_mu(mut self, mu: f64) -> Self {
        self.mu = mu;
        self
    }

    pub fn nbasis(&self) -> usize {
        self.nx * self.ny
    }

    fn site(&self, x: usize, y: usize) -> usize {
        x + self.nx * y
    }

    /// Nearest-neighbour hopping matrix with periodic boundaries.
    ///
    /// On a ring of two sites both neighbours coincide; the bond is counted once.
    pub fn hopping(&self) -> DMatrix<f64> {
        let n = self.nbasis();
        let mut h = DMatrix::zeros(n, n);
        for y in 0..self.ny {
            for x in 0..self.nx {
                let i = self.site(x, y);
                let mut neighbours = Vec::with_capacity(4);
                if self.nx > 1 {
                    neighbours.push(self.site((x + 1) % self.nx, y));
                    neighbours.push(self.site((x + self.nx - 1) % self.nx, y));
                }
                if self.ny > 1 {
                    neighbours.push(self.site(x, (y + 1) % self.ny));
                    neighbours.push(self.site(x, (y + self.ny - 1) % self.ny));
                }
                for j in neighbours {
                    if j != i {
                        h[(i, j)] = -self.t;
                    }
                }
            }
        }
        h
    }

    /// One-body Hamiltonian `T - μ I`.
    pub fn one_body(&self) -> DMatrix<f64> {
        let n = self.nbasis();
        self.hopping() - DMatrix::<f64>::identity(n, n) * self.mu
    }

    /// Propagators and field tables for time step `dt`.
    pub fn model_parameters(&self, dt: f64) -> ModelParameters {
        let h1 = self.one_body();
        // cosh(γ) = exp(dt U / 2)
        let gamma = (0.5 * dt * self.u).exp().acosh();
        let scale = (-0.5 * dt * self.u).exp();
        let up = gamma.exp() * scale;
        let down = (-gamma).exp() * scale;
        ModelParameters {
            dt,
            nbasis: self.nbasis(),
            nup: self.nup,
            ndown: self.ndown,
            bt2: to_complex(&exp_symmetric(&h1, 0.5 * dt)),
            bt: to_complex(&exp_symmetric(&h1, dt)),
            bt_inv: to_complex(&exp_symmetric(&h1, -dt)),
            auxf: [[up, down], [down, up]],
            coupling: Complex64::new(-2.0 * self.u * dt, 0.0).sqrt(),
        }
    }

    /// Lowest `nup` and `ndown` eigenvectors of the hopping matrix.
    pub fn free_electron_orbitals(&self) -> [CMatrix; 2] {
        let eig = self.hopping().symmetric_eigen();
        let mut order: Vec<usize> = (0..self.nbasis()).collect();
        order.sort_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]));
        let pick = |m: usize| {
            let mut psi = CMatrix::zeros(self.nbasis(), m);
            for (col, &k) in order.iter().take(m).enumerate() {
                for i in 0..self.nbasis() {
                    psi[(i, col)] = Complex64::new(eig.eigenvectors[(i, k)], 0.0);
                }
            }
            psi
        };
        [pick(self.nup), pick(self.ndown)]
    }

    fn kinetic(&self, g_up: &CMatrix, g_down: &CMatrix) -> Complex64 {
        let t = self.hopping();
        let n = self.nbasis();
        let mut ke = Complex64::new(0.0, 0.0);
        for i in 0..n {
            for j in 0..n {
                if t[(i, j)] != 0.0 {
                    ke += (g_up[(i, j)] + g_down[(i, j)]) * t[(i, j)];
                }
            }
        }
        ke
    }
}

impl EnergyEvaluator for Hubbard {
    fn local_energy(&self, greens: &[CMatrix]) -> Complex64 {
        let (g_up, g_down) = (&greens[0], &greens[1]);
        let pe: Complex64 = (0..self.nbasis()).map(|i| g_up[(i, i)] * g_down[(i, i)]).sum();
        self.kinetic(g_up, g_down) + pe * self.u
    }

    fn local_energy_ghf(&self, greens: &CMatrix) -> Complex64 {
        let n = self.nbasis();
        let g_up = greens.view((0, 0), (n, n)).into_owned();
        let g_down = greens.view((n, n), (n, n)).into_owned();
        let pe: Complex64 = (0..n)
            .map(|i| greens[(i, i)] * greens[(n + i, n + i)] - greens[(i, n + i)] * greens[(n + i, i)])
            .sum();
        self.kinetic(&g_up, &g_down) + pe * self.u
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_hopping_is_symmetric_with_four_neighbours() {
        let system = Hubbard::new(4, 4, 1.0, 4.0, 7, 7);
        let t = system.hopping();
        assert_eq!(t, t.transpose());
        for i in 0..16 {
            let bonds = (0..16).filter(|&j| t[(i, j)] != 0.0).count();
            assert_eq!(bonds, 4);
            assert_eq!(t[(i, i)], 0.0);
        }
    }

    #[test]
    fn test_two_site_ring_counts_bond_once() {
        let system = Hubbard::new(2, 1, 1.0, 4.0, 1, 1);
        let t = system.hopping();
        assert_eq!(t[(0, 1)], -1.0);
        assert_eq!(t[(1, 0)], -1.0);
    }

    #[test]
    fn test_discrete_fields_reproduce_interaction() {
        let system = Hubbard::new(4, 1, 1.0, 4.0, 2, 2);
        let dt = 0.05;
        let params = system.model_parameters(dt);
        // Doubly occupied site: 0.5 Σ_x auxf[x][0] auxf[x][1] = exp(-dt U)
        let doubly = 0.5 * (params.auxf[0][0] * params.auxf[0][1] + params.auxf[1][0] * params.auxf[1][1]);
        assert_relative_eq!(doubly, (-dt * 4.0_f64).exp(), epsilon = 1e-12);
        // Singly occupied site: the field average is exp(-dt U / 2)
        let single = 0.5 * (params.auxf[0][0] + params.auxf[1][0]);
        assert_relative_eq!(single, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_free_electron_energy_two_by_two() {
        // 4 sites, one up and one down electron in the k = 0 orbital.
        let system = Hubbard::new(4, 1, 1.0, 0.0, 1, 1);
        let [psi_up, psi_down] = system.free_electron_orbitals();
        let g_up = (&psi_up * psi_up.adjoint()).transpose();
        let g_down = (&psi_down * psi_down.adjoint()).transpose();
        let e = system.local_energy(&[g_up, g_down]);
        assert_relative_eq!(e.re, -4.0, epsilon = 1e-10);
    }

    #[test]
    fn test_ghf_energy_matches_uhf_for_block_diagonal() {
        let system = Hubbard::new(4, 1, 1.0, 2.0, 2, 1);
        let [psi_up, psi_down] = system.free_electron_orbitals();
        let g_up = (&psi_up * psi_up.adjoint()).transpose();
        let g_down = (&psi_down * psi_down.adjoint()).transpose();
        let mut g = CMatrix::zeros(8, 8);
        g.view_mut((0, 0), (4, 4)).copy_from(&g_up);
        g.view_mut((4, 4), (4, 4)).copy_from(&g_down);
        let e_uhf = system.local_energy(&[g_up, g_down]);
        let e_ghf = system.local_energy_ghf(&g);
        assert_relative_eq!(e_uhf.re, e_ghf.re, epsilon = 1e-12);
    }
}
