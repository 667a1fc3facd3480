//! Finite-temperature walker built on a stack of time-slice propagators.
//!
//! The walker carries `G = (I + B_L ⋯ B_1)^{-1}` per spin rather than a
//! determinant. Time-slice matrices are accumulated into bins of
//! `stack_size` slices; the bins are only an optimisation of the periodic
//! stable recomputation and never change results.

use num_complex::Complex64;

use crate::error::{AfqmcError, Result};
use crate::linalg::{stable_inverse_one_plus, CMatrix, ONE, OVERLAP_FLOOR};
use crate::systems::EnergyEvaluator;
use crate::walkers::buffer::{push_matrix, push_real, BufferReader};
use crate::walkers::WalkerBackend;
use crate::wavefunction::Trial;

/// Binned product of the time-slice propagators of one imaginary-time path.
#[derive(Clone, Debug)]
pub struct PropagatorStack {
    pub stack_size: usize,
    pub ntime_slices: usize,
    pub nbins: usize,
    /// Slices pushed since the last reset.
    pub time_slice: usize,
    pub block: usize,
    counter: usize,
    /// `[bin][spin]`, each bin the product of its slices, latest leftmost.
    stack: Vec<Vec<CMatrix>>,
}

impl PropagatorStack {
    pub fn new(stack_size: usize, ntime_slices: usize, nbasis: usize) -> Result<Self> {
        if stack_size == 0 || ntime_slices % stack_size != 0 {
            return Err(AfqmcError::Config(format!(
                "stack size {stack_size} must divide the {ntime_slices} time slices"
            )));
        }
        let nbins = ntime_slices / stack_size;
        Ok(Self {
            stack_size,
            ntime_slices,
            nbins,
            time_slice: 0,
            block: 0,
            counter: 0,
            stack: vec![vec![CMatrix::identity(nbasis, nbasis); 2]; nbins],
        })
    }

    /// Fill every slice with `b` and rewind.
    pub fn set_all(&mut self, b: &[CMatrix]) {
        for bin in self.stack.iter_mut() {
            for (s, m) in bin.iter_mut().enumerate() {
                let mut prod = CMatrix::identity(b[s].nrows(), b[s].ncols());
                for _ in 0..self.stack_size {
                    prod = &b[s] * prod;
                }
                *m = prod;
            }
        }
        self.reset();
    }

    pub fn reset(&mut self) {
        self.time_slice = 0;
        self.block = 0;
        self.counter = 0;
    }

    /// Push the next time slice.
    pub fn update(&mut self, b: &[CMatrix]) {
        let bin = &mut self.stack[self.block % self.nbins];
        for (s, m) in bin.iter_mut().enumerate() {
            if self.counter == 0 {
                *m = b[s].clone();
            } else {
                *m = &b[s] * &*m;
            }
        }
        self.time_slice += 1;
        self.block = self.time_slice / self.stack_size;
        self.counter = (self.counter + 1) % self.stack_size;
    }

    /// Bin factors for spin `s` ordered rightmost first, with `leftmost` last.
    fn chain(&self, s: usize, leftmost: usize) -> Vec<&CMatrix> {
        (1..=self.nbins)
            .map(|k| &self.stack[(leftmost + k) % self.nbins][s])
            .collect()
    }
}

/// Thermal walker: per-spin equal-time Green's functions plus the stack.
#[derive(Clone, Debug)]
pub struct ThermalWalker {
    pub stack: PropagatorStack,
    greens: Vec<CMatrix>,
    ot: Complex64,
}

impl ThermalWalker {
    /// Walker with every slice set to the one-body propagator `bt`.
    pub fn new(bt: &CMatrix, stack_size: usize, ntime_slices: usize) -> Result<Self> {
        let n = bt.nrows();
        let mut walker = Self {
            stack: PropagatorStack::new(stack_size, ntime_slices, n)?,
            greens: vec![CMatrix::zeros(n, n); 2],
            ot: ONE,
        };
        walker.reset(bt)?;
        Ok(walker)
    }

    /// Restart the imaginary-time path from the non-interacting density matrix.
    pub fn reset(&mut self, bt: &CMatrix) -> Result<()> {
        self.stack.set_all(&[bt.clone(), bt.clone()]);
        self.ot = ONE;
        self.recompute_greens_function(self.stack.ntime_slices - 1)
    }

    /// Stable `G` with the bin holding time slice `slice_ix` leftmost.
    pub fn recompute_greens_function(&mut self, slice_ix: usize) -> Result<()> {
        let leftmost = (slice_ix / self.stack.stack_size) % self.stack.nbins;
        let mut greens = Vec::with_capacity(2);
        for s in 0..2 {
            greens.push(stable_inverse_one_plus(&self.stack.chain(s, leftmost))?);
        }
        self.greens = greens;
        Ok(())
    }

    /// Move G to the next time slice, `G ← B G B^{-1}`.
    pub fn wrap(&mut self, b: &CMatrix, b_inv: &CMatrix) {
        for g in self.greens.iter_mut() {
            *g = b * &*g * b_inv;
        }
    }

    /// One-particle density matrices `P = I - Gᵀ`.
    pub fn density_matrix(&self) -> Vec<CMatrix> {
        self.greens
            .iter()
            .map(|g| CMatrix::identity(g.nrows(), g.ncols()) - g.transpose())
            .collect()
    }
}

impl WalkerBackend for ThermalWalker {
    fn trial_overlap(&self) -> Complex64 {
        self.ot
    }

    fn greens_function(&self) -> &[CMatrix] {
        &self.greens
    }

    fn wavefunction(&self) -> &[CMatrix] {
        &[]
    }

    fn field_ratio(&self, site: usize, deltas: [Complex64; 2]) -> Complex64 {
        (0..2)
            .map(|s| ONE + (ONE - self.greens[s][(site, site)]) * deltas[s])
            .product()
    }

    fn apply_field_update(&mut self, site: usize, deltas: [Complex64; 2], _trial: &Trial) -> Result<Complex64> {
        let mut ratio = ONE;
        let mut updated = Vec::with_capacity(2);
        for (s, g) in self.greens.iter().enumerate() {
            let denom = ONE + (ONE - g[(site, site)]) * deltas[s];
            if !denom.is_finite() || denom.norm() < OVERLAP_FLOOR {
                return Err(AfqmcError::NumericalDegeneracy(format!("thermal update ratio {denom}")));
            }
            // G' = G - δ G[:, i] (I - G)[i, :] / (1 + δ (1 - G_ii))
            let col = g.column(site).into_owned();
            let mut row = -g.row(site).into_owned();
            row[site] += ONE;
            updated.push(g - col * row * (deltas[s] / denom));
            ratio *= denom;
        }
        self.greens = updated;
        self.ot *= ratio;
        Ok(ratio)
    }

    fn apply_one_body(&mut self, _b: &CMatrix, _trial: &Trial) -> Result<Complex64> {
        Err(AfqmcError::Unsupported("one-body half steps on a thermal walker"))
    }

    /// Thermal walkers are stabilised through the propagator stack instead.
    fn reorthogonalize(&mut self, _trial: &Trial) -> Result<Complex64> {
        Ok(ONE)
    }

    fn set_wavefunction(&mut self, _phi: Vec<CMatrix>, _trial: &Trial) -> Result<()> {
        Err(AfqmcError::Unsupported("thermal walkers carry no determinant"))
    }

    fn local_energy(&self, evaluator: &dyn EnergyEvaluator) -> Complex64 {
        evaluator.local_energy(&self.density_matrix())
    }

    fn pack(&self, buf: &mut Vec<Complex64>) {
        buf.push(self.ot);
        push_real(buf, self.stack.time_slice as f64);
        push_real(buf, self.stack.block as f64);
        push_real(buf, self.stack.counter as f64);
        for bin in &self.stack.stack {
            bin.iter().for_each(|m| push_matrix(buf, m));
        }
        self.greens.iter().for_each(|g| push_matrix(buf, g));
    }

    fn unpack(&mut self, reader: &mut BufferReader) -> Result<()> {
        self.ot = reader.complex()?;
        self.stack.time_slice = reader.index()?;
        self.stack.block = reader.index()?;
        self.stack.counter = reader.index()?;
        for bin in self.stack.stack.iter_mut() {
            for m in bin.iter_mut() {
                reader.matrix_into(m)?;
            }
        }
        for g in self.greens.iter_mut() {
            reader.matrix_into(g)?;
        }
        Ok(())
    }
}
