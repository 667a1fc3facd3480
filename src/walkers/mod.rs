//! Walkers module - stochastic samples of the many-body state.
//!
//! A [`Walker`] holds what every variant shares (weight, phase, running
//! overlap, field history and wavefunction snapshots) and delegates the
//! state-shape specific work to a [`WalkerKind`].

mod buffer;
mod traits;
mod field_config;
mod single_det;
mod multi_det;
mod multi_ghf;
mod thermal;

pub(crate) use traits::WalkerBackend;
pub use field_config::FieldConfig;
pub use single_det::SingleDet;
pub use multi_det::MultiDet;
pub use multi_ghf::MultiGhf;
pub use thermal::{PropagatorStack, ThermalWalker};

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::{AfqmcError, Result};
use crate::linalg::{CMatrix, ONE, ZERO};
use crate::systems::{EnergyEvaluator, ModelParameters};
use crate::wavefunction::{Trial, TrialKind};
use buffer::{push_matrix, push_real, BufferReader};

/// Walker variant selected by the run configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WalkerType {
    #[default]
    SingleDet,
    MultiDet,
    MultiGhf,
    Thermal,
}

/// Shape parameters for building walkers.
#[derive(Copy, Clone, Debug)]
pub struct WalkerOptions {
    pub walker_type: WalkerType,
    /// Rows retained in the field history.
    pub nprop_tot: usize,
    /// Rows per back-propagation block.
    pub nbp: usize,
    /// Time slices per bin of a thermal walker's stack.
    pub stack_size: usize,
    /// Time slices of a thermal path, `β / dt`.
    pub ntime_slices: usize,
}

impl Default for WalkerOptions {
    fn default() -> Self {
        Self {
            walker_type: WalkerType::SingleDet,
            nprop_tot: 1,
            nbp: 1,
            stack_size: 1,
            ntime_slices: 1,
        }
    }
}

impl WalkerOptions {
    pub fn with_type(mut self, walker_type: WalkerType) -> Self {
        self.walker_type = walker_type;
        self
    }

    pub fn with_history(mut self, nprop_tot: usize, nbp: usize) -> Self {
        self.nprop_tot = nprop_tot;
        self.nbp = nbp;
        self
    }

    pub fn with_stack(mut self, stack_size: usize, ntime_slices: usize) -> Self {
        self.stack_size = stack_size;
        self.ntime_slices = ntime_slices;
        self
    }
}

#[derive(Clone, Debug)]
pub enum WalkerKind {
    SingleDet(SingleDet),
    MultiDet(MultiDet),
    MultiGhf(MultiGhf),
    Thermal(ThermalWalker),
}

impl WalkerKind {
    pub(crate) fn backend(&self) -> &dyn WalkerBackend {
        match self {
            WalkerKind::SingleDet(w) => w,
            WalkerKind::MultiDet(w) => w,
            WalkerKind::MultiGhf(w) => w,
            WalkerKind::Thermal(w) => w,
        }
    }

    pub(crate) fn backend_mut(&mut self) -> &mut dyn WalkerBackend {
        match self {
            WalkerKind::SingleDet(w) => w,
            WalkerKind::MultiDet(w) => w,
            WalkerKind::MultiGhf(w) => w,
            WalkerKind::Thermal(w) => w,
        }
    }
}

/// One stochastic sample with its statistical weight.
#[derive(Clone, Debug)]
pub struct Walker {
    pub weight: f64,
    /// Unit phase accumulated under free projection.
    pub phase: Complex64,
    /// Running overlap: product of update ratios over reorthogonalisation factors.
    pub overlap: Complex64,
    /// Cached real-part local energy used by the continuous propagator.
    pub e_local: Complex64,
    pub field_configs: FieldConfig,
    phi_old: Vec<CMatrix>,
    phi_init: Vec<CMatrix>,
    last_ratio: Complex64,
    kind: WalkerKind,
}

impl Walker {
    /// Walker at the leading trial determinant. `e_local` starts at the
    /// walker's own local energy.
    pub fn new(
        opts: &WalkerOptions,
        trial: &Trial,
        params: &ModelParameters,
        evaluator: &dyn EnergyEvaluator,
    ) -> Result<Self> {
        let kind = match opts.walker_type {
            WalkerType::SingleDet => WalkerKind::SingleDet(SingleDet::new(trial)?),
            WalkerType::MultiDet => WalkerKind::MultiDet(MultiDet::new(trial)?),
            WalkerType::MultiGhf => {
                if trial.kind != TrialKind::Ghf {
                    return Err(AfqmcError::Config("GHF walkers need a GHF trial".to_string()));
                }
                WalkerKind::MultiGhf(MultiGhf::new(trial)?)
            }
            WalkerType::Thermal => {
                WalkerKind::Thermal(ThermalWalker::new(&params.bt, opts.stack_size, opts.ntime_slices)?)
            }
        };
        let phi = kind.backend().wavefunction().to_vec();
        let mut walker = Self {
            weight: 1.0,
            phase: ONE,
            overlap: ONE,
            e_local: ZERO,
            field_configs: FieldConfig::new(params.nbasis, opts.nprop_tot, opts.nbp),
            phi_old: phi.clone(),
            phi_init: phi,
            last_ratio: ONE,
            kind,
        };
        walker.refresh_energy(evaluator);
        Ok(walker)
    }

    /// Restart from the leading trial determinant with unit weight, overlap and phase.
    pub fn initialize(&mut self, trial: &Trial, evaluator: &dyn EnergyEvaluator) -> Result<()> {
        self.kind.backend_mut().set_wavefunction(trial.leading().to_vec(), trial)?;
        self.weight = 1.0;
        self.phase = ONE;
        self.overlap = ONE;
        self.last_ratio = ONE;
        self.field_configs.reset();
        self.phi_init = trial.leading().to_vec();
        self.phi_old = self.phi_init.clone();
        self.refresh_energy(evaluator);
        Ok(())
    }

    pub fn kind(&self) -> &WalkerKind {
        &self.kind
    }

    pub fn thermal_mut(&mut self) -> Option<&mut ThermalWalker> {
        match &mut self.kind {
            WalkerKind::Thermal(w) => Some(w),
            _ => None,
        }
    }

    pub fn is_thermal(&self) -> bool {
        matches!(self.kind, WalkerKind::Thermal(_))
    }

    pub fn is_ghf(&self) -> bool {
        matches!(self.kind, WalkerKind::MultiGhf(_))
    }

    pub fn is_alive(&self) -> bool {
        self.weight > 0.0
    }

    pub fn kill(&mut self) {
        self.weight = 0.0;
    }

    pub fn wavefunction(&self) -> &[CMatrix] {
        self.kind.backend().wavefunction()
    }

    pub fn greens_function(&self) -> &[CMatrix] {
        self.kind.backend().greens_function()
    }

    /// `⟨Ψ_T|φ⟩` as tracked by the variant.
    pub fn trial_overlap(&self) -> Complex64 {
        self.kind.backend().trial_overlap()
    }

    /// Prospective overlap ratio of a field update, without applying it.
    pub fn field_ratio(&self, site: usize, deltas: [Complex64; 2]) -> Complex64 {
        self.kind.backend().field_ratio(site, deltas)
    }

    /// Scale site `site` by `1 + deltas[σ]` and fold the ratio into the overlap.
    pub fn apply_field_update(&mut self, site: usize, deltas: [Complex64; 2], trial: &Trial) -> Result<Complex64> {
        let ratio = self.kind.backend_mut().apply_field_update(site, deltas, trial)?;
        self.overlap *= ratio;
        self.last_ratio = ratio;
        Ok(ratio)
    }

    /// Overlap ratio of the most recent update.
    pub fn compute_overlap_ratio(&self) -> Complex64 {
        self.last_ratio
    }

    pub fn apply_one_body(&mut self, b: &CMatrix, trial: &Trial) -> Result<Complex64> {
        let ratio = self.kind.backend_mut().apply_one_body(b, trial)?;
        self.overlap *= ratio;
        self.last_ratio = ratio;
        Ok(ratio)
    }

    /// QR-stabilise the wavefunction. The returned `det R` is already divided
    /// out of the running overlap.
    pub fn reorthogonalize(&mut self, trial: &Trial) -> Result<Complex64> {
        let det = self.kind.backend_mut().reorthogonalize(trial)?;
        self.overlap /= det;
        Ok(det)
    }

    pub fn local_energy(&self, evaluator: &dyn EnergyEvaluator) -> Complex64 {
        self.kind.backend().local_energy(evaluator)
    }

    /// Cache the current local energy as `e_local`. A non-finite energy kills the walker.
    pub fn refresh_energy(&mut self, evaluator: &dyn EnergyEvaluator) {
        let e = self.local_energy(evaluator);
        if e.is_finite() {
            self.e_local = e;
        } else {
            self.e_local = ZERO;
            self.kill();
        }
    }

    pub fn record_field(&mut self, value: Complex64) {
        self.field_configs.push(value);
    }

    pub fn record_step(&mut self, fields: &[Complex64], cos_fac: f64, weight_fac: Complex64) {
        self.field_configs.push_full(fields, cos_fac, weight_fac);
    }

    /// Wavefunction at the start of the current back-propagation window.
    pub fn phi_old(&self) -> &[CMatrix] {
        &self.phi_old
    }

    /// Wavefunction at the start of the run.
    pub fn phi_init(&self) -> &[CMatrix] {
        &self.phi_init
    }

    /// Start a new back-propagation window at the current wavefunction.
    pub fn snapshot_window(&mut self) {
        self.phi_old = self.wavefunction().to_vec();
    }

    /// Rewind a thermal walker to the start of a new imaginary-time path.
    pub fn reset_thermal(&mut self, bt: &CMatrix) -> Result<()> {
        let walker = self
            .thermal_mut()
            .ok_or(AfqmcError::Unsupported("thermal reset of a zero-temperature walker"))?;
        walker.reset(bt)?;
        self.weight = 1.0;
        self.phase = ONE;
        self.overlap = ONE;
        self.last_ratio = ONE;
        Ok(())
    }

    /// Full walker state for moving it to another slot or rank.
    pub fn transfer_buffer(&self) -> Vec<Complex64> {
        let mut buf = Vec::new();
        push_real(&mut buf, self.weight);
        buf.push(self.phase);
        buf.push(self.overlap);
        buf.push(self.e_local);
        buf.push(self.last_ratio);
        self.field_configs.pack(&mut buf);
        self.phi_old.iter().for_each(|m| push_matrix(&mut buf, m));
        self.phi_init.iter().for_each(|m| push_matrix(&mut buf, m));
        self.kind.backend().pack(&mut buf);
        buf
    }

    /// Overwrite this walker with a buffer from [`Walker::transfer_buffer`]
    /// of an identically shaped walker.
    pub fn set_transfer_buffer(&mut self, buf: &[Complex64]) -> Result<()> {
        let mut reader = BufferReader::new(buf);
        self.weight = reader.real()?;
        self.phase = reader.complex()?;
        self.overlap = reader.complex()?;
        self.e_local = reader.complex()?;
        self.last_ratio = reader.complex()?;
        self.field_configs.unpack(&mut reader)?;
        for m in self.phi_old.iter_mut() {
            reader.matrix_into(m)?;
        }
        for m in self.phi_init.iter_mut() {
            reader.matrix_into(m)?;
        }
        self.kind.backend_mut().unpack(&mut reader)?;
        reader.finish()
    }

    /// Length of a checkpoint record, `3 + Σ_blocks rows × columns`.
    pub fn checkpoint_len(&self) -> usize {
        3 + self.wavefunction().iter().map(|m| m.len()).sum::<usize>()
    }

    /// `[weight, phase, overlap, φ row-major]`, spin blocks side by side.
    pub fn checkpoint_record(&self) -> Result<Vec<Complex64>> {
        let phi = self.wavefunction();
        if phi.is_empty() {
            return Err(AfqmcError::Unsupported("checkpointing thermal walkers"));
        }
        let mut record = Vec::with_capacity(self.checkpoint_len());
        record.push(Complex64::new(self.weight, 0.0));
        record.push(self.phase);
        record.push(self.overlap);
        for i in 0..phi[0].nrows() {
            for block in phi {
                record.extend(block.row(i).iter().copied());
            }
        }
        Ok(record)
    }

    /// Restore from a checkpoint record and rebuild derived quantities.
    pub fn restore_checkpoint(
        &mut self,
        record: &[Complex64],
        trial: &Trial,
        evaluator: &dyn EnergyEvaluator,
    ) -> Result<()> {
        if self.is_thermal() {
            return Err(AfqmcError::Unsupported("checkpointing thermal walkers"));
        }
        let expected = self.checkpoint_len();
        if record.len() != expected {
            return Err(AfqmcError::CheckpointFormatMismatch {
                what: "checkpoint record entries",
                expected,
                found: record.len(),
            });
        }
        let mut phi: Vec<CMatrix> = self.wavefunction().to_vec();
        let mut entries = record[3..].iter();
        for i in 0..phi[0].nrows() {
            for block in phi.iter_mut() {
                for j in 0..block.ncols() {
                    block[(i, j)] = entries.next().copied().unwrap_or_default();
                }
            }
        }
        self.kind.backend_mut().set_wavefunction(phi, trial)?;
        self.weight = record[0].re;
        self.phase = record[1];
        self.overlap = record[2];
        self.last_ratio = ONE;
        self.field_configs.reset();
        self.phi_init = self.wavefunction().to_vec();
        self.phi_old = self.phi_init.clone();
        self.refresh_energy(evaluator);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systems::Hubbard;

    fn setup(walker_type: WalkerType) -> (Hubbard, Trial, ModelParameters, Walker) {
        let system = Hubbard::new(4, 2, 1.0, 4.0, 3, 3);
        let mut trial = Trial::free_electron(&system);
        if walker_type == WalkerType::MultiGhf {
            trial = trial.to_ghf();
        }
        let params = system.model_parameters(0.05);
        let opts = WalkerOptions::default()
            .with_type(walker_type)
            .with_history(4, 2)
            .with_stack(2, 10);
        let walker = Walker::new(&opts, &trial, &params, &system).unwrap();
        (system, trial, params, walker)
    }

    #[test]
    fn test_transfer_buffer_moves_full_state() {
        for walker_type in [WalkerType::SingleDet, WalkerType::MultiDet, WalkerType::MultiGhf, WalkerType::Thermal] {
            let (system, trial, params, mut source) = setup(walker_type);
            let mut target = source.clone();
            if !source.is_thermal() {
                source.apply_one_body(&params.bt2, &trial).unwrap();
                source.snapshot_window();
            }
            source.apply_field_update(3, params.discrete_deltas(1), &trial).unwrap();
            source.record_field(Complex64::new(1.0, 0.0));
            source.weight = 0.75;
            target.set_transfer_buffer(&source.transfer_buffer()).unwrap();
            assert_eq!(target.weight, 0.75);
            assert_eq!(target.overlap, source.overlap);
            assert_eq!(target.compute_overlap_ratio(), source.compute_overlap_ratio());
            assert_eq!(target.field_configs.step(), source.field_configs.step());
            assert_eq!(target.local_energy(&system), source.local_energy(&system));
            for (a, b) in target.greens_function().iter().zip(source.greens_function()) {
                assert_eq!(a, b);
            }
            for (a, b) in target.phi_old().iter().zip(source.phi_old()) {
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn test_truncated_transfer_buffer_is_rejected() {
        let (_, _, _, mut walker) = setup(WalkerType::SingleDet);
        let mut buf = walker.transfer_buffer();
        buf.pop();
        assert!(matches!(
            walker.set_transfer_buffer(&buf),
            Err(AfqmcError::CheckpointFormatMismatch { .. })
        ));
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let (system, trial, params, mut walker) = setup(WalkerType::SingleDet);
        walker.apply_one_body(&params.bt2, &trial).unwrap();
        walker.weight = 1.5;
        let record = walker.checkpoint_record().unwrap();
        assert_eq!(record.len(), 3 + 8 * 6);
        assert_eq!(record.len(), walker.checkpoint_len());
        // Row 0: three spin-up entries then three spin-down entries.
        assert_eq!(record[3 + 3], walker.wavefunction()[1][(0, 0)]);
        let (_, _, _, mut restored) = setup(WalkerType::SingleDet);
        restored.restore_checkpoint(&record, &trial, &system).unwrap();
        assert_eq!(restored.weight, 1.5);
        assert_eq!(restored.overlap, walker.overlap);
        assert!((restored.local_energy(&system) - walker.local_energy(&system)).norm() < 1e-10);
        assert!((restored.e_local - walker.local_energy(&system)).norm() < 1e-10);
        assert!((restored.e_local - restored.local_energy(&system)).norm() < 1e-14);
    }

    #[test]
    fn test_checkpoint_length_mismatch() {
        let (system, trial, _, mut walker) = setup(WalkerType::SingleDet);
        let mut record = walker.checkpoint_record().unwrap();
        record.push(ONE);
        let err = walker.restore_checkpoint(&record, &trial, &system).unwrap_err();
        assert!(matches!(
            err,
            AfqmcError::CheckpointFormatMismatch { expected: 51, found: 52, .. }
        ));
    }

    #[test]
    fn test_thermal_checkpoint_unsupported() {
        let (_, _, _, walker) = setup(WalkerType::Thermal);
        assert!(matches!(walker.checkpoint_record(), Err(AfqmcError::Unsupported(_))));
    }

    #[test]
    fn test_new_walker_caches_local_energy() {
        for walker_type in [WalkerType::SingleDet, WalkerType::MultiDet, WalkerType::MultiGhf] {
            let (system, _, _, walker) = setup(walker_type);
            let e = walker.local_energy(&system);
            assert!(e.re < 0.0);
            assert_eq!(walker.e_local, e);
        }
    }

    #[test]
    fn test_initialize_resets_scalars() {
        let (system, trial, params, mut walker) = setup(WalkerType::MultiDet);
        let e_trial = walker.e_local;
        walker.apply_one_body(&params.bt2, &trial).unwrap();
        walker.weight = 3.0;
        walker.e_local = ZERO;
        walker.initialize(&trial, &system).unwrap();
        assert_eq!(walker.weight, 1.0);
        assert_eq!(walker.overlap, ONE);
        assert_eq!(walker.wavefunction()[0], trial.leading()[0]);
        assert_eq!(walker.phi_init(), trial.leading());
        assert!((walker.e_local - e_trial).norm() < 1e-12);
    }
}
