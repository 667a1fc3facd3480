//! Population module - the walker ensemble of one rank and its control.
//!
//! Walkers are propagated independently. Ranks only meet in the comb, which
//! resamples the global population by weight and moves copies of heavy
//! walkers into the slots of light ones, and at checkpoint writes.

mod comm;
#[cfg(feature = "mpi")]
mod mpi_comm;

pub use comm::{spawn_ranks, Communicator, FakeComm, ThreadComm};
#[cfg(feature = "mpi")]
pub use mpi_comm::MpiComm;

use std::path::Path;

use rand::Rng;

use crate::error::{AfqmcError, Result};
use crate::io::{checkpoint_path, read_checkpoint, write_checkpoint, CheckpointFile};
use crate::linalg::{CMatrix, OVERLAP_FLOOR};
use crate::propagation::Propagator;
use crate::systems::{EnergyEvaluator, ModelParameters};
use crate::walkers::{Walker, WalkerOptions};
use crate::wavefunction::Trial;

/// Walkers owned by one rank.
#[derive(Clone, Debug)]
pub struct Walkers {
    pub walkers: Vec<Walker>,
    nwalkers: usize,
    ntot_walkers: usize,
    total_weight: f64,
}

impl Walkers {
    /// `nwalkers` identical walkers on each of `nranks` ranks.
    pub fn new(
        nwalkers: usize,
        nranks: usize,
        opts: &WalkerOptions,
        trial: &Trial,
        params: &ModelParameters,
        evaluator: &dyn EnergyEvaluator,
    ) -> Result<Self> {
        if nwalkers == 0 || nranks == 0 {
            return Err(AfqmcError::Config("need at least one walker per rank".to_string()));
        }
        let walker = Walker::new(opts, trial, params, evaluator)?;
        Ok(Self {
            walkers: vec![walker; nwalkers],
            nwalkers,
            ntot_walkers: nwalkers * nranks,
            total_weight: (nwalkers * nranks) as f64,
        })
    }

    pub fn nwalkers(&self) -> usize {
        self.nwalkers
    }

    pub fn ntot_walkers(&self) -> usize {
        self.ntot_walkers
    }

    /// Global weight measured by the last comb.
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn set_total_weight(&mut self, total_weight: f64) {
        self.total_weight = total_weight;
    }

    /// Number of local walkers with non-zero weight.
    pub fn alive(&self) -> usize {
        self.walkers.iter().filter(|w| w.is_alive()).count()
    }

    /// One propagation step for every local walker, in index order.
    pub fn propagate_all<R: Rng + ?Sized>(
        &mut self,
        step: usize,
        propagator: &Propagator,
        trial: &Trial,
        evaluator: &dyn EnergyEvaluator,
        rng: &mut R,
    ) -> Result<()> {
        for walker in self.walkers.iter_mut() {
            propagator.propagate_walker(walker, trial, evaluator, rng)?;
        }
        log::trace!("step {step}: {} of {} walkers alive", self.alive(), self.nwalkers);
        Ok(())
    }

    /// QR-stabilise every live walker. Under free projection `det R` is kept
    /// in the weight and phase.
    pub fn reorthogonalize_all(&mut self, trial: &Trial, free_projection: bool) -> Result<()> {
        for walker in self.walkers.iter_mut().filter(|w| w.is_alive()) {
            match walker.reorthogonalize(trial) {
                Ok(det) if free_projection => {
                    let (mag, theta) = det.to_polar();
                    if mag > OVERLAP_FLOOR {
                        walker.weight *= mag;
                        walker.phase *= num_complex::Complex64::from_polar(1.0, theta);
                    } else {
                        walker.kill();
                    }
                }
                Ok(_) => {}
                Err(e) if e.is_walker_death() => {
                    log::warn!("walker died during reorthogonalisation: {e}");
                    walker.kill();
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Comb population control across all ranks.
    ///
    /// The root draws one offset and assigns every global walker the number
    /// of comb teeth in its cumulative-weight interval. Slots with zero teeth
    /// are overwritten by copies of walkers with more than one, in global
    /// `(rank, slot)` order, after which every weight is reset to one.
    pub fn branch<C, R>(&mut self, comm: &C, rng: &mut R, step: usize) -> Result<()>
    where
        C: Communicator + ?Sized,
        R: Rng + ?Sized,
    {
        if self.ntot_walkers == 1 {
            self.walkers[0].weight = 1.0;
            return Ok(());
        }
        let local: Vec<f64> = self.walkers.iter().map(|w| w.weight.abs()).collect();
        let mut parents = vec![0usize; self.ntot_walkers];
        let mut total = [0.0];
        if let Some(global) = comm.gather(&local)? {
            total[0] = global.iter().sum();
            if total[0] > 0.0 && total[0].is_finite() {
                let r: f64 = rng.gen();
                parents = comb_multiplicities(&global, self.ntot_walkers, r);
            }
        }
        comm.broadcast_f64(&mut total)?;
        comm.broadcast_usize(&mut parents)?;
        let total_weight = total[0];
        if !(total_weight > 0.0 && total_weight.is_finite()) {
            return Err(AfqmcError::PopulationCollapse { step });
        }

        let rank = comm.rank();
        let transfers = pair_transfers(&parents);
        for (tag, &(source, dest)) in transfers.iter().enumerate() {
            let (src_rank, src_slot) = (source / self.nwalkers, source % self.nwalkers);
            let (dst_rank, dst_slot) = (dest / self.nwalkers, dest % self.nwalkers);
            if src_rank == rank && dst_rank == rank {
                let buf = self.walkers[src_slot].transfer_buffer();
                self.walkers[dst_slot].set_transfer_buffer(&buf)?;
            } else if src_rank == rank {
                comm.send(dst_rank, tag, self.walkers[src_slot].transfer_buffer())?;
            } else if dst_rank == rank {
                let buf = comm.receive(src_rank, tag)?;
                self.walkers[dst_slot].set_transfer_buffer(&buf)?;
            }
        }
        comm.barrier()?;

        for walker in self.walkers.iter_mut() {
            walker.weight = 1.0;
        }
        self.set_total_weight(total_weight);
        log::debug!(
            "comb at step {step}: total weight {total_weight:.6}, {} walkers copied",
            transfers.len()
        );
        Ok(())
    }

    /// Write this rank's walkers to `<prefix>.rank<r>.yaml`, then wait for all ranks.
    pub fn write_checkpoint<C: Communicator + ?Sized>(&self, prefix: &Path, comm: &C) -> Result<()> {
        let records = self
            .walkers
            .iter()
            .map(|w| w.checkpoint_record())
            .collect::<Result<Vec<_>>>()?;
        let path = checkpoint_path(prefix, comm.rank());
        if path.exists() {
            log::warn!("overwriting checkpoint {}", path.display());
        }
        write_checkpoint(&path, &CheckpointFile { rank: comm.rank(), nwalkers: self.nwalkers, records })?;
        comm.barrier()
    }

    /// Restore this rank's walkers from a checkpoint written with the same
    /// configuration.
    pub fn read_checkpoint<C: Communicator + ?Sized>(
        &mut self,
        prefix: &Path,
        trial: &Trial,
        evaluator: &dyn EnergyEvaluator,
        comm: &C,
    ) -> Result<()> {
        let file = read_checkpoint(&checkpoint_path(prefix, comm.rank()))?;
        if file.nwalkers != self.nwalkers || file.records.len() != self.nwalkers {
            return Err(AfqmcError::CheckpointFormatMismatch {
                what: "walkers",
                expected: self.nwalkers,
                found: file.records.len(),
            });
        }
        for (walker, record) in self.walkers.iter_mut().zip(&file.records) {
            walker.restore_checkpoint(record, trial, evaluator)?;
        }
        comm.barrier()
    }

    /// Restart every thermal walker on a fresh imaginary-time path.
    pub fn reset_thermal(&mut self, bt: &CMatrix) -> Result<()> {
        for walker in self.walkers.iter_mut() {
            walker.reset_thermal(bt)?;
        }
        Ok(())
    }
}

/// Teeth of a comb with offset `r ∈ [0, 1)` falling into each weight's
/// cumulative interval. Zero-weight entries never receive a tooth.
pub fn comb_multiplicities(weights: &[f64], ntarget: usize, r: f64) -> Vec<usize> {
    let mut multiplicity = vec![0; weights.len()];
    let total: f64 = weights.iter().sum();
    let last = match weights.iter().rposition(|&w| w > 0.0) {
        Some(last) if ntarget > 0 && total > 0.0 => last,
        _ => return multiplicity,
    };
    let cumulative: Vec<f64> = weights
        .iter()
        .scan(0.0, |acc, &w| {
            *acc += w;
            Some(*acc)
        })
        .collect();
    let spacing = total / ntarget as f64;
    let mut iw = 0;
    for ic in 0..ntarget {
        let tooth = (ic as f64 + r) * spacing;
        while iw < last && tooth >= cumulative[iw] {
            iw += 1;
        }
        multiplicity[iw] += 1;
    }
    multiplicity
}

/// Pair every surplus copy with an empty slot, both in global index order.
/// Returns `(source, destination)` global indices.
fn pair_transfers(multiplicity: &[usize]) -> Vec<(usize, usize)> {
    let sources = multiplicity
        .iter()
        .enumerate()
        .flat_map(|(i, &m)| std::iter::repeat(i).take(m.saturating_sub(1)));
    let dests = multiplicity.iter().enumerate().filter(|&(_, &m)| m == 0).map(|(i, _)| i);
    sources.zip(dests).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_comb_multiplicities_floor_or_ceil() {
        let weights = [0.3, 2.5, 0.0, 1.2, 0.05, 0.95];
        let total: f64 = weights.iter().sum();
        for &r in &[0.0, 0.13, 0.5, 0.87, 0.999] {
            let m = comb_multiplicities(&weights, 6, r);
            assert_eq!(m.iter().sum::<usize>(), 6);
            assert_eq!(m[2], 0);
            for (w, &k) in weights.iter().zip(&m) {
                let expected = w * 6.0 / total;
                assert!(k == expected.floor() as usize || k == expected.ceil() as usize);
            }
        }
    }

    #[test]
    fn test_comb_trailing_zero_weight_gets_nothing() {
        let m = comb_multiplicities(&[1.0, 0.0], 2, 1.0 - 1e-17);
        assert_eq!(m, vec![2, 0]);
        assert_eq!(comb_multiplicities(&[0.0, 0.0], 2, 0.5), vec![0, 0]);
    }

    #[test]
    fn test_pair_transfers_in_global_order() {
        let pairs = pair_transfers(&[0, 3, 1, 0, 0, 2]);
        assert_eq!(pairs, vec![(1, 0), (1, 3), (5, 4)]);
    }

    #[test]
    fn test_equal_weights_are_untouched() {
        let m = comb_multiplicities(&[0.7; 5], 5, 0.4);
        assert_eq!(m, vec![1; 5]);
        assert!(pair_transfers(&m).is_empty());
        let spacing: f64 = 3.5 / 5.0;
        assert_relative_eq!(spacing, 0.7, epsilon = 1e-15);
    }
}
