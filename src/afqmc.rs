//! AFQMC driver: propagation, population control and measurement on one rank.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::Result;
use crate::estimators::{BackPropagatedEstimate, BackPropagation, MixedEstimator};
use crate::io::Config;
use crate::population::{Communicator, Walkers};
use crate::propagation::Propagator;
use crate::systems::ModelParameters;
use crate::walkers::WalkerType;
use crate::wavefunction::Trial;

/// Energies reported by one rank. Every rank sees the same globally reduced values.
#[derive(Clone, Debug, Default)]
pub struct AfqmcResults {
    /// Mixed energy of every measurement block; `None` if no walker contributed.
    pub block_energies: Vec<Option<f64>>,
    pub back_propagated: Vec<BackPropagatedEstimate>,
    /// Global weight measured by the last comb.
    pub total_weight: f64,
}

impl AfqmcResults {
    /// Mean and standard error over the finite block energies.
    pub fn energy(&self) -> Option<(f64, f64)> {
        let blocks: Vec<f64> = self.block_energies.iter().flatten().copied().collect();
        if blocks.is_empty() {
            return None;
        }
        let n = blocks.len() as f64;
        let mean = blocks.iter().sum::<f64>() / n;
        let error = if blocks.len() > 1 {
            let var = blocks.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / (n - 1.0);
            (var / n).sqrt()
        } else {
            0.0
        };
        Some((mean, error))
    }
}

pub struct Afqmc {
    config: Config,
    trial: Trial,
    params: ModelParameters,
    propagator: Propagator,
}

impl Afqmc {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let trial = match config.walkers.walker_type {
            WalkerType::MultiGhf => Trial::free_electron(&config.system).to_ghf(),
            _ => Trial::free_electron(&config.system),
        };
        let params = config.system.model_parameters(config.qmc.dt);
        let propagator = Propagator::new(config.propagator_options(), params.clone(), &config.walker_options())?;
        Ok(Self { config, trial, params, propagator })
    }

    /// Run on one rank. Every rank of `comm` must call this with the same configuration.
    pub fn run<C: Communicator + ?Sized>(&self, comm: &C) -> Result<AfqmcResults> {
        let qmc = &self.config.qmc;
        let mut rng = ChaCha8Rng::seed_from_u64(qmc.seed.wrapping_add(comm.rank() as u64));
        let mut walkers = Walkers::new(
            qmc.nwalkers,
            comm.size(),
            &self.config.walker_options(),
            &self.trial,
            &self.params,
            &self.config.system,
        )?;
        if let Some(prefix) = &self.config.walkers.restart {
            walkers.read_checkpoint(prefix, &self.trial, &self.config.system, comm)?;
            if comm.is_root() {
                log::info!("restarted {} walkers per rank from {}", qmc.nwalkers, prefix.display());
            }
        }
        if comm.is_root() {
            log::info!(
                "AFQMC on {} rank(s): {} walkers, dt = {}, {:?} fields, {:?} walkers",
                comm.size(),
                walkers.ntot_walkers(),
                qmc.dt,
                self.propagator.options().hs_type,
                self.config.walkers.walker_type,
            );
        }

        let results = if self.config.is_thermal() {
            self.run_thermal(&mut walkers, comm, &mut rng)?
        } else {
            self.run_ground_state(&mut walkers, comm, &mut rng)?
        };

        if let Some(prefix) = &self.config.walkers.checkpoint {
            walkers.write_checkpoint(prefix, comm)?;
        }
        Ok(results)
    }

    fn run_ground_state<C: Communicator + ?Sized>(
        &self,
        walkers: &mut Walkers,
        comm: &C,
        rng: &mut ChaCha8Rng,
    ) -> Result<AfqmcResults> {
        let qmc = &self.config.qmc;
        let system = &self.config.system;
        let mut bp = match &self.config.estimators.back_propagation {
            Some(opts) => Some(BackPropagation::new(
                opts.tau_bp,
                qmc.dt,
                qmc.nstblz,
                opts.restore_weights,
                self.params.nbasis,
            )?),
            None => None,
        };
        let mut mixed = MixedEstimator::new();
        let mut results = AfqmcResults { total_weight: walkers.total_weight(), ..Default::default() };

        for step in 1..=qmc.nsteps {
            walkers.propagate_all(step, &self.propagator, &self.trial, system, rng)?;
            if step % qmc.nstblz == 0 {
                walkers.reorthogonalize_all(&self.trial, self.propagator.is_free_projection())?;
            }
            if let Some(bp) = bp.as_mut().filter(|bp| bp.is_due(step)) {
                bp.update(walkers, &self.propagator, &self.trial, system)?;
                if let Some(estimate) = bp.reduce(comm)? {
                    if comm.is_root() {
                        log::debug!("step {step}: back-propagated energy {:.8}", estimate.energy);
                    }
                    results.back_propagated.push(estimate);
                }
            }
            mixed.update(walkers, system);
            if step % qmc.npop_control == 0 {
                walkers.branch(comm, rng, step)?;
            }
            if step % qmc.nmeasure == 0 {
                let energy = mixed.reduce(comm)?;
                self.report(comm, step, energy, walkers);
                results.block_energies.push(energy);
            }
        }
        results.total_weight = walkers.total_weight();
        Ok(results)
    }

    /// Each "step" is a full path of `β / dt` slices, measured at its end.
    fn run_thermal<C: Communicator + ?Sized>(
        &self,
        walkers: &mut Walkers,
        comm: &C,
        rng: &mut ChaCha8Rng,
    ) -> Result<AfqmcResults> {
        let qmc = &self.config.qmc;
        let system = &self.config.system;
        let nslices = self.config.ntime_slices();
        let mut mixed = MixedEstimator::new();
        let mut results = AfqmcResults { total_weight: walkers.total_weight(), ..Default::default() };

        for path in 1..=qmc.nsteps {
            for slice in 1..=nslices {
                let step = (path - 1) * nslices + slice;
                walkers.propagate_all(step, &self.propagator, &self.trial, system, rng)?;
                if slice % qmc.npop_control == 0 {
                    walkers.branch(comm, rng, step)?;
                }
            }
            mixed.update(walkers, system);
            if path % qmc.nmeasure == 0 {
                let energy = mixed.reduce(comm)?;
                self.report(comm, path, energy, walkers);
                results.block_energies.push(energy);
            }
            walkers.reset_thermal(&self.params.bt)?;
        }
        results.total_weight = walkers.total_weight();
        Ok(results)
    }

    fn report<C: Communicator + ?Sized>(&self, comm: &C, step: usize, energy: Option<f64>, walkers: &Walkers) {
        if walkers.alive() < walkers.nwalkers() {
            log::warn!(
                "rank {}: {} of {} walkers dead at step {step}",
                comm.rank(),
                walkers.nwalkers() - walkers.alive(),
                walkers.nwalkers()
            );
        }
        if !comm.is_root() {
            return;
        }
        match energy {
            Some(e) => log::info!("step {step:>6}  E = {e:>14.8}  W = {:.6e}", walkers.total_weight()),
            None => log::warn!("step {step:>6}  no live walkers in block"),
        }
    }
}
