//! YAML run configuration.
//!
//! ```yaml
//! system:
//!   nx: 4
//!   ny: 4
//!   t: 1.0
//!   u: 4.0
//!   nup: 7
//!   ndown: 7
//! qmc:
//!   dt: 0.05
//!   nsteps: 200
//!   nwalkers: 20
//! propagator:
//!   hs_type: continuous
//! estimators:
//!   back_propagation:
//!     tau_bp: 1.0
//!     restore_weights: phase
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AfqmcError, Result};
use crate::estimators::RestoreWeights;
use crate::propagation::{PropagatorOptions, Reweighting};
use crate::systems::{HsType, Hubbard};
use crate::walkers::{WalkerOptions, WalkerType};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub system: Hubbard,
    pub qmc: QmcOptions,
    pub propagator: PropagatorConfig,
    pub walkers: WalkerConfig,
    pub estimators: EstimatorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system: Hubbard::new(4, 4, 1.0, 4.0, 7, 7),
            qmc: QmcOptions::default(),
            propagator: PropagatorConfig::default(),
            walkers: WalkerConfig::default(),
            estimators: EstimatorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QmcOptions {
    pub dt: f64,
    pub nsteps: usize,
    /// Walkers per rank.
    pub nwalkers: usize,
    /// Steps between reorthogonalisations (thermal: slices between stable rebuilds).
    pub nstblz: usize,
    /// Steps between comb passes.
    pub npop_control: usize,
    /// Steps between reported energy blocks.
    pub nmeasure: usize,
    pub seed: u64,
    /// Inverse temperature; set for finite-temperature runs.
    pub beta: Option<f64>,
}

impl Default for QmcOptions {
    fn default() -> Self {
        Self {
            dt: 0.05,
            nsteps: 100,
            nwalkers: 10,
            nstblz: 5,
            npop_control: 5,
            nmeasure: 10,
            seed: 7,
            beta: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagatorConfig {
    pub hs_type: HsType,
    pub reweighting: Reweighting,
    pub energy_shift: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkerConfig {
    pub walker_type: WalkerType,
    /// Thermal walkers: time slices per stack bin.
    pub stack_size: usize,
    /// Prefix of per-rank checkpoint files written at the end of the run.
    pub checkpoint: Option<PathBuf>,
    /// Prefix of per-rank checkpoint files to start from.
    pub restart: Option<PathBuf>,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            walker_type: WalkerType::SingleDet,
            stack_size: 1,
            checkpoint: None,
            restart: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub back_propagation: Option<BackPropagationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackPropagationConfig {
    pub tau_bp: f64,
    #[serde(default)]
    pub restore_weights: RestoreWeights,
}

impl Config {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let q = &self.qmc;
        if !(q.dt > 0.0) {
            return Err(AfqmcError::Config(format!("dt must be positive, got {}", q.dt)));
        }
        if q.nwalkers == 0 || q.nstblz == 0 || q.npop_control == 0 || q.nmeasure == 0 {
            return Err(AfqmcError::Config(
                "nwalkers, nstblz, npop_control and nmeasure must be positive".to_string(),
            ));
        }
        let n = self.system.nbasis();
        if self.system.nup > n || self.system.ndown > n {
            return Err(AfqmcError::Config(format!(
                "{} up and {} down electrons do not fit in {n} sites",
                self.system.nup, self.system.ndown
            )));
        }
        match (self.walkers.walker_type, q.beta) {
            (WalkerType::Thermal, None) => {
                return Err(AfqmcError::Config("thermal walkers need beta".to_string()));
            }
            (WalkerType::Thermal, Some(_)) => {
                let slices = self.ntime_slices();
                if slices == 0 || self.walkers.stack_size == 0 || slices % self.walkers.stack_size != 0 {
                    return Err(AfqmcError::Config(format!(
                        "stack size {} must divide the {slices} time slices",
                        self.walkers.stack_size
                    )));
                }
                if q.nstblz % self.walkers.stack_size != 0 {
                    return Err(AfqmcError::Config(format!(
                        "nstblz {} must be a multiple of the stack size {}",
                        q.nstblz, self.walkers.stack_size
                    )));
                }
                if self.estimators.back_propagation.is_some() {
                    return Err(AfqmcError::Unsupported("back-propagation of thermal walkers"));
                }
                if self.walkers.checkpoint.is_some() || self.walkers.restart.is_some() {
                    return Err(AfqmcError::Unsupported("checkpointing thermal walkers"));
                }
            }
            (_, Some(_)) => {
                return Err(AfqmcError::Config("beta is only used by thermal walkers".to_string()));
            }
            (_, None) => {}
        }
        Ok(())
    }

    pub fn is_thermal(&self) -> bool {
        self.walkers.walker_type == WalkerType::Thermal
    }

    /// `β / dt`, zero for ground-state runs.
    pub fn ntime_slices(&self) -> usize {
        self.qmc.beta.map_or(0, |beta| (beta / self.qmc.dt).round() as usize)
    }

    /// Steps per back-propagation window, one when back-propagation is off.
    pub fn nbp(&self) -> usize {
        self.estimators
            .back_propagation
            .as_ref()
            .map_or(1, |bp| ((bp.tau_bp / self.qmc.dt).round() as usize).max(1))
    }

    pub fn walker_options(&self) -> WalkerOptions {
        let nbp = self.nbp();
        WalkerOptions::default()
            .with_type(self.walkers.walker_type)
            .with_history(nbp, nbp)
            .with_stack(self.walkers.stack_size, self.ntime_slices().max(1))
    }

    pub fn propagator_options(&self) -> PropagatorOptions {
        PropagatorOptions::default()
            .with_hs_type(self.propagator.hs_type)
            .with_reweighting(self.propagator.reweighting)
            .with_energy_shift(self.propagator.energy_shift)
            .with_nstblz(self.qmc.nstblz)
    }
}
