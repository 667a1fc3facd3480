//! Propagation module - imaginary-time steps applied to single walkers.
//!
//! A zero-temperature step is
//! `one-body half step → two-body field sampling → one-body half step → reweight`.
//! Finite-temperature walkers instead advance one time slice of their path.

mod kinetic;
mod discrete;
mod continuous;
mod thermal;

pub use discrete::DiscreteHs;
pub use continuous::ContinuousHs;
pub use thermal::ThermalDiscrete;

use num_complex::Complex64;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{AfqmcError, Result};
use crate::linalg::OVERLAP_FLOOR;
use crate::systems::{EnergyEvaluator, HsType, ModelParameters};
use crate::walkers::{Walker, WalkerOptions, WalkerType};
use crate::wavefunction::Trial;

/// How overlap ratios are folded into a walker's weight and phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Reweighting {
    /// Keep `max(0, Re r)`; the phase is dropped and weights stay real.
    #[default]
    Phaseless,
    /// Keep `|r|` in the weight and `r / |r|` in the phase.
    FreeProjection,
}

impl Reweighting {
    /// Fold an overlap ratio into the walker, killing it when the ratio is
    /// unusable under this strategy.
    pub fn fold(&self, walker: &mut Walker, ratio: Complex64) {
        if !ratio.is_finite() {
            walker.kill();
            return;
        }
        match self {
            Reweighting::Phaseless => {
                if ratio.re > OVERLAP_FLOOR {
                    walker.weight *= ratio.re;
                } else {
                    walker.kill();
                }
            }
            Reweighting::FreeProjection => {
                let mag = ratio.norm();
                if mag > OVERLAP_FLOOR {
                    walker.weight *= mag;
                    walker.phase *= ratio / mag;
                } else {
                    walker.kill();
                }
            }
        }
    }

    /// Branch probability of a candidate field from its (halved) overlap ratio.
    pub(crate) fn probability(&self, p: Complex64) -> f64 {
        match self {
            Reweighting::Phaseless => p.re.max(0.0),
            Reweighting::FreeProjection => p.norm(),
        }
    }
}

/// Propagator settings independent of the model.
#[derive(Copy, Clone, Debug)]
pub struct PropagatorOptions {
    pub hs_type: HsType,
    pub reweighting: Reweighting,
    /// Energy shift of the continuous scheme's importance factor.
    pub energy_shift: f64,
    /// Time slices between stable Green's function rebuilds of thermal walkers.
    pub nstblz: usize,
}

impl Default for PropagatorOptions {
    fn default() -> Self {
        Self {
            hs_type: HsType::Discrete,
            reweighting: Reweighting::Phaseless,
            energy_shift: 0.0,
            nstblz: 10,
        }
    }
}

impl PropagatorOptions {
    pub fn with_hs_type(mut self, hs_type: HsType) -> Self {
        self.hs_type = hs_type;
        self
    }

    pub fn with_reweighting(mut self, reweighting: Reweighting) -> Self {
        self.reweighting = reweighting;
        self
    }

    pub fn with_energy_shift(mut self, energy_shift: f64) -> Self {
        self.energy_shift = energy_shift;
        self
    }

    pub fn with_nstblz(mut self, nstblz: usize) -> Self {
        self.nstblz = nstblz;
        self
    }
}

#[derive(Clone, Debug)]
enum Scheme {
    Discrete(DiscreteHs),
    Continuous(ContinuousHs),
    Thermal(ThermalDiscrete),
}

/// Propagator bound to one model and time step.
#[derive(Clone, Debug)]
pub struct Propagator {
    params: ModelParameters,
    options: PropagatorOptions,
    scheme: Scheme,
}

impl Propagator {
    pub fn new(options: PropagatorOptions, params: ModelParameters, walkers: &WalkerOptions) -> Result<Self> {
        let scheme = match (walkers.walker_type, options.hs_type) {
            (WalkerType::Thermal, HsType::Discrete) => {
                if options.nstblz == 0 || options.nstblz % walkers.stack_size != 0 {
                    return Err(AfqmcError::Config(format!(
                        "nstblz {} must be a multiple of the stack size {}",
                        options.nstblz, walkers.stack_size
                    )));
                }
                if options.reweighting != Reweighting::Phaseless {
                    return Err(AfqmcError::Unsupported("free projection of thermal walkers"));
                }
                Scheme::Thermal(ThermalDiscrete::new(options.nstblz))
            }
            (WalkerType::Thermal, HsType::Continuous) => {
                return Err(AfqmcError::Unsupported("continuous fields for thermal walkers"));
            }
            (_, HsType::Discrete) => Scheme::Discrete(DiscreteHs::new(options.reweighting)),
            (_, HsType::Continuous) => {
                Scheme::Continuous(ContinuousHs::new(options.reweighting, options.energy_shift))
            }
        };
        Ok(Self { params, options, scheme })
    }

    pub fn params(&self) -> &ModelParameters {
        &self.params
    }

    pub fn options(&self) -> &PropagatorOptions {
        &self.options
    }

    pub fn is_free_projection(&self) -> bool {
        self.options.reweighting == Reweighting::FreeProjection
    }

    /// Advance one walker by one step (zero temperature) or one time slice
    /// (finite temperature). Dead walkers only pad their field history.
    pub fn propagate_walker<R: Rng + ?Sized>(
        &self,
        walker: &mut Walker,
        trial: &Trial,
        evaluator: &dyn EnergyEvaluator,
        rng: &mut R,
    ) -> Result<()> {
        match &self.scheme {
            Scheme::Thermal(t) => t.propagate_walker(walker, &self.params, trial, rng),
            Scheme::Discrete(d) => {
                if !walker.is_alive() {
                    walker.record_step(&[], 0.0, Complex64::new(1.0, 0.0));
                    return Ok(());
                }
                kinetic::half_step(walker, &self.params, trial, self.options.reweighting)?;
                d.two_body_step(walker, &self.params, trial, rng)?;
                kinetic::half_step(walker, &self.params, trial, self.options.reweighting)?;
                Ok(())
            }
            Scheme::Continuous(c) => c.propagate_walker(walker, &self.params, trial, evaluator, rng),
        }
    }

    /// Per-spin `δ` of a field value stored in a walker's history.
    pub fn field_deltas(&self, value: Complex64) -> [Complex64; 2] {
        match self.scheme {
            Scheme::Continuous(_) => self.params.continuous_deltas(value.re),
            _ => self.params.discrete_deltas(if value.re > 0.5 { 1 } else { 0 }),
        }
    }
}

/// Apply a field update, turning numerical degeneracy into walker death.
/// Returns `None` when the walker died.
pub(crate) fn update_or_kill(
    walker: &mut Walker,
    site: usize,
    deltas: [Complex64; 2],
    trial: &Trial,
) -> Result<Option<Complex64>> {
    match walker.apply_field_update(site, deltas, trial) {
        Ok(ratio) => Ok(Some(ratio)),
        Err(e) if e.is_walker_death() => {
            log::trace!("walker died in field update at site {site}: {e}");
            walker.kill();
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systems::Hubbard;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn setup(walker_type: WalkerType, hs_type: HsType) -> (Hubbard, Trial, Propagator, Walker) {
        let system = Hubbard::new(4, 2, 1.0, 4.0, 3, 3);
        let trial = Trial::free_electron(&system);
        let params = system.model_parameters(0.05);
        let wopts = WalkerOptions::default().with_type(walker_type).with_history(4, 4);
        let propagator = Propagator::new(PropagatorOptions::default().with_hs_type(hs_type), params.clone(), &wopts)
            .unwrap();
        let walker = Walker::new(&wopts, &trial, &params, &system).unwrap();
        (system, trial, propagator, walker)
    }

    #[test]
    fn test_phaseless_fold_kills_negative_ratio() {
        let (_, _, _, mut walker) = setup(WalkerType::SingleDet, HsType::Discrete);
        Reweighting::Phaseless.fold(&mut walker, Complex64::new(0.5, 0.2));
        assert_eq!(walker.weight, 0.5);
        Reweighting::Phaseless.fold(&mut walker, Complex64::new(-0.1, 0.0));
        assert_eq!(walker.weight, 0.0);
    }

    #[test]
    fn test_free_projection_fold_keeps_phase() {
        let (_, _, _, mut walker) = setup(WalkerType::SingleDet, HsType::Discrete);
        Reweighting::FreeProjection.fold(&mut walker, Complex64::new(0.0, -2.0));
        assert_eq!(walker.weight, 2.0);
        assert!((walker.phase - Complex64::new(0.0, -1.0)).norm() < 1e-15);
    }

    #[test]
    fn test_dead_walker_only_pads_history() {
        let (system, trial, propagator, mut walker) = setup(WalkerType::SingleDet, HsType::Continuous);
        walker.kill();
        let phi = walker.wavefunction().to_vec();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        propagator.propagate_walker(&mut walker, &trial, &system, &mut rng).unwrap();
        assert_eq!(walker.weight, 0.0);
        assert_eq!(walker.field_configs.step(), 1);
        assert_eq!(walker.wavefunction()[0], phi[0]);
    }

    #[test]
    fn test_thermal_requires_compatible_stabilisation() {
        let system = Hubbard::new(4, 1, 1.0, 4.0, 2, 2);
        let params = system.model_parameters(0.05);
        let wopts = WalkerOptions::default().with_type(WalkerType::Thermal).with_stack(4, 40);
        let opts = PropagatorOptions::default().with_nstblz(10);
        assert!(matches!(Propagator::new(opts, params, &wopts), Err(AfqmcError::Config(_))));
    }

    #[test]
    fn test_field_deltas_decode_history() {
        let (_, _, propagator, _) = setup(WalkerType::SingleDet, HsType::Discrete);
        let params = propagator.params();
        assert_eq!(propagator.field_deltas(Complex64::new(1.0, 0.0)), params.discrete_deltas(1));
        assert_eq!(propagator.field_deltas(Complex64::new(0.0, 0.0)), params.discrete_deltas(0));
    }
}
