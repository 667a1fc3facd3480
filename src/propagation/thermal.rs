//! Discrete-field propagator for finite-temperature walkers.
//!
//! One call advances the imaginary-time path by a single slice: sample a field
//! per site from the equal-time Green's function, push the resulting slice
//! propagator onto the walker's stack, stabilise every `nstblz` slices and wrap
//! `G` forward to the next slice.

use nalgebra::DMatrix;
use rand::Rng;

use crate::error::{AfqmcError, Result};
use crate::linalg::{to_complex, CMatrix, OVERLAP_FLOOR};
use crate::propagation::{update_or_kill, Reweighting};
use crate::systems::ModelParameters;
use crate::walkers::Walker;
use crate::wavefunction::Trial;

#[derive(Clone, Debug)]
pub struct ThermalDiscrete {
    nstblz: usize,
}

impl ThermalDiscrete {
    pub fn new(nstblz: usize) -> Self {
        Self { nstblz }
    }

    pub fn propagate_walker<R: Rng + ?Sized>(
        &self,
        walker: &mut Walker,
        params: &ModelParameters,
        trial: &Trial,
        rng: &mut R,
    ) -> Result<()> {
        if !walker.is_thermal() {
            return Err(AfqmcError::Unsupported("thermal propagation of a zero-temperature walker"));
        }
        if !walker.is_alive() {
            return Ok(());
        }
        let n = params.nbasis;
        let mut bv = [vec![1.0; n], vec![1.0; n]];
        for site in 0..n {
            let r: f64 = rng.gen();
            let deltas = [params.discrete_deltas(0), params.discrete_deltas(1)];
            let probs = [
                Reweighting::Phaseless.probability(walker.field_ratio(site, deltas[0]) * 0.5),
                Reweighting::Phaseless.probability(walker.field_ratio(site, deltas[1]) * 0.5),
            ];
            let norm = probs[0] + probs[1];
            if !norm.is_finite() || norm <= OVERLAP_FLOOR {
                log::trace!("thermal walker died at site {site}");
                walker.kill();
                return Ok(());
            }
            walker.weight *= norm;
            let xi = if r < probs[0] / norm { 0 } else { 1 };
            if update_or_kill(walker, site, deltas[xi], trial)?.is_none() {
                return Ok(());
            }
            bv[0][site] = params.auxf[xi][0];
            bv[1][site] = params.auxf[xi][1];
        }
        let slices = [slice_propagator(&params.bt, &bv[0]), slice_propagator(&params.bt, &bv[1])];
        let thermal = walker
            .thermal_mut()
            .ok_or(AfqmcError::Unsupported("thermal propagation of a zero-temperature walker"))?;
        thermal.stack.update(&slices);
        let time_slice = thermal.stack.time_slice;
        if time_slice % self.nstblz == 0 {
            if let Err(e) = thermal.recompute_greens_function(time_slice - 1) {
                if e.is_walker_death() {
                    walker.kill();
                    return Ok(());
                }
                return Err(e);
            }
        }
        if time_slice < thermal.stack.ntime_slices {
            thermal.wrap(&params.bt, &params.bt_inv);
        }
        Ok(())
    }
}

/// `diag(bv) · bt`
fn slice_propagator(bt: &CMatrix, bv: &[f64]) -> CMatrix {
    to_complex(&DMatrix::from_diagonal(&nalgebra::DVector::from_column_slice(bv))) * bt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systems::Hubbard;
    use crate::walkers::{WalkerOptions, WalkerType};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_slice_propagator_scales_rows() {
        let bt = CMatrix::from_element(2, 2, num_complex::Complex64::new(1.0, 0.0));
        let b = slice_propagator(&bt, &[2.0, 0.5]);
        assert_eq!(b[(0, 1)].re, 2.0);
        assert_eq!(b[(1, 0)].re, 0.5);
    }

    #[test]
    fn test_full_path_advances_stack() {
        let system = Hubbard::new(4, 1, 1.0, 4.0, 2, 2).with_mu(1.0);
        let params = system.model_parameters(0.1);
        let trial = Trial::free_electron(&system);
        let opts = WalkerOptions::default().with_type(WalkerType::Thermal).with_stack(2, 10);
        let mut walker = Walker::new(&opts, &trial, &params, &system).unwrap();
        let propagator = ThermalDiscrete::new(2);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..10 {
            propagator.propagate_walker(&mut walker, &params, &trial, &mut rng).unwrap();
        }
        assert!(walker.is_alive());
        let thermal = walker.thermal_mut().unwrap();
        assert_eq!(thermal.stack.time_slice, 10);
        for p in thermal.density_matrix() {
            let trace = p.trace().re;
            assert!(trace > 0.0 && trace < 4.0);
        }
    }

    #[test]
    fn test_zero_temperature_walker_rejected() {
        let system = Hubbard::new(4, 1, 1.0, 4.0, 2, 2);
        let params = system.model_parameters(0.1);
        let trial = Trial::free_electron(&system);
        let mut walker = Walker::new(&WalkerOptions::default(), &trial, &params, &system).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let err = ThermalDiscrete::new(2).propagate_walker(&mut walker, &params, &trial, &mut rng);
        assert!(matches!(err, Err(AfqmcError::Unsupported(_))));
    }
}
