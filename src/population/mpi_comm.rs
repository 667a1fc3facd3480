//! MPI-backed communicator, built with the `mpi` feature.

use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use num_complex::Complex64;

use crate::error::{AfqmcError, Result};
use crate::population::Communicator;

/// Thin wrapper over an MPI world communicator.
pub struct MpiComm {
    world: SimpleCommunicator,
}

impl MpiComm {
    pub fn new(world: SimpleCommunicator) -> Self {
        Self { world }
    }

    fn tag(&self, tag: usize) -> Result<i32> {
        i32::try_from(tag).map_err(|_| AfqmcError::CommunicationFailure {
            rank: self.rank(),
            message: format!("tag {tag} out of MPI range"),
        })
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn gather(&self, local: &[f64]) -> Result<Option<Vec<f64>>> {
        let root = self.world.process_at_rank(0);
        if self.is_root() {
            let mut all = vec![0.0; local.len() * self.size()];
            root.gather_into_root(local, &mut all[..]);
            Ok(Some(all))
        } else {
            root.gather_into(local);
            Ok(None)
        }
    }

    fn broadcast_f64(&self, values: &mut [f64]) -> Result<()> {
        self.world.process_at_rank(0).broadcast_into(values);
        Ok(())
    }

    fn broadcast_usize(&self, values: &mut [usize]) -> Result<()> {
        let mut wide: Vec<u64> = values.iter().map(|&v| v as u64).collect();
        self.world.process_at_rank(0).broadcast_into(&mut wide[..]);
        values.iter_mut().zip(wide).for_each(|(v, w)| *v = w as usize);
        Ok(())
    }

    fn send(&self, dest: usize, tag: usize, buf: Vec<Complex64>) -> Result<()> {
        let flat: Vec<f64> = buf.iter().flat_map(|z| [z.re, z.im]).collect();
        let tag = self.tag(tag)?;
        self.world.process_at_rank(dest as i32).send_with_tag(&flat[..], tag);
        Ok(())
    }

    fn receive(&self, source: usize, tag: usize) -> Result<Vec<Complex64>> {
        let tag = self.tag(tag)?;
        let (flat, _status) = self.world.process_at_rank(source as i32).receive_vec_with_tag::<f64>(tag);
        if flat.len() % 2 != 0 {
            return Err(AfqmcError::CommunicationFailure {
                rank: self.rank(),
                message: format!("odd-length walker buffer from rank {source}"),
            });
        }
        Ok(flat.chunks(2).map(|c| Complex64::new(c[0], c[1])).collect())
    }

    fn barrier(&self) -> Result<()> {
        self.world.barrier();
        Ok(())
    }
}
