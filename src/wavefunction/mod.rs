//! Wavefunction module - trial determinants guiding the walkers.

mod trial;

pub use trial::{Trial, TrialKind};
