//! Per-rank walker checkpoint files.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Checkpoint records of the walkers owned by one rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub rank: usize,
    pub nwalkers: usize,
    /// `[weight, phase, overlap, φ row-major]` per walker.
    pub records: Vec<Vec<Complex64>>,
}

/// `<prefix>.rank<r>.yaml`
pub fn checkpoint_path(prefix: &Path, rank: usize) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!(".rank{rank}.yaml"));
    PathBuf::from(name)
}

pub fn write_checkpoint(path: &Path, checkpoint: &CheckpointFile) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_yaml::to_writer(writer, checkpoint)?;
    Ok(())
}

pub fn read_checkpoint(path: &Path) -> Result<CheckpointFile> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_yaml::from_reader(reader)?)
}
