//! IO module - run configuration and walker checkpoints.

mod config;
mod checkpoint;

pub use config::{
    BackPropagationConfig, Config, EstimatorConfig, PropagatorConfig, QmcOptions, WalkerConfig,
};
pub use checkpoint::{checkpoint_path, read_checkpoint, write_checkpoint, CheckpointFile};
