//! Job dispatch and pipeline orchestration for fitting interatomic potentials.
//!
//! Stages are run either on the local shell or through a SLURM cluster,
//! selected by the `general.cluster` configuration value.

pub mod config;
pub mod descriptor;
pub mod dispatchers;
pub mod ingest;
pub mod manager;
pub mod models;
pub mod pipeline;
pub mod search;
pub mod sync;
pub mod template;
