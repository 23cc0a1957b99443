//! Result side of the potential fitting pipeline: candidate bookkeeping,
//! persisted records, result tables and selection of the best candidates.

pub mod discovery;
pub mod model;
pub mod selector;
pub mod tables;
pub mod tracker;

pub use model::{ModelKind, ModelReference, UnknownModel};
pub use selector::filter_best_loss;
pub use tables::LossLogger;
pub use tracker::{CandidateId, Losses, ModelTracker, ParameterMap};

use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Losses were not computed for candidate {0}")]
    LossNotComputed(CandidateId),
    #[error("Candidate directory {0:?} does not exist")]
    MissingCandidate(PathBuf),
    #[error("Record {path:?} belongs to model {found}, expected {expected}")]
    ModelMismatch {
        path: PathBuf,
        expected: ModelKind,
        found: ModelKind,
    },
    #[error("Failed to access {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read or write record {path:?}")]
    Record {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Failed to access result table")]
    Table(#[from] csv::Error),
    #[error("Invalid discovery pattern")]
    Pattern(#[from] globset::Error),
    #[error("No candidates found below {0:?}")]
    NoCandidates(PathBuf),
    #[error("Parameter table was created without parameter keys")]
    NoParameterKeys,
}

impl AnalysisError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}
