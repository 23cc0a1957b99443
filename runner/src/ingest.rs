//! Readers for the loss artifacts every fitting framework leaves in its
//! candidate directory.

pub mod grace;
pub mod mace;
pub mod pace;

use potline_analysis::{Losses, ModelKind};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum IngestorError {
    #[error("Expected fit artifact {0:?} does not exist")]
    MissingArtifact(PathBuf),
    #[error("Failed to read {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to deserialize {path:?}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Malformed artifact {path:?}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

impl IngestorError {
    fn malformed(path: &Path, reason: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Losses found in one candidate directory
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LossReport {
    pub train: Option<Losses>,
    pub validation: Losses,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ingestors {
    Mace(mace::MaceIngestor),
    Grace(grace::GraceIngestor),
    Pace(pace::PaceIngestor),
}

impl Ingestors {
    pub fn for_model(kind: ModelKind) -> Self {
        match kind {
            ModelKind::Mace => Self::Mace(mace::MaceIngestor),
            ModelKind::Grace => Self::Grace(grace::GraceIngestor),
            ModelKind::Pace => Self::Pace(pace::PaceIngestor),
        }
    }

    #[tracing::instrument(level = "debug")]
    pub fn ingest(&self, directory: &Path) -> Result<LossReport, IngestorError> {
        let report = match self {
            Self::Mace(ingestor) => ingestor.ingest(directory),
            Self::Grace(ingestor) => ingestor.ingest(directory),
            Self::Pace(ingestor) => ingestor.ingest(directory),
        };

        match &report {
            Ok(report) => debug!(validation = ?report.validation, train = ?report.train, "Ingested losses"),
            Err(e) => error!(error = %e, "Failed to ingest losses"),
        }

        report
    }
}

/// Read an artifact, a missing file is a missing artifact
fn read_artifact(path: &Path) -> Result<String, IngestorError> {
    fs::read_to_string(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => IngestorError::MissingArtifact(path.to_path_buf()),
        _ => IngestorError::Io {
            path: path.to_path_buf(),
            source,
        },
    })
}

fn parse_yaml<T: serde::de::DeserializeOwned>(
    path: &Path,
    content: &str,
) -> Result<T, IngestorError> {
    serde_yaml::from_str(content).map_err(|source| IngestorError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_are_missing_artifacts() {
        let dir = tempfile::tempdir().unwrap();

        for kind in ModelKind::ALL {
            let result = Ingestors::for_model(kind).ingest(dir.path());
            assert!(
                matches!(result, Err(IngestorError::MissingArtifact(_))),
                "{kind} returned {result:?}"
            );
        }
    }
}
