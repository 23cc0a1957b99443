use crate::AnalysisError;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

/// Name of the model configuration written into every candidate directory
pub const CONFIG_NAME: &str = "model_config.yaml";

/// Interatomic potential frameworks the pipeline knows how to fit
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "pacemaker", alias = "pace")]
    Pace,
    #[serde(rename = "mace")]
    Mace,
    #[serde(rename = "grace")]
    Grace,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Model {0} is not supported")]
pub struct UnknownModel(pub String);

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [ModelKind::Pace, ModelKind::Mace, ModelKind::Grace];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pace => "pacemaker",
            Self::Mace => "mace",
            Self::Grace => "grace",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = UnknownModel;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "pacemaker" | "pace" => Ok(Self::Pace),
            "mace" => Ok(Self::Mace),
            "grace" => Ok(Self::Grace),
            _ => Err(UnknownModel(value.to_owned())),
        }
    }
}

/// Handle to a model living in its own candidate directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelReference {
    kind: ModelKind,
    directory: PathBuf,
}

impl ModelReference {
    pub fn new(kind: ModelKind, directory: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            directory: directory.into(),
        }
    }

    /// re-resolve a reference for an already existing candidate directory
    pub fn resolve(kind: ModelKind, directory: &Path) -> Result<Self, AnalysisError> {
        if directory.is_dir() {
            Ok(Self::new(kind, directory))
        } else {
            Err(AnalysisError::MissingCandidate(directory.to_path_buf()))
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn config_path(&self) -> PathBuf {
        self.directory.join(CONFIG_NAME)
    }
}
