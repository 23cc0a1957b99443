use crate::{model::ModelReference, AnalysisError, ModelKind};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Name of the per-candidate record
pub const RECORD_NAME: &str = "potline_info.yaml";

/// Hyperparameter name (dotted path into the model config) -> value
pub type ParameterMap = BTreeMap<String, serde_yaml::Value>;

/// Energy and force errors of a fitted model
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Losses {
    pub energy: f64,
    pub force: f64,
}

impl Losses {
    pub fn new(energy: f64, force: f64) -> Self {
        Self { energy, force }
    }

    /// Scalar loss `w * energy + (1 - w) * force`.
    ///
    /// Energy and force errors live on different scales, the weight is what
    /// makes them comparable and is supplied by the caller at selection time.
    pub fn weighted(&self, energy_weight: f64) -> f64 {
        energy_weight * self.energy + (1.0 - energy_weight) * self.force
    }
}

/// Position of a candidate in the search: iteration and index inside it
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CandidateId {
    pub iteration: u32,
    pub subiteration: u32,
}

impl CandidateId {
    pub fn new(iteration: u32, subiteration: u32) -> Self {
        Self {
            iteration,
            subiteration,
        }
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.iteration, self.subiteration)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
struct InfoRecord {
    model: ModelKind,
    iteration: u32,
    subiteration: u32,
    #[serde(default)]
    train_energy_error: Option<f64>,
    #[serde(default)]
    train_force_error: Option<f64>,
    #[serde(default)]
    energy_error: Option<f64>,
    #[serde(default)]
    force_error: Option<f64>,
    #[serde(default)]
    parameters: ParameterMap,
}

fn pair(energy: Option<f64>, force: Option<f64>) -> Option<Losses> {
    energy.zip(force).map(|(energy, force)| Losses::new(energy, force))
}

/// Bookkeeping for a single candidate model.
///
/// Trackers never share state, each one owns its directory and record.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelTracker {
    model: ModelReference,
    id: CandidateId,
    parameters: ParameterMap,
    train_losses: Option<Losses>,
    validation_losses: Option<Losses>,
}

impl ModelTracker {
    pub fn new(model: ModelReference, id: CandidateId, parameters: ParameterMap) -> Self {
        Self {
            model,
            id,
            parameters,
            train_losses: None,
            validation_losses: None,
        }
    }

    /// Rebuild a tracker from the record stored in `directory`
    pub fn from_path(kind: ModelKind, directory: &Path) -> Result<Self, AnalysisError> {
        let model = ModelReference::resolve(kind, directory)?;
        let path = directory.join(RECORD_NAME);
        let file = File::open(&path).map_err(AnalysisError::io(&path))?;
        let record: InfoRecord =
            serde_yaml::from_reader(file).map_err(|source| AnalysisError::Record {
                path: path.clone(),
                source,
            })?;

        if record.model != kind {
            return Err(AnalysisError::ModelMismatch {
                path,
                expected: kind,
                found: record.model,
            });
        }

        debug!(path = ?path, "Loaded candidate record");

        Ok(Self {
            model,
            id: CandidateId::new(record.iteration, record.subiteration),
            parameters: record.parameters,
            train_losses: pair(record.train_energy_error, record.train_force_error),
            validation_losses: pair(record.energy_error, record.force_error),
        })
    }

    /// Persist the record into the candidate directory, replacing an older one
    pub fn save(&self) -> Result<PathBuf, AnalysisError> {
        let record = InfoRecord {
            model: self.model.kind(),
            iteration: self.id.iteration,
            subiteration: self.id.subiteration,
            train_energy_error: self.train_losses.map(|losses| losses.energy),
            train_force_error: self.train_losses.map(|losses| losses.force),
            energy_error: self.validation_losses.map(|losses| losses.energy),
            force_error: self.validation_losses.map(|losses| losses.force),
            parameters: self.parameters.clone(),
        };
        let path = self.record_path();
        let file = File::create(&path).map_err(AnalysisError::io(&path))?;

        serde_yaml::to_writer(file, &record).map_err(|source| AnalysisError::Record {
            path: path.clone(),
            source,
        })?;

        Ok(path)
    }

    pub fn attach_losses(&mut self, validation: Losses, train: Option<Losses>) {
        self.validation_losses = Some(validation);
        self.train_losses = train;
    }

    /// Tracker for the same candidate continuing in another directory,
    /// losses are dropped since they belong to the old model state
    pub fn moved_to(&self, directory: impl Into<PathBuf>) -> Self {
        Self::new(
            ModelReference::new(self.model.kind(), directory),
            self.id,
            self.parameters.clone(),
        )
    }

    pub fn total_validation_loss(&self, energy_weight: f64) -> Result<f64, AnalysisError> {
        self.validation_losses
            .map(|losses| losses.weighted(energy_weight))
            .ok_or(AnalysisError::LossNotComputed(self.id))
    }

    pub fn record_path(&self) -> PathBuf {
        self.model.directory().join(RECORD_NAME)
    }

    pub fn model(&self) -> &ModelReference {
        &self.model
    }

    pub fn id(&self) -> CandidateId {
        self.id
    }

    pub fn parameters(&self) -> &ParameterMap {
        &self.parameters
    }

    pub fn train_losses(&self) -> Option<Losses> {
        self.train_losses
    }

    pub fn validation_losses(&self) -> Option<Losses> {
        self.validation_losses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(directory: &Path) -> ModelTracker {
        let mut parameters = ParameterMap::new();
        parameters.insert("r_max".to_owned(), serde_yaml::Value::from(5.0));
        parameters.insert("num_channels".to_owned(), serde_yaml::Value::from(64));

        ModelTracker::new(
            ModelReference::new(ModelKind::Mace, directory),
            CandidateId::new(2, 3),
            parameters,
        )
    }

    #[test]
    fn weighted_loss() {
        let losses = Losses::new(0.1, 0.2);
        assert!((losses.weighted(0.8) - 0.12).abs() < 1e-12);
        assert_eq!(losses.weighted(1.0), 0.1);
        assert_eq!(losses.weighted(0.0), 0.2);
    }

    #[test]
    fn record_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut original = tracker(dir.path());
        original.save().unwrap();

        let reloaded = ModelTracker::from_path(ModelKind::Mace, dir.path()).unwrap();
        assert_eq!(reloaded, original);
        assert!(reloaded.validation_losses().is_none());

        original.attach_losses(Losses::new(0.01, 0.05), Some(Losses::new(0.005, 0.04)));
        original.save().unwrap();

        let reloaded = ModelTracker::from_path(ModelKind::Mace, dir.path()).unwrap();
        assert_eq!(reloaded.validation_losses(), Some(Losses::new(0.01, 0.05)));
        assert_eq!(reloaded.train_losses(), Some(Losses::new(0.005, 0.04)));
        assert_eq!(reloaded.id(), CandidateId::new(2, 3));
    }

    #[test]
    fn reload_checks_model_kind() {
        let dir = tempfile::tempdir().unwrap();
        tracker(dir.path()).save().unwrap();

        assert!(matches!(
            ModelTracker::from_path(ModelKind::Grace, dir.path()),
            Err(AnalysisError::ModelMismatch { .. })
        ));
    }

    #[test]
    fn missing_losses_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());

        assert!(matches!(
            tracker.total_validation_loss(0.5),
            Err(AnalysisError::LossNotComputed(id)) if id == CandidateId::new(2, 3)
        ));
    }

    #[test]
    fn moving_drops_losses() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = tracker(dir.path());
        tracker.attach_losses(Losses::new(0.1, 0.1), None);

        let moved = tracker.moved_to(dir.path().join("deep"));
        assert_eq!(moved.id(), tracker.id());
        assert_eq!(moved.parameters(), tracker.parameters());
        assert!(moved.validation_losses().is_none());
        assert_eq!(moved.model().directory(), dir.path().join("deep"));
    }
}
