use super::{parse_yaml, read_artifact, IngestorError, LossReport};
use potline_analysis::{model::CONFIG_NAME, Losses};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};

const TEST_METRICS: &str = "test_metrics.yaml";
const TRAIN_METRICS: &str = "train_metrics.yaml";

/// `<dir>/seed/<seed>` where gracemaker writes metrics and the final model,
/// the seed comes from the candidate's model configuration
pub fn seed_directory(directory: &Path) -> Result<PathBuf, IngestorError> {
    let path = directory.join(CONFIG_NAME);
    let config: Mapping = parse_yaml(&path, &read_artifact(&path)?)?;

    let seed = match config.get("seed") {
        Some(Value::Number(seed)) => seed.to_string(),
        Some(Value::String(seed)) => seed.clone(),
        _ => return Err(IngestorError::malformed(&path, "no seed in model configuration")),
    };

    Ok(directory.join("seed").join(seed))
}

/// Reads the last entry of the gracemaker metric logs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GraceIngestor;

impl GraceIngestor {
    fn last_losses(&self, path: &Path) -> Result<Losses, IngestorError> {
        let entries: Vec<Mapping> = parse_yaml(path, &read_artifact(path)?)?;
        let last = entries
            .last()
            .ok_or_else(|| IngestorError::malformed(path, "no metric entries"))?;

        let metric = |key: &str| {
            last.get(key)
                .and_then(Value::as_f64)
                .ok_or_else(|| IngestorError::malformed(path, format!("missing {key}")))
        };

        Ok(Losses::new(metric("rmse/de")?, metric("rmse/f_comp")?))
    }

    pub fn ingest(&self, directory: &Path) -> Result<LossReport, IngestorError> {
        let seed = seed_directory(directory)?;
        let test = seed.join(TEST_METRICS);
        let train = seed.join(TRAIN_METRICS);

        let train_losses = if train.is_file() {
            Some(self.last_losses(&train)?)
        } else {
            None
        };
        let validation = match (test.is_file(), train_losses) {
            (true, _) => self.last_losses(&test)?,
            (false, Some(losses)) => losses,
            (false, None) => return Err(IngestorError::MissingArtifact(test)),
        };

        Ok(LossReport {
            train: train_losses,
            validation,
        })
    }
}
