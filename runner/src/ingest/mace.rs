use super::{parse_yaml, read_artifact, IngestorError, LossReport};
use potline_analysis::Losses;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

const RESULTS_DIR: &str = "results";
const EVAL_MARKER: &str = r#""mode": "eval""#;

#[derive(Deserialize)]
struct EvalLine {
    rmse_e: Option<f64>,
    rmse_f: Option<f64>,
}

/// Reads the last evaluation line of the mace training log
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaceIngestor;

impl MaceIngestor {
    fn results_file(&self, directory: &Path) -> Result<PathBuf, IngestorError> {
        let results = directory.join(RESULTS_DIR);
        let entries = fs::read_dir(&results)
            .map_err(|_| IngestorError::MissingArtifact(results.clone()))?;

        let mut logs = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().map_or(false, |ext| ext == "txt"))
            .collect::<Vec<_>>();
        logs.sort();

        logs.into_iter()
            .next()
            .ok_or_else(|| IngestorError::MissingArtifact(results.join("*.txt")))
    }

    pub fn ingest(&self, directory: &Path) -> Result<LossReport, IngestorError> {
        let path = self.results_file(directory)?;
        let content = read_artifact(&path)?;

        let last_eval = content
            .lines()
            .filter(|line| line.contains(EVAL_MARKER))
            .last()
            .ok_or_else(|| IngestorError::malformed(&path, "no evaluation line"))?;

        // json lines are valid yaml flow mappings
        let eval: EvalLine = parse_yaml(&path, last_eval)?;
        match (eval.rmse_e, eval.rmse_f) {
            (Some(energy), Some(force)) => Ok(LossReport {
                train: None,
                validation: Losses::new(energy, force),
            }),
            _ => Err(IngestorError::malformed(
                &path,
                "last evaluation line lacks rmse_e or rmse_f",
            )),
        }
    }
}
