use super::{read_artifact, IngestorError, LossReport};
use potline_analysis::Losses;
use std::path::Path;

const TEST_METRICS: &str = "test_metrics.txt";
const TRAIN_METRICS: &str = "train_metrics.txt";
const ENERGY_COLUMN: &str = "rmse_epa";
const FORCE_COLUMN: &str = "rmse_f_comp";

/// Reads the last row of the pacemaker metric tables
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PaceIngestor;

/// Energy and force columns of the last row of a whitespace separated table
fn last_row(path: &Path) -> Result<Losses, IngestorError> {
    let content = read_artifact(path)?;
    let mut lines = content.lines().filter(|line| !line.trim().is_empty());

    let header = lines
        .next()
        .ok_or_else(|| IngestorError::malformed(path, "empty table"))?
        .split_whitespace()
        .collect::<Vec<_>>();
    let row = lines
        .last()
        .ok_or_else(|| IngestorError::malformed(path, "no rows"))?
        .split_whitespace()
        .collect::<Vec<_>>();

    let column = |name: &str| -> Result<f64, IngestorError> {
        let position = header
            .iter()
            .position(|column| *column == name)
            .ok_or_else(|| IngestorError::malformed(path, format!("no column {name}")))?;
        row.get(position)
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| IngestorError::malformed(path, format!("invalid value for {name}")))
    };

    Ok(Losses::new(column(ENERGY_COLUMN)?, column(FORCE_COLUMN)?))
}

impl PaceIngestor {
    pub fn ingest(&self, directory: &Path) -> Result<LossReport, IngestorError> {
        let validation = last_row(&directory.join(TEST_METRICS))?;
        let train = directory.join(TRAIN_METRICS);

        Ok(LossReport {
            train: if train.is_file() {
                Some(last_row(&train)?)
            } else {
                None
            },
            validation,
        })
    }
}
