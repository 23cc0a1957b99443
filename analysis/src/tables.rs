use crate::{AnalysisError, CandidateId, ModelTracker};
use itertools::Itertools;
use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
};
use tracing::{debug, info};

pub const ERROR_FILENAME: &str = "loss_function_errors.csv";
pub const PARAMETER_FILENAME: &str = "parameters.csv";

const ERROR_HEADER: [&str; 6] = [
    "Iteration",
    "Subiteration",
    "Train Δ Energy",
    "Test Δ Energy",
    "Train Δ Force",
    "Test Δ Force",
];

/// Append-only result tables of a sweep directory
#[derive(Debug, Clone)]
pub struct LossLogger {
    error_path: PathBuf,
    parameter_path: PathBuf,
    keys: Option<Vec<String>>,
}

/// render a single YAML value as a table cell
pub fn cell(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(value) => value.to_string(),
        serde_yaml::Value::Number(value) => value.to_string(),
        serde_yaml::Value::String(value) => value.clone(),
        other => serde_yaml::to_string(other)
            .map(|rendered| rendered.trim().replace('\n', " "))
            .unwrap_or_default(),
    }
}

fn optional(value: Option<f64>) -> String {
    value.map(|value| value.to_string()).unwrap_or_default()
}

impl LossLogger {
    /// Create the tables below `directory`, truncating older ones.
    /// Without `keys` only the error table is written.
    pub fn create(directory: &Path, keys: Option<Vec<String>>) -> Result<Self, AnalysisError> {
        fs::create_dir_all(directory).map_err(AnalysisError::io(directory))?;

        let logger = Self {
            error_path: directory.join(ERROR_FILENAME),
            parameter_path: directory.join(PARAMETER_FILENAME),
            keys,
        };

        let mut writer = csv::Writer::from_path(&logger.error_path)?;
        writer.write_record(ERROR_HEADER)?;
        writer.flush().map_err(AnalysisError::io(&logger.error_path))?;

        if let Some(keys) = &logger.keys {
            let mut writer = csv::Writer::from_path(&logger.parameter_path)?;
            writer.write_record(
                ["iteration", "subiteration", "loss"]
                    .into_iter()
                    .chain(keys.iter().map(String::as_str)),
            )?;
            writer.flush().map_err(AnalysisError::io(&logger.parameter_path))?;
        }

        debug!(error_table = ?logger.error_path, "Initialised result tables");

        Ok(logger)
    }

    fn append<I>(path: &Path, record: I) -> Result<(), AnalysisError>
    where
        I: IntoIterator<Item = String>,
    {
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(AnalysisError::io(path))?;
        let mut writer = csv::Writer::from_writer(file);

        writer.write_record(record.into_iter().collect_vec())?;
        writer.flush().map_err(AnalysisError::io(path))
    }

    /// Append the error row of a candidate with computed losses
    pub fn write_error_row(&self, tracker: &ModelTracker) -> Result<(), AnalysisError> {
        let validation = tracker
            .validation_losses()
            .ok_or(AnalysisError::LossNotComputed(tracker.id()))?;
        let train = tracker.train_losses();

        Self::append(
            &self.error_path,
            [
                tracker.id().iteration.to_string(),
                tracker.id().subiteration.to_string(),
                optional(train.map(|losses| losses.energy)),
                validation.energy.to_string(),
                optional(train.map(|losses| losses.force)),
                validation.force.to_string(),
            ],
        )
    }

    /// Append the loss and the parameter values of a candidate, in key order
    pub fn write_param_row(
        &self,
        id: CandidateId,
        loss: f64,
        tracker: &ModelTracker,
    ) -> Result<(), AnalysisError> {
        let keys = self.keys.as_ref().ok_or(AnalysisError::NoParameterKeys)?;
        let values = keys.iter().map(|key| {
            tracker
                .parameters()
                .get(key)
                .map(cell)
                .unwrap_or_default()
        });

        Self::append(
            &self.parameter_path,
            [
                id.iteration.to_string(),
                id.subiteration.to_string(),
                loss.to_string(),
            ]
            .into_iter()
            .chain(values),
        )
    }

    /// Render every written table as a GitHub flavoured text table next to it
    pub fn tabulate_final_results(&self) -> Result<Vec<PathBuf>, AnalysisError> {
        let mut written = Vec::new();

        for path in [&self.error_path, &self.parameter_path] {
            if !path.is_file() {
                continue;
            }

            let rows = csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_path(path)?
                .records()
                .map_ok(|record| record.iter().map(str::to_owned).collect_vec())
                .collect::<Result<Vec<_>, _>>()?;

            let stem = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("table");
            let target = path.with_file_name(format!("{stem}_final.txt"));
            fs::write(&target, render_table(&rows)).map_err(AnalysisError::io(&target))?;
            info!(table = ?target, "Wrote final results");
            written.push(target);
        }

        Ok(written)
    }

    pub fn error_path(&self) -> &Path {
        &self.error_path
    }

    pub fn parameter_path(&self) -> &Path {
        &self.parameter_path
    }
}

/// GitHub style table, the first row is the header
pub fn render_table(rows: &[Vec<String>]) -> String {
    let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
    if columns == 0 {
        return String::new();
    }

    let widths = (0..columns)
        .map(|column| {
            rows.iter()
                .filter_map(|row| row.get(column))
                .map(|value| value.chars().count())
                .max()
                .unwrap_or(0)
                .max(3)
        })
        .collect_vec();

    let line = |row: &[String]| {
        let cells = widths
            .iter()
            .enumerate()
            .map(|(column, width)| {
                let value = row.get(column).map(String::as_str).unwrap_or("");
                let padding = width - value.chars().count();
                format!(" {value}{} ", " ".repeat(padding))
            })
            .join("|");
        format!("|{cells}|\n")
    };

    let mut table = line(&rows[0]);
    table.push_str(&format!(
        "|{}|\n",
        widths
            .iter()
            .map(|width| format!(" {} ", "-".repeat(*width)))
            .join("|")
    ));
    for row in &rows[1..] {
        table.push_str(&line(row));
    }

    table
}
