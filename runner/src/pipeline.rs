//! Pipeline Sequencer: runs the fixed stage order
//! `search -> filter -> deep train -> convert -> [inference | properties]`
//! and threads the job of a finished stage into the next one as dependency.

mod bench;
mod convert;
mod deep;
mod optimize;

use crate::{
    config::{ConfigErrors, PipelineConfig, Section},
    descriptor::{BuildError, StageType},
    dispatchers::{DispatchError, JobHandle, TerminalStatus},
    ingest::IngestorError,
    manager::{DispatchSettings, DispatcherFactory},
    search::SearchError,
    template::TemplateError,
};
use clap::ValueEnum;
use potline_analysis::{
    discovery::model_trackers, filter_best_loss, model::CONFIG_NAME, AnalysisError, CandidateId,
    ModelKind, ModelTracker,
};
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
pub enum Stage {
    Search,
    Filter,
    #[value(name = "deep")]
    DeepTrain,
    Convert,
    Inference,
    Properties,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Search,
        Stage::Filter,
        Stage::DeepTrain,
        Stage::Convert,
        Stage::Inference,
        Stage::Properties,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Filter => "filter",
            Self::DeepTrain => "deep",
            Self::Convert => "convert",
            Self::Inference => "inference",
            Self::Properties => "properties",
        }
    }

    /// Configuration sections that must exist before the stage is started
    pub fn required_sections(&self) -> &'static [Section] {
        match self {
            Self::Search | Self::Filter | Self::Convert => &[Section::Optimizer],
            Self::DeepTrain => &[Section::Optimizer, Section::DeepTrain],
            Self::Inference => &[Section::Optimizer, Section::Inference, Section::Lammps],
            Self::Properties => &[Section::Optimizer, Section::DataAnalysis, Section::Lammps],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Enabled stages, always in pipeline order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageSelection(Vec<Stage>);

impl StageSelection {
    pub fn all() -> Self {
        Self(Stage::ALL.to_vec())
    }

    pub fn only(stage: Stage) -> Self {
        Self(vec![stage])
    }

    pub fn without(disabled: &[Stage]) -> Self {
        Self(
            Stage::ALL
                .into_iter()
                .filter(|stage| !disabled.contains(stage))
                .collect(),
        )
    }

    pub fn stages(&self) -> &[Stage] {
        &self.0
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.0.contains(&stage)
    }
}

/// Candidate a fan-out stage failed for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Candidate {
    Id(CandidateId),
    /// Position in the array job of the stage
    Index(u32),
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(
                f,
                "iteration {}, subiteration {}",
                id.iteration, id.subiteration
            ),
            Self::Index(index) => write!(f, "array index {index}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum StageFailure {
    #[error("Invalid configuration")]
    Config(#[from] ConfigErrors),
    #[error("Invalid job description")]
    Build(#[from] BuildError),
    #[error("Dispatching failed")]
    Dispatch(#[from] DispatchError),
    #[error("Collecting losses failed")]
    Ingest(#[from] IngestorError),
    #[error("Candidate bookkeeping failed")]
    Analysis(#[from] AnalysisError),
    #[error("Rendering a template failed")]
    Template(#[from] TemplateError),
    #[error("Invalid parameter")]
    Search(#[from] SearchError),
    #[error("Failed to walk candidate directory")]
    Walk(#[from] ignore::Error),
    #[error("Failed to read or write model configuration {path:?}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Failed to access {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Job ended with {status:?}")]
    JobFailed { status: TerminalStatus },
}

impl StageFailure {
    fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

fn describe_candidate(candidate: &Option<Candidate>) -> String {
    candidate.map_or_else(String::new, |candidate| format!(" for {candidate}"))
}

/// The failure that stopped a run: which stage, which candidate, and why
#[derive(Error, Debug)]
#[error("Stage {stage} failed{}", describe_candidate(.candidate))]
pub struct PipelineError {
    pub stage: Stage,
    pub candidate: Option<Candidate>,
    #[source]
    pub cause: StageFailure,
}

impl PipelineError {
    pub fn new(stage: Stage, cause: impl Into<StageFailure>) -> Self {
        let cause = cause.into();
        // local array jobs report the failing task themselves
        let candidate = match &cause {
            StageFailure::Dispatch(DispatchError::ExecutionFailed {
                index: Some(index), ..
            }) => Some(Candidate::Index(*index)),
            _ => None,
        };

        Self {
            stage,
            candidate,
            cause,
        }
    }
}

pub(crate) trait InStage<T> {
    fn in_stage(self, stage: Stage) -> Result<T, PipelineError>;

    fn for_candidate(self, stage: Stage, candidate: Candidate) -> Result<T, PipelineError>;
}

impl<T, E: Into<StageFailure>> InStage<T> for Result<T, E> {
    fn in_stage(self, stage: Stage) -> Result<T, PipelineError> {
        self.map_err(|e| PipelineError::new(stage, e))
    }

    fn for_candidate(self, stage: Stage, candidate: Candidate) -> Result<T, PipelineError> {
        self.map_err(|e| PipelineError {
            candidate: Some(candidate),
            ..PipelineError::new(stage, e)
        })
    }
}

/// Fail on terminal states that are known failures
fn check_status(
    stage: Stage,
    status: Result<TerminalStatus, DispatchError>,
) -> Result<TerminalStatus, PipelineError> {
    let status = status.in_stage(stage)?;
    match status {
        TerminalStatus::Failed { .. } => Err(PipelineError::new(
            stage,
            StageFailure::JobFailed { status },
        )),
        TerminalStatus::Left => {
            warn!(%stage, "Job left the scheduler without an exit code, checking artifacts");
            Ok(status)
        }
        TerminalStatus::Succeeded => Ok(status),
    }
}

fn create_dir(path: &Path) -> Result<(), StageFailure> {
    fs::create_dir_all(path).map_err(StageFailure::io(path))
}

/// Empty stage directory, records of an earlier run would be discovered again
fn reset_dir(path: &Path) -> Result<(), StageFailure> {
    if path.exists() {
        warn!(?path, "Removing results of an earlier run");
        fs::remove_dir_all(path).map_err(StageFailure::io(path))?;
    }
    create_dir(path)
}

fn read_model_config(directory: &Path) -> Result<serde_yaml::Mapping, StageFailure> {
    let path = directory.join(CONFIG_NAME);
    let content = fs::read_to_string(&path).map_err(StageFailure::io(&path))?;
    serde_yaml::from_str(&content).map_err(|source| StageFailure::Serialize { path, source })
}

fn write_model_config(directory: &Path, config: &serde_yaml::Mapping) -> Result<(), StageFailure> {
    let path = directory.join(CONFIG_NAME);
    let content = serde_yaml::to_string(config).map_err(|source| StageFailure::Serialize {
        path: path.clone(),
        source,
    })?;
    fs::write(&path, content).map_err(StageFailure::io(&path))
}

/// Runs the stages of one sweep in process, blocking on every stage
#[derive(Debug)]
pub struct Sequencer {
    config: PipelineConfig,
    model: ModelKind,
    settings: DispatchSettings,
    sweep: PathBuf,
    // scheduler job of the last stage that produced candidates or potentials
    dependency: Option<u64>,
}

impl Sequencer {
    pub fn new(config: PipelineConfig, settings: DispatchSettings) -> Result<Self, ConfigErrors> {
        Ok(Self {
            model: config.model()?,
            sweep: config.general.sweep_path.clone(),
            config,
            settings,
            dependency: None,
        })
    }

    pub fn sweep(&self) -> &Path {
        &self.sweep
    }

    /// Whether jobs go to a batch scheduler
    pub fn is_remote(&self) -> bool {
        self.settings.cluster.is_some()
    }

    fn energy_weight(&self, stage: Stage) -> Result<f64, PipelineError> {
        Ok(self.config.optimizer().in_stage(stage)?.energy_weight)
    }

    /// Best candidates of the sweep, read back from their records
    #[instrument(level = "debug", skip(self))]
    pub fn select(&self, from_search: bool) -> Result<Vec<ModelTracker>, PipelineError> {
        let stage = Stage::Filter;
        let trackers = model_trackers(&self.sweep, self.model, from_search).in_stage(stage)?;

        filter_best_loss(
            trackers,
            self.energy_weight(stage)?,
            self.config.general.best_n_models,
        )
        .in_stage(stage)
    }

    /// Run the enabled stages in order.
    ///
    /// Stages consuming candidates take the survivors of an earlier stage of
    /// this run, or select them from the records on disk.
    pub fn run(&mut self, stages: &StageSelection) -> Result<(), PipelineError> {
        let mut survivors: Option<Vec<ModelTracker>> = None;

        for &stage in stages.stages() {
            info!(%stage, sweep = ?self.sweep, "Starting stage");

            match stage {
                Stage::Search => {
                    let searched = self.hyper_search()?;
                    info!(candidates = searched.len(), "Search finished");
                }
                Stage::Filter => survivors = Some(self.select(true)?),
                Stage::DeepTrain => {
                    let input = match survivors.take() {
                        Some(survivors) => survivors,
                        None => self.select(true)?,
                    };
                    survivors = Some(self.deep_train(&input)?);
                }
                Stage::Convert => {
                    let candidates = self.candidates(&mut survivors)?;
                    self.convert(&candidates)?;
                }
                Stage::Inference => {
                    let candidates = self.candidates(&mut survivors)?;
                    self.inference(&candidates)?;
                }
                Stage::Properties => {
                    let candidates = self.candidates(&mut survivors)?;
                    self.properties(&candidates)?;
                }
            }

            info!(%stage, "Finished stage");
        }

        Ok(())
    }

    fn candidates(
        &self,
        survivors: &mut Option<Vec<ModelTracker>>,
    ) -> Result<Vec<ModelTracker>, PipelineError> {
        if let Some(survivors) = survivors {
            return Ok(survivors.clone());
        }

        let selected = self.select(false)?;
        *survivors = Some(selected.clone());
        Ok(selected)
    }

    /// Hand the stages to the scheduler: one watch job per stage running
    /// `<exe> run --only <stage>`, chained with `afterok` dependencies.
    /// Inference and properties both wait for the conversion.
    #[instrument(level = "debug", skip(self, stages))]
    pub fn submit(
        &self,
        stages: &StageSelection,
        config_path: &Path,
        exe: &Path,
    ) -> Result<Vec<(Stage, JobHandle)>, PipelineError> {
        let factory = DispatcherFactory::new(self.settings.clone(), StageType::Watch);
        let mut previous = None;
        let mut converted = None;
        let mut handles = Vec::new();

        for &stage in stages.stages() {
            // selection happens inside the stages consuming candidates
            if stage == Stage::Filter {
                continue;
            }

            let dependency = match stage {
                Stage::Inference | Stage::Properties => converted.or(previous),
                _ => previous,
            };
            let command = format!(
                "{} run --config {} --only {}",
                exe.display(),
                config_path.display(),
                stage
            );

            let spec = factory
                .spec(&self.sweep, Some(self.model))
                .with_dependency(dependency);
            let mut dispatcher = factory.build(&spec, vec![command]).in_stage(stage)?;
            let handle = dispatcher.dispatch().in_stage(stage)?;
            info!(%stage, job_id = %handle.id, ?dependency, "Submitted stage");

            previous = handle.id.scheduler_id();
            if stage == Stage::Convert {
                converted = previous;
            }
            handles.push((stage, handle));
        }

        Ok(handles)
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod tests;
