use crate::{
    descriptor::{BuildError, Cluster},
    pipeline::Stage,
    search::ParameterKind,
};
use potline_analysis::ModelKind;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env, fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse config {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Configuration section `{0}` is missing")]
    MissingSection(Section),
    #[error("Configuration section `{section}` is invalid")]
    InvalidSection {
        section: Section,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Invalid name in configuration")]
    Name(#[from] BuildError),
    #[error("Preflight checks failed, see the errors above")]
    PreflightFailed,
}

/// Stage sections of the configuration, kept opaque until a stage needs them
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Section {
    Optimizer,
    DeepTrain,
    Inference,
    DataAnalysis,
    Lammps,
}

impl Section {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Optimizer => "optimizer",
            Self::DeepTrain => "deep_train",
            Self::Inference => "inference",
            Self::DataAnalysis => "data_analysis",
            Self::Lammps => "lammps",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub general: GeneralConfig,

    #[serde(default)]
    pub optimizer: Option<serde_yaml::Value>,
    #[serde(default)]
    pub deep_train: Option<serde_yaml::Value>,
    #[serde(default)]
    pub inference: Option<serde_yaml::Value>,
    #[serde(default)]
    pub data_analysis: Option<serde_yaml::Value>,
    #[serde(default)]
    pub lammps: Option<serde_yaml::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    // every stage writes below this directory
    pub sweep_path: PathBuf,
    // model name, see ModelKind::from_str
    pub model: String,
    // batch cluster, local execution without one
    #[serde(default)]
    pub cluster: Option<String>,
    pub best_n_models: usize,
    // root of job templates and cluster setup scripts
    pub templates: PathBuf,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub poll: PollConfig,
    // query exit codes of finished batch jobs
    #[serde(default = "default_accounting")]
    pub accounting: bool,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub commands: CommandOverrides,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            deadline_secs: None,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

/// Additions to every batch job
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    // environment scripts, sourced
    #[serde(default)]
    pub modules: Vec<String>,
    // preflight scripts, run with python
    #[serde(default)]
    pub py_scripts: Vec<String>,
    // extra scheduler directives, override the presets
    #[serde(default)]
    pub options: BTreeMap<String, serde_yaml::Value>,
}

impl JobConfig {
    /// `source`/`python` commands in configuration order
    pub fn setup_commands(&self) -> Vec<String> {
        self.modules
            .iter()
            .map(|module| format!("source {module}"))
            .chain(self.py_scripts.iter().map(|script| format!("python {script}")))
            .collect()
    }

    pub fn extra_options(&self) -> BTreeMap<String, String> {
        self.options
            .iter()
            .map(|(key, value)| (key.clone(), yaml_scalar(value)))
            .collect()
    }
}

/// Replacements of the per-model fitting commands, run inside the candidate directory
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CommandOverrides {
    #[serde(default)]
    pub fit: Option<String>,
    #[serde(default)]
    pub deep_fit: Option<String>,
    #[serde(default)]
    pub convert: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OptimizerConfig {
    pub energy_weight: f64,
    #[serde(default = "default_one")]
    pub max_iter: u32,
    #[serde(default = "default_one")]
    pub n_points: u32,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterKind>,
    // base model configuration every candidate starts from
    #[serde(default)]
    pub model_config: serde_yaml::Mapping,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Random,
    Exploit,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DeepTrainConfig {
    pub max_epochs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct InferenceConfig {
    pub n_cpu: u32,
    pub prerun_steps: u64,
    pub max_steps: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DataAnalysisConfig {
    pub email: String,
    pub lammps_inps_path: PathBuf,
    pub pps_python_path: PathBuf,
    pub ref_data_path: PathBuf,
}

/// LAMMPS binary plus free `lammps_*` style values for the templates
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct LammpsConfig {
    pub lammps_bin_path: PathBuf,
    #[serde(flatten)]
    pub values: BTreeMap<String, serde_yaml::Value>,
}

/// Render a YAML scalar without quotes or document markers
pub fn yaml_scalar(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(value) => value.clone(),
        serde_yaml::Value::Number(value) => value.to_string(),
        serde_yaml::Value::Bool(value) => value.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|rendered| rendered.trim().to_owned())
            .unwrap_or_default(),
    }
}

fn default_shell() -> String {
    "bash".to_owned()
}

fn default_accounting() -> bool {
    true
}

fn default_interval() -> u64 {
    10
}

fn default_one() -> u32 {
    1
}

fn default_seed() -> u64 {
    42
}

impl PipelineConfig {
    /// Read a configuration file, relative paths are resolved against its directory
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self =
            serde_yaml::from_str(&content).map_err(|source| ConfigErrors::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        // jobs run in other working directories, every path must be absolute
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        let base = if base.is_absolute() {
            base.to_path_buf()
        } else {
            env::current_dir()
                .map_err(|source| ConfigErrors::Read {
                    path: path.to_path_buf(),
                    source,
                })?
                .join(base)
        };
        config.general.sweep_path = base.join(&config.general.sweep_path);
        config.general.templates = base.join(&config.general.templates);
        debug!(path = ?path, sweep = ?config.general.sweep_path, "Loaded configuration");

        Ok(config)
    }

    fn raw_section(&self, section: Section) -> Option<&serde_yaml::Value> {
        match section {
            Section::Optimizer => self.optimizer.as_ref(),
            Section::DeepTrain => self.deep_train.as_ref(),
            Section::Inference => self.inference.as_ref(),
            Section::DataAnalysis => self.data_analysis.as_ref(),
            Section::Lammps => self.lammps.as_ref(),
        }
    }

    /// Typed view of a stage section
    pub fn section<T: DeserializeOwned>(&self, section: Section) -> Result<T, ConfigErrors> {
        let value = self
            .raw_section(section)
            .ok_or(ConfigErrors::MissingSection(section))?;

        serde_yaml::from_value(value.clone())
            .map_err(|source| ConfigErrors::InvalidSection { section, source })
    }

    pub fn optimizer(&self) -> Result<OptimizerConfig, ConfigErrors> {
        self.section(Section::Optimizer)
    }

    pub fn cluster(&self) -> Result<Option<Cluster>, ConfigErrors> {
        Ok(self
            .general
            .cluster
            .as_deref()
            .map(Cluster::from_str)
            .transpose()?)
    }

    pub fn model(&self) -> Result<ModelKind, ConfigErrors> {
        ModelKind::from_str(&self.general.model)
            .map_err(|e| ConfigErrors::Name(BuildError::UnsupportedModel(e.0)))
    }

    fn check_section(&self, section: Section) -> Result<(), ConfigErrors> {
        match section {
            Section::Optimizer => self.section::<OptimizerConfig>(section).map(|_| ()),
            Section::DeepTrain => self.section::<DeepTrainConfig>(section).map(|_| ()),
            Section::Inference => self.section::<InferenceConfig>(section).map(|_| ()),
            Section::DataAnalysis => self.section::<DataAnalysisConfig>(section).map(|_| ()),
            Section::Lammps => self.section::<LammpsConfig>(section).map(|_| ()),
        }
    }

    /// Validate everything the enabled stages need before anything is dispatched.
    /// Every problem is logged, the result only says whether there were any.
    pub fn preflight_checks(&self, stages: &[Stage]) -> Result<(), ConfigErrors> {
        let mut contains_error = false;

        if let Err(e) = self.cluster() {
            error!("general.cluster: {}", error_chain(&e));
            contains_error = true;
        }
        if let Err(e) = self.model() {
            error!("general.model: {}", error_chain(&e));
            contains_error = true;
        }
        if self.general.best_n_models == 0 {
            error!("general.best_n_models must be at least 1");
            contains_error = true;
        }
        if self.general.poll.interval_secs == 0 {
            warn!("general.poll.interval_secs is 0, the scheduler will be polled continuously");
        }
        if !self.general.templates.is_dir() {
            error!(
                "general.templates ({}) is not a directory",
                self.general.templates.to_string_lossy()
            );
            contains_error = true;
        }

        let mut sections = stages
            .iter()
            .flat_map(|stage| stage.required_sections().iter().copied())
            .collect::<Vec<_>>();
        sections.sort();
        sections.dedup();

        for section in sections {
            if let Err(e) = self.check_section(section) {
                error!("{}", error_chain(&e));
                contains_error = true;
            }
        }

        if let Ok(optimizer) = self.optimizer() {
            if !(0.0..=1.0).contains(&optimizer.energy_weight) {
                error!("optimizer.energy_weight must lie in [0, 1]");
                contains_error = true;
            }
            if optimizer.n_points == 0 || optimizer.max_iter == 0 {
                error!("optimizer.n_points and optimizer.max_iter must be at least 1");
                contains_error = true;
            }
            for (name, parameter) in optimizer.parameters.iter() {
                if let Err(problem) = parameter.validate() {
                    error!("optimizer.parameters.{name}: {problem}");
                    contains_error = true;
                }
            }
        }

        if contains_error {
            Err(ConfigErrors::PreflightFailed)
        } else {
            Ok(())
        }
    }
}

/// An error and all of its sources joined into one line
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut causes = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        causes.push(cause.to_string());
        source = cause.source();
    }
    causes.join(": ")
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
