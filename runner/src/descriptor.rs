//! Job Descriptor Builder: turns a stage request into scheduler options and
//! the setup commands a job needs before the caller's own commands run.
//!
//! Everything in here is pure, nothing touches the filesystem or spawns.

mod options;
mod preset;

pub use options::{command_body, render_script, ArrayIndices, SchedulerOptions};

use crate::template::TemplatePaths;
use potline_analysis::ModelKind;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("Cluster {0:?} is not supported, use `snellius` or `habrok`")]
    UnsupportedCluster(String),
    #[error("Stage type {0:?} is not supported, use `fit`, `deep`, `inf`, `sim` or `watch`")]
    UnsupportedStageType(String),
    #[error("Model {0:?} is not supported, use `pacemaker`, `mace` or `grace`")]
    UnsupportedModel(String),
    #[error("{stage} jobs require the resource hint `{field}`")]
    MissingResource { stage: StageType, field: &'static str },
    #[error("No {stage} preset for {} on {cluster}", .model.map_or("any model", |model| model.name()))]
    NotImplemented {
        cluster: Cluster,
        stage: StageType,
        model: Option<ModelKind>,
    },
    #[error("Array indices must be a non-empty set of positive integers")]
    InvalidArray,
    #[error("{0} jobs do not fan out and cannot carry array indices")]
    UnexpectedArray(StageType),
    #[error("{0} jobs fan out and require array indices")]
    MissingArray(StageType),
}

/// Batch clusters with known presets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cluster {
    Snellius,
    Habrok,
}

impl Cluster {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Snellius => "snellius",
            Self::Habrok => "habrok",
        }
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Cluster {
    type Err = BuildError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "snellius" => Ok(Self::Snellius),
            "habrok" => Ok(Self::Habrok),
            _ => Err(BuildError::UnsupportedCluster(value.to_owned())),
        }
    }
}

/// Kind of job a stage submits, determines presets and setup commands
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageType {
    #[serde(rename = "fit")]
    Fit,
    #[serde(rename = "deep")]
    DeepFit,
    #[serde(rename = "inf")]
    Inference,
    #[serde(rename = "sim")]
    Simulation,
    #[serde(rename = "watch")]
    Watch,
}

impl StageType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fit => "fit",
            Self::DeepFit => "deep",
            Self::Inference => "inf",
            Self::Simulation => "sim",
            Self::Watch => "watch",
        }
    }

    /// Whether a job of this type runs once per candidate index
    pub fn fans_out(&self) -> bool {
        matches!(self, Self::Fit | Self::DeepFit | Self::Simulation)
    }
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageType {
    type Err = BuildError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "fit" => Ok(Self::Fit),
            "deep" => Ok(Self::DeepFit),
            "inf" => Ok(Self::Inference),
            "sim" => Ok(Self::Simulation),
            "watch" => Ok(Self::Watch),
            _ => Err(BuildError::UnsupportedStageType(value.to_owned())),
        }
    }
}

/// Optional resource requests, required ones depend on the stage type
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceHints {
    pub cpus: Option<u32>,
    pub email: Option<String>,
    pub nodes: Option<u32>,
}

impl ResourceHints {
    pub fn with_cpus(mut self, cpus: u32) -> Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Fully resolved description of a single job submission.
/// `cluster == None` describes a job that runs on the local shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSpec {
    pub cluster: Option<Cluster>,
    pub stage: StageType,
    pub model: Option<ModelKind>,
    pub out_path: PathBuf,
    pub hints: ResourceHints,
    pub dependency: Option<u64>,
    pub array: Option<ArrayIndices>,
}

impl JobSpec {
    pub fn new(
        cluster: Option<Cluster>,
        stage: StageType,
        model: Option<ModelKind>,
        out_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cluster,
            stage,
            model,
            out_path: out_path.into(),
            hints: ResourceHints::default(),
            dependency: None,
            array: None,
        }
    }

    /// Resolve names from configuration, in the order cluster, stage type, model
    pub fn parse(
        cluster: Option<&str>,
        stage: &str,
        model: Option<&str>,
        out_path: impl Into<PathBuf>,
    ) -> Result<Self, BuildError> {
        let cluster = cluster.map(Cluster::from_str).transpose()?;
        let stage = StageType::from_str(stage)?;
        let model = model
            .map(|name| {
                ModelKind::from_str(name).map_err(|e| BuildError::UnsupportedModel(e.0))
            })
            .transpose()?;

        Ok(Self::new(cluster, stage, model, out_path))
    }

    pub fn with_hints(mut self, hints: ResourceHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_dependency(mut self, dependency: Option<u64>) -> Self {
        self.dependency = dependency;
        self
    }

    pub fn with_array(mut self, array: Option<ArrayIndices>) -> Self {
        self.array = array;
        self
    }

    /// Job name as shown by the scheduler
    pub fn job_name(&self) -> String {
        match self.model {
            Some(model) => format!("{}_{}", self.stage, model),
            None => self.stage.to_string(),
        }
    }

    fn check_resources(&self) -> Result<(), BuildError> {
        let missing = |field| BuildError::MissingResource {
            stage: self.stage,
            field,
        };

        match self.stage {
            StageType::Fit | StageType::DeepFit if self.model.is_none() => Err(missing("model")),
            StageType::Inference if self.hints.cpus.is_none() => Err(missing("cpus")),
            StageType::Simulation if self.hints.email.is_none() => Err(missing("email")),
            _ => Ok(()),
        }
    }

    fn check_array(&self) -> Result<(), BuildError> {
        match (self.stage.fans_out(), &self.array) {
            (true, None) => Err(BuildError::MissingArray(self.stage)),
            (false, Some(_)) => Err(BuildError::UnexpectedArray(self.stage)),
            _ => Ok(()),
        }
    }

    /// Validated scheduler options for this job.
    ///
    /// Fails on the first problem found: missing resource hints, an array
    /// that does not fit the stage type, then a missing preset. Local jobs
    /// are validated the same way and get an empty option set.
    pub fn build_options(&self) -> Result<SchedulerOptions, BuildError> {
        self.check_resources()?;
        self.check_array()?;

        let Some(cluster) = self.cluster else {
            return Ok(SchedulerOptions::default());
        };

        let preset = preset::lookup(cluster, self.stage, self.model).ok_or(
            BuildError::NotImplemented {
                cluster,
                stage: self.stage,
                model: self.model,
            },
        )?;

        let mut options = preset.options(self);
        if let Some(array) = &self.array {
            options.make_array(self.stage, &self.out_path, array);
        }
        if let Some(dependency) = self.dependency {
            options.insert("dependency", format!("afterok:{dependency}"));
        }

        Ok(options)
    }
}

/// Setup commands a job of this kind needs on its cluster, before the
/// configured modules and the caller's commands
pub fn build_commands(
    cluster: Option<Cluster>,
    stage: StageType,
    model: Option<ModelKind>,
    templates: &TemplatePaths,
) -> Result<Vec<String>, BuildError> {
    let Some(cluster) = cluster else {
        return Ok(Vec::new());
    };
    let model = model.ok_or(BuildError::MissingResource {
        stage,
        field: "model",
    })?;

    let scripts = preset::setup_scripts(cluster, stage, model).ok_or(
        BuildError::NotImplemented {
            cluster,
            stage,
            model: Some(model),
        },
    )?;

    Ok(scripts
        .into_iter()
        .map(|script| match script {
            preset::Setup::Source(name) => format!(
                "source {}",
                templates.cluster_script(cluster, name).display()
            ),
            preset::Setup::Probe(name) => {
                format!("python {}", templates.probe(name).display())
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODELS: [Option<ModelKind>; 4] = [
        None,
        Some(ModelKind::Pace),
        Some(ModelKind::Mace),
        Some(ModelKind::Grace),
    ];
    const STAGES: [StageType; 5] = [
        StageType::Fit,
        StageType::DeepFit,
        StageType::Inference,
        StageType::Simulation,
        StageType::Watch,
    ];

    fn complete(cluster: Cluster, stage: StageType, model: Option<ModelKind>) -> JobSpec {
        JobSpec::new(Some(cluster), stage, model, "/sweep/out")
            .with_hints(ResourceHints::default().with_cpus(8).with_email("a@b.c"))
            .with_array(stage.fans_out().then(|| ArrayIndices::up_to(3).unwrap()))
    }

    #[test]
    fn names_are_validated_in_order() {
        assert_eq!(
            JobSpec::parse(Some("lisa"), "nope", Some("nope"), "/out"),
            Err(BuildError::UnsupportedCluster("lisa".into()))
        );
        assert_eq!(
            JobSpec::parse(Some("Snellius"), "nope", Some("nope"), "/out"),
            Err(BuildError::UnsupportedStageType("nope".into()))
        );
        assert_eq!(
            JobSpec::parse(Some("snellius"), "FIT", Some("nequip"), "/out"),
            Err(BuildError::UnsupportedModel("nequip".into()))
        );

        let spec = JobSpec::parse(None, "sim", Some("pace"), "/out").unwrap();
        assert_eq!(spec.cluster, None);
        assert_eq!(spec.stage, StageType::Simulation);
        assert_eq!(spec.model, Some(ModelKind::Pace));
    }

    #[test]
    fn presets_carry_required_fields() {
        for cluster in [Cluster::Snellius, Cluster::Habrok] {
            for stage in STAGES {
                for model in MODELS {
                    let spec = complete(cluster, stage, model);
                    match spec.build_options() {
                        Ok(options) => {
                            for key in ["job-name", "chdir", "output", "error", "time"] {
                                assert!(
                                    options.get(key).is_some(),
                                    "{cluster} {stage} {model:?} lacks {key}"
                                );
                            }
                        }
                        Err(e) => assert!(
                            matches!(
                                e,
                                BuildError::NotImplemented { .. }
                                    | BuildError::MissingResource { field: "model", .. }
                            ),
                            "{cluster} {stage} {model:?} failed with {e}"
                        ),
                    }
                }
            }
        }
    }

    #[test]
    fn snellius_covers_every_model() {
        for stage in STAGES {
            for model in &MODELS[1..] {
                assert!(complete(Cluster::Snellius, stage, *model)
                    .build_options()
                    .is_ok());
            }
        }
    }

    #[test]
    fn missing_presets_are_not_implemented() {
        for (stage, model) in [
            (StageType::Fit, ModelKind::Mace),
            (StageType::DeepFit, ModelKind::Mace),
            (StageType::Inference, ModelKind::Pace),
            (StageType::Simulation, ModelKind::Grace),
        ] {
            assert_eq!(
                complete(Cluster::Habrok, stage, Some(model)).build_options(),
                Err(BuildError::NotImplemented {
                    cluster: Cluster::Habrok,
                    stage,
                    model: Some(model),
                })
            );
        }
    }

    #[test]
    fn missing_hints_fail_at_build_time() {
        let spec = JobSpec::new(
            Some(Cluster::Snellius),
            StageType::Inference,
            Some(ModelKind::Mace),
            "/out",
        );
        assert_eq!(
            spec.build_options(),
            Err(BuildError::MissingResource {
                stage: StageType::Inference,
                field: "cpus",
            })
        );

        let spec = JobSpec::new(None, StageType::Simulation, Some(ModelKind::Mace), "/out")
            .with_array(Some(ArrayIndices::up_to(2).unwrap()));
        assert_eq!(
            spec.build_options(),
            Err(BuildError::MissingResource {
                stage: StageType::Simulation,
                field: "email",
            })
        );

        let spec = JobSpec::new(Some(Cluster::Snellius), StageType::Fit, None, "/out")
            .with_array(Some(ArrayIndices::up_to(2).unwrap()));
        assert!(matches!(
            spec.build_options(),
            Err(BuildError::MissingResource { field: "model", .. })
        ));
    }

    #[test]
    fn array_presence_follows_stage_type() {
        let watch = complete(Cluster::Snellius, StageType::Watch, Some(ModelKind::Mace))
            .with_array(Some(ArrayIndices::up_to(2).unwrap()));
        assert_eq!(
            watch.build_options(),
            Err(BuildError::UnexpectedArray(StageType::Watch))
        );

        let fit =
            complete(Cluster::Snellius, StageType::Fit, Some(ModelKind::Mace)).with_array(None);
        assert_eq!(
            fit.build_options(),
            Err(BuildError::MissingArray(StageType::Fit))
        );
    }

    #[test]
    fn array_options_extend_base_options() {
        let array = complete(Cluster::Snellius, StageType::Fit, Some(ModelKind::Grace))
            .with_array(Some(ArrayIndices::new(vec![1, 2, 3]).unwrap()));
        let options = array.build_options().unwrap();

        assert_eq!(options.get("array"), Some("1-3"));
        assert_eq!(options.get("chdir"), Some("/sweep/out/%a"));
        assert_eq!(
            options.get("output"),
            Some("/sweep/out/%a/fit_%A_%a.out")
        );
        assert_eq!(options.get("error"), Some("/sweep/out/%a/fit_%A_%a.err"));

        // everything but the per-task fields is shared with the plain preset
        let base = preset::lookup(Cluster::Snellius, StageType::Fit, Some(ModelKind::Grace))
            .unwrap()
            .options(&array);
        for (key, value) in base.iter() {
            if !["chdir", "output", "error"].contains(&key) {
                assert_eq!(options.get(key), Some(value), "{key} differs");
            }
        }
        assert_eq!(base.get("output"), Some("/sweep/out/fit_%j.out"));
        assert_eq!(base.get("chdir"), Some("/sweep/out"));
    }

    #[test]
    fn dependencies_are_afterok() {
        let spec = complete(Cluster::Snellius, StageType::Watch, Some(ModelKind::Pace))
            .with_dependency(Some(42));
        let options = spec.build_options().unwrap();

        assert_eq!(options.get("dependency"), Some("afterok:42"));
        assert_eq!(options.get("job-name"), Some("watch_pacemaker"));
        assert_eq!(options.get("chdir"), Some("/sweep/out"));
        assert_eq!(options.get("gpus"), None);
    }

    #[test]
    fn simulation_jobs_mail_the_user() {
        let options = complete(Cluster::Snellius, StageType::Simulation, Some(ModelKind::Mace))
            .build_options()
            .unwrap();

        assert_eq!(options.get("mail-type"), Some("ALL"));
        assert_eq!(options.get("mail-user"), Some("a@b.c"));
        assert_eq!(options.get("cpus-per-task"), Some("8"));
        assert_eq!(options.get("exclude"), Some("gcn25,gcn56"));
    }

    #[test]
    fn local_jobs_have_no_options() {
        let spec = JobSpec::new(None, StageType::Watch, None, "/out");
        assert!(spec.build_options().unwrap().is_empty());
    }

    #[test]
    fn setup_commands_come_from_template_root() {
        let templates = TemplatePaths::new("/templates");
        let commands = build_commands(
            Some(Cluster::Snellius),
            StageType::Simulation,
            Some(ModelKind::Mace),
            &templates,
        )
        .unwrap();

        assert_eq!(
            commands,
            vec![
                "source /templates/snellius/module_mpi.sh",
                "source /templates/snellius/module_mkl.sh",
                "source /templates/snellius/module_prop_sim.sh",
            ]
        );

        let commands = build_commands(
            Some(Cluster::Habrok),
            StageType::Fit,
            Some(ModelKind::Grace),
            &templates,
        )
        .unwrap();
        assert_eq!(
            commands,
            vec![
                "source /templates/habrok/conda_grace.sh",
                "python /templates/tf_gpu_test.py",
            ]
        );

        assert!(build_commands(None, StageType::Fit, None, &templates)
            .unwrap()
            .is_empty());
        assert!(matches!(
            build_commands(
                Some(Cluster::Habrok),
                StageType::Inference,
                Some(ModelKind::Pace),
                &TemplatePaths::new("/t")
            ),
            Err(BuildError::NotImplemented { .. })
        ));
    }
}
