//! Dispatcher Factory and Manager: pick the backend from configuration and
//! assemble options and commands for every submission.

use crate::{
    config::{ConfigErrors, JobConfig, PipelineConfig},
    descriptor::{build_commands, ArrayIndices, Cluster, JobSpec, ResourceHints, StageType},
    dispatchers::{
        DispatchError, Dispatcher, JobHandle, LocalDispatcher, SchedulerClient, SlurmCli,
        SlurmDispatcher, TerminalStatus, WaitPolicy,
    },
    sync::CancellationToken,
    template::TemplatePaths,
};
use potline_analysis::ModelKind;
use std::{path::Path, sync::Arc};
use tracing::{debug, instrument, warn};

/// Directives the pipeline derives per job, configuration cannot replace them
const RESERVED_OPTIONS: [&str; 5] = ["array", "chdir", "dependency", "error", "output"];

/// Configured extra directives without the reserved ones
fn extra_options(job: &JobConfig) -> Vec<(String, String)> {
    job.extra_options()
        .into_iter()
        .filter(|(key, _)| {
            let reserved = RESERVED_OPTIONS.contains(&key.as_str());
            if reserved {
                warn!("Ignoring general.job.options.{key}, it is set per job");
            }
            !reserved
        })
        .collect()
}

/// Everything a dispatcher needs that does not change between stages
#[derive(Clone, Debug)]
pub struct DispatchSettings {
    pub cluster: Option<Cluster>,
    pub templates: TemplatePaths,
    pub shell: String,
    pub job: JobConfig,
    pub policy: WaitPolicy,
    pub accounting: bool,
    pub client: Arc<dyn SchedulerClient>,
}

impl DispatchSettings {
    pub fn from_config(
        config: &PipelineConfig,
        token: CancellationToken,
    ) -> Result<Self, ConfigErrors> {
        Ok(Self {
            cluster: config.cluster()?,
            templates: TemplatePaths::new(&config.general.templates),
            shell: config.general.shell.clone(),
            job: config.general.job.clone(),
            policy: WaitPolicy {
                interval: config.general.poll.interval(),
                deadline: config.general.poll.deadline(),
                token,
            },
            accounting: config.general.accounting,
            client: Arc::new(SlurmCli::default()),
        })
    }

    /// Talk to a different scheduler than the SLURM command line tools
    pub fn with_client(mut self, client: Arc<dyn SchedulerClient>) -> Self {
        self.client = client;
        self
    }
}

/// Creates dispatchers of one stage type, local without a cluster
#[derive(Clone, Debug)]
pub struct DispatcherFactory {
    settings: DispatchSettings,
    stage: StageType,
}

impl DispatcherFactory {
    pub fn new(settings: DispatchSettings, stage: StageType) -> Self {
        Self { settings, stage }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Description of a job of this factory's stage type writing to `out_path`
    pub fn spec(&self, out_path: &Path, model: Option<ModelKind>) -> JobSpec {
        JobSpec::new(self.settings.cluster, self.stage, model, out_path)
    }

    /// Dispatcher running `commands` for a job without array indices or dependency
    pub fn create_dispatcher(
        &self,
        commands: Vec<String>,
        out_path: &Path,
        model: Option<ModelKind>,
        hints: ResourceHints,
    ) -> Result<Box<dyn Dispatcher>, DispatchError> {
        self.build(&self.spec(out_path, model).with_hints(hints), commands)
    }

    /// Dispatcher for a fully described job.
    ///
    /// Batch jobs run the cluster setup commands, the configured modules
    /// and python scripts, then `commands`. Local jobs run `commands` only.
    pub fn build(
        &self,
        spec: &JobSpec,
        commands: Vec<String>,
    ) -> Result<Box<dyn Dispatcher>, DispatchError> {
        let mut options = spec.build_options()?;

        let Some(cluster) = spec.cluster else {
            debug!(out = ?spec.out_path, stage = %spec.stage, "Creating local dispatcher");
            return Ok(Box::new(
                LocalDispatcher::new(commands, &spec.out_path, self.settings.policy.clone())
                    .with_shell(&self.settings.shell)
                    .with_array(spec.array.clone()),
            ));
        };

        let mut sequence = build_commands(
            Some(cluster),
            spec.stage,
            spec.model,
            &self.settings.templates,
        )?;
        sequence.extend(self.settings.job.setup_commands());
        sequence.extend(commands);
        options.extend(extra_options(&self.settings.job));

        debug!(out = ?spec.out_path, stage = %spec.stage, %cluster, "Creating batch dispatcher");

        Ok(Box::new(
            SlurmDispatcher::new(
                sequence,
                options,
                self.settings.client.clone(),
                self.settings.policy.clone(),
            )
            .with_accounting(self.settings.accounting),
        ))
    }
}

/// Configure once, submit once: the two-phase variant used by fan-out stages
#[derive(Debug)]
pub struct DispatcherManager {
    factory: DispatcherFactory,
    model: Option<ModelKind>,
    dispatcher: Option<Box<dyn Dispatcher>>,
}

impl DispatcherManager {
    pub fn new(settings: DispatchSettings, stage: StageType, model: Option<ModelKind>) -> Self {
        Self {
            factory: DispatcherFactory::new(settings, stage),
            model,
            dispatcher: None,
        }
    }

    /// Prepare the next job, replacing an earlier one
    pub fn set_job(
        &mut self,
        commands: Vec<String>,
        out_path: &Path,
        hints: ResourceHints,
        array: Option<ArrayIndices>,
        dependency: Option<u64>,
    ) -> Result<(), DispatchError> {
        let spec = self
            .factory
            .spec(out_path, self.model)
            .with_hints(hints)
            .with_array(array)
            .with_dependency(dependency);

        self.dispatcher = Some(self.factory.build(&spec, commands)?);
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub fn dispatch_job(&mut self) -> Result<JobHandle, DispatchError> {
        self.dispatcher
            .as_mut()
            .ok_or(DispatchError::NoJobConfigured)?
            .dispatch()
    }

    #[instrument(level = "debug", skip(self))]
    pub fn wait_job(&mut self) -> Result<TerminalStatus, DispatchError> {
        self.dispatcher
            .as_mut()
            .ok_or(DispatchError::NoJobConfigured)?
            .wait()
    }

    pub fn dispatcher(&self) -> Option<&dyn Dispatcher> {
        self.dispatcher.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        descriptor::BuildError,
        dispatchers::{testing::ScriptedScheduler, DispatchState, JobId},
    };
    use std::{fs, time::Duration};

    fn settings(cluster: Option<Cluster>, client: Arc<ScriptedScheduler>) -> DispatchSettings {
        DispatchSettings {
            cluster,
            templates: TemplatePaths::new("/templates"),
            shell: "bash".into(),
            job: JobConfig {
                modules: vec!["/env/extra.sh".into()],
                py_scripts: vec!["/env/check.py".into()],
                options: [("account".to_owned(), serde_yaml::Value::from("proj42"))]
                    .into_iter()
                    .collect(),
            },
            policy: WaitPolicy {
                interval: Duration::from_millis(1),
                ..WaitPolicy::default()
            },
            accounting: true,
            client,
        }
    }

    #[test]
    fn local_dispatcher_without_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DispatcherFactory::new(
            settings(None, ScriptedScheduler::finishing(1)),
            StageType::Watch,
        );

        let mut dispatcher = factory
            .create_dispatcher(
                vec!["echo hi > out.txt".into()],
                dir.path(),
                Some(ModelKind::Mace),
                ResourceHints::default(),
            )
            .unwrap();

        // commands are passed through untouched
        assert_eq!(dispatcher.commands(), ["echo hi > out.txt"]);
        assert_eq!(dispatcher.dispatch().unwrap().id, JobId::Local);
        assert_eq!(dispatcher.wait().unwrap(), TerminalStatus::Succeeded);
        assert_eq!(fs::read_to_string(dir.path().join("out.txt")).unwrap(), "hi\n");
    }

    #[test]
    fn batch_dispatcher_prepends_setup() {
        let scheduler = ScriptedScheduler::finishing(100);
        let factory = DispatcherFactory::new(
            settings(Some(Cluster::Snellius), scheduler.clone()),
            StageType::Watch,
        );

        let mut dispatcher = factory
            .create_dispatcher(
                vec!["potline run --only convert".into()],
                Path::new("/sweep"),
                Some(ModelKind::Pace),
                ResourceHints::default(),
            )
            .unwrap();

        assert_eq!(
            dispatcher.commands(),
            [
                "source /templates/snellius/conda_pace.sh",
                "source /env/extra.sh",
                "python /env/check.py",
                "potline run --only convert",
            ]
        );
        assert_eq!(dispatcher.dispatch().unwrap().id, JobId::Scheduler(100));

        let script = &scheduler.scripts()[0];
        assert!(script.contains("#SBATCH --account=proj42\n"));
        assert!(script.contains("#SBATCH --job-name=watch_pacemaker\n"));
    }

    #[test]
    fn manager_builds_array_jobs_once() {
        let scheduler = ScriptedScheduler::finishing(7);
        let mut manager = DispatcherManager::new(
            settings(Some(Cluster::Snellius), scheduler.clone()),
            StageType::Fit,
            Some(ModelKind::Mace),
        );

        assert!(matches!(
            manager.dispatch_job(),
            Err(DispatchError::NoJobConfigured)
        ));
        assert!(matches!(manager.wait_job(), Err(DispatchError::NoJobConfigured)));

        manager
            .set_job(
                vec!["mace_run_train --config model_config.yaml".into()],
                Path::new("/sweep/hyper_search/1"),
                ResourceHints::default(),
                Some(ArrayIndices::up_to(4).unwrap()),
                Some(6),
            )
            .unwrap();
        let handle = manager.dispatch_job().unwrap();
        assert_eq!(manager.wait_job().unwrap(), TerminalStatus::Succeeded);
        assert_eq!(
            manager.dispatcher().map(|dispatcher| *dispatcher.state()),
            Some(DispatchState::Completed {
                handle,
                status: TerminalStatus::Succeeded
            })
        );

        let scripts = scheduler.scripts();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].contains("#SBATCH --array=1-4\n"));
        assert!(scripts[0].contains("#SBATCH --dependency=afterok:6\n"));
        assert!(scripts[0].contains("#SBATCH --chdir=/sweep/hyper_search/1/%a\n"));
        assert!(scripts[0].contains("python /templates/pyt_gpu_test.py\n"));
    }

    #[test]
    fn configured_options_keep_job_wiring() {
        let scheduler = ScriptedScheduler::finishing(20);
        let mut settings = settings(Some(Cluster::Snellius), scheduler.clone());
        settings.job.options.extend([
            ("dependency".to_owned(), serde_yaml::Value::from("afterany:1")),
            ("output".to_owned(), serde_yaml::Value::from("/tmp/x.out")),
            ("chdir".to_owned(), serde_yaml::Value::from("/tmp")),
            ("time".to_owned(), serde_yaml::Value::from("00:10:00")),
        ]);
        let factory = DispatcherFactory::new(settings, StageType::Watch);

        let spec = factory
            .spec(Path::new("/sweep"), Some(ModelKind::Pace))
            .with_dependency(Some(19));
        let mut dispatcher = factory.build(&spec, vec!["true".into()]).unwrap();
        dispatcher.dispatch().unwrap();

        let script = &scheduler.scripts()[0];
        assert!(script.contains("#SBATCH --dependency=afterok:19\n"));
        assert!(script.contains("#SBATCH --output=/sweep/watch_%j.out\n"));
        assert!(script.contains("#SBATCH --chdir=/sweep\n"));
        // everything else still overrides the preset
        assert!(script.contains("#SBATCH --time=00:10:00\n"));
        assert!(script.contains("#SBATCH --account=proj42\n"));
        assert!(!script.contains("afterany"));
    }

    #[test]
    fn build_errors_surface_before_submission() {
        let scheduler = ScriptedScheduler::finishing(1);
        let mut manager = DispatcherManager::new(
            settings(Some(Cluster::Habrok), scheduler.clone()),
            StageType::Inference,
            Some(ModelKind::Grace),
        );

        let result = manager.set_job(
            vec!["bash run.sh".into()],
            Path::new("/bench"),
            ResourceHints::default().with_cpus(4),
            None,
            None,
        );

        assert!(matches!(
            result,
            Err(DispatchError::Build(BuildError::NotImplemented { .. }))
        ));
        assert!(manager.dispatcher().is_none());
        assert!(scheduler.scripts().is_empty());
    }
}
