use super::{
    check_status, convert::POTENTIAL_NAME, create_dir, Candidate, InStage, PipelineError,
    Sequencer, Stage,
};
use crate::{
    config::{yaml_scalar, DataAnalysisConfig, InferenceConfig, LammpsConfig, Section},
    descriptor::{ArrayIndices, ResourceHints, StageType},
    dispatchers::Dispatcher,
    manager::{DispatcherFactory, DispatcherManager},
    models,
    template::{gen_from_template, values, TemplateValues},
};
use potline_analysis::ModelTracker;
use std::path::Path;
use tracing::{info, instrument};

const INFERENCE_DIR_NAME: &str = "inference_bench";
const BENCH_INPUT_NAME: &str = "bench.in";
const PROPERTIES_DIR_NAME: &str = "properties_bench";
const SUBMIT_NAME: &str = "submit.sh";

/// Free `lammps_*` values of the lammps section plus the candidate's potential
fn lammps_values(lammps: &LammpsConfig, candidate: &Path) -> TemplateValues {
    let mut values = lammps
        .values
        .iter()
        .map(|(key, value)| (key.clone(), yaml_scalar(value)))
        .collect::<TemplateValues>();
    values.insert(
        "lammps_bin_path".to_owned(),
        lammps.lammps_bin_path.display().to_string(),
    );
    values.insert(
        "potential_path".to_owned(),
        candidate.join(POTENTIAL_NAME).display().to_string(),
    );
    values
}

impl Sequencer {
    /// One inference job per candidate, all submitted before the first wait
    #[instrument(level = "debug", skip(self, candidates))]
    pub(super) fn inference(&mut self, candidates: &[ModelTracker]) -> Result<(), PipelineError> {
        let stage = Stage::Inference;
        let inference: InferenceConfig = self.config.section(Section::Inference).in_stage(stage)?;
        let lammps: LammpsConfig = self.config.section(Section::Lammps).in_stage(stage)?;
        let factory = DispatcherFactory::new(self.settings.clone(), StageType::Inference);
        let templates = &self.settings.templates;

        let mut dispatchers: Vec<(Candidate, Box<dyn Dispatcher>)> = Vec::new();
        for (index, tracker) in (1u32..).zip(candidates) {
            let candidate = Candidate::Index(index);
            let directory = tracker.model().directory();
            let bench = directory.join(INFERENCE_DIR_NAME);
            create_dir(&bench).for_candidate(stage, candidate)?;

            let input = gen_from_template(
                &templates.bench_input(),
                &lammps_values(&lammps, directory),
                &bench.join(BENCH_INPUT_NAME),
            )
            .for_candidate(stage, candidate)?;

            let command = format!(
                "bash {} {} {} {} {} {} {} \"{}\"",
                templates.bench_script().display(),
                inference.n_cpu,
                lammps.lammps_bin_path.display(),
                input.display(),
                inference.prerun_steps,
                inference.max_steps,
                bench.display(),
                models::lammps_params(self.model),
            );

            let spec = factory
                .spec(&bench, Some(self.model))
                .with_hints(ResourceHints::default().with_cpus(inference.n_cpu))
                .with_dependency(self.dependency);
            let mut dispatcher = factory
                .build(&spec, vec![command])
                .for_candidate(stage, candidate)?;
            let handle = dispatcher.dispatch().for_candidate(stage, candidate)?;
            info!(candidate = %tracker.id(), job_id = %handle.id, "Submitted inference benchmark");

            dispatchers.push((candidate, dispatcher));
        }

        for (candidate, mut dispatcher) in dispatchers {
            check_status(stage, dispatcher.wait()).map_err(|e| PipelineError {
                candidate: Some(candidate),
                ..e
            })?;
        }

        Ok(())
    }

    /// Property simulations of every candidate in one array job
    #[instrument(level = "debug", skip(self, candidates))]
    pub(super) fn properties(&mut self, candidates: &[ModelTracker]) -> Result<(), PipelineError> {
        let stage = Stage::Properties;
        let analysis: DataAnalysisConfig =
            self.config.section(Section::DataAnalysis).in_stage(stage)?;
        let lammps: LammpsConfig = self.config.section(Section::Lammps).in_stage(stage)?;
        let root = self.sweep.join(PROPERTIES_DIR_NAME);

        for (index, tracker) in (1u32..).zip(candidates) {
            let out = root.join(index.to_string());
            let mut substitutions = lammps_values(&lammps, tracker.model().directory());
            substitutions.extend(values([
                ("out_path", out.display().to_string()),
                ("lammps_inps_path", analysis.lammps_inps_path.display().to_string()),
                ("pps_python_path", analysis.pps_python_path.display().to_string()),
                ("ref_data_path", analysis.ref_data_path.display().to_string()),
                ("email", analysis.email.clone()),
            ]));

            gen_from_template(
                &self.settings.templates.properties_submit(),
                &substitutions,
                &out.join(SUBMIT_NAME),
            )
            .for_candidate(stage, Candidate::Index(index))?;
        }

        let count = u32::try_from(candidates.len()).unwrap_or(u32::MAX);
        let mut manager = DispatcherManager::new(
            self.settings.clone(),
            StageType::Simulation,
            Some(self.model),
        );
        manager
            .set_job(
                vec![format!("bash {SUBMIT_NAME}")],
                &root,
                ResourceHints::default().with_email(analysis.email.clone()),
                Some(ArrayIndices::up_to(count).in_stage(stage)?),
                self.dependency,
            )
            .in_stage(stage)?;
        let handle = manager.dispatch_job().in_stage(stage)?;
        check_status(stage, manager.wait_job())?;
        info!(candidates = count, job_id = %handle.id, "Property simulations finished");

        Ok(())
    }
}
