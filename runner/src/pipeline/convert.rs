use super::{check_status, Candidate, InStage, PipelineError, Sequencer, Stage};
use crate::{
    descriptor::StageType,
    ingest::IngestorError,
    manager::DispatcherFactory,
    models::{self, Conversion},
    template::{gen_from_template, values},
};
use potline_analysis::ModelTracker;
use tracing::{info, instrument};

/// LAMMPS include file defining the pair style of a candidate
pub(super) const POTENTIAL_NAME: &str = "potential.in";

impl Sequencer {
    /// Convert every candidate into a LAMMPS potential in one watch job,
    /// then render its `potential.in`
    #[instrument(level = "debug", skip(self, candidates))]
    pub(super) fn convert(&mut self, candidates: &[ModelTracker]) -> Result<(), PipelineError> {
        let stage = Stage::Convert;
        let conversions = (1u32..)
            .zip(candidates)
            .map(|(index, tracker)| {
                models::conversion(
                    self.model,
                    tracker.model().directory(),
                    &self.config.general.commands,
                )
                .for_candidate(stage, Candidate::Index(index))
            })
            .collect::<Result<Vec<Conversion>, _>>()?;

        let commands = candidates
            .iter()
            .zip(&conversions)
            .filter_map(|(tracker, conversion)| {
                conversion.command.as_ref().map(|command| {
                    format!("(cd {} && {command})", tracker.model().directory().display())
                })
            })
            .collect::<Vec<_>>();

        if commands.is_empty() {
            info!(model = %self.model, "Nothing to convert");
        } else {
            let factory = DispatcherFactory::new(self.settings.clone(), StageType::Watch);
            let spec = factory
                .spec(&self.sweep, Some(self.model))
                .with_dependency(self.dependency);
            let mut dispatcher = factory.build(&spec, commands).in_stage(stage)?;
            let handle = dispatcher.dispatch().in_stage(stage)?;
            check_status(stage, dispatcher.wait())?;
            self.dependency = handle.id.scheduler_id();
        }

        for ((index, tracker), conversion) in (1u32..).zip(candidates).zip(&conversions) {
            let candidate = Candidate::Index(index);
            if !conversion.potential.exists() {
                return Err(IngestorError::MissingArtifact(conversion.potential.clone()))
                    .for_candidate(stage, candidate);
            }

            let potential = gen_from_template(
                &self.settings.templates.potential(),
                &values([
                    ("pstyle", conversion.pair_style.to_owned()),
                    ("yace_path", conversion.potential.display().to_string()),
                ]),
                &tracker.model().directory().join(POTENTIAL_NAME),
            )
            .for_candidate(stage, candidate)?;
            info!(candidate = %tracker.id(), ?potential, "Converted candidate");
        }

        Ok(())
    }
}
