use super::{
    check_status, create_dir, read_model_config, reset_dir, write_model_config, Candidate,
    InStage, PipelineError, Sequencer, Stage, StageFailure,
};
use crate::{
    config::{DeepTrainConfig, Section},
    descriptor::{ArrayIndices, ResourceHints, StageType},
    ingest::Ingestors,
    manager::DispatcherManager,
    models,
};
use ignore::WalkBuilder;
use potline_analysis::{discovery::DEEP_TRAIN_DIR_NAME, LossLogger, ModelTracker};
use std::{fs, path::Path};
use tracing::{debug, info, instrument};

/// Recursive copy of a candidate directory, hidden files included
fn copy_candidate(source: &Path, target: &Path) -> Result<(), StageFailure> {
    for entry in WalkBuilder::new(source).standard_filters(false).build() {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let destination = target.join(relative);

        if entry.file_type().map_or(false, |kind| kind.is_dir()) {
            create_dir(&destination)?;
        } else {
            fs::copy(entry.path(), &destination).map_err(StageFailure::io(&destination))?;
        }
    }

    debug!(?source, ?target, "Copied candidate");
    Ok(())
}

impl Sequencer {
    /// Continue training of the survivors in `deep_train/<k>` with the
    /// epoch budget of the deep training section, one array job for all
    #[instrument(level = "debug", skip(self, survivors))]
    pub(super) fn deep_train(
        &mut self,
        survivors: &[ModelTracker],
    ) -> Result<Vec<ModelTracker>, PipelineError> {
        let stage = Stage::DeepTrain;
        let deep: DeepTrainConfig = self.config.section(Section::DeepTrain).in_stage(stage)?;
        let energy_weight = self.energy_weight(stage)?;
        let root = self.sweep.join(DEEP_TRAIN_DIR_NAME);
        reset_dir(&root).in_stage(stage)?;

        let keys = survivors
            .first()
            .map(|tracker| tracker.parameters().keys().cloned().collect());
        let logger = LossLogger::create(&root, keys).in_stage(stage)?;

        let mut trackers = Vec::new();
        for (index, survivor) in (1u32..).zip(survivors) {
            let candidate = Candidate::Index(index);
            let directory = root.join(index.to_string());

            copy_candidate(survivor.model().directory(), &directory)
                .for_candidate(stage, candidate)?;
            let mut config = read_model_config(&directory).for_candidate(stage, candidate)?;
            models::set_epochs(&mut config, self.model, deep.max_epochs)
                .for_candidate(stage, candidate)?;
            write_model_config(&directory, &config).for_candidate(stage, candidate)?;

            let tracker = survivor.moved_to(&directory);
            tracker.save().for_candidate(stage, candidate)?;
            trackers.push(tracker);
        }

        let count = u32::try_from(trackers.len()).unwrap_or(u32::MAX);
        let mut manager =
            DispatcherManager::new(self.settings.clone(), StageType::DeepFit, Some(self.model));
        manager
            .set_job(
                vec![models::fit_command(
                    self.model,
                    true,
                    &self.config.general.commands,
                )],
                &root,
                ResourceHints::default(),
                Some(ArrayIndices::up_to(count).in_stage(stage)?),
                self.dependency,
            )
            .in_stage(stage)?;
        let handle = manager.dispatch_job().in_stage(stage)?;
        check_status(stage, manager.wait_job())?;
        self.dependency = handle.id.scheduler_id();

        let ingestor = Ingestors::for_model(self.model);
        for (index, tracker) in (1u32..).zip(trackers.iter_mut()) {
            let candidate = Candidate::Index(index);
            let report = ingestor
                .ingest(tracker.model().directory())
                .for_candidate(stage, candidate)?;
            tracker.attach_losses(report.validation, report.train);
            tracker.save().for_candidate(stage, candidate)?;

            let loss = tracker
                .total_validation_loss(energy_weight)
                .for_candidate(stage, candidate)?;
            logger.write_error_row(tracker).in_stage(stage)?;
            if logger.parameter_path().is_file() {
                logger
                    .write_param_row(tracker.id(), loss, tracker)
                    .in_stage(stage)?;
            }
        }

        logger.tabulate_final_results().in_stage(stage)?;
        info!(candidates = trackers.len(), job_id = %handle.id, "Deep training finished");

        Ok(trackers)
    }
}
