use super::{
    check_status, create_dir, reset_dir, write_model_config, Candidate, InStage, PipelineError,
    Sequencer, Stage,
};
use crate::{
    descriptor::{ArrayIndices, ResourceHints, StageType},
    ingest::Ingestors,
    manager::DispatcherManager,
    models,
    search::{self, apply_parameters, SearchStrategy},
};
use potline_analysis::{
    discovery::SEARCH_DIR_NAME, CandidateId, LossLogger, ModelReference, ModelTracker,
};
use tracing::{debug, info, instrument};

impl Sequencer {
    /// Hyperparameter search: one array job per iteration over `n_points`
    /// fresh candidates, losses reported back to the search strategy
    #[instrument(level = "debug", skip(self))]
    pub(super) fn hyper_search(&mut self) -> Result<Vec<ModelTracker>, PipelineError> {
        let stage = Stage::Search;
        let optimizer = self.config.optimizer().in_stage(stage)?;
        let root = self.sweep.join(SEARCH_DIR_NAME);
        reset_dir(&root).in_stage(stage)?;

        let logger = LossLogger::create(&root, Some(optimizer.parameters.keys().cloned().collect()))
            .in_stage(stage)?;
        let mut strategy = search::strategy(&optimizer).in_stage(stage)?;
        let mut manager =
            DispatcherManager::new(self.settings.clone(), StageType::Fit, Some(self.model));
        let command = models::fit_command(self.model, false, &self.config.general.commands);
        let ingestor = Ingestors::for_model(self.model);
        let mut trackers = Vec::new();

        info!(
            strategy = strategy.name(),
            iterations = optimizer.max_iter,
            points = optimizer.n_points,
            "Starting hyperparameter search"
        );

        for iteration in 1..=optimizer.max_iter {
            let out = root.join(iteration.to_string());
            let mut batch = Vec::new();

            for (subiteration, parameters) in
                (1..).zip(strategy.suggest(optimizer.n_points as usize))
            {
                let id = CandidateId::new(iteration, subiteration);
                let directory = out.join(subiteration.to_string());
                create_dir(&directory).for_candidate(stage, Candidate::Id(id))?;

                let config = apply_parameters(&optimizer.model_config, &parameters)
                    .for_candidate(stage, Candidate::Id(id))?;
                write_model_config(&directory, &config).for_candidate(stage, Candidate::Id(id))?;

                let tracker =
                    ModelTracker::new(ModelReference::new(self.model, &directory), id, parameters);
                tracker.save().for_candidate(stage, Candidate::Id(id))?;
                batch.push(tracker);
            }

            manager
                .set_job(
                    vec![command.clone()],
                    &out,
                    ResourceHints::default(),
                    Some(ArrayIndices::up_to(optimizer.n_points).in_stage(stage)?),
                    self.dependency,
                )
                .in_stage(stage)?;
            let handle = manager.dispatch_job().in_stage(stage)?;
            check_status(stage, manager.wait_job())?;
            self.dependency = handle.id.scheduler_id();

            for tracker in batch.iter_mut() {
                let candidate = Candidate::Id(tracker.id());
                let report = ingestor
                    .ingest(tracker.model().directory())
                    .for_candidate(stage, candidate)?;
                tracker.attach_losses(report.validation, report.train);
                tracker.save().for_candidate(stage, candidate)?;

                let loss = tracker
                    .total_validation_loss(optimizer.energy_weight)
                    .for_candidate(stage, candidate)?;
                strategy.report(tracker.parameters(), loss);
                debug!(candidate = %tracker.id(), loss, "Collected candidate");

                logger.write_error_row(tracker).in_stage(stage)?;
                logger
                    .write_param_row(tracker.id(), loss, tracker)
                    .in_stage(stage)?;
            }

            info!(iteration, job_id = %handle.id, "Finished search iteration");
            trackers.extend(batch);
        }

        logger.tabulate_final_results().in_stage(stage)?;
        Ok(trackers)
    }
}
