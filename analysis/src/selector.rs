use crate::{AnalysisError, ModelTracker};
use itertools::Itertools;
use tracing::{debug, info};

/// Keep the `n` candidates with the lowest weighted validation loss.
///
/// The result is ordered by non-decreasing loss, candidates with equal loss
/// keep their input order. Every tracker must carry validation losses.
pub fn filter_best_loss(
    trackers: Vec<ModelTracker>,
    energy_weight: f64,
    n: usize,
) -> Result<Vec<ModelTracker>, AnalysisError> {
    let total = trackers.len();
    let scored = trackers
        .into_iter()
        .map(|tracker| {
            tracker
                .total_validation_loss(energy_weight)
                .map(|loss| (loss, tracker))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let best = scored
        .into_iter()
        .sorted_by(|(left, _), (right, _)| left.total_cmp(right))
        .take(n)
        .map(|(loss, tracker)| {
            debug!(candidate = %tracker.id(), loss = loss, "Kept candidate");
            tracker
        })
        .collect_vec();

    info!(
        kept = best.len(),
        total = total,
        energy_weight = energy_weight,
        "Filtered candidates by validation loss"
    );

    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CandidateId, Losses, ModelKind, ModelReference, ParameterMap};

    fn tracker(subiteration: u32, losses: Option<Losses>) -> ModelTracker {
        let mut tracker = ModelTracker::new(
            ModelReference::new(ModelKind::Pace, format!("/sweep/1/{subiteration}")),
            CandidateId::new(1, subiteration),
            ParameterMap::new(),
        );
        if let Some(losses) = losses {
            tracker.attach_losses(losses, None);
        }
        tracker
    }

    fn ids(trackers: &[ModelTracker]) -> Vec<u32> {
        trackers.iter().map(|t| t.id().subiteration).collect()
    }

    #[test]
    fn picks_lower_weighted_loss() {
        // 0.8 * 0.1 + 0.2 * 0.2 = 0.12 against 0.8 * 0.05 + 0.2 * 0.5 = 0.14
        let trackers = vec![
            tracker(1, Some(Losses::new(0.1, 0.2))),
            tracker(2, Some(Losses::new(0.05, 0.5))),
        ];

        let best = filter_best_loss(trackers, 0.8, 1).unwrap();
        assert_eq!(ids(&best), vec![1]);
    }

    #[test]
    fn weight_changes_ranking_without_recomputation() {
        let trackers = vec![
            tracker(1, Some(Losses::new(0.1, 0.2))),
            tracker(2, Some(Losses::new(0.05, 0.5))),
        ];

        let energy_only = filter_best_loss(trackers.clone(), 1.0, 2).unwrap();
        assert_eq!(ids(&energy_only), vec![2, 1]);

        let force_only = filter_best_loss(trackers, 0.0, 2).unwrap();
        assert_eq!(ids(&force_only), vec![1, 2]);
    }

    #[test]
    fn ties_keep_discovery_order() {
        let trackers = vec![
            tracker(1, Some(Losses::new(0.3, 0.3))),
            tracker(2, Some(Losses::new(0.1, 0.1))),
            tracker(3, Some(Losses::new(0.3, 0.3))),
            tracker(4, Some(Losses::new(0.1, 0.1))),
            tracker(5, Some(Losses::new(0.3, 0.3))),
        ];

        let best = filter_best_loss(trackers, 0.5, 4).unwrap();
        assert_eq!(ids(&best), vec![2, 4, 1, 3]);
    }

    #[test]
    fn returns_at_most_available_candidates() {
        for weight in [0.0, 0.25, 0.5, 0.99, 1.0] {
            let trackers = (1..=3)
                .map(|i| tracker(i, Some(Losses::new(f64::from(4 - i), f64::from(i)))))
                .collect_vec();

            let best = filter_best_loss(trackers, weight, 10).unwrap();
            assert_eq!(best.len(), 3);

            let losses = best
                .iter()
                .map(|t| t.total_validation_loss(weight).unwrap())
                .collect_vec();
            assert!(losses.windows(2).all(|pair| pair[0] <= pair[1]));
        }

        assert!(filter_best_loss(Vec::new(), 0.5, 3).unwrap().is_empty());
    }

    #[test]
    fn missing_losses_fail_the_whole_selection() {
        let trackers = vec![
            tracker(1, Some(Losses::new(0.1, 0.2))),
            tracker(2, None),
        ];

        assert!(matches!(
            filter_best_loss(trackers, 0.5, 1),
            Err(AnalysisError::LossNotComputed(id)) if id == CandidateId::new(1, 2)
        ));
    }
}
