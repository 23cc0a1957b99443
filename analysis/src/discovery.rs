use crate::{tracker::RECORD_NAME, AnalysisError, ModelKind, ModelTracker};
use globset::{Glob, GlobMatcher};
use ignore::WalkBuilder;
use itertools::Itertools;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const SEARCH_DIR_NAME: &str = "hyper_search";
pub const DEEP_TRAIN_DIR_NAME: &str = "deep_train";

// <stage>/<iteration>/<subiteration>/<record>
const MAX_DEPTH: usize = 3;

fn record_matcher() -> Result<GlobMatcher, AnalysisError> {
    Ok(Glob::new(&format!("**/{RECORD_NAME}"))?.compile_matcher())
}

/// Directories below `root` that hold a candidate record
pub fn candidate_directories(root: &Path) -> Result<Vec<PathBuf>, AnalysisError> {
    let matcher = record_matcher()?;

    let directories = WalkBuilder::new(root)
        .standard_filters(false)
        .max_depth(Some(MAX_DEPTH))
        .sort_by_file_name(|a, b| a.cmp(b))
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Failed to search for candidates below {root:?}: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
        .filter(|entry| matcher.is_match(entry.path()))
        .filter_map(|entry| entry.path().parent().map(Path::to_path_buf))
        .collect_vec();

    debug!("Found {} candidate records below {root:?}", directories.len());

    Ok(directories)
}

/// Load every candidate below `root`, ordered by (iteration, subiteration)
pub fn load_trackers(kind: ModelKind, root: &Path) -> Result<Vec<ModelTracker>, AnalysisError> {
    let directories = candidate_directories(root)?;
    if directories.is_empty() {
        return Err(AnalysisError::NoCandidates(root.to_path_buf()));
    }

    let mut trackers = directories
        .par_iter()
        .map(|directory| ModelTracker::from_path(kind, directory))
        .collect::<Result<Vec<_>, _>>()?;
    trackers.sort_by_key(|tracker| tracker.id());

    Ok(trackers)
}

/// Stage directory the candidates of a sweep are read from: the deep
/// training results once they exist, the search results otherwise
pub fn candidate_root(sweep: &Path, force_from_search: bool) -> PathBuf {
    let deep = sweep.join(DEEP_TRAIN_DIR_NAME);
    if !force_from_search && deep.is_dir() {
        deep
    } else {
        sweep.join(SEARCH_DIR_NAME)
    }
}

pub fn model_trackers(
    sweep: &Path,
    kind: ModelKind,
    force_from_search: bool,
) -> Result<Vec<ModelTracker>, AnalysisError> {
    let root = candidate_root(sweep, force_from_search);
    info!("Loading {kind} candidates from {root:?}");

    load_trackers(kind, &root)
}
