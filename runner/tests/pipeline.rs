//! Local end-to-end run with shell stand-ins for the fitting programs.

use potline_analysis::{discovery, ModelKind, ModelTracker};
use potline_runner::{
    config::PipelineConfig,
    manager::DispatchSettings,
    pipeline::{Candidate, Sequencer, Stage, StageSelection},
    sync::CancellationToken,
};
use std::{fs, path::Path};

const CONFIG: &str = r#"
general:
  sweep_path: sweep
  model: pace
  best_n_models: 2
  templates: TEMPLATES
  commands:
    fit: >-
      c=$(awk '/^cutoff:/ {print $2}' model_config.yaml)
      && printf 'rmse_epa rmse_f_comp\n%s %s\n' "$c" "$c" > test_metrics.txt
    deep_fit: >-
      grep -q 'maxiter: 50' model_config.yaml
      && c=$(awk '/^cutoff:/ {print $2 / 2}' model_config.yaml)
      && printf 'rmse_epa rmse_f_comp\n%s %s\n' "$c" "$c" > test_metrics.txt
    convert: touch pace.yace
optimizer:
  energy_weight: 0.6
  max_iter: 2
  n_points: 3
  seed: 11
  parameters:
    cutoff: { kind: float, low: 4.0, high: 8.0 }
  model_config:
    cutoff: 6.0
    fit:
      maxiter: 10
deep_train:
  max_epochs: 50
"#;

fn cutoff(tracker: &ModelTracker) -> f64 {
    tracker.parameters()["cutoff"].as_f64().unwrap()
}

fn sequencer(dir: &Path, config: &str, stages: &StageSelection) -> Sequencer {
    let templates = Path::new(env!("CARGO_MANIFEST_DIR")).join("templates");
    let path = dir.join("potline.yaml");
    fs::write(
        &path,
        config.replace("TEMPLATES", &templates.display().to_string()),
    )
    .unwrap();

    let config = PipelineConfig::load(&path).unwrap();
    config.preflight_checks(stages.stages()).unwrap();
    let settings = DispatchSettings::from_config(&config, CancellationToken::new()).unwrap();

    Sequencer::new(config, settings).unwrap()
}

#[test]
fn search_to_conversion_on_the_local_shell() {
    let dir = tempfile::tempdir().unwrap();
    let stages = StageSelection::without(&[Stage::Inference, Stage::Properties]);
    let mut sequencer = sequencer(dir.path(), CONFIG, &stages);
    // deep training left behind by an earlier sweep
    let stale = dir.path().join("sweep/deep_train/3");
    fs::create_dir_all(&stale).unwrap();
    fs::write(
        stale.join("potline_info.yaml"),
        "model: pacemaker\niteration: 9\nsubiteration: 9\nenergy_error: 0.0\nforce_error: 0.0\n",
    )
    .unwrap();

    sequencer.run(&stages).unwrap();

    let sweep = dir.path().join("sweep");
    let search = sweep.join("hyper_search");
    for table in [
        "loss_function_errors.csv",
        "parameters.csv",
        "loss_function_errors_final.txt",
        "parameters_final.txt",
    ] {
        assert!(search.join(table).is_file(), "{table} is missing");
    }
    let rows = fs::read_to_string(search.join("parameters.csv")).unwrap();
    assert_eq!(rows.lines().count(), 1 + 6);

    let mut searched = discovery::load_trackers(ModelKind::Pace, &search).unwrap();
    assert_eq!(searched.len(), 6);
    searched.sort_by(|a, b| cutoff(a).total_cmp(&cutoff(b)));

    let deep = sweep.join("deep_train");
    for (index, expected) in (1..=2).zip(&searched) {
        let directory = deep.join(index.to_string());
        let tracker = ModelTracker::from_path(ModelKind::Pace, &directory).unwrap();

        assert_eq!(tracker.id(), expected.id());
        let losses = tracker.validation_losses().unwrap();
        assert!((losses.energy - cutoff(expected) / 2.0).abs() < 1e-4);

        let potential = fs::read_to_string(directory.join("potential.in")).unwrap();
        assert!(potential.starts_with("pair_style      pace\n"));
        assert!(potential.contains(&directory.join("pace.yace").display().to_string()));
        assert!(potential.contains("${element}"));
    }
    assert!(!deep.join("3").exists());

    // later stages pick up the deep training results
    let selected = sequencer.select(false).unwrap();
    assert_eq!(selected.len(), 2);
    assert_eq!(selected[0].model().directory(), deep.join("1"));
}

#[test]
fn failing_fit_reports_the_array_index() {
    let dir = tempfile::tempdir().unwrap();
    let stages = StageSelection::only(Stage::Search);
    let config = CONFIG.replace(
        "    fit: >-\n      c=",
        "    fit: >-\n      test \"$(basename \"$PWD\")\" != 2\n      && c=",
    );
    assert_ne!(config, CONFIG);
    let mut sequencer = sequencer(dir.path(), &config, &stages);

    let error = sequencer.run(&stages).unwrap_err();

    assert_eq!(error.stage, Stage::Search);
    assert_eq!(error.candidate, Some(Candidate::Index(2)));
    let iteration = dir.path().join("sweep/hyper_search/1");
    assert!(iteration.join("1/test_metrics.txt").is_file());
    // the array stops at the first failing task
    assert!(!iteration.join("3/test_metrics.txt").exists());
    assert!(!dir.path().join("sweep/hyper_search/2").exists());
}
