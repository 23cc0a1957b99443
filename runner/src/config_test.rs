use super::*;
use std::fs;

const CONFIG: &str = r#"
general:
  sweep_path: sweep
  model: GRACE
  cluster: habrok
  best_n_models: 3
  templates: templates
  poll: { interval_secs: 30, deadline_secs: 3600 }
  job:
    modules: [/opt/env.sh]
    options: { account: proj7, qos: 2 }
optimizer:
  energy_weight: 0.7
  max_iter: 2
  n_points: 4
  strategy: exploit
  parameters:
    cutoff: { kind: float, low: 5.0, high: 7.0 }
deep_train:
  max_epochs: 500
lammps:
  lammps_bin_path: /opt/lmp
  lammps_lattice: bcc
  lammps_lattice_constant: 3.16
"#;

fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("templates")).unwrap();
    let path = dir.path().join("potline.yaml");
    fs::write(&path, content).unwrap();
    (dir, path)
}

#[test]
fn load_resolves_paths_against_config() {
    let (dir, path) = write_config(CONFIG);
    let config = PipelineConfig::load(&path).unwrap();

    assert_eq!(config.general.sweep_path, dir.path().join("sweep"));
    assert_eq!(config.general.templates, dir.path().join("templates"));
    assert_eq!(config.general.shell, "bash");
    assert!(config.general.accounting);
    assert_eq!(config.general.poll.interval(), Duration::from_secs(30));
    assert_eq!(config.general.poll.deadline(), Some(Duration::from_secs(3600)));
    assert_eq!(config.cluster().unwrap(), Some(Cluster::Habrok));
    assert_eq!(config.model().unwrap(), ModelKind::Grace);
}

#[test]
fn job_additions_render_as_commands_and_options() {
    let (_dir, path) = write_config(CONFIG);
    let job = PipelineConfig::load(&path).unwrap().general.job;

    assert_eq!(job.setup_commands(), ["source /opt/env.sh"]);
    let options = job.extra_options();
    assert_eq!(options["account"], "proj7");
    assert_eq!(options["qos"], "2");
}

#[test]
fn sections_are_typed_on_demand() {
    let (_dir, path) = write_config(CONFIG);
    let config = PipelineConfig::load(&path).unwrap();

    let optimizer = config.optimizer().unwrap();
    assert_eq!(optimizer.strategy, StrategyKind::Exploit);
    assert_eq!(optimizer.seed, 42);
    assert_eq!(optimizer.n_points, 4);

    let lammps: LammpsConfig = config.section(Section::Lammps).unwrap();
    assert_eq!(lammps.lammps_bin_path, PathBuf::from("/opt/lmp"));
    assert_eq!(yaml_scalar(&lammps.values["lammps_lattice_constant"]), "3.16");
    assert_eq!(yaml_scalar(&lammps.values["lammps_lattice"]), "bcc");

    assert!(matches!(
        config.section::<InferenceConfig>(Section::Inference),
        Err(ConfigErrors::MissingSection(Section::Inference))
    ));
}

#[test]
fn invalid_sections_name_the_section() {
    let (_dir, path) = write_config(&CONFIG.replace("max_epochs: 500", "max_epochs: many"));
    let config = PipelineConfig::load(&path).unwrap();

    let error = config.section::<DeepTrainConfig>(Section::DeepTrain).unwrap_err();
    assert!(matches!(
        error,
        ConfigErrors::InvalidSection {
            section: Section::DeepTrain,
            ..
        }
    ));
    assert!(error_chain(&error).starts_with("Configuration section `deep_train` is invalid: "));
}

#[test]
fn unknown_general_fields_are_rejected() {
    let (_dir, path) = write_config(&CONFIG.replace("best_n_models", "best_models"));

    assert!(matches!(
        PipelineConfig::load(&path),
        Err(ConfigErrors::Parse { .. })
    ));
}

#[test]
fn preflight_checks_sections_of_enabled_stages() {
    let (_dir, path) = write_config(CONFIG);
    let config = PipelineConfig::load(&path).unwrap();

    assert!(config
        .preflight_checks(&[Stage::Search, Stage::Filter, Stage::DeepTrain])
        .is_ok());
    // no inference section
    assert!(matches!(
        config.preflight_checks(&[Stage::Inference]),
        Err(ConfigErrors::PreflightFailed)
    ));
}

#[test]
fn preflight_rejects_bad_general_values() {
    let content = CONFIG
        .replace("cluster: habrok", "cluster: lisa")
        .replace("energy_weight: 0.7", "energy_weight: 1.5");
    let (_dir, path) = write_config(&content);
    let config = PipelineConfig::load(&path).unwrap();

    assert!(matches!(
        config.preflight_checks(&[Stage::Search]),
        Err(ConfigErrors::PreflightFailed)
    ));
    assert!(matches!(
        config.cluster(),
        Err(ConfigErrors::Name(BuildError::UnsupportedCluster(_)))
    ));
}

#[test]
fn preflight_requires_template_root() {
    let (dir, path) = write_config(CONFIG);
    let config = PipelineConfig::load(&path).unwrap();
    fs::remove_dir(dir.path().join("templates")).unwrap();

    assert!(matches!(
        config.preflight_checks(&[Stage::Search]),
        Err(ConfigErrors::PreflightFailed)
    ));
}
