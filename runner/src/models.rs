//! What differs between the fitting frameworks: training commands, epoch
//! budget keys and conversion into a LAMMPS potential.

use crate::{
    config::CommandOverrides,
    ingest::{grace, IngestorError},
    search::{set_path, SearchError},
};
use potline_analysis::{model::CONFIG_NAME, ModelKind};
use serde_yaml::{Mapping, Value};
use std::{
    fs,
    path::{Path, PathBuf},
};

const MACE_DEFAULT_NAME: &str = "MACE_model";

/// Training command, run inside the candidate directory.
/// `deep` continues from the state a search fit left behind.
pub fn fit_command(kind: ModelKind, deep: bool, overrides: &CommandOverrides) -> String {
    let replaced = if deep { &overrides.deep_fit } else { &overrides.fit };
    if let Some(command) = replaced {
        return command.clone();
    }

    match (kind, deep) {
        (ModelKind::Mace, false) => format!("mace_run_train --config {CONFIG_NAME}"),
        (ModelKind::Mace, true) => format!("mace_run_train --config {CONFIG_NAME} --restart_latest"),
        (ModelKind::Grace, false) => format!("gracemaker {CONFIG_NAME}"),
        (ModelKind::Grace, true) => format!("gracemaker {CONFIG_NAME} -r"),
        (ModelKind::Pace, false) => format!("pacemaker {CONFIG_NAME}"),
        (ModelKind::Pace, true) => format!("pacemaker {CONFIG_NAME} -p output_potential.yaml"),
    }
}

/// Key of the epoch budget in the model configuration
pub fn epoch_path(kind: ModelKind) -> &'static str {
    match kind {
        ModelKind::Mace => "max_num_epochs",
        ModelKind::Pace | ModelKind::Grace => "fit.maxiter",
    }
}

pub fn set_epochs(config: &mut Mapping, kind: ModelKind, epochs: u64) -> Result<(), SearchError> {
    set_path(config, epoch_path(kind), Value::from(epochs))
}

/// Extra LAMMPS command line arguments the potential needs
pub fn lammps_params(kind: ModelKind) -> &'static str {
    match kind {
        ModelKind::Mace => "-k on g 1 -sf kk -pk kokkos newton on neigh half",
        ModelKind::Pace | ModelKind::Grace => "",
    }
}

/// How a fitted candidate becomes a LAMMPS potential
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conversion {
    /// Run inside the candidate directory, nothing to run for grace
    pub command: Option<String>,
    /// File or directory LAMMPS loads
    pub potential: PathBuf,
    pub pair_style: &'static str,
}

fn mace_name(directory: &Path) -> Result<String, IngestorError> {
    let path = directory.join(CONFIG_NAME);
    let content = fs::read_to_string(&path)
        .map_err(|_| IngestorError::MissingArtifact(path.clone()))?;
    let config: Mapping = serde_yaml::from_str(&content)
        .map_err(|source| IngestorError::Yaml { path, source })?;

    Ok(config
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(MACE_DEFAULT_NAME)
        .to_owned())
}

pub fn conversion(
    kind: ModelKind,
    directory: &Path,
    overrides: &CommandOverrides,
) -> Result<Conversion, IngestorError> {
    let mut conversion = match kind {
        ModelKind::Pace => {
            let potential = directory.join("pace.yace");
            Conversion {
                command: Some(format!(
                    "pace_yaml2yace -o {} {}",
                    potential.display(),
                    directory.join("output_potential.yaml").display()
                )),
                potential,
                pair_style: "pace",
            }
        }
        ModelKind::Mace => {
            let name = mace_name(directory)?;
            Conversion {
                command: Some(format!(
                    "python -m mace.cli.create_lammps_model {}",
                    directory.join(format!("{name}.model")).display()
                )),
                potential: directory.join(format!("{name}.model-lammps.pt")),
                pair_style: "mace no_domain_decomposition",
            }
        }
        ModelKind::Grace => Conversion {
            command: None,
            potential: grace::seed_directory(directory)?.join("final_model"),
            pair_style: "grace pad_verbose",
        },
    };

    if let Some(command) = &overrides.convert {
        conversion.command = Some(command.clone());
    }

    Ok(conversion)
}
