use super::{Cluster, JobSpec, SchedulerOptions, StageType};
use potline_analysis::ModelKind;

/// Nodes known to fail GPU jobs on snellius
const FAULTY_NODES: &str = "gcn25,gcn56";

#[derive(Clone, Copy, Debug)]
enum Cpus {
    Fixed(u32),
    Hint,
    HintOr(u32),
}

#[derive(Clone, Copy, Debug)]
struct Gpu {
    count: u32,
    partition: &'static str,
    exclude: Option<&'static str>,
}

/// Fixed resource request of a (cluster, stage type, model) combination
#[derive(Clone, Copy, Debug)]
pub(super) struct Preset {
    time: &'static str,
    mem: &'static str,
    ntasks: u32,
    cpus: Cpus,
    gpu: Option<Gpu>,
    partition: Option<&'static str>,
    mail: bool,
}

const SNELLIUS_GPU: Gpu = Gpu {
    count: 1,
    partition: "gpu_a100",
    exclude: Some(FAULTY_NODES),
};

const HABROK_GPU: Gpu = Gpu {
    count: 1,
    partition: "gpu",
    exclude: None,
};

const SNELLIUS_INF: Preset = Preset {
    time: "3:00:00",
    mem: "50G",
    ntasks: 1,
    cpus: Cpus::Hint,
    gpu: Some(SNELLIUS_GPU),
    partition: None,
    mail: false,
};

const SNELLIUS_SIM: Preset = Preset {
    cpus: Cpus::HintOr(16),
    mail: true,
    ..SNELLIUS_INF
};

const SNELLIUS_FIT: Preset = Preset {
    time: "12:00:00",
    cpus: Cpus::Fixed(16),
    ..SNELLIUS_INF
};

const SNELLIUS_DEEP: Preset = Preset {
    time: "36:00:00",
    ..SNELLIUS_FIT
};

const SNELLIUS_WATCH: Preset = Preset {
    time: "119:00:00",
    mem: "50G",
    ntasks: 1,
    cpus: Cpus::Fixed(16),
    gpu: None,
    partition: None,
    mail: false,
};

const HABROK_FIT: Preset = Preset {
    time: "12:00:00",
    mem: "32G",
    ntasks: 1,
    cpus: Cpus::Fixed(8),
    gpu: Some(HABROK_GPU),
    partition: None,
    mail: false,
};

const HABROK_DEEP: Preset = Preset {
    time: "36:00:00",
    ..HABROK_FIT
};

const HABROK_WATCH: Preset = Preset {
    time: "119:00:00",
    mem: "8G",
    ntasks: 1,
    cpus: Cpus::Fixed(1),
    gpu: None,
    partition: Some("regular"),
    mail: false,
};

pub(super) fn lookup(
    cluster: Cluster,
    stage: StageType,
    model: Option<ModelKind>,
) -> Option<Preset> {
    match (cluster, stage) {
        (Cluster::Snellius, StageType::Inference) => Some(SNELLIUS_INF),
        (Cluster::Snellius, StageType::Simulation) => Some(SNELLIUS_SIM),
        (Cluster::Snellius, StageType::Fit) => Some(SNELLIUS_FIT),
        (Cluster::Snellius, StageType::DeepFit) => Some(SNELLIUS_DEEP),
        (Cluster::Snellius, StageType::Watch) => Some(SNELLIUS_WATCH),
        (Cluster::Habrok, StageType::Fit) => habrok_model(model).then_some(HABROK_FIT),
        (Cluster::Habrok, StageType::DeepFit) => habrok_model(model).then_some(HABROK_DEEP),
        (Cluster::Habrok, StageType::Watch) => Some(HABROK_WATCH),
        (Cluster::Habrok, StageType::Inference | StageType::Simulation) => None,
    }
}

// no mace environment is set up on habrok
fn habrok_model(model: Option<ModelKind>) -> bool {
    matches!(model, Some(ModelKind::Pace | ModelKind::Grace))
}

impl Preset {
    pub(super) fn options(&self, spec: &JobSpec) -> SchedulerOptions {
        let out = spec.out_path.display();
        let mut options = SchedulerOptions::default();

        options.insert("job-name", spec.job_name());
        options.insert("chdir", out.to_string());
        options.insert("output", format!("{out}/{}_%j.out", spec.stage));
        options.insert("error", format!("{out}/{}_%j.err", spec.stage));
        options.insert("time", self.time);
        options.insert("mem", self.mem);
        options.insert("nodes", spec.hints.nodes.unwrap_or(1).to_string());
        options.insert("ntasks", self.ntasks.to_string());

        let cpus = match self.cpus {
            Cpus::Fixed(cpus) => cpus,
            Cpus::Hint => spec.hints.cpus.unwrap_or(1),
            Cpus::HintOr(default) => spec.hints.cpus.unwrap_or(default),
        };
        options.insert("cpus-per-task", cpus.to_string());

        if let Some(gpu) = self.gpu {
            options.insert("gpus", gpu.count.to_string());
            options.insert("partition", gpu.partition);
            if let Some(exclude) = gpu.exclude {
                options.insert("exclude", exclude);
            }
        } else if let Some(partition) = self.partition {
            options.insert("partition", partition);
        }

        if let (true, Some(email)) = (self.mail, &spec.hints.email) {
            options.insert("mail-type", "ALL");
            options.insert("mail-user", email.as_str());
        }

        options
    }
}

pub(super) enum Setup {
    Source(&'static str),
    Probe(&'static str),
}

fn conda(model: ModelKind) -> Setup {
    Setup::Source(match model {
        ModelKind::Pace => "conda_pace.sh",
        ModelKind::Mace => "conda_mace.sh",
        ModelKind::Grace => "conda_grace.sh",
    })
}

fn gpu_probe(model: ModelKind) -> Setup {
    Setup::Probe(match model {
        ModelKind::Mace => "pyt_gpu_test.py",
        ModelKind::Pace | ModelKind::Grace => "tf_gpu_test.py",
    })
}

pub(super) fn setup_scripts(
    cluster: Cluster,
    stage: StageType,
    model: ModelKind,
) -> Option<Vec<Setup>> {
    let mpi = || {
        let mut scripts = vec![Setup::Source("module_mpi.sh")];
        if model == ModelKind::Mace {
            scripts.push(Setup::Source("module_mkl.sh"));
        }
        scripts
    };

    match (cluster, stage) {
        (Cluster::Snellius, StageType::Fit | StageType::DeepFit) => {
            Some(vec![conda(model), gpu_probe(model)])
        }
        (Cluster::Snellius, StageType::Inference) => Some(mpi()),
        (Cluster::Snellius, StageType::Simulation) => {
            let mut scripts = mpi();
            scripts.push(Setup::Source("module_prop_sim.sh"));
            Some(scripts)
        }
        (Cluster::Habrok, StageType::Fit | StageType::DeepFit) => {
            habrok_model(Some(model)).then(|| vec![conda(model), gpu_probe(model)])
        }
        (_, StageType::Watch) => Some(vec![conda(model)]),
        (Cluster::Habrok, StageType::Inference | StageType::Simulation) => None,
    }
}
