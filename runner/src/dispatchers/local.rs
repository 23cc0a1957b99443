use super::{DispatchError, DispatchState, Dispatcher, JobHandle, JobId, TerminalStatus, WaitPolicy};
use crate::descriptor::{command_body, ArrayIndices};
use itertools::Itertools;
use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

pub const STDOUT_NAME: &str = "local.out";
pub const STDERR_NAME: &str = "local.err";

const SLICE: Duration = Duration::from_millis(100);
const STDERR_TAIL: usize = 20;

/// Runs the command sequence synchronously on the local shell, one command
/// per line under `set -e`. Dispatching and running to completion are the
/// same event
#[derive(Debug)]
pub struct LocalDispatcher {
    commands: Vec<String>,
    workdir: PathBuf,
    shell: String,
    array: Option<ArrayIndices>,
    policy: WaitPolicy,
    state: DispatchState,
}

fn append(path: &Path) -> Result<File, DispatchError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| DispatchError::Workdir {
            path: path.to_path_buf(),
            source,
        })
}

fn stderr_tail(path: &Path) -> String {
    fs::read_to_string(path)
        .map(|content| {
            let lines = content.lines().collect_vec();
            lines[lines.len().saturating_sub(STDERR_TAIL)..].join("\n")
        })
        .unwrap_or_default()
}

impl LocalDispatcher {
    pub fn new(commands: Vec<String>, workdir: impl Into<PathBuf>, policy: WaitPolicy) -> Self {
        Self {
            commands,
            workdir: workdir.into(),
            shell: "bash".to_owned(),
            array: None,
            policy,
            state: DispatchState::Unsubmitted,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Run the sequence once per index in `<workdir>/<index>`
    pub fn with_array(mut self, array: Option<ArrayIndices>) -> Self {
        self.array = array;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn spawn(&self, directory: &Path, index: Option<u32>) -> Result<Child, DispatchError> {
        fs::create_dir_all(directory).map_err(|source| DispatchError::Workdir {
            path: directory.to_path_buf(),
            source,
        })?;

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(command_body(&self.commands))
            .current_dir(directory)
            .stdin(Stdio::null())
            .stdout(append(&directory.join(STDOUT_NAME))?)
            .stderr(append(&directory.join(STDERR_NAME))?);
        // same variable a scheduler array task sees
        if let Some(index) = index {
            command.env("SLURM_ARRAY_TASK_ID", index.to_string());
        }

        command.spawn().map_err(|source| DispatchError::Spawn {
            program: self.shell.clone(),
            source,
        })
    }

    fn stop(child: &mut Child) {
        if let Err(e) = child.kill().and_then(|_| child.wait()) {
            warn!("Failed to stop local job: {e}");
        }
    }

    /// Run the whole sequence in `directory` and wait for it
    fn run(&self, directory: &Path, index: Option<u32>, start: Instant) -> Result<(), DispatchError> {
        let mut child = self.spawn(directory, index)?;
        debug!(directory = ?directory, index, pid = child.id(), "Started local job");

        loop {
            let waited = child.wait_timeout(SLICE).map_err(|source| DispatchError::Spawn {
                program: self.shell.clone(),
                source,
            })?;

            if let Some(status) = waited {
                if status.success() {
                    return Ok(());
                }

                return Err(DispatchError::ExecutionFailed {
                    exit_code: status.code(),
                    index,
                    stderr: stderr_tail(&directory.join(STDERR_NAME)),
                });
            }

            if self.policy.token.is_cancelled() {
                Self::stop(&mut child);
                return Err(DispatchError::Cancelled(JobId::Local));
            }

            if let Some(deadline) = self.policy.deadline {
                if start.elapsed() >= deadline {
                    Self::stop(&mut child);
                    return Err(DispatchError::TimedOut(JobId::Local));
                }
            }
        }
    }

    fn run_all(&self) -> Result<(), DispatchError> {
        let start = Instant::now();

        match &self.array {
            None => self.run(&self.workdir, None, start),
            Some(array) => array
                .iter()
                .try_for_each(|index| {
                    self.run(&self.workdir.join(index.to_string()), Some(index), start)
                }),
        }
    }
}

impl Dispatcher for LocalDispatcher {
    #[instrument(level = "debug", skip(self), fields(workdir = ?self.workdir))]
    fn dispatch(&mut self) -> Result<JobHandle, DispatchError> {
        if self.state != DispatchState::Unsubmitted {
            return Err(DispatchError::AlreadyDispatched);
        }

        let handle = JobHandle::new(JobId::Local);
        let result = self.run_all();
        let status = match &result {
            Ok(()) => TerminalStatus::Succeeded,
            Err(DispatchError::ExecutionFailed { exit_code, .. }) => TerminalStatus::Failed {
                exit_code: *exit_code,
            },
            Err(_) => TerminalStatus::Failed { exit_code: None },
        };
        self.state = DispatchState::Completed { handle, status };

        result?;
        info!(workdir = ?self.workdir, "Local job finished");

        Ok(handle)
    }

    fn wait(&mut self) -> Result<TerminalStatus, DispatchError> {
        match self.state {
            DispatchState::Unsubmitted => Err(DispatchError::NotYetDispatched),
            DispatchState::Submitted(_) => Ok(TerminalStatus::Left),
            DispatchState::Completed { status, .. } => Ok(status),
        }
    }

    fn state(&self) -> &DispatchState {
        &self.state
    }

    fn commands(&self) -> &[String] {
        &self.commands
    }

    fn push_command(&mut self, command: String) -> Result<(), DispatchError> {
        if self.state != DispatchState::Unsubmitted {
            return Err(DispatchError::AlreadyDispatched);
        }

        self.commands.push(command);
        Ok(())
    }
}
