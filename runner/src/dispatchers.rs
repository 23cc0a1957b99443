//! Dispatchers run a command sequence either on the local shell or through
//! a batch scheduler, behind one contract.

pub mod local;
pub mod slurm;
#[cfg(test)]
pub(crate) mod testing;

pub use local::LocalDispatcher;
pub use slurm::{ExitRecord, SchedulerClient, SlurmCli, SlurmDispatcher};

use crate::{descriptor::BuildError, sync::CancellationToken};
use std::{fmt, io, path::PathBuf, process::ExitStatus, time::Duration, time::SystemTime};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Failed to run {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("{program} printed unparsable output {output:?}")]
    Parse { program: String, output: String },
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    exit_code.map_or_else(|| "a signal".to_owned(), |code| format!("exit code {code}"))
}

fn describe_index(index: &Option<u32>) -> String {
    index.map_or_else(String::new, |index| format!(" for array index {index}"))
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Job was already dispatched")]
    AlreadyDispatched,
    #[error("No job was dispatched yet")]
    NotYetDispatched,
    #[error("No job was configured before dispatching")]
    NoJobConfigured,
    #[error("Command sequence failed{} with {}: {stderr}", describe_index(.index), describe_exit(.exit_code))]
    ExecutionFailed {
        exit_code: Option<i32>,
        index: Option<u32>,
        stderr: String,
    },
    #[error("Failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to prepare working directory {path:?}")]
    Workdir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Scheduler request failed")]
    Scheduler(#[from] SchedulerError),
    #[error("Invalid job description")]
    Build(#[from] BuildError),
    #[error("Job {0} did not finish before the deadline")]
    TimedOut(JobId),
    #[error("Waiting for job {0} was cancelled")]
    Cancelled(JobId),
}

/// Identifier of a dispatched job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobId {
    /// Local jobs have no identity outside this process
    Local,
    Scheduler(u64),
}

impl JobId {
    /// Identifier usable as a scheduler dependency
    pub fn scheduler_id(&self) -> Option<u64> {
        match self {
            Self::Local => None,
            Self::Scheduler(id) => Some(*id),
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Scheduler(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobHandle {
    pub id: JobId,
    pub submitted_at: SystemTime,
}

impl JobHandle {
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            submitted_at: SystemTime::now(),
        }
    }
}

/// Outcome of a job that is no longer running
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalStatus {
    Succeeded,
    Failed { exit_code: Option<i32> },
    /// Left the scheduler without an accounting record, outcome unknown
    Left,
}

impl TerminalStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
    Unsubmitted,
    Submitted(JobHandle),
    Completed {
        handle: JobHandle,
        status: TerminalStatus,
    },
}

impl DispatchState {
    pub fn handle(&self) -> Option<&JobHandle> {
        match self {
            Self::Unsubmitted => None,
            Self::Submitted(handle) | Self::Completed { handle, .. } => Some(handle),
        }
    }
}

/// How long and how often blocking waits poll, and what stops them early
#[derive(Clone, Debug)]
pub struct WaitPolicy {
    pub interval: Duration,
    pub deadline: Option<Duration>,
    pub token: CancellationToken,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            deadline: None,
            token: CancellationToken::new(),
        }
    }
}

/// A command sequence with a submission lifecycle
/// `Unsubmitted -> Submitted -> Completed`
pub trait Dispatcher: Send + fmt::Debug {
    /// Submit the command sequence, only allowed once
    fn dispatch(&mut self) -> Result<JobHandle, DispatchError>;

    /// Block until the job is terminal
    fn wait(&mut self) -> Result<TerminalStatus, DispatchError>;

    fn state(&self) -> &DispatchState;

    fn commands(&self) -> &[String];

    /// Append a command, only allowed before submission
    fn push_command(&mut self, command: String) -> Result<(), DispatchError>;

    fn handle(&self) -> Option<&JobHandle> {
        self.state().handle()
    }
}
