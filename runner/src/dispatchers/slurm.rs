use super::{
    DispatchError, DispatchState, Dispatcher, JobHandle, JobId, SchedulerError, TerminalStatus,
    WaitPolicy,
};
use crate::descriptor::{render_script, SchedulerOptions};
use itertools::Itertools;
use std::{
    collections::BTreeSet,
    fmt,
    io::Write,
    process::{Command, Output, Stdio},
    sync::Arc,
    time::Instant,
};
use tracing::{debug, info, instrument, trace, warn};

/// Exit code and signal the scheduler's accounting recorded for a job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitRecord {
    pub code: i32,
    pub signal: i32,
}

impl ExitRecord {
    pub fn success(&self) -> bool {
        self.code == 0 && self.signal == 0
    }
}

/// The three requests the batch dispatcher needs from a scheduler
pub trait SchedulerClient: Send + Sync + fmt::Debug {
    /// Submit a batch script, returns the assigned job id
    fn submit(&self, script: &str) -> Result<u64, SchedulerError>;

    /// Ids of every job still queued or running
    fn active_jobs(&self) -> Result<BTreeSet<u64>, SchedulerError>;

    /// Accounting record of a finished job, the first failing task for
    /// arrays, `None` if the scheduler kept no record
    fn exit_code(&self, id: u64) -> Result<Option<ExitRecord>, SchedulerError>;
}

/// SLURM command line tools
#[derive(Clone, Debug)]
pub struct SlurmCli {
    sbatch: String,
    squeue: String,
    sacct: String,
}

impl Default for SlurmCli {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".into(),
            squeue: "squeue".into(),
            sacct: "sacct".into(),
        }
    }
}

fn checked(program: &str, output: std::io::Result<Output>) -> Result<String, SchedulerError> {
    let output = output.map_err(|source| SchedulerError::Spawn {
        program: program.to_owned(),
        source,
    })?;

    if !output.status.success() {
        return Err(SchedulerError::Failed {
            program: program.to_owned(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn unparsable(program: &str, output: &str) -> SchedulerError {
    SchedulerError::Parse {
        program: program.to_owned(),
        output: output.to_owned(),
    }
}

/// `<job id>[;<cluster>]`
pub fn parse_submission(output: &str) -> Option<u64> {
    output.trim().split(';').next()?.trim().parse().ok()
}

/// One `%F` (array base id) per line, blank lines ignored
pub fn parse_active_jobs(output: &str) -> Option<BTreeSet<u64>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.parse().ok())
        .collect()
}

/// `code:signal` per allocation, the first failing one wins
pub fn parse_exit_codes(output: &str) -> Option<Option<ExitRecord>> {
    let records = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (code, signal) = line.split_once(':')?;
            Some(ExitRecord {
                code: code.parse().ok()?,
                signal: signal.parse().ok()?,
            })
        })
        .collect::<Option<Vec<_>>>()?;

    Some(
        records
            .iter()
            .find(|record| !record.success())
            .or_else(|| records.first())
            .copied(),
    )
}

impl SlurmCli {
    pub fn new(
        sbatch: impl Into<String>,
        squeue: impl Into<String>,
        sacct: impl Into<String>,
    ) -> Self {
        Self {
            sbatch: sbatch.into(),
            squeue: squeue.into(),
            sacct: sacct.into(),
        }
    }
}

impl SchedulerClient for SlurmCli {
    fn submit(&self, script: &str) -> Result<u64, SchedulerError> {
        let spawn_error = |source| SchedulerError::Spawn {
            program: self.sbatch.clone(),
            source,
        };

        let mut child = Command::new(&self.sbatch)
            .arg("--parsable")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).map_err(spawn_error)?;
        }

        let stdout = checked(&self.sbatch, child.wait_with_output())?;
        parse_submission(&stdout).ok_or_else(|| unparsable(&self.sbatch, &stdout))
    }

    fn active_jobs(&self) -> Result<BTreeSet<u64>, SchedulerError> {
        let stdout = checked(
            &self.squeue,
            Command::new(&self.squeue)
                .args(["--noheader", "--format=%F"])
                .output(),
        )?;

        parse_active_jobs(&stdout).ok_or_else(|| unparsable(&self.squeue, &stdout))
    }

    fn exit_code(&self, id: u64) -> Result<Option<ExitRecord>, SchedulerError> {
        let stdout = checked(
            &self.sacct,
            Command::new(&self.sacct)
                .args(["-j", &id.to_string()])
                .args([
                    "--noheader",
                    "--parsable2",
                    "--allocations",
                    "--format=ExitCode",
                ])
                .output(),
        )?;

        parse_exit_codes(&stdout).ok_or_else(|| unparsable(&self.sacct, &stdout))
    }
}

/// Submits the command sequence as one batch script and polls the
/// scheduler until the job left the active listing
#[derive(Debug)]
pub struct SlurmDispatcher {
    commands: Vec<String>,
    options: SchedulerOptions,
    client: Arc<dyn SchedulerClient>,
    policy: WaitPolicy,
    accounting: bool,
    state: DispatchState,
}

impl SlurmDispatcher {
    pub fn new(
        commands: Vec<String>,
        options: SchedulerOptions,
        client: Arc<dyn SchedulerClient>,
        policy: WaitPolicy,
    ) -> Self {
        Self {
            commands,
            options,
            client,
            policy,
            accounting: true,
            state: DispatchState::Unsubmitted,
        }
    }

    /// Query exit codes once the job is terminal
    pub fn with_accounting(mut self, accounting: bool) -> Self {
        self.accounting = accounting;
        self
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn script(&self) -> String {
        render_script(&self.options, &self.commands)
    }

    fn terminal_status(&self, id: u64) -> Result<TerminalStatus, DispatchError> {
        if !self.accounting {
            return Ok(TerminalStatus::Left);
        }

        Ok(match self.client.exit_code(id)? {
            Some(record) if record.success() => TerminalStatus::Succeeded,
            Some(record) => {
                warn!(job_id = id, code = record.code, signal = record.signal, "Batch job failed");
                TerminalStatus::Failed {
                    exit_code: (record.signal == 0).then_some(record.code),
                }
            }
            None => {
                debug!(job_id = id, "No accounting record for batch job");
                TerminalStatus::Left
            }
        })
    }
}

impl Dispatcher for SlurmDispatcher {
    #[instrument(level = "debug", skip(self))]
    fn dispatch(&mut self) -> Result<JobHandle, DispatchError> {
        if self.state != DispatchState::Unsubmitted {
            return Err(DispatchError::AlreadyDispatched);
        }

        let id = self.client.submit(&self.script())?;
        let handle = JobHandle::new(JobId::Scheduler(id));
        self.state = DispatchState::Submitted(handle);

        info!(
            job_id = id,
            job_name = self.options.get("job-name").unwrap_or_default(),
            "Submitted batch job"
        );

        Ok(handle)
    }

    #[instrument(level = "debug", skip(self))]
    fn wait(&mut self) -> Result<TerminalStatus, DispatchError> {
        let handle = match self.state {
            DispatchState::Unsubmitted => return Err(DispatchError::NotYetDispatched),
            DispatchState::Completed { status, .. } => return Ok(status),
            DispatchState::Submitted(handle) => handle,
        };
        let id = match handle.id {
            JobId::Scheduler(id) => id,
            JobId::Local => return Err(DispatchError::NotYetDispatched),
        };
        let start = Instant::now();

        loop {
            let active = self.client.active_jobs()?;
            if !active.contains(&id) {
                break;
            }
            trace!(job_id = id, active = %active.iter().join(","), "Batch job still active");

            let mut pause = self.policy.interval;
            if let Some(deadline) = self.policy.deadline {
                let left = deadline.saturating_sub(start.elapsed());
                if left.is_zero() {
                    warn!(job_id = id, "Stopped waiting at the deadline, the job keeps running");
                    return Err(DispatchError::TimedOut(handle.id));
                }
                pause = pause.min(left);
            }

            if self.policy.token.sleep(pause) {
                warn!(job_id = id, "Stopped waiting, the job keeps running");
                return Err(DispatchError::Cancelled(handle.id));
            }
        }

        let status = self.terminal_status(id)?;
        info!(job_id = id, status = ?status, "Batch job left the queue");
        self.state = DispatchState::Completed { handle, status };

        Ok(status)
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

#[cfg(test)]
#[path = "slurm_test.rs"]
mod tests;
