//! Scheduler double for tests of everything above the batch dispatcher.

use super::{ExitRecord, SchedulerClient, SchedulerError};
use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, VecDeque},
    sync::Arc,
};

/// Answers from scripted listings, the last listing repeats.
/// Submissions get consecutive ids starting at `first_id`.
#[derive(Debug, Default)]
pub struct ScriptedScheduler {
    pub first_id: u64,
    pub listings: Mutex<VecDeque<BTreeSet<u64>>>,
    pub record: Option<ExitRecord>,
    pub scripts: Mutex<Vec<String>>,
    pub polls: Mutex<usize>,
    // number of submissions seen by every listing query
    pub submitted_at_poll: Mutex<Vec<usize>>,
    pub accounting_queries: Mutex<usize>,
}

impl ScriptedScheduler {
    pub fn new(first_id: u64, listings: Vec<Vec<u64>>, record: Option<ExitRecord>) -> Arc<Self> {
        Arc::new(Self {
            first_id,
            listings: Mutex::new(
                listings
                    .into_iter()
                    .map(|listing| listing.into_iter().collect())
                    .collect(),
            ),
            record,
            ..Self::default()
        })
    }

    /// Every job finishes before the first poll and succeeds
    pub fn finishing(first_id: u64) -> Arc<Self> {
        Self::new(first_id, vec![vec![]], Some(ExitRecord { code: 0, signal: 0 }))
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().clone()
    }

    pub fn submitted_at_poll(&self) -> Vec<usize> {
        self.submitted_at_poll.lock().clone()
    }
}

impl SchedulerClient for ScriptedScheduler {
    fn submit(&self, script: &str) -> Result<u64, SchedulerError> {
        let mut scripts = self.scripts.lock();
        scripts.push(script.to_owned());
        Ok(self.first_id + scripts.len() as u64 - 1)
    }

    fn active_jobs(&self) -> Result<BTreeSet<u64>, SchedulerError> {
        *self.polls.lock() += 1;
        let submitted = self.scripts.lock().len();
        self.submitted_at_poll.lock().push(submitted);
        let mut listings = self.listings.lock();
        if listings.len() > 1 {
            Ok(listings.pop_front().unwrap_or_default())
        } else {
            Ok(listings.front().cloned().unwrap_or_default())
        }
    }

    fn exit_code(&self, _id: u64) -> Result<Option<ExitRecord>, SchedulerError> {
        *self.accounting_queries.lock() += 1;
        Ok(self.record)
    }
}
