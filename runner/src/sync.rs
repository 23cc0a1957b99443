//! Cooperative cancellation shared between the orchestrator and the
//! blocking waits of the dispatchers.

use nix::sys::signal::{SigSet, Signal};
use parking_lot::{Condvar, Mutex};
use std::{
    process::exit,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tracing::{error, warn};

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

/// Cloneable cancellation flag, waiters are woken as soon as it fires
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<Inner>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self.0.cancelled.lock();
        *cancelled = true;
        self.0.signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.cancelled.lock()
    }

    /// Sleep for `timeout` unless cancelled earlier.
    /// Returns whether the token was cancelled.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.0.cancelled.lock();

        while !*cancelled {
            if self
                .0
                .signal
                .wait_until(&mut cancelled, deadline)
                .timed_out()
            {
                break;
            }
        }

        *cancelled
    }
}

/// Route SIGINT to a dedicated thread: the first interrupt cancels `token`,
/// the second terminates the process with 130.
///
/// Must be called before any other thread is spawned, the signal mask is
/// inherited.
pub fn install_interrupt_handler(token: CancellationToken) -> Result<(), nix::Error> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.thread_block()?;

    thread::Builder::new()
        .name("sigint".into())
        .spawn(move || {
            let mut interrupted = false;
            loop {
                match mask.wait() {
                    Ok(_) if interrupted => {
                        error!("Interrupted twice, exiting");
                        exit(130);
                    }
                    Ok(_) => {
                        warn!("Interrupted, stopping after the current poll. Submitted batch jobs keep running, interrupt again to exit immediately");
                        interrupted = true;
                        token.cancel();
                    }
                    Err(e) => {
                        error!("Failed to wait for signals: {e}");
                        return;
                    }
                }
            }
        })
        .map_err(|_| nix::Error::EAGAIN)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_runs_to_timeout() {
        let token = CancellationToken::new();
        let start = Instant::now();

        assert!(!token.sleep(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn cancel_wakes_sleepers() {
        let token = CancellationToken::new();
        let remote = token.clone();
        let start = Instant::now();

        let handle = thread::spawn(move || remote.sleep(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        token.cancel();

        assert!(handle.join().unwrap());
        assert!(token.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(30));
        assert!(token.sleep(Duration::from_secs(30)));
    }
}
