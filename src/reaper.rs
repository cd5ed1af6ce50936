//! Background job collection, polled between prompts instead of a SIGCHLD handler.

use crate::launcher::StageStatus;
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Collects background children so they do not linger as zombies.
///
/// Only the pids handed to [`Reaper::track`] are ever waited on, so children started
/// by anyone else in the process are left alone. Polling never blocks.
#[derive(Debug, Default)]
pub struct Reaper {
    pending: Vec<Pid>,
}

impl Reaper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, pids: impl IntoIterator<Item = Pid>) {
        self.pending.extend(pids);
    }

    /// Background children not yet collected.
    pub fn pending(&self) -> &[Pid] {
        &self.pending
    }

    /// Collect every tracked child that has terminated since the last poll.
    pub fn reap(&mut self) -> Vec<(Pid, StageStatus)> {
        let mut reaped = Vec::new();
        self.pending.retain(|&pid| match poll(pid) {
            Poll::Running => true,
            Poll::Finished(status) => {
                debug!(%pid, ?status, "background job finished");
                reaped.push((pid, status));
                false
            }
            Poll::Gone => false,
        });
        reaped
    }
}

enum Poll {
    Running,
    Finished(StageStatus),
    /// No longer our child to wait on.
    Gone,
}

fn poll(pid: Pid) -> Poll {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return Poll::Running,
            Ok(status) => {
                return match StageStatus::from_wait(status) {
                    Some(status) => Poll::Finished(status),
                    // stopped or continued; still ours to collect later
                    None => Poll::Running,
                };
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Poll::Gone,
            Err(errno) => {
                warn!(%pid, %errno, "waitpid failed, dropping background job");
                return Poll::Gone;
            }
        }
    }
}
