//! Reaps terminated/stopped/continued children and backfills freed capacity.

use std::mem::MaybeUninit;

use tracing::{debug, warn};

use super::launcher;
use super::registry::Registry;
use super::types::{GlobalJobId, JobStatus};
use crate::proto::WireRusage;

/// One job whose status changed this reap pass, for the caller to turn into
/// a JOB_UPDATE.
pub struct Changed {
    pub job: GlobalJobId,
}

/// Drains every pending child-state change via `wait4(-1, WNOHANG, ...)`,
/// then backfills freed capacity with queued NEW jobs in submission order.
/// Returns every job whose status changed, in the order it was observed —
/// reaps first, then backfilled launches.
pub fn reap_and_backfill(registry: &mut Registry) -> Vec<Changed> {
    let mut changed = Vec::new();

    loop {
        let mut status: i32 = 0;
        let mut rusage = MaybeUninit::<libc::rusage>::zeroed();
        // SAFETY: -1 waits for any child of this process; WNOHANG makes
        // this non-blocking so the loop terminates once nothing is ready.
        let pid = unsafe {
            libc::wait4(
                -1,
                &mut status,
                libc::WNOHANG | libc::WUNTRACED | libc::WCONTINUED,
                rusage.as_mut_ptr(),
            )
        };
        if pid <= 0 {
            break;
        }
        // SAFETY: wait4 returned > 0, so it populated rusage.
        let rusage = unsafe { rusage.assume_init() };

        let Some(gid) = registry.by_pgid(pid as u32) else {
            warn!(pid, "reaped a pid with no matching job, ignoring");
            continue;
        };

        registry.job_mut(gid).rusage = wire_rusage(&rusage);

        let new_status = if libc::WIFSTOPPED(status) {
            Some(JobStatus::Suspended)
        } else if libc::WIFCONTINUED(status) {
            Some(JobStatus::Running)
        } else if libc::WIFSIGNALED(status) {
            registry.job_mut(gid).exitcode = libc::WTERMSIG(status);
            Some(JobStatus::Aborted)
        } else if libc::WIFEXITED(status) {
            registry.job_mut(gid).exitcode = libc::WEXITSTATUS(status);
            Some(JobStatus::Exited)
        } else {
            None
        };

        if let Some(new_status) = new_status {
            debug!(pid, jobid = registry.job(gid).jobid, ?new_status, "job status changed");
            registry.set_status(gid, new_status);
            changed.push(Changed { job: gid });
        }
    }

    changed.extend(backfill(registry));
    changed
}

/// Launches queued NEW jobs, earliest-submitted first, until capacity is
/// exhausted or none remain.
fn backfill(registry: &mut Registry) -> Vec<Changed> {
    let mut launched = Vec::new();
    loop {
        if !registry.has_capacity() {
            break;
        }
        let Some(gid) = registry.new_jobs_in_order().next() else {
            break;
        };

        let jobid = registry.job(gid).jobid;
        match launcher::launch(registry.job(gid)) {
            Ok(pid) => {
                debug!(jobid, pid, "backfilled job launched");
                registry.mark_launched(gid, pid);
            },
            Err(e) => {
                warn!(jobid, error = %e, "backfill launch failed, marking ABORTED");
                registry.set_status(gid, JobStatus::Aborted);
            },
        }
        launched.push(Changed { job: gid });
    }
    launched
}

fn wire_rusage(ru: &libc::rusage) -> WireRusage {
    WireRusage {
        utime_secs: ru.ru_utime.tv_sec as u32,
        utime_micros: ru.ru_utime.tv_usec as u32,
        stime_secs: ru.ru_stime.tv_sec as u32,
        stime_micros: ru.ru_stime.tv_usec as u32,
        maxrss_kb: ru.ru_maxrss as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::registry::NewJob;

    fn spec(cmd: &str) -> NewJob {
        NewJob {
            argv: cmd.split(' ').map(|s| s.as_bytes().to_vec()).collect(),
            env: vec![],
            maxcpu: 10,
            maxmem: 1 << 20,
            priority: 0,
        }
    }

    #[test]
    fn backfill_stops_once_capacity_is_exhausted() {
        let mut reg = Registry::new(Some(0));
        let a = reg.login(b"alice").unwrap();
        reg.submit(a, spec("true"));
        let changed = backfill(&mut reg);
        assert!(changed.is_empty());
    }
}
