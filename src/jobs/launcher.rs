//! Forks and execs a job's child process group.

use std::ffi::OsStr;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::process::Command;

use tracing::{debug, warn};

use super::types::Job;

/// Applies the job's resource limits and scheduling priority to the child.
/// Runs between fork and exec via `pre_exec`; must stick to async-signal-safe
/// operations.
///
/// # Safety
/// Must only be invoked from a `pre_exec` closure, per its contract.
unsafe fn apply_limits(maxcpu: u32, maxmem: u32, priority: i32) -> io::Result<()> {
    let cpu = libc::rlimit {
        rlim_cur: maxcpu as libc::rlim_t,
        rlim_max: maxcpu as libc::rlim_t,
    };
    if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
        return Err(io::Error::last_os_error());
    }

    let mem = libc::rlimit {
        rlim_cur: maxmem as libc::rlim_t,
        rlim_max: maxmem as libc::rlim_t,
    };
    if libc::setrlimit(libc::RLIMIT_AS, &mem) != 0 {
        return Err(io::Error::last_os_error());
    }

    if libc::setpriority(libc::PRIO_PROCESS, 0, priority) != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Launches `job`, returning the child's pid (== its pgid, since the child
/// is made its own process group leader) on success.
///
/// Does not touch registry bookkeeping: the caller decides how to record
/// the outcome (RUNNING with this pgid, or ABORTED if this errors).
pub fn launch(job: &Job) -> io::Result<u32> {
    let Some((prog, args)) = job.argv.split_first() else {
        warn!(jobid = job.jobid, "refusing to launch an empty argv");
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty argv"));
    };

    let stdout = match OpenOptions::new().create(true).write(true).truncate(true).mode(0o600).open(&job.stdout_path) {
        Ok(f) => f,
        Err(e) => {
            warn!(jobid = job.jobid, path = %job.stdout_path.display(), error = %e, "failed to open stdout capture file");
            return Err(e);
        },
    };
    let stderr = match OpenOptions::new().create(true).write(true).truncate(true).mode(0o600).open(&job.stderr_path) {
        Ok(f) => f,
        Err(e) => {
            warn!(jobid = job.jobid, path = %job.stderr_path.display(), error = %e, "failed to open stderr capture file");
            return Err(e);
        },
    };

    let mut cmd = Command::new(OsStr::from_bytes(prog));
    cmd.args(args.iter().map(|a| OsStr::from_bytes(a)));
    cmd.env_clear();
    for var in &job.env {
        if let Some(eq) = var.iter().position(|&b| b == b'=') {
            cmd.env(OsStr::from_bytes(&var[..eq]), OsStr::from_bytes(&var[eq + 1..]));
        }
    }
    cmd.stdout(stdout);
    cmd.stderr(stderr);
    // Makes the child its own process group leader between fork and exec —
    // the safe-std equivalent of setpgid(self, self).
    cmd.process_group(0);

    let maxcpu = job.maxcpu;
    let maxmem = job.maxmem;
    let priority = job.priority;
    // SAFETY: apply_limits only calls async-signal-safe libc functions.
    unsafe {
        cmd.pre_exec(move || apply_limits(maxcpu, maxmem, priority));
    }

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(jobid = job.jobid, error = %e, "spawn() failed");
            return Err(e);
        },
    };
    let pid = child.id();
    debug!(jobid = job.jobid, pid, "spawned child");

    // Race guard against the child execing before the parent's setpgid
    // lands; matches the reference implementation's belt-and-suspenders
    // call on both sides of fork. ESRCH here means the child already
    // reparented itself and is harmless to ignore.
    unsafe {
        libc::setpgid(pid as libc::pid_t, pid as libc::pid_t);
    }

    // We reap via wait4 ourselves; std::process::Child must not be waited
    // on, so it's dropped here without ever calling .wait()/.try_wait().
    std::mem::forget(child);

    Ok(pid)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::jobs::types::{ClientId, JobStatus};
    use crate::proto::WireRusage;

    fn job_with_argv(argv: Vec<&str>) -> Job {
        Job {
            owner: ClientId(0),
            jobid: 0,
            argv: argv.into_iter().map(|s| s.as_bytes().to_vec()).collect(),
            env: vec![],
            maxcpu: 5,
            maxmem: 1 << 20,
            priority: 0,
            status: JobStatus::New,
            exitcode: 0,
            pgid: None,
            rusage: WireRusage::default(),
            stdout_path: PathBuf::from("/tmp/batchd-launcher-test.out"),
            stderr_path: PathBuf::from("/tmp/batchd-launcher-test.err"),
        }
    }

    #[test]
    fn empty_argv_is_rejected_before_forking() {
        let job = job_with_argv(vec![]);
        let err = launch(&job).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
