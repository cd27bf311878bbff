//! Per-frame request handling: the one place where a decoded [`Frame`] turns
//! into registry mutation plus a reply.

use std::io;

use tracing::{debug, warn};

use crate::jobs::{self, ClientId, GlobalJobId, JobStatus, NewJob, Registry};
use crate::proto::{Frame, Listing};

use super::conn::{ConnId, ConnTable};

/// The frames to send back on the requesting connection, in order, plus
/// whether that connection should be torn down afterwards.
#[derive(Default)]
pub struct DispatchOutcome {
    pub replies: Vec<Frame>,
    pub disconnect: bool,
}

impl DispatchOutcome {
    fn reply(frame: Frame) -> Self {
        Self {
            replies: vec![frame],
            disconnect: false,
        }
    }

    fn nack() -> Self {
        Self::reply(Frame::Nack)
    }

    fn close() -> Self {
        Self {
            replies: vec![],
            disconnect: true,
        }
    }
}

pub fn dispatch(
    registry: &mut Registry,
    conns: &mut ConnTable,
    conn: ConnId,
    frame: Frame,
) -> DispatchOutcome {
    if let Frame::Login { name } = &frame {
        return handle_login(registry, conns, conn, name);
    }

    let Some(client) = conns.bound_client(conn) else {
        return DispatchOutcome::nack();
    };

    match frame {
        Frame::Login { .. } => unreachable!("handled above"),
        Frame::JobSubmit {
            maxcpu,
            maxmem,
            priority,
            cmd,
            envp,
        } => handle_submit(registry, client, maxcpu, maxmem, priority, cmd, envp),
        Frame::JobStatus { jobid } => handle_status(registry, client, jobid),
        Frame::JobSignal { jobid, signum } => handle_signal(registry, client, jobid, signum),
        Frame::JobSetPri { jobid, priority } => handle_set_pri(registry, client, jobid, priority),
        Frame::JobGetStdout { jobid } => handle_get_output(registry, client, jobid, true),
        Frame::JobGetStderr { jobid } => handle_get_output(registry, client, jobid, false),
        Frame::JobListAll => handle_list_all(registry, client),
        Frame::JobExpunge { jobid } => handle_expunge(registry, client, jobid),
        // These only ever flow server-to-client; seeing one from a client is
        // a protocol violation severe enough to warrant a disconnect.
        Frame::Ack
        | Frame::Nack
        | Frame::JobSubmitSuccess { .. }
        | Frame::JobStatusResp { .. }
        | Frame::JobUpdate { .. }
        | Frame::JobListAllResp { .. }
        | Frame::JobResults { .. } => DispatchOutcome::close(),
    }
}

fn handle_login(
    registry: &mut Registry,
    conns: &mut ConnTable,
    conn: ConnId,
    name: &[u8],
) -> DispatchOutcome {
    if conns.bound_client(conn).is_some() {
        warn!(conn = conn.0, "LOGIN on an already-bound connection, closing");
        return DispatchOutcome::close();
    }
    match registry.login(name) {
        Ok(client) => {
            debug!(conn = conn.0, name = %String::from_utf8_lossy(name), "client logged in");
            conns.bind(conn, client);
            DispatchOutcome::reply(Frame::Ack)
        },
        Err(e) => {
            warn!(conn = conn.0, error = %e, "LOGIN rejected, closing");
            DispatchOutcome::close()
        },
    }
}

fn handle_submit(
    registry: &mut Registry,
    client: ClientId,
    maxcpu: u32,
    maxmem: u32,
    priority: i32,
    cmd: Vec<u8>,
    envp: Vec<Vec<u8>>,
) -> DispatchOutcome {
    let argv = jobs::split_argv(&cmd);
    if argv.is_empty() {
        debug!("JOB_SUBMIT with an empty/whitespace-only command, NACKing");
        return DispatchOutcome::nack();
    }

    let gid = registry.submit(
        client,
        NewJob {
            argv,
            env: envp,
            maxcpu,
            maxmem,
            priority,
        },
    );
    let jobid = registry.job(gid).jobid;
    debug!(jobid, "job submitted");
    let mut replies = vec![Frame::JobSubmitSuccess { jobid }];

    if registry.has_capacity() {
        match jobs::launch(registry.job(gid)) {
            Ok(pid) => {
                debug!(jobid, pid, "job launched");
                registry.mark_launched(gid, pid);
                replies.push(update_frame(registry, gid));
            },
            Err(e) => {
                warn!(jobid, error = %e, "job launch failed, marking ABORTED");
                registry.set_status(gid, JobStatus::Aborted);
                replies.push(update_frame(registry, gid));
            },
        }
    }

    DispatchOutcome {
        replies,
        disconnect: false,
    }
}

fn handle_status(registry: &Registry, client: ClientId, jobid: u32) -> DispatchOutcome {
    let Some(gid) = registry.by_jobid(client, jobid) else {
        debug!(jobid, "JOB_STATUS for unknown job, NACKing");
        return DispatchOutcome::nack();
    };
    let job = registry.job(gid);
    DispatchOutcome::reply(Frame::JobStatusResp {
        status: job.status.wire_code(),
        exitcode: job.exitcode,
        maxcpu: job.maxcpu,
        maxmem: job.maxmem,
        priority: job.priority,
        rusage: job.rusage,
    })
}

fn handle_list_all(registry: &Registry, client: ClientId) -> DispatchOutcome {
    let jobs: Vec<_> = registry.client_jobs(client).collect();
    if jobs.is_empty() {
        debug!("JOB_LIST_ALL with no jobs on file, NACKing");
        return DispatchOutcome::nack();
    }

    let n = jobs.len();
    let listing = jobs
        .into_iter()
        .enumerate()
        .map(|(i, job)| Listing {
            jobid: job.jobid,
            left: (n - i - 1) as u32,
            cmd: job.cmd_display(),
            status: job.status.wire_code(),
            exitcode: job.exitcode,
        })
        .collect();

    DispatchOutcome::reply(Frame::JobListAllResp { listing })
}

fn handle_signal(registry: &mut Registry, client: ClientId, jobid: u32, signum: u32) -> DispatchOutcome {
    let Some(gid) = registry.by_jobid(client, jobid) else {
        debug!(jobid, "JOB_SIGNAL for unknown job, NACKing");
        return DispatchOutcome::nack();
    };
    let job = registry.job(gid);
    let Some(pgid) = job.pgid else {
        debug!(jobid, "JOB_SIGNAL before the job has a pgid, NACKing");
        return DispatchOutcome::nack();
    };
    if job.status.is_terminal() {
        debug!(jobid, "JOB_SIGNAL on a terminal job, NACKing");
        return DispatchOutcome::nack();
    }

    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signum as i32) };
    if rc == 0 {
        debug!(jobid, pgid, signum, "signalled job's process group");
        DispatchOutcome::reply(Frame::Ack)
    } else {
        warn!(jobid, pgid, signum, error = %io::Error::last_os_error(), "killpg failed");
        DispatchOutcome::nack()
    }
}

fn handle_set_pri(registry: &mut Registry, client: ClientId, jobid: u32, priority: i32) -> DispatchOutcome {
    let Some(gid) = registry.by_jobid(client, jobid) else {
        debug!(jobid, "JOB_SET_PRI for unknown job, NACKing");
        return DispatchOutcome::nack();
    };
    let job = registry.job(gid);
    let Some(pgid) = job.pgid else {
        debug!(jobid, "JOB_SET_PRI before the job has a pgid, NACKing");
        return DispatchOutcome::nack();
    };
    if job.status.is_terminal() {
        debug!(jobid, "JOB_SET_PRI on a terminal job, NACKing");
        return DispatchOutcome::nack();
    }

    let rc = unsafe { libc::setpriority(libc::PRIO_PGRP, pgid, priority) };
    if rc == 0 {
        debug!(jobid, pgid, priority, "job priority changed");
        registry.job_mut(gid).priority = priority;
        DispatchOutcome::reply(Frame::Ack)
    } else {
        warn!(jobid, pgid, priority, error = %io::Error::last_os_error(), "setpriority failed");
        DispatchOutcome::nack()
    }
}

fn handle_expunge(registry: &mut Registry, client: ClientId, jobid: u32) -> DispatchOutcome {
    let Some(gid) = registry.by_jobid(client, jobid) else {
        debug!(jobid, "JOB_EXPUNGE for unknown job, NACKing");
        return DispatchOutcome::nack();
    };
    let job = registry.job(gid);
    if job.status.is_active() {
        if let Some(pgid) = job.pgid {
            debug!(jobid, pgid, "expunging a live job, sending SIGKILL first");
            unsafe {
                libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
            }
        }
    }
    registry.remove(gid);
    debug!(jobid, "job expunged");
    DispatchOutcome::reply(Frame::Ack)
}

fn handle_get_output(registry: &Registry, client: ClientId, jobid: u32, stdout: bool) -> DispatchOutcome {
    let Some(gid) = registry.by_jobid(client, jobid) else {
        debug!(jobid, "JOB_GET_OUTPUT for unknown job, NACKing");
        return DispatchOutcome::nack();
    };
    let job = registry.job(gid);
    if !matches!(job.status, JobStatus::Exited | JobStatus::Aborted) {
        debug!(jobid, status = %job.status, "output requested before job is terminal, NACKing");
        return DispatchOutcome::nack();
    }

    let path = if stdout {
        &job.stdout_path
    } else {
        &job.stderr_path
    };
    // A blocking read, not tokio::fs: this server never spawns a task, so
    // there is no executor to hand the read off to — and these files are
    // small captured job output, not a reason to reach for async I/O.
    match std::fs::read(path) {
        Ok(content) if !content.is_empty() => DispatchOutcome::reply(Frame::JobResults { content }),
        Ok(_) => {
            debug!(jobid, "output file is empty, NACKing");
            DispatchOutcome::nack()
        },
        Err(e) => {
            warn!(jobid, error = %e, "failed to read captured output");
            DispatchOutcome::nack()
        },
    }
}

/// Builds the JOB_UPDATE frame for a job's current status.
pub fn update_frame(registry: &Registry, gid: GlobalJobId) -> Frame {
    let job = registry.job(gid);
    Frame::JobUpdate {
        jobid: job.jobid,
        status: job.status.wire_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login(registry: &mut Registry, conns: &mut ConnTable, name: &[u8]) -> ConnId {
        let conn = conns.insert();
        let outcome = dispatch(
            registry,
            conns,
            conn,
            Frame::Login {
                name: name.to_vec(),
            },
        );
        assert_eq!(outcome.replies, vec![Frame::Ack]);
        conn
    }

    #[test]
    fn submit_before_login_is_nacked_not_fatal() {
        let mut registry = Registry::new(None);
        let mut conns = ConnTable::new();
        let conn = conns.insert();
        let outcome = dispatch(
            &mut registry,
            &mut conns,
            conn,
            Frame::JobStatus { jobid: 0 },
        );
        assert_eq!(outcome.replies, vec![Frame::Nack]);
        assert!(!outcome.disconnect);
    }

    #[test]
    fn double_login_on_same_connection_closes_it() {
        let mut registry = Registry::new(None);
        let mut conns = ConnTable::new();
        let conn = login(&mut registry, &mut conns, b"alice");
        let outcome = dispatch(
            &mut registry,
            &mut conns,
            conn,
            Frame::Login {
                name: b"alice".to_vec(),
            },
        );
        assert!(outcome.disconnect);
    }

    #[test]
    fn list_all_nacks_when_no_jobs() {
        let mut registry = Registry::new(None);
        let mut conns = ConnTable::new();
        login(&mut registry, &mut conns, b"alice");
        let client = conns.bound_client(ConnId(0)).unwrap();
        let outcome = handle_list_all(&registry, client);
        assert_eq!(outcome.replies, vec![Frame::Nack]);
    }

    #[test]
    fn expunge_unknown_job_nacks() {
        let mut registry = Registry::new(None);
        let mut conns = ConnTable::new();
        login(&mut registry, &mut conns, b"alice");
        let client = conns.bound_client(ConnId(0)).unwrap();
        let outcome = handle_expunge(&mut registry, client, 99);
        assert_eq!(outcome.replies, vec![Frame::Nack]);
    }
}
