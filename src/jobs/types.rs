//! Core entities: clients, jobs, and their handles.

use std::path::PathBuf;

use crate::proto::WireRusage;

/// Index of a [`Client`] inside [`super::registry::Registry`]. Clients are
/// never removed, so this handle stays valid for the server's lifetime.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ClientId(pub(super) usize);

/// Index of a [`Job`] inside the registry's global job slab. Stable for the
/// job's lifetime; never reused even after the job is expunged.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct GlobalJobId(pub(super) usize);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobStatus {
    New,
    Running,
    Suspended,
    Exited,
    Aborted,
    Canceled,
}

impl JobStatus {
    /// Whether a job in this status counts against `numjobs`.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Suspended)
    }

    /// Whether a job in this status has finished for good.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Exited | JobStatus::Aborted | JobStatus::Canceled
        )
    }

    /// The wire-level status code sent in JOB_STATUS_RESP / JOB_UPDATE /
    /// JOB_LIST_ALL_RESP.
    pub fn wire_code(self) -> u32 {
        match self {
            JobStatus::New => 0,
            JobStatus::Running => 1,
            JobStatus::Suspended => 2,
            JobStatus::Exited => 3,
            JobStatus::Aborted => 4,
            JobStatus::Canceled => 5,
        }
    }

    /// Inverse of [`JobStatus::wire_code`], used by clients decoding a
    /// status off the wire.
    pub fn from_wire_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => JobStatus::New,
            1 => JobStatus::Running,
            2 => JobStatus::Suspended,
            3 => JobStatus::Exited,
            4 => JobStatus::Aborted,
            5 => JobStatus::Canceled,
            _ => return None,
        })
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::New => "NEW",
            JobStatus::Running => "RUNNING",
            JobStatus::Suspended => "SUSPENDED",
            JobStatus::Exited => "EXITED",
            JobStatus::Aborted => "ABORTED",
            JobStatus::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

/// A submitted, supervised job. Belongs to exactly one [`Client`] by
/// identity: [`Job::owner`] is a weak back-reference, ownership of the value
/// itself lives in the registry's job slab.
#[derive(Clone, Debug)]
pub struct Job {
    pub owner: ClientId,
    /// Monotonic, per-client id; the value clients see on the wire.
    pub jobid: u32,
    pub argv: Vec<Vec<u8>>,
    pub env: Vec<Vec<u8>>,
    pub maxcpu: u32,
    pub maxmem: u32,
    pub priority: i32,
    pub status: JobStatus,
    /// Exit status or terminating signal number, meaningful once terminal.
    pub exitcode: i32,
    /// Set once the job has been launched; a dead pgid must never be
    /// signalled again.
    pub pgid: Option<u32>,
    pub rusage: WireRusage,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl Job {
    /// Raw command line as submitted, rejoined with single spaces — used for
    /// JOB_LIST_ALL_RESP display.
    pub fn cmd_display(&self) -> Vec<u8> {
        self.argv.join(&b' ')
    }
}

/// A logged-in user. Persists across disconnects: its jobs keep running and
/// stay listed even while no connection is bound to it.
#[derive(Clone, Debug)]
pub struct Client {
    pub name: Vec<u8>,
    pub connected: bool,
    /// Slab indices of this client's jobs, in submission order.
    pub job_slots: Vec<GlobalJobId>,
    next_jobid: u32,
}

impl Client {
    pub(super) fn new(name: Vec<u8>) -> Self {
        Self {
            name,
            connected: true,
            job_slots: Vec::new(),
            next_jobid: 0,
        }
    }

    /// Allocates the next monotonic job id for this client. Never reused,
    /// even if the job it was assigned to is later expunged.
    pub(super) fn take_next_jobid(&mut self) -> u32 {
        let id = self.next_jobid;
        self.next_jobid += 1;
        id
    }
}
