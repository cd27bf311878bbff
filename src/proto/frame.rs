//! Wire types for the batch job protocol: the one-byte tag values and the
//! in-memory [`Frame`] representation the codec encodes/decodes.

/// One-byte frame type tags, as placed on the wire.
pub mod tag {
    pub const ACK: u8 = 1;
    pub const NACK: u8 = 2;
    pub const LOGIN: u8 = 3;
    pub const JOB_SUBMIT: u8 = 4;
    pub const JOB_STATUS: u8 = 5;
    pub const JOB_SIGNAL: u8 = 6;
    pub const JOB_SET_PRI: u8 = 7;
    pub const JOB_GET_STDOUT: u8 = 8;
    pub const JOB_GET_STDERR: u8 = 9;
    pub const JOB_LIST_ALL: u8 = 10;
    pub const JOB_EXPUNGE: u8 = 11;
    pub const JOB_SUBMIT_SUCCESS: u8 = 12;
    pub const JOB_STATUS_RESP: u8 = 13;
    pub const JOB_UPDATE: u8 = 14;
    pub const JOB_LIST_ALL_RESP: u8 = 15;
    pub const JOB_RESULTS: u8 = 16;
}

/// Resource usage as carried on the wire: an explicit, portable structure in
/// place of a raw `struct rusage`. "cpu time" shown to a user is
/// `utime + stime`; unlike the reference implementation this does not double
/// `stime` into itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WireRusage {
    pub utime_secs: u32,
    pub utime_micros: u32,
    pub stime_secs: u32,
    pub stime_micros: u32,
    pub maxrss_kb: u32,
}

/// One entry in a `JOB_LIST_ALL_RESP` chain. `left` is the count of entries
/// that follow this one; the last entry in a response has `left == 0`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listing {
    pub jobid: u32,
    pub left: u32,
    pub cmd: Vec<u8>,
    pub status: u32,
    pub exitcode: i32,
}

/// A single `{ len, bytes }` environment variable assignment, as submitted
/// with a job.
pub type EnvVar = Vec<u8>;

/// A fully decoded protocol frame, in either direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Ack,
    Nack,
    Login {
        name: Vec<u8>,
    },
    JobSubmit {
        maxcpu: u32,
        maxmem: u32,
        priority: i32,
        cmd: Vec<u8>,
        envp: Vec<EnvVar>,
    },
    JobStatus {
        jobid: u32,
    },
    JobSignal {
        jobid: u32,
        signum: u32,
    },
    JobSetPri {
        jobid: u32,
        priority: i32,
    },
    JobGetStdout {
        jobid: u32,
    },
    JobGetStderr {
        jobid: u32,
    },
    JobListAll,
    JobExpunge {
        jobid: u32,
    },
    JobSubmitSuccess {
        jobid: u32,
    },
    JobStatusResp {
        status: u32,
        exitcode: i32,
        maxcpu: u32,
        maxmem: u32,
        priority: i32,
        rusage: WireRusage,
    },
    JobUpdate {
        jobid: u32,
        status: u32,
    },
    JobListAllResp {
        listing: Vec<Listing>,
    },
    JobResults {
        content: Vec<u8>,
    },
}

impl Frame {
    /// The one-byte tag this frame will be/was sent with.
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Ack => tag::ACK,
            Frame::Nack => tag::NACK,
            Frame::Login { .. } => tag::LOGIN,
            Frame::JobSubmit { .. } => tag::JOB_SUBMIT,
            Frame::JobStatus { .. } => tag::JOB_STATUS,
            Frame::JobSignal { .. } => tag::JOB_SIGNAL,
            Frame::JobSetPri { .. } => tag::JOB_SET_PRI,
            Frame::JobGetStdout { .. } => tag::JOB_GET_STDOUT,
            Frame::JobGetStderr { .. } => tag::JOB_GET_STDERR,
            Frame::JobListAll => tag::JOB_LIST_ALL,
            Frame::JobExpunge { .. } => tag::JOB_EXPUNGE,
            Frame::JobSubmitSuccess { .. } => tag::JOB_SUBMIT_SUCCESS,
            Frame::JobStatusResp { .. } => tag::JOB_STATUS_RESP,
            Frame::JobUpdate { .. } => tag::JOB_UPDATE,
            Frame::JobListAllResp { .. } => tag::JOB_LIST_ALL_RESP,
            Frame::JobResults { .. } => tag::JOB_RESULTS,
        }
    }
}
