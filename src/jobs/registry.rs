//! The job/client registry: the single source of truth for all scheduling
//! state, mutated only by the one task that owns the server.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use super::types::{Client, ClientId, GlobalJobId, Job, JobStatus};
use crate::proto::WireRusage;

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("client {0:?} is already connected")]
    AlreadyConnected(String),
    #[error("client name must not be empty")]
    EmptyName,
}

/// Arguments for a freshly submitted job, before admission is decided.
pub struct NewJob {
    pub argv: Vec<Vec<u8>>,
    pub env: Vec<Vec<u8>>,
    pub maxcpu: u32,
    pub maxmem: u32,
    pub priority: i32,
}

pub struct Registry {
    clients: Vec<Client>,
    /// Global job slab in insertion order. Entries are tombstoned with
    /// `None` on expunge/shutdown but never removed or reused, so indices
    /// (and therefore [`GlobalJobId`]s) stay stable and scans stay in
    /// submission order.
    jobs: Vec<Option<Job>>,
    maxjobs: Option<u32>,
    numjobs: u32,
}

impl Registry {
    pub fn new(maxjobs: Option<u32>) -> Self {
        Self {
            clients: Vec::new(),
            jobs: Vec::new(),
            maxjobs,
            numjobs: 0,
        }
    }

    pub fn numjobs(&self) -> u32 {
        self.numjobs
    }

    pub fn has_capacity(&self) -> bool {
        match self.maxjobs {
            Some(max) => self.numjobs < max,
            None => true,
        }
    }

    /// Binds `name` to a client, creating one if it doesn't exist yet, and
    /// re-binding a previously-disconnected one. Rejects a name that's
    /// already bound to a live connection.
    pub fn login(&mut self, name: &[u8]) -> Result<ClientId, LoginError> {
        if name.is_empty() {
            return Err(LoginError::EmptyName);
        }

        if let Some((idx, client)) = self
            .clients
            .iter_mut()
            .enumerate()
            .find(|(_, c)| c.name == name)
        {
            if client.connected {
                return Err(LoginError::AlreadyConnected(
                    String::from_utf8_lossy(name).into_owned(),
                ));
            }
            client.connected = true;
            return Ok(ClientId(idx));
        }

        let idx = self.clients.len();
        self.clients.push(Client::new(name.to_vec()));
        Ok(ClientId(idx))
    }

    pub fn disconnect(&mut self, id: ClientId) {
        self.clients[id.0].connected = false;
    }

    pub fn client(&self, id: ClientId) -> &Client {
        &self.clients[id.0]
    }

    /// Creates a job for `owner` in the NEW state. Does not launch it —
    /// callers decide admission separately so the launcher stays the only
    /// place that forks.
    pub fn submit(&mut self, owner: ClientId, spec: NewJob) -> GlobalJobId {
        let jobid = self.clients[owner.0].take_next_jobid();
        let (stdout_path, stderr_path) = output_paths(&self.clients[owner.0].name, jobid);

        let job = Job {
            owner,
            jobid,
            argv: spec.argv,
            env: spec.env,
            maxcpu: spec.maxcpu,
            maxmem: spec.maxmem,
            priority: spec.priority,
            status: JobStatus::New,
            exitcode: 0,
            pgid: None,
            rusage: WireRusage::default(),
            stdout_path,
            stderr_path,
        };

        let gid = GlobalJobId(self.jobs.len());
        self.jobs.push(Some(job));
        self.clients[owner.0].job_slots.push(gid);
        gid
    }

    pub fn job(&self, id: GlobalJobId) -> &Job {
        self.jobs[id.0].as_ref().expect("job id refers to a live slot")
    }

    pub fn job_mut(&mut self, id: GlobalJobId) -> &mut Job {
        self.jobs[id.0].as_mut().expect("job id refers to a live slot")
    }

    /// O(n) lookup within `client`'s own job list, as only that scope
    /// guarantees jobid uniqueness.
    pub fn by_jobid(&self, client: ClientId, jobid: u32) -> Option<GlobalJobId> {
        self.clients[client.0]
            .job_slots
            .iter()
            .copied()
            .find(|&gid| self.job(gid).jobid == jobid)
    }

    /// O(N) linear scan of the global job slab — the reaper's only way to
    /// map a reaped pid back to a job, mirroring the reference
    /// implementation's linear list walk.
    pub fn by_pgid(&self, pid: u32) -> Option<GlobalJobId> {
        self.jobs
            .iter()
            .enumerate()
            .find_map(|(i, slot)| match slot {
                Some(job) if job.pgid == Some(pid) => Some(GlobalJobId(i)),
                _ => None,
            })
    }

    /// All of `client`'s jobs, in submission order, skipping expunged ones.
    pub fn client_jobs(&self, client: ClientId) -> impl Iterator<Item = &Job> {
        self.clients[client.0]
            .job_slots
            .iter()
            .filter_map(move |&gid| self.jobs[gid.0].as_ref())
    }

    /// NEW jobs across every client, in global submission order — the order
    /// backfill must respect.
    pub fn new_jobs_in_order(&self) -> impl Iterator<Item = GlobalJobId> + '_ {
        self.jobs.iter().enumerate().filter_map(|(i, slot)| {
            slot.as_ref()
                .filter(|j| j.status == JobStatus::New)
                .map(|_| GlobalJobId(i))
        })
    }

    /// Records a job as launched: pgid assigned, status RUNNING, counted
    /// against `numjobs`.
    pub fn mark_launched(&mut self, id: GlobalJobId, pgid: u32) {
        let job = self.job_mut(id);
        job.pgid = Some(pgid);
        job.status = JobStatus::Running;
        self.numjobs += 1;
    }

    /// Applies a status transition reported by the reaper (or a forced
    /// abort such as a failed `spawn()`), adjusting `numjobs` to match
    /// whether the job counts as active before and after.
    pub fn set_status(&mut self, id: GlobalJobId, status: JobStatus) {
        let job = self.job_mut(id);
        let was_active = job.status.is_active();
        job.status = status;
        let is_active = status.is_active();
        if is_active && !was_active {
            self.numjobs += 1;
        } else if was_active && !is_active {
            self.numjobs -= 1;
        }
    }

    /// Removes a job permanently: unlinks its output files and tombstones
    /// its slab slot. The caller must have already ensured the job isn't
    /// live (signalled and reaped, or never launched).
    pub fn remove(&mut self, id: GlobalJobId) {
        let job = self.jobs[id.0].take().expect("job id refers to a live slot");
        let _ = std::fs::remove_file(&job.stdout_path);
        let _ = std::fs::remove_file(&job.stderr_path);
        self.clients[job.owner.0].job_slots.retain(|&gid| gid != id);
    }

    /// Every client currently known to the registry, live or disconnected —
    /// used at shutdown to sweep every job.
    pub fn client_ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        (0..self.clients.len()).map(ClientId)
    }
}

fn output_paths(client_name: &[u8], jobid: u32) -> (std::path::PathBuf, std::path::PathBuf) {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let name = String::from_utf8_lossy(client_name);
    let stem = format!("{name}_{}{}", now.as_secs(), now.subsec_micros());
    // jobid is folded in defensively: two jobs submitted by the same client
    // within the same microsecond would otherwise collide.
    let stem = format!("{stem}_{jobid}");
    (
        std::path::PathBuf::from(format!("{stem}.out")),
        std::path::PathBuf::from(format!("{stem}.err")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn login_rejects_empty_name() {
        let mut reg = Registry::new(None);
        assert!(matches!(reg.login(b""), Err(LoginError::EmptyName)));
        assert_eq!(reg.client_ids().count(), 0);
    }

    #[test]
    fn login_creates_then_rebinds() {
        let mut reg = Registry::new(None);
        let a = reg.login(b"alice").unwrap();
        assert!(matches!(reg.login(b"alice"), Err(LoginError::AlreadyConnected(_))));
        reg.disconnect(a);
        let a2 = reg.login(b"alice").unwrap();
        assert_eq!(a, a2);
    }

    #[test]
    fn jobids_are_monotonic_and_not_reused() {
        let mut reg = Registry::new(None);
        let a = reg.login(b"alice").unwrap();
        let j0 = reg.submit(a, spec("true"));
        let j1 = reg.submit(a, spec("true"));
        assert_eq!(reg.job(j0).jobid, 0);
        assert_eq!(reg.job(j1).jobid, 1);
        reg.remove(j0);
        let j2 = reg.submit(a, spec("true"));
        assert_eq!(reg.job(j2).jobid, 2);
    }

    #[test]
    fn admission_cap_is_respected_by_numjobs_bookkeeping() {
        let mut reg = Registry::new(Some(1));
        let a = reg.login(b"alice").unwrap();
        let j0 = reg.submit(a, spec("sleep 5"));
        assert!(reg.has_capacity());
        reg.mark_launched(j0, 100);
        assert_eq!(reg.numjobs(), 1);
        assert!(!reg.has_capacity());
    }

    #[test]
    fn backfill_order_is_submission_order() {
        let mut reg = Registry::new(Some(1));
        let a = reg.login(b"alice").unwrap();
        let j0 = reg.submit(a, spec("sleep 5"));
        let j1 = reg.submit(a, spec("sleep 5"));
        reg.mark_launched(j0, 100);
        let order: Vec<_> = reg.new_jobs_in_order().collect();
        assert_eq!(order, vec![j1]);
    }

    #[test]
    fn terminal_status_stops_counting_against_numjobs() {
        let mut reg = Registry::new(Some(4));
        let a = reg.login(b"alice").unwrap();
        let j0 = reg.submit(a, spec("true"));
        reg.mark_launched(j0, 100);
        assert_eq!(reg.numjobs(), 1);
        reg.set_status(j0, JobStatus::Exited);
        assert_eq!(reg.numjobs(), 0);
        assert!(reg.job(j0).status.is_terminal());
    }

    #[test]
    fn by_pgid_finds_only_live_jobs() {
        let mut reg = Registry::new(None);
        let a = reg.login(b"alice").unwrap();
        let j0 = reg.submit(a, spec("sleep 5"));
        assert_eq!(reg.by_pgid(42), None);
        reg.mark_launched(j0, 42);
        assert_eq!(reg.by_pgid(42), Some(j0));
    }
}
