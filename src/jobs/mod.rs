//! Job and client entities, the registry that owns them, and the process
//! launcher/reaper that drive a job through its lifecycle.

mod launcher;
mod reaper;
mod registry;
mod split;
mod types;

pub use launcher::launch;
pub use reaper::{reap_and_backfill, Changed};
pub use registry::{LoginError, NewJob, Registry};
pub use split::split_argv;
pub use types::{Client, ClientId, GlobalJobId, Job, JobStatus};
