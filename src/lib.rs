//! A supervised batch job server: clients submit shell-style commands over a
//! local Unix socket, the server forks each into its own process group with
//! resource limits applied, tracks lifecycle via asynchronous reaping, and
//! streams status updates and captured output back over a framed binary
//! protocol.

pub mod jobs;
pub mod proto;
pub mod server;
