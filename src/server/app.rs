//! The single-task event loop: listens, multiplexes every connection and
//! signal stream, and owns all mutable server state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use futures::{SinkExt, StreamExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::{Stream, StreamMap};
use tracing::{debug, info, warn};

use crate::jobs::{reap_and_backfill, JobStatus, Registry};
use crate::proto::{Frame, FrameCodec, FrameError};

use super::conn::{ConnId, ConnTable};
use super::dispatcher::{self, update_frame};

/// One item from a connection's event stream: either a decoded frame (or a
/// decode/transport error), or an explicit end-of-stream marker. The marker
/// exists because `StreamMap` silently drops a key whose stream ends, and
/// the accept loop needs an event to react to so it can flip the owning
/// client's connected flag and free the connection table entry.
enum ConnEvent {
    Frame(Result<Frame, FrameError>),
    Closed,
}

type ConnStream = Pin<Box<dyn Stream<Item = ConnEvent> + Send>>;

pub struct Server {
    registry: Registry,
    conns: ConnTable,
    reads: StreamMap<ConnId, ConnStream>,
    writes: HashMap<ConnId, tokio_util::codec::FramedWrite<OwnedWriteHalf, FrameCodec>>,
    listener: UnixListener,
    socket_path: PathBuf,
    shutting_down: bool,
    on_sigusr1: Box<dyn FnMut() + Send>,
}

impl Server {
    /// Binds the listening socket, refusing to start if the path already
    /// exists (a stale socket from a previous run must be cleaned up by the
    /// operator, not silently clobbered).
    pub fn bind(
        socket_path: impl AsRef<Path>,
        maxjobs: Option<u32>,
        on_sigusr1: Box<dyn FnMut() + Send>,
    ) -> anyhow::Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        if socket_path.exists() {
            anyhow::bail!(
                "socket path {} already exists; remove it or choose another with -f",
                socket_path.display()
            );
        }
        let listener = UnixListener::bind(&socket_path)?;
        Ok(Self {
            registry: Registry::new(maxjobs),
            conns: ConnTable::new(),
            reads: StreamMap::new(),
            writes: HashMap::new(),
            listener,
            socket_path,
            shutting_down: false,
            on_sigusr1,
        })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigchld = signal(SignalKind::child())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;

        loop {
            if self.shutting_down {
                break;
            }

            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => self.accept(stream),
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                Some((conn, event)) = self.reads.next() => {
                    self.handle_conn_event(conn, event).await;
                }
                _ = sigchld.recv() => {
                    self.handle_sigchld().await;
                }
                _ = sigusr1.recv() => {
                    (self.on_sigusr1)();
                    debug!("toggled debug logging");
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    self.shutting_down = true;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    self.shutting_down = true;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn accept(&mut self, stream: tokio::net::UnixStream) {
        let conn = self.conns.insert();
        let (read_half, write_half) = stream.into_split();
        let frames = tokio_util::codec::FramedRead::new(read_half, FrameCodec)
            .map(ConnEvent::Frame)
            .chain(tokio_stream::once(ConnEvent::Closed));
        self.reads.insert(conn, Box::pin(frames));
        self.writes
            .insert(conn, tokio_util::codec::FramedWrite::new(write_half, FrameCodec));
        debug!(conn = conn.0, "accepted connection");
    }

    async fn handle_conn_event(&mut self, conn: ConnId, event: ConnEvent) {
        match event {
            ConnEvent::Closed => self.drop_connection(conn),
            ConnEvent::Frame(Err(e)) => {
                warn!(conn = conn.0, error = %e, "decode error, disconnecting");
                self.drop_connection(conn);
            },
            ConnEvent::Frame(Ok(frame)) => {
                let outcome = dispatcher::dispatch(&mut self.registry, &mut self.conns, conn, frame);
                for reply in outcome.replies {
                    self.send(conn, reply).await;
                }
                if outcome.disconnect {
                    self.drop_connection(conn);
                }
            },
        }
    }

    async fn handle_sigchld(&mut self) {
        let changed = reap_and_backfill(&mut self.registry);
        for change in changed {
            let owner = self.registry.job(change.job).owner;
            if let Some(conn) = self.conns.conn_for_client(owner) {
                let frame = update_frame(&self.registry, change.job);
                self.send(conn, frame).await;
            }
        }
    }

    async fn send(&mut self, conn: ConnId, frame: Frame) {
        if let Some(writer) = self.writes.get_mut(&conn) {
            if let Err(e) = writer.send(frame).await {
                warn!(conn = conn.0, error = %e, "send failed, disconnecting");
                self.drop_connection(conn);
            }
        }
    }

    fn drop_connection(&mut self, conn: ConnId) {
        if let Some(client) = self.conns.bound_client(conn) {
            self.registry.disconnect(client);
        }
        self.reads.remove(&conn);
        self.writes.remove(&conn);
        self.conns.remove(conn);
    }

    async fn shutdown(&mut self) {
        info!("shutting down: killing all live jobs");
        for client in self.registry.client_ids().collect::<Vec<_>>() {
            let live: Vec<_> = self
                .registry
                .client_jobs(client)
                .filter(|j| j.status.is_active())
                .filter_map(|j| j.pgid)
                .collect();
            for pgid in live {
                unsafe {
                    libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
                }
                let mut status = 0;
                // Blocking wait is acceptable here: shutdown happens once,
                // at process exit, with no further events to serve.
                unsafe {
                    libc::waitpid(pgid as libc::pid_t, &mut status, 0);
                }
            }
        }

        for client in self.registry.client_ids().collect::<Vec<_>>() {
            let gids: Vec<_> = self
                .registry
                .client_jobs(client)
                .map(|j| j.jobid)
                .collect();
            for jobid in gids {
                if let Some(gid) = self.registry.by_jobid(client, jobid) {
                    if self.registry.job(gid).status.is_active() {
                        self.registry.set_status(gid, JobStatus::Canceled);
                    }
                    self.registry.remove(gid);
                }
            }
        }

        for conn in self.conns.ids().collect::<Vec<_>>() {
            self.writes.remove(&conn);
            self.reads.remove(&conn);
        }

        let _ = std::fs::remove_file(&self.socket_path);
    }
}
