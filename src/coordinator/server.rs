//! Coordinator server
//!
//! One tokio task per connection. All of them reach the [`Coordinator`]
//! through [`SharedCoordinator`], which runs each operation to completion
//! under a single lock and broadcasts the configuration version afterwards
//! so host sessions wake up and push what is pending.

use crate::common::{AuditLogger, CoordinatorConfig, Error, Result};
use crate::coordinator::control;
use crate::coordinator::host::HostSession;
use crate::coordinator::state::Coordinator;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// The single path to the coordinator state.
#[derive(Clone)]
pub struct SharedCoordinator {
    inner: Arc<Mutex<Coordinator>>,
    version: Arc<watch::Sender<u64>>,
}

impl SharedCoordinator {
    pub fn new(coord: Coordinator) -> Self {
        let (version, _) = watch::channel(coord.config_version());
        Self {
            inner: Arc::new(Mutex::new(coord)),
            version: Arc::new(version),
        }
    }

    /// Run one operation against the coordinator, then publish the
    /// configuration version if it moved.
    pub fn with<R>(&self, f: impl FnOnce(&mut Coordinator) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let result = f(&mut guard);
        let current = guard.config_version();
        drop(guard);
        self.version.send_if_modified(|published| {
            if *published != current {
                *published = current;
                true
            } else {
                false
            }
        });
        result
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }
}

pub struct CoordinatorServer {
    config: CoordinatorConfig,
    shared: SharedCoordinator,
    audit: Arc<AuditLogger>,
}

impl CoordinatorServer {
    pub fn new(config: CoordinatorConfig, coord: Coordinator) -> Self {
        let audit = match &config.audit_log {
            Some(path) => AuditLogger::open(path),
            None => AuditLogger::disabled(),
        };
        Self {
            config,
            shared: SharedCoordinator::new(coord),
            audit: Arc::new(audit),
        }
    }

    pub fn shared(&self) -> SharedCoordinator {
        self.shared.clone()
    }

    pub async fn serve(self) -> Result<()> {
        let host = TcpListener::bind(self.config.host_addr()).await?;
        let control = TcpListener::bind(self.config.control_addr()).await?;
        self.serve_with_listeners(host, control).await
    }

    /// Accept on already-bound listeners until the process is stopped.
    pub async fn serve_with_listeners(self, host: TcpListener, control: TcpListener) -> Result<()> {
        tracing::info!("Starting coordinator");
        tracing::info!("  Host port: {}", host.local_addr()?);
        tracing::info!("  Control port: {}", control.local_addr()?);
        if let Some(path) = &self.config.snapshot_path {
            tracing::info!("  Snapshot path: {}", path.display());
        }
        tracing::info!("✓ Coordinator ready ({})", self.shared.with(|c| c.state()));

        loop {
            tokio::select! {
                accepted = host.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = self.shared.clone();
                        let audit = self.audit.clone();
                        tokio::spawn(run_host_connection(stream, peer, shared, audit));
                    }
                    Err(e) => tracing::warn!("Host accept failed: {}", e),
                },
                accepted = control.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = self.shared.clone();
                        let audit = self.audit.clone();
                        let snapshot_path = self.config.snapshot_path.clone();
                        tokio::spawn(async move {
                            run_control_connection(stream, peer, shared, audit, snapshot_path.as_deref())
                                .await
                        });
                    }
                    Err(e) => tracing::warn!("Control accept failed: {}", e),
                },
            }
        }
    }
}

fn log_closed(id: &str, result: Result<()>) {
    match result {
        Ok(()) | Err(Error::EndConnection) => tracing::info!("{} disconnected", id),
        Err(e) if e.terminates_connection() => tracing::error!("connection killed: {}", e),
        Err(e) => tracing::error!("{} failed: {}", id, e),
    }
}

async fn run_host_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: SharedCoordinator,
    audit: Arc<AuditLogger>,
) {
    let mut session = HostSession::new(peer);
    let result = host_loop(stream, &mut session, &shared, &audit).await;
    log_closed(&session.id(), result);
}

async fn host_loop(
    stream: TcpStream,
    session: &mut HostSession,
    shared: &SharedCoordinator,
    audit: &AuditLogger,
) -> Result<()> {
    let (read, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut versions = shared.subscribe();

    loop {
        if let Some(config) = shared.with(|c| session.next_outgoing(c)) {
            writer.write_all(config.as_bytes()).await?;
        }

        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Err(Error::EndConnection);
                };
                let event = shared.with(|c| session.handle_line(c, &line))?;
                if let Some(event) = event {
                    audit.log_event(event.event, session.id(), Some(event.target), shared.version());
                }
            }
            changed = versions.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

async fn run_control_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: SharedCoordinator,
    audit: Arc<AuditLogger>,
    snapshot_path: Option<&Path>,
) {
    let id = format!("Control({})", peer);
    tracing::info!("new control connection {}", id);
    let result = control_loop(stream, &id, &shared, &audit, snapshot_path).await;
    log_closed(&id, result);
}

async fn control_loop(
    stream: TcpStream,
    id: &str,
    shared: &SharedCoordinator,
    audit: &AuditLogger,
    snapshot_path: Option<&Path>,
) -> Result<()> {
    let (read, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        let replies = shared.with(|c| control::handle_line(c, &line))?;
        for reply in replies {
            if let Some((event, target)) = reply.event {
                audit.log_event(event, id, target, shared.version());
            }
            if let (Some(snapshot), Some(path)) = (&reply.snapshot, snapshot_path) {
                write_snapshot(path, snapshot).await;
            }
            writer.write_all(reply.response.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
    }
    Ok(())
}

async fn write_snapshot(path: &Path, snapshot: &str) {
    match tokio::fs::write(path, snapshot).await {
        Ok(()) => tracing::info!("Wrote shutdown snapshot to {}", path.display()),
        Err(e) => tracing::error!("Could not write snapshot to {}: {}", path.display(), e),
    }
}
