//! Process pool — at most one live subprocess per server id, created on
//! demand and reused across calls.
//!
//! The pool keeps one slot per server id. Slot creation is guarded by a
//! per-slot lock so concurrent first requests for the same server perform
//! exactly one launch (single flight); the outer map lock is only ever held
//! for the slot lookup itself, never across a spawn or a call, so servers
//! never block each other.
//!
//! Slots are never removed from the map — the map is bounded by the
//! registry, and an empty slot costs nothing. Termination clears the slot's
//! occupant; the next get-or-create relaunches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::config::ServerSpec;
use crate::launcher::{self, ProcessHandle};
use crate::session::RpcSession;
use crate::transport::LineTransport;

/// A freshly spawned, handshake-complete process.
///
/// `handle` is `None` for in-memory backends that have no OS process.
pub struct SpawnedProcess {
    pub session: RpcSession,
    pub handle: Option<ProcessHandle>,
}

/// How the pool obtains a live process for a server spec. The production
/// implementation launches subprocesses; tests substitute in-memory stubs.
#[async_trait::async_trait]
pub trait Spawn: Send + Sync {
    async fn spawn(&self, id: &str, spec: &ServerSpec) -> crate::Result<SpawnedProcess>;
}

/// Production spawner: subprocess (docker or direct executable) with the
/// MCP handshake driven to completion before the process is handed over.
pub struct ContainerSpawner;

#[async_trait::async_trait]
impl Spawn for ContainerSpawner {
    async fn spawn(&self, id: &str, spec: &ServerSpec) -> crate::Result<SpawnedProcess> {
        let mut handle = launcher::launch(id, spec)?;

        // Pipes are always requested at spawn; absence is unreachable in
        // practice but mapped to a launch error rather than a panic.
        let (stdin, stdout) = match (handle.take_stdin(), handle.take_stdout()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                handle.terminate(Duration::from_secs(1)).await;
                return Err(crate::error::GatewayError::Launch(
                    id.to_string(),
                    "subprocess stdio pipes unavailable".to_string(),
                ));
            }
        };
        if let Some(stderr) = handle.take_stderr() {
            launcher::spawn_stderr_drain(id.to_string(), stderr);
        }

        let transport = LineTransport::new(stdout, stdin);
        let handshake_timeout = Duration::from_secs(spec.handshake_timeout_secs);
        match RpcSession::initialize(id, transport, handshake_timeout).await {
            Ok(session) => Ok(SpawnedProcess {
                session,
                handle: Some(handle),
            }),
            Err(e) => {
                // A process that failed its handshake is never retained.
                handle.terminate(Duration::from_secs(2)).await;
                Err(e)
            }
        }
    }
}

/// One live managed process: the session plus lifecycle metadata.
pub struct ManagedProcess {
    id: String,
    session: RpcSession,
    handle: Mutex<Option<ProcessHandle>>,
    started_at: DateTime<Utc>,
    last_used: RwLock<DateTime<Utc>>,
}

impl ManagedProcess {
    fn new(id: String, spawned: SpawnedProcess) -> Self {
        let now = Utc::now();
        Self {
            id,
            session: spawned.session,
            handle: Mutex::new(spawned.handle),
            started_at: now,
            last_used: RwLock::new(now),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &RpcSession {
        &self.session
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub async fn last_used(&self) -> DateTime<Utc> {
        *self.last_used.read().await
    }

    /// Record activity, deferring idle reclamation.
    pub async fn touch(&self) {
        *self.last_used.write().await = Utc::now();
    }

    /// Close the session and terminate the subprocess. Idempotent.
    pub async fn shutdown(&self, grace: Duration) {
        self.session.close().await;
        if let Some(mut handle) = self.handle.lock().await.take() {
            handle.terminate(grace).await;
        }
    }
}

/// Point-in-time view of one pooled process, for `list_active` output.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

struct PoolSlot {
    current: RwLock<Option<Arc<ManagedProcess>>>,
}

/// The pool itself. Cheap to share via `Arc`.
pub struct ProcessPool {
    spawner: Arc<dyn Spawn>,
    slots: Mutex<HashMap<String, Arc<PoolSlot>>>,
    termination_grace: Duration,
}

impl ProcessPool {
    pub fn new(spawner: Arc<dyn Spawn>, termination_grace: Duration) -> Self {
        Self {
            spawner,
            slots: Mutex::new(HashMap::new()),
            termination_grace,
        }
    }

    async fn slot(&self, id: &str) -> Arc<PoolSlot> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(PoolSlot {
                    current: RwLock::new(None),
                })
            })
            .clone()
    }

    /// Return the live process for `id`, launching one if necessary.
    ///
    /// Holding the slot's write lock across the spawn is what makes
    /// concurrent callers single-flight: the first caller launches, the
    /// rest block on the lock and then take the warm hit. A failed spawn
    /// leaves the slot empty so the next caller retries from scratch.
    pub async fn get_or_create(
        &self,
        id: &str,
        spec: &ServerSpec,
    ) -> crate::Result<Arc<ManagedProcess>> {
        let slot = self.slot(id).await;
        let mut current = slot.current.write().await;

        if let Some(process) = current.as_ref() {
            if !process.session().is_closed() {
                process.touch().await;
                return Ok(process.clone());
            }
            // Dead occupant: reap it before relaunching.
            let dead = process.clone();
            *current = None;
            dead.shutdown(self.termination_grace).await;
            tracing::info!(server = %id, "replacing dead pooled process");
        }

        let spawned = self.spawner.spawn(id, spec).await?;
        let process = Arc::new(ManagedProcess::new(id.to_string(), spawned));
        *current = Some(process.clone());
        tracing::info!(server = %id, "pooled process ready");
        Ok(process)
    }

    /// Remove `process` from the pool and terminate it, but only if it is
    /// still the slot's occupant. The pointer comparison prevents an error
    /// path from tearing down a replacement launched in the meantime.
    pub async fn remove_entry(&self, id: &str, process: &Arc<ManagedProcess>) {
        let slot = self.slot(id).await;
        {
            let mut current = slot.current.write().await;
            match current.as_ref() {
                Some(occupant) if Arc::ptr_eq(occupant, process) => *current = None,
                _ => return,
            }
        }
        process.shutdown(self.termination_grace).await;
    }

    /// Terminate the process for `id` if one is running. Returns whether a
    /// process was actually stopped.
    pub async fn terminate(&self, id: &str) -> bool {
        let slot = {
            let slots = self.slots.lock().await;
            match slots.get(id) {
                Some(slot) => slot.clone(),
                None => return false,
            }
        };
        let process = slot.current.write().await.take();
        match process {
            Some(process) => {
                process.shutdown(self.termination_grace).await;
                tracing::info!(server = %id, "terminated pooled process");
                true
            }
            None => false,
        }
    }

    /// Snapshot every live process. Slots mid-creation are skipped rather
    /// than waited on.
    pub async fn list(&self) -> Vec<ProcessSnapshot> {
        let slots: Vec<(String, Arc<PoolSlot>)> = {
            let slots = self.slots.lock().await;
            slots.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut snapshots = Vec::new();
        for (id, slot) in slots {
            let Ok(current) = slot.current.try_read() else {
                continue;
            };
            if let Some(process) = current.as_ref() {
                if !process.session().is_closed() {
                    snapshots.push(ProcessSnapshot {
                        id,
                        started_at: process.started_at(),
                        last_used: process.last_used().await,
                    });
                }
            }
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Terminate every pooled process. Used at gateway shutdown.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = {
            let slots = self.slots.lock().await;
            slots.keys().cloned().collect()
        };
        for id in ids {
            self.terminate(&id).await;
        }
    }
}
