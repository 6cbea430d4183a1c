//! Gateway facade — the four public operations, composed from the
//! registry, the pool, and the idle reaper.
//!
//! Every operation returns a [`crate::Result`]; the mapping to the
//! `{error: {kind, message}}` wire shape happens in [`error_body`], used by
//! whichever surface exposes the facade. Systems-level failures tear down
//! the affected pool entry before they surface, so the caller can simply
//! retry and get a fresh process.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Registry, ToolDescriptor};
use crate::error::GatewayError;
use crate::pool::{ContainerSpawner, ProcessPool, Spawn};
use crate::reaper;

/// Tunables that are properties of the gateway, not of any one server.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Interval between idle reaper sweeps.
    pub reaper_interval: Duration,
    /// Grace period between SIGTERM and forced kill.
    pub termination_grace: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            reaper_interval: Duration::from_secs(30),
            termination_grace: Duration::from_secs(5),
        }
    }
}

/// Tool-call arguments as supplied by the caller: either already
/// structured, or a JSON-encoded string that still needs decoding.
pub enum RawArguments {
    Structured(Map<String, Value>),
    Encoded(String),
}

impl RawArguments {
    /// Decode to a structured argument object. Anything that is not a JSON
    /// object is an argument error, except the empty string, which stands
    /// for "no arguments".
    fn normalize(self) -> crate::Result<Map<String, Value>> {
        match self {
            Self::Structured(map) => Ok(map),
            Self::Encoded(text) => {
                if text.trim().is_empty() {
                    return Ok(Map::new());
                }
                let value: Value = serde_json::from_str(&text)
                    .map_err(|e| GatewayError::Argument(format!("arguments are not valid JSON: {}", e)))?;
                match value {
                    Value::Object(map) => Ok(map),
                    other => Err(GatewayError::Argument(format!(
                        "arguments must be a JSON object, got {}",
                        json_type_name(&other)
                    ))),
                }
            }
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One row of `list_active` output.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveServer {
    pub server_id: String,
    pub started_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub idle_timeout: u64,
}

/// Outcome of a `stop` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    Stopped,
    NotRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopResult {
    pub server_id: String,
    pub status: StopStatus,
}

/// The gateway: registry + pool + reaper behind four operations.
pub struct Gateway {
    registry: Arc<Registry>,
    pool: Arc<ProcessPool>,
    settings: GatewaySettings,
    cancel: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Gateway backed by real subprocesses.
    pub fn new(registry: Arc<Registry>, settings: GatewaySettings) -> Self {
        Self::with_spawner(registry, settings, Arc::new(ContainerSpawner))
    }

    /// Gateway with a custom process source. Tests use this to substitute
    /// in-memory stubs for subprocesses.
    pub fn with_spawner(
        registry: Arc<Registry>,
        settings: GatewaySettings,
        spawner: Arc<dyn Spawn>,
    ) -> Self {
        let pool = Arc::new(ProcessPool::new(spawner, settings.termination_grace));
        Self {
            registry,
            pool,
            settings,
            cancel: CancellationToken::new(),
            reaper: Mutex::new(None),
        }
    }

    /// Start the background idle reaper. Call once after construction.
    pub async fn start(&self) {
        let mut reaper = self.reaper.lock().await;
        if reaper.is_some() {
            return;
        }
        *reaper = Some(tokio::spawn(reaper::run_idle_reaper(
            self.pool.clone(),
            self.registry.clone(),
            self.settings.reaper_interval,
            self.cancel.clone(),
        )));
    }

    /// Stop the reaper and terminate every pooled process.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.reaper.lock().await.take() {
            let _ = task.await;
        }
        self.pool.shutdown_all().await;
        tracing::info!("gateway shut down");
    }

    /// Registry-declared tools across all servers. Never touches a
    /// process — this is the cheap, always-available catalog.
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.registry.tool_descriptors()
    }

    /// Ask a live server what tools it actually serves (`tools/list`).
    /// Launches the server if it is not already running.
    pub async fn live_tools(&self, server_id: &str) -> crate::Result<Value> {
        let spec = self
            .registry
            .get(server_id)
            .ok_or_else(|| GatewayError::UnknownServer(server_id.to_string()))?;

        let process = self.pool.get_or_create(server_id, spec).await?;
        let timeout = Duration::from_secs(spec.call_timeout_secs);
        match process.session().list_tools(timeout).await {
            Ok(tools) => {
                process.touch().await;
                Ok(tools)
            }
            Err(e) => {
                if e.is_fatal_to_process() {
                    self.pool.remove_entry(server_id, &process).await;
                }
                Err(e)
            }
        }
    }

    /// Execute one tool call on a registered server, launching the server
    /// on demand and reusing it afterwards.
    pub async fn execute(
        &self,
        server_id: &str,
        tool: &str,
        arguments: RawArguments,
    ) -> crate::Result<Value> {
        let spec = self
            .registry
            .get(server_id)
            .ok_or_else(|| GatewayError::UnknownServer(server_id.to_string()))?;
        let arguments = arguments.normalize()?;

        let process = self.pool.get_or_create(server_id, spec).await?;
        let params = json!({
            "name": tool,
            "arguments": Value::Object(arguments),
        });
        let timeout = Duration::from_secs(spec.call_timeout_secs);

        match process
            .session()
            .call_with_timeout("tools/call", params, timeout)
            .await
        {
            Ok(result) => {
                process.touch().await;
                Ok(result)
            }
            Err(e) => {
                // The subprocess's own error responses leave the process
                // alive; systems failures evict it so the next call gets a
                // fresh launch.
                if e.is_fatal_to_process() {
                    tracing::warn!(server = %server_id, error = %e, "evicting failed process");
                    self.pool.remove_entry(server_id, &process).await;
                }
                Err(e)
            }
        }
    }

    /// Snapshot of currently running servers with their idle budgets.
    pub async fn list_active(&self) -> Vec<ActiveServer> {
        self.pool
            .list()
            .await
            .into_iter()
            .map(|snapshot| {
                let idle_timeout = self
                    .registry
                    .get(&snapshot.id)
                    .map(|spec| spec.idle_timeout)
                    .unwrap_or(crate::config::DEFAULT_IDLE_TIMEOUT_SECS);
                ActiveServer {
                    server_id: snapshot.id,
                    started_at: snapshot.started_at,
                    last_used: snapshot.last_used,
                    idle_timeout,
                }
            })
            .collect()
    }

    /// Stop a server's process if it is running. Idempotent: any id with
    /// no running process, registered or not, reports `not_running`
    /// rather than an error.
    pub async fn stop(&self, server_id: &str) -> crate::Result<StopResult> {
        let status = if self.pool.terminate(server_id).await {
            StopStatus::Stopped
        } else {
            StopStatus::NotRunning
        };
        Ok(StopResult {
            server_id: server_id.to_string(),
            status,
        })
    }
}

/// The wire shape for facade failures: `{"error": {"kind", "message"}}`.
pub fn error_body(error: &GatewayError) -> Value {
    json!({
        "error": {
            "kind": error.kind(),
            "message": error.to_string(),
        }
    })
}
