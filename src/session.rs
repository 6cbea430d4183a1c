//! RPC session — the MCP request/response protocol over one line transport.
//!
//! A session is created in the `Initializing` state, drives the fixed
//! handshake (initialize request, validated response, `initialized`
//! notification), and then serves `call()` in the `Ready` state. Because
//! the child process handles one request at a time on a single shared
//! stream, calls are serialized: the session's own lock is held for the
//! full round trip, so a new request frame is never written before the
//! previous response frame has been fully read.
//!
//! Any frame that cannot be decoded or whose correlation id does not match
//! the pending request closes the session — a desynchronized stream is not
//! salvageable. Transport EOF or a write failure likewise closes the
//! session; subsequent calls fail immediately without attempting I/O.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::error::GatewayError;
use crate::transport::LineTransport;

/// MCP protocol version sent during the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Correlation id reserved for the initialize request. Call ids start
/// strictly above this and are never reused within a session.
const HANDSHAKE_ID: u64 = 1;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake in progress.
    Initializing,
    /// Handshake complete; calls accepted.
    Ready,
    /// Terminal: explicit close, transport EOF, or protocol violation.
    Closed,
}

struct SessionIo {
    transport: LineTransport,
    state: SessionState,
}

/// One MCP session bound to a subprocess's stdio streams.
pub struct RpcSession {
    server_id: String,
    /// Held for a full call round trip — this is the per-process lock that
    /// serializes concurrent callers targeting the same server.
    io: Mutex<SessionIo>,
    /// Strictly increasing correlation ids, starting above the handshake id.
    next_id: AtomicU64,
    /// Lock-free mirror of `SessionIo::state == Closed`, so liveness checks
    /// never queue behind an in-flight call.
    closed: AtomicBool,
}

impl RpcSession {
    /// Bind a transport and drive the MCP handshake to completion.
    ///
    /// On success the session is `Ready`. Any validation failure, transport
    /// error, or timeout surfaces as [`GatewayError::Initialization`]; the
    /// caller is responsible for terminating the subprocess in that case.
    pub async fn initialize(
        server_id: &str,
        transport: LineTransport,
        timeout: Duration,
    ) -> crate::Result<Self> {
        let session = Self {
            server_id: server_id.to_string(),
            io: Mutex::new(SessionIo {
                transport,
                state: SessionState::Initializing,
            }),
            next_id: AtomicU64::new(HANDSHAKE_ID + 1),
            closed: AtomicBool::new(false),
        };

        // Bind before matching so a timed-out handshake future (and any
        // lock it holds) is dropped before close() runs.
        let outcome = tokio::time::timeout(timeout, session.handshake()).await;
        match outcome {
            Err(_elapsed) => {
                session.close().await;
                Err(GatewayError::Initialization(
                    server_id.to_string(),
                    format!("handshake timed out after {}s", timeout.as_secs()),
                ))
            }
            Ok(Err(e)) => {
                session.close().await;
                Err(e)
            }
            Ok(Ok(())) => Ok(session),
        }
    }

    /// The logical identifier of the server this session is bound to.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// True once the session has transitioned to `Closed`.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn handshake(&self) -> crate::Result<()> {
        let init_err = |msg: String| GatewayError::Initialization(self.server_id.clone(), msg);

        let mut io = self.io.lock().await;

        let request = json!({
            "jsonrpc": "2.0",
            "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            },
            "id": HANDSHAKE_ID,
        });
        io.transport
            .write_frame(&request.to_string())
            .await
            .map_err(|e| init_err(format!("failed to send initialize: {}", e)))?;

        let frame = match io.transport.read_frame().await {
            Err(e) => return Err(init_err(format!("failed to read initialize response: {}", e))),
            Ok(None) => return Err(init_err("server closed stream during handshake".to_string())),
            Ok(Some(frame)) => frame,
        };

        let response: Value = serde_json::from_str(&frame)
            .map_err(|e| init_err(format!("initialize response is not valid JSON: {}", e)))?;

        if response.get("id").and_then(Value::as_u64) != Some(HANDSHAKE_ID) {
            return Err(init_err(
                "initialize response id does not match request".to_string(),
            ));
        }
        if let Some(error) = response.get("error") {
            return Err(init_err(format!("server rejected initialize: {}", error)));
        }
        let result = response
            .get("result")
            .ok_or_else(|| init_err("initialize response missing 'result'".to_string()))?;
        if !result.get("protocolVersion").is_some_and(Value::is_string) {
            return Err(init_err(
                "initialize result missing 'protocolVersion'".to_string(),
            ));
        }
        if !result.get("capabilities").is_some_and(Value::is_object) {
            return Err(init_err(
                "initialize result missing 'capabilities' object".to_string(),
            ));
        }

        let notification = json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
            "params": {},
        });
        io.transport
            .write_frame(&notification.to_string())
            .await
            .map_err(|e| init_err(format!("failed to send initialized notification: {}", e)))?;

        io.state = SessionState::Ready;
        tracing::debug!(server = %self.server_id, "session initialized");
        Ok(())
    }

    /// Perform one request/response round trip.
    ///
    /// Allocates the next correlation id, writes the request frame, and
    /// reads exactly one response frame. Concurrent callers queue on the
    /// session lock for the duration of the full round trip.
    pub async fn call(&self, method: &str, params: Value) -> crate::Result<Value> {
        if self.is_closed() {
            return Err(GatewayError::ConnectionLost(self.server_id.clone()));
        }

        let mut io = self.io.lock().await;
        if io.state != SessionState::Ready {
            return Err(GatewayError::ConnectionLost(self.server_id.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        if io.transport.write_frame(&request.to_string()).await.is_err() {
            self.mark_closed(&mut io);
            return Err(GatewayError::ConnectionLost(self.server_id.clone()));
        }

        let frame = match io.transport.read_frame().await {
            Err(_) | Ok(None) => {
                self.mark_closed(&mut io);
                return Err(GatewayError::ConnectionLost(self.server_id.clone()));
            }
            Ok(Some(frame)) => frame,
        };

        let response: Value = match serde_json::from_str(&frame) {
            Ok(v) => v,
            Err(e) => {
                self.mark_closed(&mut io);
                return Err(GatewayError::Protocol(
                    self.server_id.clone(),
                    format!("response is not valid JSON: {}", e),
                ));
            }
        };

        if response.get("id").and_then(Value::as_u64) != Some(id) {
            self.mark_closed(&mut io);
            return Err(GatewayError::Protocol(
                self.server_id.clone(),
                format!("response id does not match pending request {}", id),
            ));
        }

        if let Some(error) = response.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32603);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(GatewayError::Rpc {
                server: self.server_id.clone(),
                code,
                message,
            });
        }

        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    /// [`call`](Self::call) wrapped with a caller timeout.
    ///
    /// On timeout the session is closed rather than resumed: a response
    /// frame may still be in flight with no one waiting for it, and
    /// skipping frames cannot be done safely. The next get-or-create
    /// against this server relaunches a fresh process.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> crate::Result<Value> {
        // Bind before matching so the abandoned call future releases the
        // session lock before close() tries to take it.
        let outcome = tokio::time::timeout(timeout, self.call(method, params)).await;
        match outcome {
            Ok(result) => result,
            Err(_elapsed) => {
                self.close().await;
                Err(GatewayError::CallTimeout(self.server_id.clone()))
            }
        }
    }

    /// Ask the server for its live tool list (`tools/list`).
    pub async fn list_tools(&self, timeout: Duration) -> crate::Result<Value> {
        self.call_with_timeout("tools/list", json!({}), timeout).await
    }

    /// Close the session. Idempotent; also closes the transport's write
    /// half so the subprocess sees EOF on its stdin.
    pub async fn close(&self) {
        let mut io = self.io.lock().await;
        if io.state != SessionState::Closed {
            io.transport.close().await;
        }
        self.mark_closed(&mut io);
    }

    fn mark_closed(&self, io: &mut SessionIo) {
        io.state = SessionState::Closed;
        self.closed.store(true, Ordering::Release);
    }
}
