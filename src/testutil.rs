//! In-memory stub MCP servers for tests.
//!
//! `spawn_stub_server` stands in for a launched subprocess: it speaks the
//! line protocol over an in-memory duplex stream, answers the initialize
//! handshake, and then applies a scripted [`StubReply`] behavior to every
//! subsequent request. This lets session, pool, and gateway tests exercise
//! the full protocol path without docker or real child processes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::split;

use crate::config::ServerSpec;
use crate::pool::{Spawn, SpawnedProcess};
use crate::session::RpcSession;
use crate::transport::LineTransport;

/// Scripted behavior for the stub server's reply to each call request.
#[derive(Debug, Clone)]
pub enum StubReply {
    /// Complete the handshake; answer every call with this result.
    Result(Value),
    /// Complete the handshake; sleep, then answer with this result.
    DelayedResult { delay: Duration, result: Value },
    /// Complete the handshake; answer every call with a JSON-RPC error.
    Error { code: i64, message: String },
    /// Complete the handshake; answer with a line that is not valid JSON.
    MalformedFrame,
    /// Complete the handshake; answer with a correlation id that matches
    /// no pending request.
    WrongId,
    /// Complete the handshake; answer each call with a result object
    /// `{"id": <request id>}` so tests can observe id allocation.
    EchoId,
    /// Complete the handshake; close the stream after reading the first
    /// call request, without answering it.
    CloseAfterRequest,
    /// Complete the handshake; read call requests but never answer.
    NeverReply,
    /// Answer initialize with a result missing `protocolVersion`.
    HandshakeMissingFields,
    /// Answer initialize with a line that is not valid JSON.
    HandshakeGarbage,
    /// Read the initialize request, then close without answering.
    CloseDuringHandshake,
}

/// Start a stub server task and return the client-side transport, ready to
/// be handed to [`RpcSession::initialize`].
pub fn spawn_stub_server(reply: StubReply) -> LineTransport {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = split(client);
    let (server_read, server_write) = split(server);

    tokio::spawn(run_stub(
        LineTransport::new(server_read, server_write),
        reply,
    ));

    LineTransport::new(client_read, client_write)
}

async fn run_stub(mut transport: LineTransport, reply: StubReply) {
    // Handshake: read the initialize request first.
    let init = match transport.read_frame().await {
        Ok(Some(frame)) => frame,
        _ => return,
    };
    let init: Value = match serde_json::from_str(&init) {
        Ok(v) => v,
        Err(_) => return,
    };
    let init_id = init.get("id").cloned().unwrap_or(Value::Null);

    match &reply {
        StubReply::CloseDuringHandshake => {
            transport.close().await;
            return;
        }
        StubReply::HandshakeGarbage => {
            let _ = transport.write_frame("### not json ###").await;
            return;
        }
        StubReply::HandshakeMissingFields => {
            let response = json!({
                "jsonrpc": "2.0",
                "id": init_id,
                "result": {"capabilities": {}},
            });
            let _ = transport.write_frame(&response.to_string()).await;
            return;
        }
        _ => {
            let response = json!({
                "jsonrpc": "2.0",
                "id": init_id,
                "result": {
                    "protocolVersion": crate::session::PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "stub", "version": "0.0.0"},
                },
            });
            if transport.write_frame(&response.to_string()).await.is_err() {
                return;
            }
        }
    }

    // The initialized notification carries no id and gets no reply.
    if !matches!(transport.read_frame().await, Ok(Some(_))) {
        return;
    }

    // Serve call requests until the client hangs up.
    loop {
        let frame = match transport.read_frame().await {
            Ok(Some(frame)) => frame,
            _ => return,
        };
        let request: Value = match serde_json::from_str(&frame) {
            Ok(v) => v,
            Err(_) => return,
        };
        let id = request.get("id").cloned().unwrap_or(Value::Null);

        let response = match &reply {
            StubReply::Result(result) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result,
            }),
            StubReply::DelayedResult { delay, result } => {
                tokio::time::sleep(*delay).await;
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": result,
                })
            }
            StubReply::Error { code, message } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message},
            }),
            StubReply::MalformedFrame => {
                let _ = transport.write_frame("{{{ broken frame").await;
                return;
            }
            StubReply::WrongId => json!({
                "jsonrpc": "2.0",
                "id": 999_999,
                "result": {},
            }),
            StubReply::EchoId => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"id": id},
            }),
            StubReply::CloseAfterRequest => {
                transport.close().await;
                return;
            }
            StubReply::NeverReply => {
                // Park forever; the client's timeout is the exit path.
                std::future::pending::<()>().await;
                return;
            }
            StubReply::HandshakeMissingFields
            | StubReply::HandshakeGarbage
            | StubReply::CloseDuringHandshake => return,
        };

        if transport.write_frame(&response.to_string()).await.is_err() {
            return;
        }
    }
}

/// Test spawner: pool entries are backed by stub servers instead of real
/// subprocesses. Counts launches so tests can assert single-flight.
pub struct StubSpawner {
    reply: StubReply,
    launches: AtomicUsize,
    fail_launches: AtomicUsize,
}

impl StubSpawner {
    pub fn new(reply: StubReply) -> Arc<Self> {
        Arc::new(Self {
            reply,
            launches: AtomicUsize::new(0),
            fail_launches: AtomicUsize::new(0),
        })
    }

    /// Make the next `n` spawn attempts fail with a launch error.
    pub fn fail_next(&self, n: usize) {
        self.fail_launches.store(n, Ordering::SeqCst);
    }

    /// Number of successful spawn attempts so far.
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Spawn for StubSpawner {
    async fn spawn(&self, id: &str, _spec: &ServerSpec) -> crate::Result<SpawnedProcess> {
        if self
            .fail_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(crate::error::GatewayError::Launch(
                id.to_string(),
                "stub launch failure".to_string(),
            ));
        }

        let transport = spawn_stub_server(self.reply.clone());
        let session = RpcSession::initialize(id, transport, Duration::from_secs(5)).await?;
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(SpawnedProcess {
            session,
            handle: None,
        })
    }
}

/// Minimal executable-style spec for pool and gateway tests.
pub fn stub_spec() -> ServerSpec {
    ServerSpec {
        image: None,
        executable: Some("/bin/true".to_string()),
        command: vec![],
        environment: Default::default(),
        description: "stub".to_string(),
        idle_timeout: 300,
        handshake_timeout_secs: 5,
        call_timeout_secs: 5,
        tools: vec![],
    }
}
