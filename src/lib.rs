//! Stevedore — an MCP gateway that runs registered MCP servers in isolated
//! subprocesses and multiplexes their tools behind one endpoint.
//!
//! Servers are declared in a YAML registry (`servers.yaml`) and launched on
//! demand, either inside a container (`docker run -i --rm`) or as a direct
//! executable. Each launched process speaks line-delimited JSON-RPC (the
//! MCP stdio framing) with the gateway; a process pool keeps at most one
//! process per server alive, reuses it across calls, and reclaims it after
//! a period of disuse.
//!
//! Layering, bottom to top:
//! - [`transport`]: newline-delimited framing over a byte stream
//! - [`launcher`]: subprocess construction and termination
//! - [`session`]: the MCP handshake and request/response protocol
//! - [`pool`]: one live process per server id, single-flight creation
//! - [`reaper`]: periodic idle reclamation
//! - [`gateway`]: the public facade composing all of the above
//! - [`mcp`]: the outward rmcp surface exposing the facade as MCP tools

pub mod config;
pub mod error;
pub mod gateway;
pub mod launcher;
pub mod mcp;
pub mod pool;
pub mod reaper;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use config::Registry;
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewaySettings};
pub use mcp::GatewayMcpServer;
