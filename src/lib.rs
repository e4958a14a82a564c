//! # mcp-conduit
//!
//! A Model Context Protocol (MCP) engine for Rust: both peer roles, a
//! pluggable transport layer, request correlation, session management, and
//! a live capability registry.
//!
//! MCP is a JSON-RPC 2.0 application protocol by which a client (typically
//! an LLM host) discovers and invokes the capabilities exposed by a server:
//! tools, resources, and prompts. This crate is the protocol engine: framing
//! and correlation, four transports (stdio subprocess, SSE, streamable
//! HTTP, in-process), the initialize handshake and capability negotiation,
//! progress and cancellation, and the server-side registry with its
//! concurrency discipline.
//!
//! ## Server
//!
//! ```rust,no_run
//! use mcp_conduit::server::Server;
//! use mcp_conduit::tool::Tool;
//! use mcp_conduit::protocol::CallToolResult;
//! use mcp_conduit::transport::stdio::StdioServerTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::builder()
//!         .server_info("my-server", "1.0.0")
//!         .tool(Tool::builder("echo")
//!             .description("Echo the message argument")
//!             .handler(|args: serde_json::Value, _ctx| async move {
//!                 let message = args.get("message").and_then(|v| v.as_str()).unwrap_or("");
//!                 Ok(CallToolResult::text(message))
//!             }))
//!         .build();
//!
//!     server.serve(StdioServerTransport::new()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Client
//!
//! ```rust,no_run
//! use mcp_conduit::client::ClientBuilder;
//! use mcp_conduit::transport::stdio::ChildProcessTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClientBuilder::new("my-client", "1.0.0")
//!         .connect(ChildProcessTransport::new("my-mcp-server"))
//!         .await?;
//!     client.initialize().await?;
//!     let tools = client.list_tools(None).await?;
//!     println!("{} tools", tools.tools.len());
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod context;
pub mod correlator;
pub mod error;
pub mod hooks;
pub mod prompt;
pub mod protocol;
pub mod registry;
pub mod resource;
pub mod server;
pub mod session;
pub mod tool;
pub mod transport;

// Re-exports
pub use client::{Client, ClientBuilder, ClientHandler};
pub use codec::Frame;
pub use context::{CancellationToken, RequestContext};
pub use correlator::{Correlator, RequestOptions};
pub use error::{Error, ErrorCode, JsonRpcError, Result};
pub use hooks::Hooks;
pub use prompt::Prompt;
pub use protocol::{
    CallToolResult, Content, InitializeResult, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId, LATEST_PROTOCOL_VERSION,
};
pub use registry::Registry;
pub use resource::{Resource, ResourceTemplate};
pub use server::{Server, ServerBuilder, ServerConnection};
pub use session::{Session, SessionManager};
pub use tool::Tool;
pub use transport::Transport;
