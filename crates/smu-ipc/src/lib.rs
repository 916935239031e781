//! Async JSON-lines TCP transport between SMU clients and the server.

mod error;

pub mod client;
pub mod codec;
pub mod framing;
pub mod registry;
pub mod server;

pub use client::SmuClient;
pub use error::IpcError;
pub use registry::{SessionId, SessionRegistry, SessionTicket};
pub use server::{RequestHandler, ServerLimits, serve_tcp};
