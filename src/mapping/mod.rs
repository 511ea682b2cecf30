//! Port mappings. A client mapping listens on a local port and carries each
//! accepted connection over its own data channel; a server mapping forwards
//! every channel it is offered to one local port.

pub(crate) mod bridge;
pub mod client;
pub mod proxy;
pub mod server;

pub use client::{ClientOptions, MappingClient};
pub use server::{MappingServer, ServerOptions};

/// Text of a free-form signal payload, for logging.
pub(crate) fn display_buf(buf: &serde_json::Value) -> String {
    match buf {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
