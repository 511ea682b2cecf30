//! IpacLinker maps TCP ports between machines over peer-to-peer data
//! channels.
//!
//! A node runs any mix of three roles:
//!
//! - a [`signal::server::SignalServer`], the relay nodes register with and
//!   negotiate through,
//! - [`mapping::MappingServer`]s, each exposing one local TCP port under a
//!   server identity,
//! - [`mapping::MappingClient`]s, each listening on a local port and carrying
//!   accepted connections to a server identity.
//!
//! Negotiation and data channels come from a
//! [`TransportFactory`](ipaclinker_core::transport::TransportFactory); the
//! binary uses WebRTC, tests use the in-process memory network.
//!
//! ```no_run
//! # async fn demo() -> ipaclinker::error::Result<()> {
//! use std::sync::Arc;
//! use ipaclinker::config::Config;
//! use ipaclinker::mapping::MappingClient;
//! use ipaclinker_core::transport::memory::MemoryNetwork;
//!
//! let config = Config::from_json(r#"{
//!     "client": {"enable": true, "list": [{"server": "my-server", "port": 2222}]}
//! }"#)?;
//! let factory = Arc::new(MemoryNetwork::new());
//! for options in config.client_mappings()? {
//!     tokio::spawn(MappingClient::new(options, factory.clone()).run());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod mapping;
pub mod signal;

/// Line logged when a node is started with every role disabled.
pub fn idle_message(hour: u32) -> &'static str {
    if (9..21).contains(&hour) {
        "吾今日无事可做, 闲庭信步, 静听风吟松涛, 悠然自得."
    } else {
        "今日无事挂心, 闲适自得其乐."
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_message_by_hour() {
        assert_eq!(idle_message(9), idle_message(20));
        assert_ne!(idle_message(8), idle_message(9));
        // 21:00 already counts as evening
        assert_ne!(idle_message(20), idle_message(21));
        assert_eq!(idle_message(21), idle_message(3));
    }
}
