use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("invalid signal payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    #[error("peer session closed")]
    PeerClosed,
}

/// Rejections produced by the registry. The `Display` text is what the
/// offending party receives in its `errMsg` reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("identifier too long: {0}")]
    IdentifierTooLong(String),
    #[error("node already online: {0}")]
    AlreadyOnline(String),
    #[error("server offline or unknown: Server[{0}]")]
    UnknownServer(String),
    #[error("client offline or unknown: {0}")]
    UnknownClient(String),
    #[error("version mismatch: Client[{client}] -> Server[{server}]")]
    VersionMismatch { client: String, server: String },
    #[error("connection already registered as {0}")]
    AlreadyRegistered(String),
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
