use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The local listener of a mapping could not be opened. Fatal to that
    /// mapping only.
    #[error("cannot listen on local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Config(String),
    #[error(transparent)]
    Core(#[from] ipaclinker_core::error::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
