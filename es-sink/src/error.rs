use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Connection Error - {0}")]
    Connection(String),

    #[error("Transport Error - {0}")]
    Transport(String),

    #[error("Invalid document - {0}")]
    InvalidDocument(String),

    #[error("Flush cancelled during shutdown")]
    Cancelled,

    #[error("Drain timed out, {abandoned} records were failed")]
    DrainTimeout { abandoned: usize },

    #[error("metrics Error - {0}")]
    Metrics(String),
}

impl From<numaflow_elasticsearch::Error> for Error {
    fn from(value: numaflow_elasticsearch::Error) -> Self {
        Error::Transport(value.to_string())
    }
}
