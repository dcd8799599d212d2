use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the netx protocol layer.
#[derive(Debug, Error)]
pub enum NetxError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("compilation error: {0}")]
    Compilation(String),

    #[error("correlation error: {0}")]
    Correlation(String),

    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl NetxError {
    /// Whether this error means the underlying connection is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(self, NetxError::Transport(_) | NetxError::Io(_))
    }
}

impl From<ciborium::de::Error<std::io::Error>> for NetxError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        NetxError::Compilation(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for NetxError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        NetxError::Compilation(e.to_string())
    }
}

impl From<serde_json::Error> for NetxError {
    fn from(e: serde_json::Error) -> Self {
        NetxError::Compilation(e.to_string())
    }
}

pub type NetxResult<T> = Result<T, NetxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_count_as_transport() {
        let err: NetxError = std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into();
        assert!(err.is_transport());
        assert!(NetxError::Transport("reset".into()).is_transport());
        assert!(!NetxError::Crypto("bad tag".into()).is_transport());
    }
}
