//! Error types for spacecoord

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Coordinator (domain) errors ===
    #[error("Space already exists")]
    DuplicateSpace,

    #[error("Space does not exist")]
    UnknownSpace,

    #[error("Exhausted connection epochs for {addr}:{port}")]
    ExhaustedPorts { addr: String, port: u16 },

    #[error("Exhausted space identifiers")]
    ExhaustedSpaces,

    #[error("Coordinator state does not allow handling this request: {0}")]
    InvalidState(String),

    #[error("Service level must be met before changing spaces (need more daemons)")]
    ServiceLevelNotMet,

    #[error("Invalid space description: {0}")]
    InvalidSpaceDescription(String),

    // === Restart snapshot errors ===
    #[error("Invalid state data: {0}")]
    InvalidStateData(String),

    // === Connection errors ===
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Connection killed: {0}")]
    KillConnection(String),

    #[error("Connection closed by peer")]
    EndConnection,

    // === I/O & encoding ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Closed tag over [`Error`], for callers that switch on the kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DuplicateSpace,
    UnknownSpace,
    ExhaustedPorts,
    ExhaustedSpaces,
    InvalidState,
    ServiceLevelNotMet,
    InvalidSpaceDescription,
    InvalidStateData,
    Protocol,
    KillConnection,
    EndConnection,
    Io,
    Json,
    InvalidConfig,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DuplicateSpace => ErrorKind::DuplicateSpace,
            Error::UnknownSpace => ErrorKind::UnknownSpace,
            Error::ExhaustedPorts { .. } => ErrorKind::ExhaustedPorts,
            Error::ExhaustedSpaces => ErrorKind::ExhaustedSpaces,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::ServiceLevelNotMet => ErrorKind::ServiceLevelNotMet,
            Error::InvalidSpaceDescription(_) => ErrorKind::InvalidSpaceDescription,
            Error::InvalidStateData(_) => ErrorKind::InvalidStateData,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::KillConnection(_) => ErrorKind::KillConnection,
            Error::EndConnection => ErrorKind::EndConnection,
            Error::Io(_) => ErrorKind::Io,
            Error::Json(_) => ErrorKind::Json,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }

    /// Is this a coordinator-level rejection that a control client should see
    /// as an `ERROR` response?
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            Error::DuplicateSpace
                | Error::UnknownSpace
                | Error::ExhaustedPorts { .. }
                | Error::ExhaustedSpaces
                | Error::InvalidState(_)
                | Error::ServiceLevelNotMet
                | Error::InvalidSpaceDescription(_)
        )
    }

    /// Does this error end only the connection that triggered it?
    pub fn terminates_connection(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::KillConnection(_)
                | Error::EndConnection
                | Error::ExhaustedPorts { .. }
                | Error::Io(_)
        )
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    pub(crate) fn kill(msg: impl Into<String>) -> Self {
        Error::KillConnection(msg.into())
    }
}

impl From<::config::ConfigError> for Error {
    fn from(e: ::config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
