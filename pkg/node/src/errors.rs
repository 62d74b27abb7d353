//! Error taxonomy for a single node.
//!
//! Four kinds: `Transient` causes are retried with bounded
//! backoff by the caller; `FatalLocal` means the process should abort at
//! startup; `ProtocolViolation` is surfaced as a specific non-200 response
//! and logged; `Rejected` means the caller asked for something this node
//! isn't allowed to do right now (e.g. serve `/logs` while not the leader).

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal local failure: {0}")]
    FatalLocal(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a caller should retry this error with backoff rather than
    /// giving up immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Http(_) | Error::Io(_))
    }
}
