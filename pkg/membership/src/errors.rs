//! Error type for the membership registry.
//!
//! Mirrors the node crate's error taxonomy (see `node::errors`) so that the
//! two binaries read the same way even though they don't share a dependency
//! edge.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid address {0:?}: expected host:port")]
    InvalidAddress(String),
}

pub type Result<T> = std::result::Result<T, Error>;
