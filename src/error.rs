//! Error types for tasksyncd
//!
//! Every failure the sync path can surface maps onto a taskd response code
//! so the pipeline can answer the client with a structured message instead
//! of dropping the connection.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for tasksyncd operations
#[derive(Error, Debug)]
pub enum Error {
    // Framing and request parsing (code 500)
    #[error("{0}")]
    Malformed(String),

    // Announced frame length exceeds request.limit (code 504)
    #[error("message size limit exceeded: {size} > {limit}")]
    RequestTooBig { size: usize, limit: usize },

    #[error("Protocol not supported")]
    UnsupportedProtocol,

    #[error("Invalid org")]
    InvalidOrg,

    #[error("Invalid username or key")]
    InvalidCredentials,

    // Branch point or common ancestor missing from the transaction log
    #[error("Could not find the last sync transaction. Did you skip the 'task sync init' requirement?")]
    DesyncedClient,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Organization not found: {0}")]
    OrgNotFound(String),

    #[error("Organization already exists: {0}")]
    OrgExists(String),

    #[error("User already exists: {0}")]
    UserExists(String),

    #[error("Not a repository: {0}")]
    NotARepo(PathBuf),

    #[error("Task parse error: {0}")]
    TaskParse(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// The wire response code for this error, per the taskd status table.
    pub fn response_code(&self) -> &'static str {
        match self {
            Error::RequestTooBig { .. } => "504",
            Error::UnsupportedProtocol | Error::InvalidOrg => "400",
            Error::InvalidCredentials => "401",
            Error::Malformed(_)
            | Error::DesyncedClient
            | Error::TaskParse(_)
            | Error::InvalidConfig(_)
            | Error::InvalidArgument(_)
            | Error::Repository(_)
            | Error::OrgNotFound(_)
            | Error::OrgExists(_)
            | Error::UserExists(_)
            | Error::NotARepo(_)
            | Error::Transport(_)
            | Error::Io(_)
            | Error::Json(_) => "500",
        }
    }
}

/// Result type alias for tasksyncd operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_codes_match_taxonomy() {
        assert_eq!(
            Error::RequestTooBig { size: 2, limit: 1 }.response_code(),
            "504"
        );
        assert_eq!(Error::UnsupportedProtocol.response_code(), "400");
        assert_eq!(Error::InvalidOrg.response_code(), "400");
        assert_eq!(Error::InvalidCredentials.response_code(), "401");
        assert_eq!(Error::DesyncedClient.response_code(), "500");
        assert_eq!(Error::Malformed("bad header".into()).response_code(), "500");
    }

    #[test]
    fn desynced_client_keeps_the_init_hint() {
        let message = Error::DesyncedClient.to_string();
        assert!(message.contains("task sync init"));
    }
}
