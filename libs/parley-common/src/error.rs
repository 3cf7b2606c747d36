use std::io;

use thiserror::Error;

/// Infrastructure failures not attributable to the contestant. An attempt
/// that fails with one of these must be retried by the caller, never turned
/// into a score.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("failed to set up communication channel: {0}")]
    Channel(#[source] io::Error),

    #[error("blob store error: {0}")]
    Storage(#[source] io::Error),

    #[error("blob {0} not found in store")]
    MissingBlob(String),

    #[error("sandbox failure: {0}")]
    Sandbox(String),

    #[error("missing manager artifact: {0}")]
    MissingArtifact(String),

    #[error("language {0} is not configured")]
    UnknownLanguage(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("manager terminated abnormally: {0}")]
    ManagerFailed(String),

    #[error("malformed manager verdict: {0}")]
    Verdict(String),
}

pub type Result<T> = std::result::Result<T, SystemError>;
