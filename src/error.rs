//! Service-level error taxonomy.
//!
//! Collaborator errors ([`StoreError`], [`SearchError`], [`CacheError`]) are
//! wrapped into [`ElectionError`], which classifies every failure as a
//! validation failure, a not-found condition, or an internal failure.

use crate::cache::CacheError;
use crate::search::SearchError;
use crate::store::StoreError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification used for exit codes and HTTP-equivalent status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Internal,
}

#[derive(Debug, Error)]
pub enum ElectionError {
    /// Bad input; nothing was mutated.
    #[error("{0}")]
    Validation(String),

    /// A named filter value does not exist in the dataset.
    #[error("{0}")]
    NotFound(String),

    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("Search index error: {0}")]
    Search(#[from] SearchError),

    #[error("Suggestion cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("{operation} timed out after {}s", .limit.as_secs())]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },
}

impl ElectionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Store(_) | Self::Search(_) | Self::Cache(_) | Self::Timeout { .. } => {
                ErrorKind::Internal
            }
        }
    }

    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Internal => 500,
        }
    }

    /// Message safe to hand back to a caller. Internal detail stays in the logs.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Run a collaborator call under a deadline, folding both the timeout and the
/// call's own error into [`ElectionError`].
pub async fn bounded<T, E, F>(operation: &'static str, limit: Duration, fut: F) -> Result<T, ElectionError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ElectionError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(ElectionError::Timeout { operation, limit }),
    }
}
