//! Unified error type for the toolmatrix engine.
//!
//! All crates funnel their failures into [`Error`], which carries enough context
//! for API handlers to derive an HTTP status code via [`Error::http_status`].

use std::fmt;

use crate::plan::Rejection;

/// Unified error type covering all failure modes in toolmatrix.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "job", "file").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A compare-and-swap lost the race: the stored state was not the expected one.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The operation is not permitted in the entity's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A submission was refused by the admission policy.
    #[error("Rejected: {0}")]
    Rejected(#[from] Rejection),

    /// The job names a tool with no registered handler.
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// A tool handler failed while processing a file.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// The storage collaborator failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A database operation failed.
    #[error("Database error: {source}")]
    Database {
        /// The underlying database error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound { .. } => 404,
            Error::Validation(_) => 400,
            Error::Conflict(_) => 409,
            Error::InvalidState(_) => 409,
            Error::Rejected(rejection) => rejection.http_status(),
            Error::UnknownTool(_) => 422,
            Error::Tool { .. } => 502,
            Error::Storage(_) => 500,
            Error::Database { .. } => 500,
            Error::Io { .. } => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::Validation(_) => "validation_error",
            Error::Conflict(_) => "conflict",
            Error::InvalidState(_) => "invalid_state",
            Error::Rejected(rejection) => rejection.code(),
            Error::UnknownTool(_) => "unknown_tool",
            Error::Tool { .. } => "tool_error",
            Error::Storage(_) => "storage_error",
            Error::Database { .. } => "database_error",
            Error::Io { .. } => "io_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Storage`].
    pub fn storage(message: impl fmt::Display) -> Self {
        Error::Storage(message.to_string())
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
