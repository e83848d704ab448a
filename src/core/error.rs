//! Error types and handling for the hopstore persistence core
//!
//! This module defines all error types used throughout the crate. Not-found
//! conditions are kept apart from real failures so callers can treat a
//! missing object as a normal outcome.

use std::path::PathBuf;
use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the persistence core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage layer errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Type mapping errors
    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// Requested object or row does not exist
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Object already exists
    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    /// Invalid input, e.g. a non-numeric literal where a number is required
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Transaction state errors
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Internal system errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Failure raised at the node manager boundary, carrying the original cause
    #[error("Error in {operation}: {source}")]
    Persistence {
        /// Name of the wrapped operation
        operation: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// XML encoding/decoding errors
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database home directory is missing and could not be created
    #[error("Can't create database directory {0}")]
    CreateHome(PathBuf),

    /// Database home directory is not writable
    #[error("No write permission for database directory {0}")]
    Unwritable(PathBuf),

    /// Stored data could not be decoded
    #[error("Data corruption detected in {path}: {reason}")]
    Corruption {
        /// File holding the broken record
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// A relational data source reported a failure
    #[error("Data source {source_name} failed: {message}")]
    DataSource {
        /// Name of the data source
        source_name: String,
        /// Driver message
        message: String,
    },

    /// Transaction failed
    #[error("Transaction failed: {0}")]
    Transaction(String),
}

/// Type mapping and schema errors
#[derive(Error, Debug)]
pub enum MappingError {
    /// No mapping registered for a prototype
    #[error("No type mapping for prototype {0}")]
    UnknownPrototype(String),

    /// Mapping refers to a data source that is not registered
    #[error("Data source {source_name} for prototype {prototype} not found")]
    UnknownDataSource {
        /// Prototype declaring the source
        prototype: String,
        /// Missing data source name
        source_name: String,
    },

    /// Relational mapping without a table
    #[error("No table name specified for prototype {0}")]
    MissingTable(String),

    /// Relational operation on a mapping without data source
    #[error("Prototype {0} is not mapped to a relational data source")]
    NotRelational(String),

    /// Relation declaration that can't be interpreted
    #[error("Invalid relation {prototype}.{property}: {reason}")]
    InvalidRelation {
        /// Prototype declaring the relation
        prototype: String,
        /// Property name
        property: String,
        /// Why it was rejected
        reason: String,
    },

    /// Inheritance chain loops back on itself
    #[error("Cyclic inheritance at prototype {0}")]
    CyclicInheritance(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a not found error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Create an already exists error
    pub fn already_exists(resource: impl Into<String>) -> Self {
        Self::AlreadyExists(resource.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a transaction error
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap a failure raised inside a node manager operation
    pub fn persistence(operation: impl Into<String>, source: Error) -> Self {
        Self::Persistence {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Check whether this error only reports a missing object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Persistence { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Check if this is a configuration problem the operator has to fix
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::Mapping(_)
                | Error::Storage(StorageError::CreateHome(_))
                | Error::Storage(StorageError::Unwritable(_))
        )
    }

    /// The innermost cause of a wrapped failure
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Persistence { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_survives_wrapping() {
        let err = Error::persistence("getNode", Error::not_found("42"));
        assert!(err.is_not_found());
        assert!(matches!(err.root_cause(), Error::NotFound(id) if id == "42"));
    }

    #[test]
    fn test_config_classification() {
        assert!(Error::config("bad").is_config_error());
        assert!(Error::from(MappingError::MissingTable("Story".into())).is_config_error());
        assert!(!Error::invalid_input("x").is_config_error());
    }

    #[test]
    fn test_persistence_message_names_operation() {
        let err = Error::persistence("countNodes", Error::internal("boom"));
        let msg = err.to_string();
        assert!(msg.contains("countNodes"));
        assert!(msg.contains("boom"));
    }
}
