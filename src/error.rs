//! Error types for the driver.
//!
//! Every failure is one of five kinds: transport, protocol, server-reported,
//! state-consistency and value errors.

use std::io;

use thiserror::Error;

/// Result type for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

#[derive(Error, Debug)]
pub enum DriverError {
    /// Read/write/connect failure on the byte stream.
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    /// Bad version byte, unparseable control payload or unknown response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered with an `error` field.
    #[error("Server error: {0}")]
    Server(String),

    /// Caller-induced misuse of the statement protocol.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Caller-induced bad value, type or column reference.
    #[error("Value error: {0}")]
    Value(#[from] ValueError),
}

/// The closed set of error kinds, for callers that only branch on the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    ServerReported,
    StateConsistency,
    Value,
}

impl DriverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::Transport(_) => ErrorKind::Transport,
            DriverError::Protocol(_) => ErrorKind::Protocol,
            DriverError::Server(_) => ErrorKind::ServerReported,
            DriverError::State(_) => ErrorKind::StateConsistency,
            DriverError::Value(_) => ErrorKind::Value,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        DriverError::Protocol(msg.into())
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(e: serde_json::Error) -> Self {
        DriverError::Protocol(format!("could not parse server response: {}", e))
    }
}

/// Statement protocol violations. Fatal to the current statement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("driver is not connected")]
    NotConnected,

    #[error("protocol order violation: {operation} is not allowed in phase {phase}")]
    OrderViolation {
        operation: &'static str,
        phase: String,
    },

    #[error("{operation} is not supported for a {kind} statement")]
    WrongStatementKind {
        operation: &'static str,
        kind: &'static str,
    },

    #[error("columns {missing:?} were not set before advancing the row")]
    ColumnsNotSet { missing: Vec<usize> },

    #[error("column {column} is already set in this row")]
    ColumnAlreadySet { column: usize },

    #[error("setting columns by name is not supported")]
    NamedSetUnsupported,
}

/// Bad values and column references. Fatal to the current call only.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    #[error("column {column} is of type {actual}, not {expected}")]
    TypeMismatch {
        column: usize,
        expected: &'static str,
        actual: String,
    },

    #[error("column index {index} is out of range (statement has {count} columns)")]
    ColumnIndex { index: usize, count: usize },

    #[error("column name {0:?} not found")]
    ColumnName(String),

    #[error("column {column} is not nullable")]
    NotNullable { column: usize },

    #[error("string of {len} bytes does not fit column {column} of width {width}")]
    StringTooLong {
        column: usize,
        len: usize,
        width: usize,
    },

    #[error("string of {0} bytes exceeds the variable-length limit")]
    BlobTooLong(usize),

    #[error("invalid date {year:04}-{month:02}-{day:02}")]
    InvalidDate { year: i32, month: i32, day: i32 },

    #[error("invalid time {hour:02}:{minute:02}:{second:02}.{millisecond:03}")]
    InvalidTime {
        hour: i32,
        minute: i32,
        second: i32,
        millisecond: i32,
    },

    #[error("column {column} does not hold valid UTF-8 text")]
    InvalidText { column: usize },

    #[error("payload of {size} bytes exceeds the {max} byte message limit")]
    PayloadTooLarge { size: usize, max: usize },
}
