//! Custom error types for the crate.
//!
//! This module defines the primary error type, `DeviceError`, shared by every layer of the
//! device stack. Using the `thiserror` crate, it gives a single place where transport,
//! translation, state and lifecycle failures are classified.
//!
//! ## Error Taxonomy
//!
//! - **`Connection`**: A backend could not be opened: unreachable resource, bad identifier,
//!   permission denied, or connection parameters that failed validation in `connect()`.
//! - **`Access`**: A read of a write-only attribute or a write of a read-only attribute.
//! - **`Validation`**: A value was rejected locally (type, range, step or choices) before any
//!   command bytes were produced. Nothing reaches the instrument.
//! - **`Command`**: Transport I/O failed or timed out during `write`/`read`/`query`. The
//!   `timed_out` flag lets callers and poll sources tell a quiet line from a broken one.
//! - **`Decode`**: A reply could not be parsed into the attribute's declared type. The
//!   attribute's cached value is left untouched.
//! - **`NotConnected`**: An operation needed a live backend and the device had none.
//! - **`PollerFault`**: The background poller stopped on an error; carried to the next
//!   `fetch()` with the original error as its source.
//! - **`UnresponsiveWorker`**: The poller did not honour a stop request within `stop_timeout`.
//!   This is fatal and never swallowed.
//!
//! Everything else (`UnknownAttribute`, `InvalidState`, `Configuration`, `Config`, `Io`) covers
//! programming mistakes and ambient failures such as configuration loading.

use crate::device::DeviceState;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Errors raised by backends, translators, devices and pollers.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Connection error on '{resource}': {message}")]
    Connection { resource: String, message: String },

    #[error("Access error: attribute '{name}' {message}")]
    Access { name: String, message: String },

    #[error("Invalid value for '{name}': {message}")]
    Validation { name: String, message: String },

    #[error("Command error: {message}")]
    Command { message: String, timed_out: bool },

    #[error("Decode error for '{name}': {message} (reply: {reply:?})")]
    Decode {
        name: String,
        message: String,
        reply: String,
    },

    #[error("Device '{0}' is not connected")]
    NotConnected(String),

    #[error("Background poller failed: {0}")]
    PollerFault(#[source] Box<DeviceError>),

    #[error("Background poller did not stop within {0:?}")]
    UnresponsiveWorker(Duration),

    #[error("Unknown attribute '{0}'")]
    UnknownAttribute(String),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: DeviceState,
    },

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Build a `Connection` error for a resource.
    pub fn connection(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Build a `Validation` error for an attribute.
    pub fn validation(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Build a `Command` error for a failed transport operation.
    pub fn command(message: impl Into<String>) -> Self {
        Self::Command {
            message: message.into(),
            timed_out: false,
        }
    }

    /// Build a `Command` error for an operation that ran out of time.
    pub fn command_timeout(what: &str, timeout: Duration) -> Self {
        Self::Command {
            message: format!("{what} timed out after {timeout:?}"),
            timed_out: true,
        }
    }

    /// Build a `Decode` error, keeping the offending reply for diagnostics.
    pub fn decode(
        name: impl Into<String>,
        message: impl Into<String>,
        reply: impl Into<String>,
    ) -> Self {
        Self::Decode {
            name: name.into(),
            message: message.into(),
            reply: reply.into(),
        }
    }

    /// Whether this is a `Command` error caused by a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Command { timed_out: true, .. })
    }

    /// Whether the device can keep operating after this error.
    ///
    /// Local rejections and single bad replies leave the backend usable. Transport
    /// failures, poller faults and configuration problems do not.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Access { .. }
            | Self::Validation { .. }
            | Self::Decode { .. }
            | Self::UnknownAttribute(_)
            | Self::InvalidState { .. }
            | Self::NotConnected(_) => true,
            Self::Command { timed_out, .. } => *timed_out,
            Self::Connection { .. }
            | Self::PollerFault(_)
            | Self::UnresponsiveWorker(_)
            | Self::Configuration(_)
            | Self::Config(_)
            | Self::Io(_) => false,
        }
    }
}

impl From<figment::Error> for DeviceError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}
