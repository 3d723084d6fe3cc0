//! Transport backends.
//!
//! A [`Backend`] moves command bytes to an instrument and reply bytes back. Devices only ever
//! see `Box<dyn Backend>`; which transport sits underneath is decided by the
//! [`ConnectionParams`] handed to the device, and those parameters are validated when the
//! device connects, not when it is constructed.
//!
//! | Kind        | Module        | Transport                                         |
//! |-------------|---------------|---------------------------------------------------|
//! | `serial`    | [`serial`]    | RS-232 / USB-serial through `tokio-serial`        |
//! | `visa`      | [`visa`]      | VISA resource strings (raw SCPI sockets, ASRL)    |
//! | `process`   | [`process`]   | External command-line tools                       |
//! | `library`   | [`library`]   | Vendor native libraries behind an injected shim   |
//! | `simulated` | [`simulated`] | In-memory register instrument for tests and demos |

pub mod library;
pub mod process;
pub mod serial;
pub mod simulated;
mod stream;
pub mod visa;

pub use library::{LibraryBackend, LibraryParams, NativeLibrary, NativeSession};
pub use process::{ProcessBackend, ProcessParams};
pub use serial::{FlowControl, Parity, SerialBackend, SerialParams};
pub use simulated::{SimulatedBackend, SimulatedInstrument, SimulatedParams};
pub use visa::{VisaBackend, VisaParams, VisaResource};

use crate::error::DeviceResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Backend shared between a device and its poller.
///
/// The async mutex serializes command/response pairs: a caller's `query` and a poll
/// iteration never interleave on the wire.
pub type SharedBackend = Arc<Mutex<Box<dyn Backend>>>;

/// Wrap a backend for sharing.
pub fn wrap_shared(backend: Box<dyn Backend>) -> SharedBackend {
    Arc::new(Mutex::new(backend))
}

/// Transport family of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Serial port
    Serial,
    /// VISA resource
    Visa,
    /// External process
    Process,
    /// Vendor native library
    Library,
    /// In-memory simulator
    Simulated,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Serial => "serial",
            BackendKind::Visa => "visa",
            BackendKind::Process => "process",
            BackendKind::Library => "library",
            BackendKind::Simulated => "simulated",
        })
    }
}

/// Byte transport to one instrument.
///
/// `close` is idempotent and never fails. `write`, `read` and `query` report transport
/// trouble as [`DeviceError::Command`](crate::error::DeviceError::Command), with the
/// `timed_out` flag set when the backend timeout expired.
#[async_trait]
pub trait Backend: Send {
    /// Transport family.
    fn kind(&self) -> BackendKind;

    /// Resource identifier (port name, VISA string, executable path).
    fn resource(&self) -> &str;

    /// Human-readable description for logs.
    fn info(&self) -> String {
        format!("{} backend ({})", self.kind(), self.resource())
    }

    /// Acquire the transport.
    async fn open(&mut self) -> DeviceResult<()>;

    /// Release the transport.
    async fn close(&mut self);

    /// Whether the transport is held.
    fn is_open(&self) -> bool;

    /// Send one command. Termination is appended by the backend.
    async fn write(&mut self, command: &[u8]) -> DeviceResult<()>;

    /// Receive one reply with its termination removed.
    async fn read(&mut self) -> DeviceResult<Vec<u8>>;

    /// Send a command and receive its reply.
    async fn query(&mut self, command: &[u8]) -> DeviceResult<Vec<u8>> {
        self.write(command).await?;
        self.read().await
    }

    /// Discard unread input.
    async fn clear(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    /// Downcast hook for transport-specific operations.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// How to reach an instrument. Validated by `Device::connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionParams {
    /// Serial port settings
    Serial(SerialParams),
    /// VISA resource
    Visa(VisaParams),
    /// External executable
    Process(ProcessParams),
    /// Vendor native library
    Library(LibraryParams),
    /// In-memory simulator
    Simulated(SimulatedParams),
}

impl ConnectionParams {
    /// Transport family these parameters select.
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        match self {
            ConnectionParams::Serial(_) => BackendKind::Serial,
            ConnectionParams::Visa(_) => BackendKind::Visa,
            ConnectionParams::Process(_) => BackendKind::Process,
            ConnectionParams::Library(_) => BackendKind::Library,
            ConnectionParams::Simulated(_) => BackendKind::Simulated,
        }
    }

    /// Resource identifier for logs and errors.
    #[must_use]
    pub fn resource(&self) -> String {
        match self {
            ConnectionParams::Serial(p) => p.port.clone(),
            ConnectionParams::Visa(p) => p.resource.clone(),
            ConnectionParams::Process(p) => p.executable.display().to_string(),
            ConnectionParams::Library(p) => p.library.display().to_string(),
            ConnectionParams::Simulated(p) => p.resource(),
        }
    }

    /// Check the parameters without touching hardware.
    pub fn validate(&self) -> DeviceResult<()> {
        match self {
            ConnectionParams::Serial(p) => p.validate(),
            ConnectionParams::Visa(p) => p.validate(),
            ConnectionParams::Process(p) => p.validate(),
            ConnectionParams::Library(p) => p.validate(),
            ConnectionParams::Simulated(_) => Ok(()),
        }
    }

    /// Validate and construct an unopened backend.
    ///
    /// `default_timeout` applies when the parameters do not name their own.
    pub fn build(&self, default_timeout: Duration) -> DeviceResult<Box<dyn Backend>> {
        self.validate()?;
        Ok(match self {
            ConnectionParams::Serial(p) => Box::new(SerialBackend::new(p.clone(), default_timeout)),
            ConnectionParams::Visa(p) => Box::new(VisaBackend::new(p.clone(), default_timeout)?),
            ConnectionParams::Process(p) => {
                Box::new(ProcessBackend::new(p.clone(), default_timeout))
            }
            ConnectionParams::Library(p) => Box::new(LibraryBackend::new(p.clone())),
            ConnectionParams::Simulated(p) => Box::new(SimulatedBackend::new(p.clone())),
        })
    }
}

pub(crate) fn resolve_timeout(timeout_ms: Option<u64>, default: Duration) -> Duration {
    timeout_ms.map_or(default, Duration::from_millis)
}
