//! # Lab Devices Core Library
//!
//! Device abstraction and state synchronization for laboratory test equipment: GPS
//! receivers, attenuators, RF switches, power sensors, GPS simulators and command-line
//! tools. Every instrument exposes the same surface (connect, configure, read state, command,
//! disconnect) over whichever transport it happens to use.
//!
//! ## Crate Structure
//!
//! - **`backend`**: The `Backend` trait and its transports: serial ports, VISA resource
//!   strings, external processes, vendor native libraries and an in-memory simulator.
//! - **`translator`**: `CommandSpec` templates and decode rules, and the `CommandTranslator`
//!   trait that turns typed values into command bytes and replies back into values.
//! - **`state`**: Attribute descriptors (`StateDescriptor`), the per-type `StateRegistry` and
//!   per-device cached state.
//! - **`value`**: The dynamically typed `Value` carried through get/set.
//! - **`device`**: `DeviceType` (shared model description) and `Device` (one instrument with
//!   a connection lifecycle and typed get/set/setup).
//! - **`poller`**: Background polling for streaming instruments with a bounded, drop-oldest
//!   result queue and cooperative shutdown.
//! - **`discovery`**: Finding candidate resources such as USB serial adapters by hardware id.
//! - **`definition`**: Device types described in TOML.
//! - **`drivers`**: The built-in instrument catalog.
//! - **`config`**: Figment-based configuration for the `labdev` binary and embedding apps.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: The crate-wide `DeviceError` taxonomy.

pub mod backend;
pub mod config;
pub mod definition;
pub mod device;
pub mod discovery;
pub mod drivers;
pub mod error;
pub mod logging;
pub mod poller;
pub mod state;
pub mod translator;
pub mod value;

pub use backend::{Backend, BackendKind, ConnectionParams};
pub use device::{Device, DeviceOptions, DeviceState, DeviceType};
pub use error::{DeviceError, DeviceResult};
pub use poller::{PollOutcome, PollRate, PollResult, PollSource, PollerConfig};
pub use state::{Access, StateDescriptor};
pub use translator::{CommandSpec, CommandTranslator, DecodeRule};
pub use value::{Value, ValueType};
