//! Serial port backend for RS-232 / USB-serial instruments.
//!
//! The port is opened with `tokio-serial` inside `spawn_blocking` so that slow USB-serial
//! drivers do not stall the runtime. Opening a port also drains whatever the OS had already
//! buffered from the instrument, so the first reply read belongs to the first command sent.
//!
//! Serial support is behind the `instrument_serial` feature. Without it the backend still
//! builds and validates, but `open()` fails with a connection error.

use super::stream::StreamTransport;
use super::{resolve_timeout, Backend, BackendKind};
use crate::error::{DeviceError, DeviceResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::time::Duration;
use tracing::{debug, info};

#[cfg(feature = "instrument_serial")]
type Port = tokio_serial::SerialStream;
#[cfg(not(feature = "instrument_serial"))]
type Port = tokio::io::DuplexStream;

/// Parity setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Flow control setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    /// No flow control
    #[default]
    None,
    /// XON/XOFF
    Software,
    /// RTS/CTS
    Hardware,
}

/// Serial connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialParams {
    /// Port name (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Communication speed
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Data bits (5-8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Parity
    #[serde(default)]
    pub parity: Parity,
    /// Stop bits (1 or 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Flow control
    #[serde(default)]
    pub flow_control: FlowControl,
    /// Appended to every command
    #[serde(default = "default_termination")]
    pub write_termination: String,
    /// Marks the end of every reply; empty reads whatever is available
    #[serde(default = "default_termination")]
    pub read_termination: String,
    /// I/O timeout; falls back to the device default
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_termination() -> String {
    "\n".to_string()
}

impl SerialParams {
    /// 8N1 settings at the given speed.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            data_bits: default_data_bits(),
            parity: Parity::None,
            stop_bits: default_stop_bits(),
            flow_control: FlowControl::None,
            write_termination: default_termination(),
            read_termination: default_termination(),
            timeout_ms: None,
        }
    }

    /// Set both terminations.
    pub fn with_termination(mut self, write: &str, read: &str) -> Self {
        self.write_termination = write.to_string();
        self.read_termination = read.to_string();
        self
    }

    /// Set the I/O timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Check the settings without opening the port.
    pub fn validate(&self) -> DeviceResult<()> {
        let bad = |msg: String| Err(DeviceError::connection(&self.port, msg));
        if self.port.trim().is_empty() {
            return bad("port name is empty".to_string());
        }
        if self.baud_rate == 0 {
            return bad("baud rate must be positive".to_string());
        }
        if !(5..=8).contains(&self.data_bits) {
            return bad(format!("unsupported data bits {}", self.data_bits));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return bad(format!("unsupported stop bits {}", self.stop_bits));
        }
        Ok(())
    }
}

/// Serial port backend.
pub struct SerialBackend {
    params: SerialParams,
    timeout: Duration,
    transport: Option<StreamTransport<Port>>,
}

impl SerialBackend {
    /// Unopened backend.
    pub fn new(params: SerialParams, default_timeout: Duration) -> Self {
        let timeout = resolve_timeout(params.timeout_ms, default_timeout);
        Self {
            params,
            timeout,
            transport: None,
        }
    }

    /// Configured settings.
    #[must_use]
    pub fn params(&self) -> &SerialParams {
        &self.params
    }

    fn transport(&mut self) -> DeviceResult<&mut StreamTransport<Port>> {
        self.transport
            .as_mut()
            .ok_or_else(|| DeviceError::command(format!("serial port '{}' is not open", self.params.port)))
    }

    #[cfg(feature = "instrument_serial")]
    async fn open_port(&self) -> DeviceResult<Port> {
        use tokio::task::spawn_blocking;
        use tokio_serial::SerialPortBuilderExt;

        let params = self.params.clone();
        let timeout = self.timeout;
        spawn_blocking(move || {
            let data_bits = match params.data_bits {
                5 => tokio_serial::DataBits::Five,
                6 => tokio_serial::DataBits::Six,
                7 => tokio_serial::DataBits::Seven,
                _ => tokio_serial::DataBits::Eight,
            };
            let parity = match params.parity {
                Parity::None => tokio_serial::Parity::None,
                Parity::Odd => tokio_serial::Parity::Odd,
                Parity::Even => tokio_serial::Parity::Even,
            };
            let stop_bits = match params.stop_bits {
                2 => tokio_serial::StopBits::Two,
                _ => tokio_serial::StopBits::One,
            };
            let flow_control = match params.flow_control {
                FlowControl::None => tokio_serial::FlowControl::None,
                FlowControl::Software => tokio_serial::FlowControl::Software,
                FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
            };
            tokio_serial::new(&params.port, params.baud_rate)
                .data_bits(data_bits)
                .parity(parity)
                .stop_bits(stop_bits)
                .flow_control(flow_control)
                .timeout(timeout)
                .open_native_async()
                .map_err(|e| DeviceError::connection(&params.port, e.to_string()))
        })
        .await
        .map_err(|e| DeviceError::connection(&self.params.port, format!("open task failed: {e}")))?
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn open_port(&self) -> DeviceResult<Port> {
        Err(DeviceError::connection(
            &self.params.port,
            "serial support not enabled. Rebuild with --features instrument_serial",
        ))
    }
}

#[async_trait]
impl Backend for SerialBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Serial
    }

    fn resource(&self) -> &str {
        &self.params.port
    }

    fn info(&self) -> String {
        format!(
            "serial backend ({} @ {} baud)",
            self.params.port, self.params.baud_rate
        )
    }

    async fn open(&mut self) -> DeviceResult<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        let port = self.open_port().await?;
        let mut transport = StreamTransport::new(
            port,
            &self.params.write_termination,
            &self.params.read_termination,
            self.timeout,
        );
        transport.drain(Duration::from_millis(50)).await;
        self.transport = Some(transport);
        info!(
            port = %self.params.port,
            baud_rate = self.params.baud_rate,
            "serial port opened"
        );
        Ok(())
    }

    async fn close(&mut self) {
        if self.transport.take().is_some() {
            debug!(port = %self.params.port, "serial port closed");
        }
    }

    fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    async fn write(&mut self, command: &[u8]) -> DeviceResult<()> {
        self.transport()?.write(command).await
    }

    async fn read(&mut self) -> DeviceResult<Vec<u8>> {
        self.transport()?.read().await
    }

    async fn clear(&mut self) -> DeviceResult<()> {
        self.transport()?.drain(Duration::from_millis(20)).await;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
