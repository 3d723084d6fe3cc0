//! VISA resource backend.
//!
//! Resource strings are parsed into a [`VisaResource`] and served by a native transport:
//!
//! - `TCPIP[board]::host::port::SOCKET` opens a raw socket on the given port.
//! - `TCPIP[board]::host[::device]::INSTR` opens the LXI raw SCPI socket on port 5025.
//! - `ASRL<port>::INSTR` opens a serial port (`ASRL3` is `COM3` on Windows and
//!   `/dev/ttyS3` elsewhere; `ASRL/dev/ttyUSB0::INSTR` names the device directly).
//!
//! GPIB, USB-TMC, VXI and PXI resources need a vendor VISA installation and are rejected
//! with a connection error. Opening any resource drains pending input.

use super::serial::{SerialBackend, SerialParams};
use super::stream::StreamTransport;
use super::{resolve_timeout, Backend, BackendKind};
use crate::error::{DeviceError, DeviceResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Port of the raw SCPI socket LXI instruments expose.
pub const SCPI_RAW_PORT: u16 = 5025;

/// Parsed VISA resource string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisaResource {
    /// Raw TCP socket
    TcpSocket {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
    /// LAN instrument, reached over its raw SCPI socket
    TcpInstr {
        /// Host name or address
        host: String,
    },
    /// Serial port
    Serial {
        /// OS port name
        port: String,
    },
    /// Interface that needs a vendor VISA library
    Unsupported {
        /// Interface prefix (GPIB, USB, ...)
        interface: String,
    },
}

impl FromStr for VisaResource {
    type Err = DeviceError;

    fn from_str(resource: &str) -> Result<Self, Self::Err> {
        let bad = |msg: &str| DeviceError::connection(resource, msg);
        let parts: Vec<&str> = resource.trim().split("::").collect();
        let head = parts.first().map(|p| p.to_ascii_uppercase()).unwrap_or_default();
        let class = parts
            .last()
            .map(|p| p.to_ascii_uppercase())
            .unwrap_or_default();

        if parts.len() < 2 {
            return Err(bad("not a VISA resource string"));
        }

        if head.starts_with("TCPIP") {
            let host = parts[1].to_string();
            if host.is_empty() {
                return Err(bad("missing host"));
            }
            return match (class.as_str(), parts.len()) {
                ("SOCKET", 4) => {
                    let port = parts[2]
                        .parse::<u16>()
                        .map_err(|_| bad("invalid socket port"))?;
                    Ok(VisaResource::TcpSocket { host, port })
                }
                ("INSTR", 3 | 4) => Ok(VisaResource::TcpInstr { host }),
                _ => Err(bad("unrecognised TCPIP resource class")),
            };
        }

        if head.starts_with("ASRL") {
            if class != "INSTR" {
                return Err(bad("serial resources must end in ::INSTR"));
            }
            let name = &parts[0][4..];
            if name.is_empty() {
                return Err(bad("missing serial port"));
            }
            let port = if name.chars().all(|c| c.is_ascii_digit()) {
                if cfg!(windows) {
                    format!("COM{name}")
                } else {
                    format!("/dev/ttyS{name}")
                }
            } else {
                name.to_string()
            };
            return Ok(VisaResource::Serial { port });
        }

        for interface in ["GPIB", "USB", "VXI", "PXI"] {
            if head.starts_with(interface) {
                return Ok(VisaResource::Unsupported {
                    interface: interface.to_string(),
                });
            }
        }
        Err(bad("unknown VISA interface"))
    }
}

impl fmt::Display for VisaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VisaResource::TcpSocket { host, port } => write!(f, "{host}:{port}"),
            VisaResource::TcpInstr { host } => write!(f, "{host}:{SCPI_RAW_PORT}"),
            VisaResource::Serial { port } => f.write_str(port),
            VisaResource::Unsupported { interface } => write!(f, "{interface} (unsupported)"),
        }
    }
}

/// VISA connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisaParams {
    /// Resource string, e.g. `TCPIP0::192.168.1.20::INSTR`
    pub resource: String,
    /// Appended to every command
    #[serde(default = "default_termination")]
    pub write_termination: String,
    /// Marks the end of every reply
    #[serde(default = "default_termination")]
    pub read_termination: String,
    /// Baud rate for ASRL resources
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// I/O timeout; falls back to the device default
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_termination() -> String {
    "\n".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

impl VisaParams {
    /// Parameters with newline termination.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            write_termination: default_termination(),
            read_termination: default_termination(),
            baud_rate: default_baud_rate(),
            timeout_ms: None,
        }
    }

    /// Check that the resource string parses.
    pub fn validate(&self) -> DeviceResult<()> {
        self.resource.parse::<VisaResource>().map(|_| ())
    }
}

enum Link {
    Tcp(StreamTransport<TcpStream>),
    Serial(SerialBackend),
}

/// Backend for VISA resources.
pub struct VisaBackend {
    params: VisaParams,
    target: VisaResource,
    timeout: Duration,
    link: Option<Link>,
}

impl VisaBackend {
    /// Parse the resource and build an unopened backend.
    pub fn new(params: VisaParams, default_timeout: Duration) -> DeviceResult<Self> {
        let target = params.resource.parse()?;
        let timeout = resolve_timeout(params.timeout_ms, default_timeout);
        Ok(Self {
            params,
            target,
            timeout,
            link: None,
        })
    }

    /// Parsed resource.
    #[must_use]
    pub fn target(&self) -> &VisaResource {
        &self.target
    }

    async fn connect_tcp(&self, host: &str, port: u16) -> DeviceResult<Link> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| DeviceError::connection(&self.params.resource, "connect timed out"))?
            .map_err(|e| DeviceError::connection(&self.params.resource, e.to_string()))?;
        stream.set_nodelay(true)?;
        let mut transport = StreamTransport::new(
            stream,
            &self.params.write_termination,
            &self.params.read_termination,
            self.timeout,
        );
        transport.drain(Duration::from_millis(20)).await;
        Ok(Link::Tcp(transport))
    }

    fn link(&mut self) -> DeviceResult<&mut Link> {
        self.link.as_mut().ok_or_else(|| {
            DeviceError::command(format!("VISA resource '{}' is not open", self.params.resource))
        })
    }
}

#[async_trait]
impl Backend for VisaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Visa
    }

    fn resource(&self) -> &str {
        &self.params.resource
    }

    async fn open(&mut self) -> DeviceResult<()> {
        if self.link.is_some() {
            return Ok(());
        }
        let link = match self.target.clone() {
            VisaResource::TcpSocket { host, port } => self.connect_tcp(&host, port).await?,
            VisaResource::TcpInstr { host } => self.connect_tcp(&host, SCPI_RAW_PORT).await?,
            VisaResource::Serial { port } => {
                let params = SerialParams::new(port, self.params.baud_rate).with_termination(
                    &self.params.write_termination,
                    &self.params.read_termination,
                );
                let mut serial = SerialBackend::new(params, self.timeout);
                serial.open().await?;
                Link::Serial(serial)
            }
            VisaResource::Unsupported { interface } => {
                return Err(DeviceError::connection(
                    &self.params.resource,
                    format!("{interface} resources require a vendor VISA library"),
                ));
            }
        };
        self.link = Some(link);
        info!(resource = %self.params.resource, target = %self.target, "VISA resource opened");
        Ok(())
    }

    async fn close(&mut self) {
        match self.link.take() {
            Some(Link::Serial(mut serial)) => serial.close().await,
            Some(Link::Tcp(_)) => {}
            None => return,
        }
        debug!(resource = %self.params.resource, "VISA resource closed");
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    async fn write(&mut self, command: &[u8]) -> DeviceResult<()> {
        match self.link()? {
            Link::Tcp(t) => t.write(command).await,
            Link::Serial(s) => s.write(command).await,
        }
    }

    async fn read(&mut self) -> DeviceResult<Vec<u8>> {
        match self.link()? {
            Link::Tcp(t) => t.read().await,
            Link::Serial(s) => s.read().await,
        }
    }

    async fn clear(&mut self) -> DeviceResult<()> {
        match self.link()? {
            Link::Tcp(t) => {
                t.drain(Duration::from_millis(20)).await;
                Ok(())
            }
            Link::Serial(s) => s.clear().await,
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
