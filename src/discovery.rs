//! Finding instruments by hardware identifier.
//!
//! Port names like `/dev/ttyUSB0` or `COM17` move around between reboots; the USB
//! vendor/product ids and serial number of the adapter do not. A [`HardwareId`] written the
//! way operating systems report it (`USB VID:PID=0403:6014 SER=5`) selects candidates from a
//! [`Discovery`] source, and [`resolve_unique`] insists on exactly one match.
//!
//! Sources are injected; nothing is cached between calls.

use crate::backend::BackendKind;
use crate::error::{DeviceError, DeviceResult};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static HWID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)VID:PID=([0-9a-f]{4}):([0-9a-f]{4})(?:\s+SER=(\S+))?")
        .expect("Invalid hardware id regex")
});

/// USB identity of an instrument or its serial adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HardwareId {
    /// USB vendor id
    pub vid: u16,
    /// USB product id
    pub pid: u16,
    /// Adapter serial number, when reported
    pub serial: Option<String>,
}

impl HardwareId {
    /// Identity without a serial number.
    #[must_use]
    pub fn new(vid: u16, pid: u16) -> Self {
        Self {
            vid,
            pid,
            serial: None,
        }
    }

    /// Require a serial number.
    #[must_use]
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    /// Whether `other` satisfies this identity used as a filter. A filter without a serial
    /// number matches any serial.
    #[must_use]
    pub fn matches(&self, other: &HardwareId) -> bool {
        self.vid == other.vid
            && self.pid == other.pid
            && self
                .serial
                .as_ref()
                .is_none_or(|s| other.serial.as_deref().is_some_and(|o| o.eq_ignore_ascii_case(s)))
    }
}

impl FromStr for HardwareId {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = HWID_REGEX.captures(s).ok_or_else(|| {
            DeviceError::Configuration(format!(
                "'{s}' is not a hardware id (expected 'USB VID:PID=xxxx:xxxx [SER=...]')"
            ))
        })?;
        let hex = |i: usize| {
            caps.get(i)
                .and_then(|m| u16::from_str_radix(m.as_str(), 16).ok())
                .ok_or_else(|| DeviceError::Configuration(format!("bad hex id in '{s}'")))
        };
        Ok(Self {
            vid: hex(1)?,
            pid: hex(2)?,
            serial: caps.get(3).map(|m| m.as_str().to_string()),
        })
    }
}

impl fmt::Display for HardwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "USB VID:PID={:04X}:{:04X}", self.vid, self.pid)?;
        if let Some(serial) = &self.serial {
            write!(f, " SER={serial}")?;
        }
        Ok(())
    }
}

/// A resource a device could connect to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceCandidate {
    /// Port name or resource string
    pub resource: String,
    /// Transport the resource belongs to
    pub kind: BackendKind,
    /// USB identity, if the resource has one
    pub hardware_id: Option<HardwareId>,
    /// Manufacturer/product text
    pub description: Option<String>,
}

/// A source of candidate resources.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Enumerate what is currently attached.
    async fn candidates(&self) -> DeviceResult<Vec<ResourceCandidate>>;
}

/// Candidates whose identity matches `filter`.
pub async fn find(
    discovery: &dyn Discovery,
    filter: &HardwareId,
) -> DeviceResult<Vec<ResourceCandidate>> {
    Ok(discovery
        .candidates()
        .await?
        .into_iter()
        .filter(|c| c.hardware_id.as_ref().is_some_and(|id| filter.matches(id)))
        .collect())
}

/// The one candidate matching `filter`. No match, or more than one, is a connection error.
pub async fn resolve_unique(
    discovery: &dyn Discovery,
    filter: &HardwareId,
) -> DeviceResult<ResourceCandidate> {
    let mut matches = find(discovery, filter).await?;
    match matches.len() {
        0 => Err(DeviceError::connection(
            filter.to_string(),
            "no attached resource matches",
        )),
        1 => Ok(matches.remove(0)),
        _ => Err(DeviceError::connection(
            filter.to_string(),
            format!(
                "ambiguous: matches {}",
                matches
                    .iter()
                    .map(|c| c.resource.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        )),
    }
}

/// A fixed candidate list.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    candidates: Vec<ResourceCandidate>,
}

impl StaticDiscovery {
    /// Source that always reports `candidates`.
    #[must_use]
    pub fn new(candidates: Vec<ResourceCandidate>) -> Self {
        Self { candidates }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn candidates(&self) -> DeviceResult<Vec<ResourceCandidate>> {
        Ok(self.candidates.clone())
    }
}

/// Serial ports reported by the operating system.
#[cfg(feature = "instrument_serial")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialDiscovery;

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl Discovery for SerialDiscovery {
    async fn candidates(&self) -> DeviceResult<Vec<ResourceCandidate>> {
        // Enumeration walks sysfs / the registry and may block.
        let ports = tokio::task::spawn_blocking(serialport::available_ports)
            .await
            .map_err(|e| DeviceError::connection("serial", format!("enumeration task failed: {e}")))?
            .map_err(|e| {
                DeviceError::connection("serial", format!("Could not enumerate serial ports: {e}"))
            })?;

        Ok(ports
            .into_iter()
            .map(|port| {
                let (hardware_id, description) = match port.port_type {
                    serialport::SerialPortType::UsbPort(usb) => {
                        let description = match (usb.manufacturer, usb.product) {
                            (Some(m), Some(p)) => Some(format!("{m} {p}")),
                            (m, p) => m.or(p),
                        };
                        let id = HardwareId {
                            vid: usb.vid,
                            pid: usb.pid,
                            serial: usb.serial_number,
                        };
                        (Some(id), description)
                    }
                    _ => (None, None),
                };
                ResourceCandidate {
                    resource: port.port_name,
                    kind: BackendKind::Serial,
                    hardware_id,
                    description,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(resource: &str, hwid: &str) -> ResourceCandidate {
        ResourceCandidate {
            resource: resource.to_string(),
            kind: BackendKind::Serial,
            hardware_id: Some(hwid.parse().unwrap()),
            description: None,
        }
    }

    #[test]
    fn test_parse_hardware_id() {
        let id: HardwareId = "USB VID:PID=0403:6014 SER=5".parse().unwrap();
        assert_eq!(id, HardwareId::new(0x0403, 0x6014).with_serial("5"));

        let id: HardwareId = "USB VID:PID=20ce:0023 LOCATION=1-1.2".parse().unwrap();
        assert_eq!(id.serial, None);
        assert_eq!(id.to_string(), "USB VID:PID=20CE:0023");

        assert!("COM3".parse::<HardwareId>().is_err());
    }

    #[test]
    fn test_matching() {
        let filter = HardwareId::new(0x0403, 0x6014);
        assert!(filter.matches(&HardwareId::new(0x0403, 0x6014).with_serial("A1")));
        assert!(!filter.matches(&HardwareId::new(0x0403, 0x6015)));

        let filter = filter.with_serial("a1");
        assert!(filter.matches(&HardwareId::new(0x0403, 0x6014).with_serial("A1")));
        assert!(!filter.matches(&HardwareId::new(0x0403, 0x6014)));
    }

    #[tokio::test]
    async fn test_resolve_unique() {
        let discovery = StaticDiscovery::new(vec![
            usb("/dev/ttyUSB0", "USB VID:PID=0403:6014 SER=5"),
            usb("/dev/ttyUSB1", "USB VID:PID=0403:6014 SER=6"),
            ResourceCandidate {
                resource: "/dev/ttyS0".to_string(),
                kind: BackendKind::Serial,
                hardware_id: None,
                description: None,
            },
        ]);

        let piksi = "USB VID:PID=0403:6014 SER=5".parse().unwrap();
        let found = resolve_unique(&discovery, &piksi).await.unwrap();
        assert_eq!(found.resource, "/dev/ttyUSB0");

        let any_ftdi = HardwareId::new(0x0403, 0x6014);
        let err = resolve_unique(&discovery, &any_ftdi).await.unwrap_err();
        assert!(err.to_string().contains("ambiguous"));

        let missing = HardwareId::new(0x20ce, 0x0023);
        assert!(matches!(
            resolve_unique(&discovery, &missing).await,
            Err(DeviceError::Connection { .. })
        ));
    }
}
