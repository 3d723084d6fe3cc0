//! Built-in instrument catalog.
//!
//! Each driver is a [`DriverFactory`]: a name, a shared [`DeviceType`] built once per process,
//! and a simulator that behaves enough like the real instrument for tests and the CLI's
//! `--simulate` mode. Instruments that need more than attribute access (power sensor
//! readings, analyzer sweeps and traces, scenario control, iperf runs, WLAN snapshots) get
//! free functions in their module that work on a connected [`Device`](crate::device::Device).
//!
//! | Driver type            | Instrument                          | Backends        |
//! |------------------------|-------------------------------------|-----------------|
//! | `minicircuits_rcdat`   | Mini-Circuits RCDAT attenuator      | serial, visa, library |
//! | `minicircuits_switch`  | Mini-Circuits USB-SP4T RF switch    | serial, visa, library |
//! | `keysight_u2000x`      | Keysight U2000X USB power sensor    | visa            |
//! | `spirent_gss8000`      | Spirent GSS8000 GPS simulator       | serial          |
//! | `gps_receiver`         | Streaming NMEA GPS receiver         | serial          |
//! | `iperf`                | iperf throughput tester             | process         |
//! | `wlan_status`          | Windows WLAN interface (`netsh`)    | process         |
//! | `rohde_schwarz_fsw`    | Rohde & Schwarz FSW signal analyzer | visa            |

pub mod gps;
pub mod iperf;
pub mod keysight;
pub mod minicircuits;
pub mod rohde_schwarz;
pub mod scpi;
pub mod spirent;
pub mod wlan;

use crate::backend::SimulatedInstrument;
use crate::device::DeviceType;
use crate::error::{DeviceError, DeviceResult};
use std::sync::{Arc, LazyLock};

/// A catalog entry.
pub trait DriverFactory: Send + Sync {
    /// Identifier used in configuration files.
    fn driver_type(&self) -> &'static str;

    /// Human-readable instrument name.
    fn name(&self) -> &'static str;

    /// The shared device type.
    fn device_type(&self) -> DeviceResult<Arc<DeviceType>>;

    /// A fresh simulated instrument answering like this one.
    fn simulator(&self) -> SimulatedInstrument;
}

static CATALOG: &[&dyn DriverFactory] = &[
    &minicircuits::RcdatFactory,
    &minicircuits::SwitchFactory,
    &keysight::U2000xFactory,
    &spirent::Gss8000Factory,
    &gps::GpsReceiverFactory,
    &iperf::IperfFactory,
    &wlan::WlanStatusFactory,
    &rohde_schwarz::FswFactory,
];

/// Every built-in driver.
#[must_use]
pub fn catalog() -> &'static [&'static dyn DriverFactory] {
    CATALOG
}

/// Find a driver by type name.
#[must_use]
pub fn lookup(driver_type: &str) -> Option<&'static dyn DriverFactory> {
    CATALOG
        .iter()
        .copied()
        .find(|f| f.driver_type().eq_ignore_ascii_case(driver_type))
}

/// Shared device type of a catalog driver.
pub fn device_type(driver_type: &str) -> DeviceResult<Arc<DeviceType>> {
    lookup(driver_type)
        .ok_or_else(|| DeviceError::Configuration(format!("unknown driver '{driver_type}'")))?
        .device_type()
}

/// Lazily built device type, kept as text on failure so the cell stays `Sync`.
pub(crate) type TypeCell = LazyLock<Result<Arc<DeviceType>, String>>;

pub(crate) fn shared(cell: &TypeCell) -> DeviceResult<Arc<DeviceType>> {
    match &**cell {
        Ok(device_type) => Ok(Arc::clone(device_type)),
        Err(e) => Err(DeviceError::Configuration(e.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalog_types_build() {
        let mut names = HashSet::new();
        for factory in catalog() {
            assert!(names.insert(factory.driver_type()), "duplicate driver type");
            let device_type = factory.device_type().unwrap();
            assert!(device_type.registry().get("connected").is_some());
        }
        assert_eq!(names.len(), 8);
    }

    #[test]
    fn test_device_type_is_shared() {
        let a = device_type("minicircuits_rcdat").unwrap();
        let b = device_type("MINICIRCUITS_RCDAT").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(device_type("flux_capacitor").is_err());
    }
}
