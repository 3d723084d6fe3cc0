//! Windows WLAN interface status, read through `netsh wlan show interfaces`.
//!
//! The "instrument" is the process backend running `netsh`. Read-only attributes pick fields
//! from the first interface listed; [`status`] and [`InterfaceSource`] select an interface
//! by name (`Wi-Fi` on a stock install) and report every field at once. Streaming polls the
//! status at the device's poll rate and queues each snapshot as JSON.

use super::{shared, DriverFactory, TypeCell};
use crate::backend::{Backend, BackendKind, SimulatedInstrument};
use crate::device::{Device, DeviceType};
use crate::error::{DeviceError, DeviceResult};
use crate::poller::{PollOutcome, PollSource};
use crate::state::StateDescriptor;
use crate::translator::{CommandSpec, DecodeRule};
use crate::value::Value;
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Arguments passed to `netsh`.
pub const SHOW_INTERFACES: &str = "wlan show interfaces";

/// Interface name Windows gives the first wireless adapter.
pub const DEFAULT_INTERFACE: &str = "Wi-Fi";

static PAIR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(\S.*?)\s+:\s+(\S.*?)\s*$").expect("Invalid netsh pair regex")
});

static WLAN: TypeCell = LazyLock::new(|| build().map_err(|e| e.to_string()));

fn field(label: &str, value: &str) -> CommandSpec {
    CommandSpec::query(SHOW_INTERFACES).with_decode(DecodeRule::Pattern {
        regex: format!(r"(?m)^\s*{label}\s+:\s+(?P<value>{value})\s*$"),
    })
}

fn build() -> DeviceResult<Arc<DeviceType>> {
    DeviceType::builder("WLAN interface status")
        .accepts(BackendKind::Process)
        .poll_source(|| Box::new(InterfaceSource::first()))
        .attributes([
            StateDescriptor::string("state")
                .read_only()
                .with_command(field("State", r".+?")),
            StateDescriptor::string("ssid")
                .read_only()
                .with_command(field("SSID", r".+?")),
            StateDescriptor::string("bssid")
                .read_only()
                .with_command(field("BSSID", r"[0-9A-Fa-f:]+")),
            StateDescriptor::string("radio_type")
                .read_only()
                .with_command(field("Radio type", r".+?")),
            StateDescriptor::int("channel")
                .read_only()
                .with_min(1.0)
                .with_command(field("Channel", r"\d+")),
            StateDescriptor::int("signal")
                .read_only()
                .with_range(0.0, 100.0)
                .with_unit("%")
                .with_command(field("Signal", r"\d+"))
                .with_help("link quality reported by the adapter"),
            StateDescriptor::float("transmit_rate_mbps")
                .read_only()
                .with_min(0.0)
                .with_unit("Mbps")
                .with_command(field(r"Transmit rate \(Mbps\)", r"[\d.]+")),
            StateDescriptor::float("receive_rate_mbps")
                .read_only()
                .with_min(0.0)
                .with_unit("Mbps")
                .with_command(field(r"Receive rate \(Mbps\)", r"[\d.]+")),
        ])
        .build()
}

/// One interface block of the `netsh` report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WlanInterface {
    /// Interface name, e.g. `Wi-Fi`
    pub name: String,
    /// `connected`, `disconnected`, ...
    pub state: Option<String>,
    /// Network name
    pub ssid: Option<String>,
    /// Access point MAC address
    pub bssid: Option<String>,
    /// 802.11 variant
    pub radio_type: Option<String>,
    /// Channel number
    pub channel: Option<u32>,
    /// Link quality, percent
    pub signal: Option<u8>,
    /// Receive link rate
    pub receive_rate_mbps: Option<f64>,
    /// Transmit link rate
    pub transmit_rate_mbps: Option<f64>,
    /// Every `key : value` pair of the block, keys lowercased with spaces as underscores
    pub fields: BTreeMap<String, String>,
}

impl WlanInterface {
    fn absorb(&mut self, key: String, value: &str) {
        match key.as_str() {
            "state" => self.state = Some(value.to_string()),
            "ssid" => self.ssid = Some(value.to_string()),
            "bssid" => self.bssid = Some(value.to_string()),
            "radio_type" => self.radio_type = Some(value.to_string()),
            "channel" => self.channel = value.parse().ok(),
            "signal" => self.signal = value.trim_end_matches('%').trim().parse().ok(),
            "receive_rate_mbps" => self.receive_rate_mbps = value.parse().ok(),
            "transmit_rate_mbps" => self.transmit_rate_mbps = value.parse().ok(),
            _ => {}
        }
        self.fields.insert(key, value.to_string());
    }
}

fn normalize_key(key: &str) -> String {
    key.to_lowercase()
        .replace(['(', ')'], "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Parse `netsh wlan show interfaces`. Pairs before the first `Name` line are ignored.
#[must_use]
pub fn parse_interfaces(report: &str) -> Vec<WlanInterface> {
    let mut interfaces: Vec<WlanInterface> = Vec::new();
    for caps in PAIR_REGEX.captures_iter(report) {
        let key = normalize_key(&caps[1]);
        let value = caps[2].trim();
        if key == "name" {
            interfaces.push(WlanInterface {
                name: value.to_string(),
                ..WlanInterface::default()
            });
        } else if let Some(current) = interfaces.last_mut() {
            current.absorb(key, value);
        }
    }
    interfaces
}

fn select(report: &str, interface: Option<&str>) -> DeviceResult<WlanInterface> {
    let mut interfaces = parse_interfaces(report);
    let found = match interface {
        Some(name) => interfaces
            .iter()
            .position(|i| i.name.eq_ignore_ascii_case(name))
            .map(|index| interfaces.swap_remove(index)),
        None => interfaces.into_iter().next(),
    };
    found.ok_or_else(|| {
        let wanted = interface.unwrap_or("any");
        DeviceError::decode("wlan", format!("no WLAN interface named '{wanted}'"), report)
    })
}

/// Current status of `interface`.
pub async fn status(device: &mut Device, interface: &str) -> DeviceResult<WlanInterface> {
    let report = device.query_raw(SHOW_INTERFACES).await?;
    select(&report, Some(interface))
}

/// Poll the status of `interface` in the background.
pub async fn start(device: &mut Device, interface: &str) -> DeviceResult<()> {
    device
        .start_with(Box::new(InterfaceSource::named(interface)))
        .await
}

/// Runs `netsh` once per poll and queues the interface's status as JSON.
#[derive(Debug, Clone)]
pub struct InterfaceSource {
    interface: Option<String>,
}

impl InterfaceSource {
    /// Follow the interface called `name`.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            interface: Some(name.into()),
        }
    }

    /// Follow whichever interface `netsh` lists first.
    #[must_use]
    pub fn first() -> Self {
        Self { interface: None }
    }
}

#[async_trait]
impl PollSource for InterfaceSource {
    async fn poll(&mut self, backend: &mut dyn Backend) -> DeviceResult<PollOutcome> {
        let raw = backend.query(SHOW_INTERFACES.as_bytes()).await?;
        let report = String::from_utf8_lossy(&raw);
        let status = select(&report, self.interface.as_deref())?;
        debug!(interface = %status.name, signal = ?status.signal, "wlan status");
        let json = serde_json::to_string(&status)
            .map_err(|e| DeviceError::decode("wlan", e.to_string(), report.as_ref()))?;
        Ok(PollOutcome::Data(Value::String(json)))
    }
}

/// Catalog entry for WLAN status.
#[derive(Debug, Clone, Copy, Default)]
pub struct WlanStatusFactory;

impl DriverFactory for WlanStatusFactory {
    fn driver_type(&self) -> &'static str {
        "wlan_status"
    }

    fn name(&self) -> &'static str {
        "Windows WLAN interface status (netsh)"
    }

    fn device_type(&self) -> DeviceResult<Arc<DeviceType>> {
        shared(&WLAN)
    }

    fn simulator(&self) -> SimulatedInstrument {
        let polls = AtomicU64::new(0);
        SimulatedInstrument::new().with_responder(move |command| {
            if command != SHOW_INTERFACES {
                return None;
            }
            let n = polls.fetch_add(1, Ordering::Relaxed);
            Some(sample_report(90 - (n % 5) as u8))
        })
    }
}

fn sample_report(signal: u8) -> String {
    format!(
        "\nThere is 1 interface on the system:\n\n\
         \x20   Name                   : Wi-Fi\n\
         \x20   Description            : Intel(R) Wi-Fi 6 AX201 160MHz\n\
         \x20   Physical address       : 8c:c6:81:2a:3b:4c\n\
         \x20   State                  : connected\n\
         \x20   SSID                   : lab-5g\n\
         \x20   BSSID                  : a0:3d:6f:11:22:33\n\
         \x20   Network type           : Infrastructure\n\
         \x20   Radio type             : 802.11ac\n\
         \x20   Authentication         : WPA2-Personal\n\
         \x20   Channel                : 149\n\
         \x20   Receive rate (Mbps)    : 866.7\n\
         \x20   Transmit rate (Mbps)   : 650\n\
         \x20   Signal                 : {signal}%\n\
         \x20   Profile                : lab-5g\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ConnectionParams, SimulatedParams};
    use std::time::Duration;

    const TWO_ADAPTERS: &str = "
There are 2 interfaces on the system:

    Name                   : Wi-Fi
    State                  : disconnected
    Radio status           : Hardware On

    Name                   : Wi-Fi 2
    State                  : connected
    SSID                   : bench AP
    BSSID                  : 00:11:22:33:44:55
    Channel                : 6
    Transmit rate (Mbps)   : 144.4
    Signal                 : 71%
";

    fn device(sim: SimulatedInstrument) -> Device {
        Device::new(
            "wlan",
            WlanStatusFactory.device_type().unwrap(),
            ConnectionParams::Simulated(SimulatedParams::new(sim)),
        )
    }

    #[test]
    fn test_parse_interfaces() {
        let interfaces = parse_interfaces(TWO_ADAPTERS);
        assert_eq!(interfaces.len(), 2);
        assert_eq!(interfaces[0].state.as_deref(), Some("disconnected"));
        assert_eq!(interfaces[0].fields["radio_status"], "Hardware On");
        assert!(interfaces[0].signal.is_none());

        let second = &interfaces[1];
        assert_eq!(second.name, "Wi-Fi 2");
        assert_eq!(second.ssid.as_deref(), Some("bench AP"));
        assert_eq!(second.bssid.as_deref(), Some("00:11:22:33:44:55"));
        assert_eq!(second.channel, Some(6));
        assert_eq!(second.signal, Some(71));
        assert_eq!(second.transmit_rate_mbps, Some(144.4));

        assert_eq!(parse_interfaces(&TWO_ADAPTERS.replace('\n', "\r\n")), interfaces);
        assert!(select(TWO_ADAPTERS, Some("wi-fi 2")).is_ok());
        assert!(select(TWO_ADAPTERS, Some("Ethernet")).is_err());
        assert!(parse_interfaces("There is no wireless interface on the system.").is_empty());
    }

    #[tokio::test]
    async fn test_attributes_read_first_interface() {
        let mut wlan = device(WlanStatusFactory.simulator());
        wlan.connect().await.unwrap();

        assert_eq!(wlan.get("ssid").await.unwrap(), Value::from("lab-5g"));
        assert_eq!(wlan.get("bssid").await.unwrap(), Value::from("a0:3d:6f:11:22:33"));
        assert_eq!(wlan.get("channel").await.unwrap(), Value::Int(149));
        assert_eq!(wlan.get("transmit_rate_mbps").await.unwrap(), Value::Float(650.0));
        assert!(matches!(wlan.get("signal").await.unwrap(), Value::Int(86..=90)));
        assert!(matches!(
            wlan.set("ssid", "other").await,
            Err(DeviceError::Access { .. })
        ));
        wlan.disconnect().await;
    }

    #[tokio::test]
    async fn test_status_and_streaming() {
        let mut wlan = device(WlanStatusFactory.simulator());
        wlan.options_mut().poller.poll_rate =
            crate::poller::PollRate::Interval(Duration::from_millis(10));
        wlan.connect().await.unwrap();

        let now = status(&mut wlan, DEFAULT_INTERFACE).await.unwrap();
        assert_eq!(now.radio_type.as_deref(), Some("802.11ac"));
        assert!(status(&mut wlan, "Ethernet").await.is_err());

        start(&mut wlan, DEFAULT_INTERFACE).await.unwrap();
        let results = wlan.fetch(Some(Duration::from_secs(2))).await.unwrap();
        wlan.stop().await.unwrap();

        assert!(!results.is_empty());
        let snapshot: serde_json::Value =
            serde_json::from_str(results[0].payload.as_str().unwrap()).unwrap();
        assert_eq!(snapshot["name"], "Wi-Fi");
        assert_eq!(snapshot["channel"], 149);
        wlan.disconnect().await;
    }

    #[tokio::test]
    async fn test_missing_interface_faults_the_poller() {
        let mut wlan = device(WlanStatusFactory.simulator());
        wlan.connect().await.unwrap();
        start(&mut wlan, "Ethernet").await.unwrap();

        let mut fault = None;
        for _ in 0..20 {
            if let Err(e) = wlan.fetch(Some(Duration::from_millis(100))).await {
                fault = Some(e);
                break;
            }
        }
        assert!(matches!(fault, Some(DeviceError::PollerFault(_))));
        assert!(!wlan.is_running());
        wlan.disconnect().await;
    }
}
