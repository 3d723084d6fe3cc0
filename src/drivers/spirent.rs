//! Spirent GSS8000 GPS constellation simulator (serial remote control).
//!
//! Every command, write or query, is answered with an XML-ish envelope:
//!
//! ```text
//! <msg><status>5</status><data>02-Mar-2021 14:07:51.300</data></msg>
//! ```
//!
//! `status` indexes [`STATUS_MESSAGES`]. `data` carries the value of a query, or an error
//! message when a write fails.

use super::{shared, DriverFactory, TypeCell};
use crate::backend::{BackendKind, SerialParams, SimulatedInstrument};
use crate::device::{Device, DeviceType};
use crate::error::{DeviceError, DeviceResult};
use crate::state::StateDescriptor;
use crate::translator::{cast, CommandSpec, CommandTranslator, TemplateTranslator};
use crate::value::Value;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Simulator states, in the order the instrument numbers them.
pub const STATUS_MESSAGES: [&str; 8] = [
    "no scenario",
    "loading",
    "ready",
    "arming",
    "armed",
    "running",
    "paused",
    "ended",
];

/// Reply terminator.
pub const MESSAGE_END: &str = "</msg>";

const DEFAULT_BAUD_RATE: u32 = 9600;

static STATUS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<status>\s*(\d+)\s*</status>").expect("Invalid status regex")
});

static DATA_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<data>\s*(.*?)\s*</data>").expect("Invalid data regex")
});

/// A decoded reply envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Index into [`STATUS_MESSAGES`]
    pub status: usize,
    /// Payload, if any
    pub data: Option<String>,
}

impl Envelope {
    /// Parse a reply, with or without its `</msg>` terminator.
    pub fn parse(reply: &str) -> Option<Self> {
        let status = STATUS_REGEX.captures(reply)?.get(1)?.as_str().parse().ok()?;
        let data = DATA_REGEX
            .captures(reply)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .filter(|d| !d.is_empty());
        Some(Self { status, data })
    }

    /// Name of the reported state.
    #[must_use]
    pub fn status_name(&self) -> Option<&'static str> {
        STATUS_MESSAGES.get(self.status).copied()
    }

    fn render(status: usize, data: Option<&str>) -> String {
        match data {
            Some(d) => format!("<msg><status>{status}</status><data>{d}</data>{MESSAGE_END}"),
            None => format!("<msg><status>{status}</status>{MESSAGE_END}"),
        }
    }
}

/// Unwraps the reply envelope before handing values to the template rules.
#[derive(Debug, Default)]
pub struct SpirentTranslator {
    inner: TemplateTranslator,
}

impl SpirentTranslator {
    fn envelope(name: &str, raw: &[u8]) -> DeviceResult<Envelope> {
        let text = String::from_utf8_lossy(raw);
        Envelope::parse(&text)
            .ok_or_else(|| DeviceError::decode(name, "reply is not a status envelope", text.trim()))
    }
}

impl CommandTranslator for SpirentTranslator {
    fn encode_get(&self, descriptor: &StateDescriptor) -> DeviceResult<Vec<u8>> {
        self.inner.encode_get(descriptor)
    }

    fn encode_set(&self, descriptor: &StateDescriptor, value: &Value) -> DeviceResult<Vec<u8>> {
        self.inner.encode_set(descriptor, value)
    }

    fn decode(&self, descriptor: &StateDescriptor, raw: &[u8]) -> DeviceResult<Value> {
        let envelope = Self::envelope(&descriptor.name, raw)?;
        let token = match &envelope.data {
            Some(data) => data.clone(),
            None => envelope
                .status_name()
                .ok_or_else(|| {
                    DeviceError::decode(
                        &descriptor.name,
                        format!("unknown status {}", envelope.status),
                        String::from_utf8_lossy(raw),
                    )
                })?
                .to_string(),
        };
        cast(descriptor, &token, &String::from_utf8_lossy(raw))
    }

    fn check_ack(&self, reply: &[u8]) -> DeviceResult<()> {
        let envelope = Self::envelope("ack", reply).map_err(|e| DeviceError::command(e.to_string()))?;
        match envelope.data {
            Some(message) => Err(DeviceError::command(format!("simulator refused command: {message}"))),
            None => Ok(()),
        }
    }
}

static GSS8000: TypeCell = LazyLock::new(|| build().map_err(|e| e.to_string()));

fn build() -> DeviceResult<Arc<DeviceType>> {
    DeviceType::builder("Spirent GSS8000")
        .accepts(BackendKind::Serial)
        .translator(SpirentTranslator::default())
        .acknowledged()
        .attributes([
            StateDescriptor::choice("status", STATUS_MESSAGES)
                .read_only()
                .with_command(CommandSpec::query("NULL")),
            StateDescriptor::string("current_scenario")
                .read_only()
                .with_command(CommandSpec::query("SC_NAME,includepath")),
            StateDescriptor::int("gps_week")
                .read_only()
                .with_command(CommandSpec::query("-,ZCNT_TOW")),
            StateDescriptor::string("utc_time")
                .read_only()
                .with_command(CommandSpec::query("-,UTC_TIME"))
                .with_help("UTC time of the running scenario"),
        ])
        .action("run", "RU")
        .action("end", "-,EN")
        .action("rewind", "RW")
        .action("abort", "-,EN,1,0")
        .scenario(
            "SC,${path}",
            Some("SAVE_SCENARIO,with_changes,as_simgen,${path}/".to_string()),
        )
        .build()
}

/// Serial settings for the simulator's remote port.
pub fn serial_params(port: impl Into<String>) -> SerialParams {
    SerialParams::new(port, DEFAULT_BAUD_RATE).with_termination("\n", MESSAGE_END)
}

/// End any running scenario, then rewind to the start.
pub async fn reset(device: &mut Device) -> DeviceResult<()> {
    let status = device.get("status").await?;
    if status.as_str() != Some("ended") {
        if let Err(e) = device.invoke("end").await {
            debug!(device = %device.id(), error = %e, "end before rewind failed");
        }
    }
    device.invoke("rewind").await
}

/// Whether a scenario is running.
pub async fn scenario_running(device: &mut Device) -> DeviceResult<bool> {
    Ok(device.get("status").await?.as_str() == Some("running"))
}

/// Scenario time, parsed from the instrument's `02-Mar-2021 14:07:51.300` format.
pub async fn utc_time(device: &mut Device) -> DeviceResult<NaiveDateTime> {
    let text = device.get("utc_time").await?.to_string();
    parse_utc(&text)
}

fn parse_utc(text: &str) -> DeviceResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%d-%b-%Y %H:%M:%S%.f")
        .map_err(|e| DeviceError::decode("utc_time", e.to_string(), text))
}

/// Catalog entry for the GSS8000.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gss8000Factory;

impl DriverFactory for Gss8000Factory {
    fn driver_type(&self) -> &'static str {
        "spirent_gss8000"
    }

    fn name(&self) -> &'static str {
        "Spirent GSS8000 GPS simulator"
    }

    fn device_type(&self) -> DeviceResult<Arc<DeviceType>> {
        shared(&GSS8000)
    }

    fn simulator(&self) -> SimulatedInstrument {
        let state = Arc::new(Mutex::new(SimState::default()));
        SimulatedInstrument::new().with_responder(move |command| Some(state.lock().respond(command)))
    }
}

const NO_SCENARIO: usize = 0;
const READY: usize = 2;
const RUNNING: usize = 5;
const ENDED: usize = 7;

#[derive(Debug, Default)]
struct SimState {
    status: usize,
    scenario: Option<String>,
}

impl SimState {
    fn respond(&mut self, command: &str) -> String {
        let refuse = |status, message: &str| Envelope::render(status, Some(message));
        match command {
            "NULL" => Envelope::render(self.status, None),
            "RU" if self.status == READY => {
                self.status = RUNNING;
                Envelope::render(self.status, None)
            }
            "RU" => refuse(self.status, "Scenario not ready"),
            "-,EN" if self.status == RUNNING => {
                self.status = ENDED;
                Envelope::render(self.status, None)
            }
            "-,EN" => refuse(self.status, "Scenario not running"),
            "-,EN,1,0" => {
                if self.scenario.is_some() {
                    self.status = ENDED;
                }
                Envelope::render(self.status, None)
            }
            "RW" if self.scenario.is_some() => {
                self.status = READY;
                Envelope::render(self.status, None)
            }
            "RW" => refuse(self.status, "No scenario loaded"),
            "SC_NAME,includepath" => match &self.scenario {
                Some(path) => Envelope::render(self.status, Some(path)),
                None => Envelope::render(self.status, None),
            },
            "-,ZCNT_TOW" => Envelope::render(self.status, Some("2146")),
            "-,UTC_TIME" => Envelope::render(self.status, Some("02-Mar-2021 14:07:51.300")),
            other => {
                if let Some(path) = other.strip_prefix("SC,") {
                    self.scenario = Some(path.to_string());
                    self.status = READY;
                    Envelope::render(self.status, None)
                } else if other.starts_with("SAVE_SCENARIO,") && self.status != NO_SCENARIO {
                    Envelope::render(self.status, None)
                } else {
                    refuse(self.status, &format!("Unrecognised command {other}"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ConnectionParams, SimulatedParams};

    async fn connected() -> (Device, SimulatedInstrument) {
        let sim = Gss8000Factory.simulator();
        let mut gss = Device::new(
            "gss",
            Gss8000Factory.device_type().unwrap(),
            ConnectionParams::Simulated(SimulatedParams::new(sim.clone())),
        );
        gss.connect().await.unwrap();
        (gss, sim)
    }

    #[test]
    fn test_envelope_parse() {
        let env = Envelope::parse("<msg>\r\n<status>5</status>\r\n<data>2146</data>\r\n").unwrap();
        assert_eq!(env.status_name(), Some("running"));
        assert_eq!(env.data.as_deref(), Some("2146"));

        let env = Envelope::parse("<msg><status>0</status><data></data></msg>").unwrap();
        assert_eq!(env.data, None);
        assert!(Envelope::parse("garbage").is_none());
    }

    #[tokio::test]
    async fn test_scenario_workflow() {
        let (mut gss, sim) = connected().await;
        assert_eq!(gss.get("status").await.unwrap(), Value::from("no scenario"));

        gss.load_scenario(r"C:\scenarios\static.scn").await.unwrap();
        assert!(sim
            .command_log()
            .contains(&r"SC,C:\scenarios\static.scn".to_string()));
        assert_eq!(
            gss.get("current_scenario").await.unwrap(),
            Value::from(r"C:\scenarios\static.scn")
        );

        gss.invoke("run").await.unwrap();
        assert!(scenario_running(&mut gss).await.unwrap());
        assert_eq!(gss.get("gps_week").await.unwrap(), Value::Int(2146));

        reset(&mut gss).await.unwrap();
        assert_eq!(gss.get("status").await.unwrap(), Value::from("ready"));

        gss.save_scenario("C:/scenarios/saved").await.unwrap();
        assert_eq!(
            sim.command_log().last().map(String::as_str),
            Some("SAVE_SCENARIO,with_changes,as_simgen,C:/scenarios/saved/")
        );
    }

    #[tokio::test]
    async fn test_refused_command_is_error() {
        let (mut gss, _sim) = connected().await;
        let err = gss.invoke("run").await.unwrap_err();
        assert!(matches!(err, DeviceError::Command { .. }));
        assert!(err.to_string().contains("Scenario not ready"));

        // A refused command leaves the link in step.
        assert_eq!(gss.get("status").await.unwrap(), Value::from("no scenario"));
    }

    #[tokio::test]
    async fn test_utc_time() {
        let (mut gss, _sim) = connected().await;
        let time = utc_time(&mut gss).await.unwrap();
        assert_eq!(time.to_string(), "2021-03-02 14:07:51.300");
    }

    #[test]
    fn test_serial_params() {
        let params = serial_params("/dev/ttyUSB3");
        assert_eq!(params.read_termination, "</msg>");
        assert_eq!(params.baud_rate, 9600);
    }
}
