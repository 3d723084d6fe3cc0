//! Keysight U2000X-series USB power sensors (SCPI over VISA).

use super::scpi::{check_errors, overlap_and_block, parse_ascii_values};
use super::{shared, DriverFactory, TypeCell};
use crate::backend::{BackendKind, SimulatedInstrument};
use crate::device::{Device, DeviceType};
use crate::error::DeviceResult;
use crate::state::StateDescriptor;
use crate::translator::{CommandSpec, TemplateTranslator};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::info;

/// Trigger sources accepted by `TRIG:SOUR`.
pub const TRIGGER_SOURCES: [&str; 5] = ["IMM", "INT", "EXT", "BUS", "INT1"];

/// Measurement speeds accepted by `SENS:MRAT`.
pub const MEASUREMENT_RATES: [&str; 3] = ["NORM", "DOUB", "FAST"];

const PRESET_TIMEOUT: Duration = Duration::from_secs(10);
const ZERO_TIMEOUT: Duration = Duration::from_secs(30);
const CALIBRATE_TIMEOUT: Duration = Duration::from_secs(10);

static U2000X: TypeCell = LazyLock::new(|| build().map_err(|e| e.to_string()));

fn build() -> DeviceResult<Arc<DeviceType>> {
    DeviceType::builder("Keysight U2000X")
        .accepts(BackendKind::Visa)
        .translator(TemplateTranslator::new().with_error_markers(["ERR"]))
        .init_command("*CLS")
        .init_command("*ESE 1")
        .attributes([
            StateDescriptor::bool("initiate_continuous").with_command(CommandSpec::scpi("INIT:CONT")),
            StateDescriptor::bool("output_trigger").with_command(CommandSpec::scpi("OUTP:TRIG")),
            StateDescriptor::choice("trigger_source", TRIGGER_SOURCES)
                .with_command(CommandSpec::scpi("TRIG:SOUR")),
            StateDescriptor::int("trigger_count")
                .with_range(1.0, 200.0)
                .with_command(CommandSpec::scpi("TRIG:COUN")),
            StateDescriptor::choice("measurement_rate", MEASUREMENT_RATES)
                .with_command(CommandSpec::scpi("SENS:MRAT")),
            StateDescriptor::float("sweep_aperture")
                .with_range(20e-6, 200e-3)
                .with_unit("s")
                .with_command(CommandSpec::scpi("SWE:APER"))
                .with_help("time"),
            StateDescriptor::float("frequency")
                .with_range(10e6, 18e9)
                .with_step(1e-3)
                .with_unit("Hz")
                .with_command(CommandSpec::scpi("SENS:FREQ"))
                .with_help("input signal center frequency"),
            StateDescriptor::bool("auto_zero").with_command(CommandSpec::scpi("CAL:ZERO:AUTO")),
            StateDescriptor::string("options")
                .read_only()
                .cached()
                .with_command(CommandSpec::query("*OPT?")),
        ])
        .build()
}

/// Catalog entry for the U2000X sensors.
#[derive(Debug, Clone, Copy, Default)]
pub struct U2000xFactory;

impl DriverFactory for U2000xFactory {
    fn driver_type(&self) -> &'static str {
        "keysight_u2000x"
    }

    fn name(&self) -> &'static str {
        "Keysight U2000X USB power sensor"
    }

    fn device_type(&self) -> DeviceResult<Arc<DeviceType>> {
        shared(&U2000X)
    }

    fn simulator(&self) -> SimulatedInstrument {
        SimulatedInstrument::new()
            .with_register("INIT:CONT", "1")
            .with_register("OUTP:TRIG", "0")
            .with_register("TRIG:SOUR", "IMM")
            .with_register("TRIG:COUN", "1")
            .with_register("SENS:MRAT", "NORM")
            .with_register("SWE:APER", "+2.00000000E-002")
            .with_register("SENS:FREQ", "+5.00000000E+007")
            .with_register("CAL:ZERO:AUTO", "0")
            .with_register("*OPT", "\"H18\"")
            .with_register("*ESR", "+1")
            .with_register("SYST:ERR", "+0,\"No error\"")
            .with_register("FETC", "-42.137,-42.205,-41.998")
    }
}

/// Return the sensor to its preset state and re-enable completion reporting.
pub async fn preset(device: &mut Device) -> DeviceResult<()> {
    overlap_and_block(device, &["SYST:PRES"], PRESET_TIMEOUT).await?;
    device.write_raw("*CLS").await?;
    device.write_raw("*ESE 1").await
}

/// Fetch the latest power readings (dBm). Triggered acquisitions return one value per
/// trigger.
pub async fn fetch_power(device: &mut Device) -> DeviceResult<Vec<f64>> {
    check_errors(device).await?;
    let reply = device.query_raw("FETC?").await?;
    parse_ascii_values("power", &reply)
}

/// Zero the sensor. The RF input must be off.
pub async fn zero(device: &mut Device) -> DeviceResult<()> {
    info!(device = %device.id(), "zeroing power sensor");
    overlap_and_block(device, &["CAL:ZERO:AUTO ONCE"], ZERO_TIMEOUT).await
}

/// Run the internal calibration.
pub async fn calibrate(device: &mut Device) -> DeviceResult<()> {
    info!(device = %device.id(), "calibrating power sensor");
    overlap_and_block(device, &["CAL:AUTO ONCE"], CALIBRATE_TIMEOUT).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ConnectionParams, SimulatedParams};
    use crate::value::Value;

    async fn connected() -> (Device, SimulatedInstrument) {
        let sim = U2000xFactory.simulator();
        let mut sensor = Device::new(
            "sensor",
            U2000xFactory.device_type().unwrap(),
            ConnectionParams::Simulated(SimulatedParams::new(sim.clone())),
        );
        sensor.connect().await.unwrap();
        (sensor, sim)
    }

    #[tokio::test]
    async fn test_connect_enables_completion_reporting() {
        let (_sensor, sim) = connected().await;
        let log = sim.command_log();
        assert_eq!(&log[..2], &["*CLS".to_string(), "*ESE 1".to_string()]);
    }

    #[tokio::test]
    async fn test_scpi_attributes() {
        let (mut sensor, sim) = connected().await;

        assert_eq!(sensor.get("frequency").await.unwrap(), Value::Float(50e6));
        assert_eq!(sensor.get("options").await.unwrap(), Value::from("H18"));

        sensor.set("trigger_source", "ext").await.unwrap();
        assert_eq!(sim.register("TRIG:SOUR").as_deref(), Some("EXT"));
        assert!(sensor.set("trigger_count", 500).await.is_err());
        assert!(sensor.set("measurement_rate", "TURBO").await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_power() {
        let (mut sensor, sim) = connected().await;
        let readings = fetch_power(&mut sensor).await.unwrap();
        assert_eq!(readings, vec![-42.137, -42.205, -41.998]);

        sim.set_register("SYST:ERR", "-222,\"Data out of range\"");
        let err = fetch_power(&mut sensor).await.unwrap_err();
        assert!(err.to_string().contains("Data out of range"));
    }

    #[tokio::test]
    async fn test_zero_waits_for_completion() {
        let (mut sensor, sim) = connected().await;
        sim.clear_log();
        zero(&mut sensor).await.unwrap();
        let log = sim.command_log();
        assert!(log.contains(&"CAL:ZERO:AUTO ONCE".to_string()));
        assert!(log.contains(&"*OPC".to_string()));
        assert_eq!(log.last().map(String::as_str), Some("*ESR?"));
    }

    #[tokio::test]
    async fn test_completion_timeout() {
        let (mut sensor, sim) = connected().await;
        sim.set_register("*ESR", "0");
        let err = overlap_and_block(&mut sensor, &["CAL:AUTO ONCE"], Duration::from_millis(120))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
