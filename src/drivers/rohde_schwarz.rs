//! Rohde & Schwarz FSW signal analyzers (SCPI over VISA).
//!
//! One model covers both the spectrum and the I/Q analyzer channel; the `iq_*` attributes
//! only mean something while `channel_type` is `IQ`, which [`store_iq`] checks before
//! writing a capture. Sweeps, autolevel and file operations run overlapped and block on
//! `*OPC` until the analyzer reports completion.

use super::scpi::{check_errors, overlap_and_block, parse_ascii_values};
use super::{shared, DriverFactory, TypeCell};
use crate::backend::{BackendKind, SimulatedInstrument};
use crate::device::{Device, DeviceType};
use crate::error::{DeviceError, DeviceResult};
use crate::state::StateDescriptor;
use crate::translator::{CommandSpec, TemplateTranslator};
use crate::value::Value;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::info;

/// Measurement channels accepted by `INST`.
pub const CHANNEL_TYPES: [&str; 2] = ["SAN", "IQ"];

/// Result formats accepted by `CALC:FORM` in the I/Q channel.
pub const IQ_FORMATS: [&str; 6] = ["FREQ", "MAGN", "MTAB", "PEAK", "RIM", "VECT"];

/// Display traces.
pub const TRACES: std::ops::RangeInclusive<u8> = 1..=6;

/// Markers.
pub const MARKERS: std::ops::RangeInclusive<u8> = 1..=16;

const FREQUENCY_MIN: f64 = 2.0;
const FREQUENCY_MAX: f64 = 26.5e9;
const AUTOLEVEL_TIMEOUT: Duration = Duration::from_secs(30);
const STATE_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

static FSW: TypeCell = LazyLock::new(|| build().map_err(|e| e.to_string()));

fn frequency(name: &str, key: &str) -> StateDescriptor {
    StateDescriptor::float(name)
        .with_range(FREQUENCY_MIN, FREQUENCY_MAX)
        .with_unit("Hz")
        .with_command(CommandSpec::scpi(key))
}

fn level(name: String, key: String) -> StateDescriptor {
    StateDescriptor::float(name)
        .with_step(1e-3)
        .with_unit("dB")
        .with_command(CommandSpec::scpi(&key))
}

fn build() -> DeviceResult<Arc<DeviceType>> {
    let mut attributes = vec![
        frequency("frequency_center", "FREQ:CENT"),
        frequency("frequency_span", "FREQ:SPAN"),
        frequency("frequency_start", "FREQ:STAR"),
        frequency("frequency_stop", "FREQ:STOP"),
        StateDescriptor::bool("initiate_continuous").with_command(CommandSpec::scpi("INIT:CONT")),
        StateDescriptor::choice("channel_type", CHANNEL_TYPES)
            .with_command(CommandSpec::scpi("INST"))
            .with_help("spectrum (SAN) or I/Q analyzer (IQ)"),
        StateDescriptor::int("sweep_points")
            .with_range(1.0, 100_001.0)
            .with_command(CommandSpec::scpi("SWE:POIN")),
        StateDescriptor::bool("iq_simple_enabled").with_command(CommandSpec::scpi("CALC:IQ")),
        StateDescriptor::int("iq_record_length")
            .with_range(1.0, 461_373_440.0)
            .with_unit("samples")
            .with_command(CommandSpec::scpi("TRAC:IQ:RLEN")),
        StateDescriptor::float("iq_sample_rate")
            .with_range(1e-9, 160e6)
            .with_unit("Hz")
            .with_command(CommandSpec::scpi("TRAC:IQ:SRAT")),
        StateDescriptor::choice("iq_format", IQ_FORMATS).with_command(CommandSpec::scpi("CALC:FORM")),
    ];
    for trace in TRACES {
        let suffix = if trace == 1 { String::new() } else { format!("_trace{trace}") };
        attributes.push(level(
            format!("reference_level{suffix}"),
            format!("DISP:TRAC{trace}:Y:RLEV"),
        ));
        attributes.push(level(
            format!("amplitude_offset{suffix}"),
            format!("DISP:TRAC{trace}:Y:RLEV:OFFS"),
        ));
    }

    DeviceType::builder("Rohde & Schwarz FSW")
        .accepts(BackendKind::Visa)
        .translator(TemplateTranslator::new().with_error_markers(["ERR"]))
        .init_command("*CLS")
        .init_command("*ESE 1")
        .attributes(attributes)
        .build()
}

fn check_trace(trace: u8) -> DeviceResult<()> {
    if TRACES.contains(&trace) {
        Ok(())
    } else {
        Err(DeviceError::validation("trace", format!("{trace} is not a trace (1-6)")))
    }
}

fn check_marker(marker: u8) -> DeviceResult<()> {
    if MARKERS.contains(&marker) {
        Ok(())
    } else {
        Err(DeviceError::validation("marker", format!("{marker} is not a marker (1-16)")))
    }
}

async fn query_number(device: &mut Device, command: &str) -> DeviceResult<f64> {
    let reply = device.query_raw(command).await?;
    reply
        .trim()
        .parse()
        .map_err(|_| DeviceError::decode(command, "expected a number", reply))
}

/// Stop continuous sweeping, run one sweep and wait for it to finish.
pub async fn trigger_single(device: &mut Device, timeout: Duration) -> DeviceResult<()> {
    device.set("initiate_continuous", false).await?;
    overlap_and_block(device, &["INIT"], timeout).await
}

/// Run the analyzer's automatic level adjustment.
pub async fn autolevel(device: &mut Device) -> DeviceResult<()> {
    info!(device = %device.id(), "adjusting reference level");
    overlap_and_block(device, &["ADJ:LEV"], AUTOLEVEL_TIMEOUT).await
}

/// Save the instrument setup to `path` on the analyzer.
pub async fn save_state(device: &mut Device, path: &str, slot: u8) -> DeviceResult<()> {
    device
        .write_raw(&format!("MMEM:STOR:STAT {slot},'{path}'"))
        .await?;
    check_errors(device).await
}

/// Recall an instrument setup saved at `path` on the analyzer.
pub async fn load_state(device: &mut Device, path: &str, slot: u8) -> DeviceResult<()> {
    let command = format!("MMEM:LOAD:STAT {slot},'{path}'");
    overlap_and_block(device, &[command.as_str()], STATE_LOAD_TIMEOUT).await?;
    // Every setting may have changed.
    device.refresh().await?;
    Ok(())
}

/// Trace amplitudes, one per sweep point.
pub async fn fetch_trace(device: &mut Device, trace: u8) -> DeviceResult<Vec<f64>> {
    check_trace(trace)?;
    let reply = device.query_raw(&format!("TRAC:DATA? TRACE{trace}")).await?;
    parse_ascii_values("trace", &reply)
}

/// Frequencies of the trace's sweep points.
pub async fn fetch_horizontal(device: &mut Device, trace: u8) -> DeviceResult<Vec<f64>> {
    check_trace(trace)?;
    let reply = device.query_raw(&format!("TRAC:DATA:X? TRACE{trace}")).await?;
    parse_ascii_values("trace", &reply)
}

/// Amplitude at a marker.
pub async fn marker_power(device: &mut Device, marker: u8) -> DeviceResult<f64> {
    check_marker(marker)?;
    query_number(device, &format!("CALC:MARK{marker}:Y?")).await
}

/// Frequency of a marker.
pub async fn marker_position(device: &mut Device, marker: u8) -> DeviceResult<f64> {
    check_marker(marker)?;
    query_number(device, &format!("CALC:MARK{marker}:X?")).await
}

/// Move a marker to `frequency`.
pub async fn set_marker_position(
    device: &mut Device,
    marker: u8,
    frequency: f64,
) -> DeviceResult<()> {
    check_marker(marker)?;
    if !(FREQUENCY_MIN..=FREQUENCY_MAX).contains(&frequency) {
        return Err(DeviceError::validation(
            "marker position",
            format!("{frequency} Hz is outside the analyzer's range"),
        ));
    }
    device
        .write_raw(&format!("CALC:MARK{marker}:X {frequency}"))
        .await
}

/// Band power measured around a marker (dBm).
pub async fn marker_band_power(device: &mut Device, marker: u8) -> DeviceResult<f64> {
    check_marker(marker)?;
    query_number(device, &format!("CALC:MARK{marker}:FUNC:BPOW:RES?")).await
}

/// Write the current I/Q capture to `path` on the analyzer. Large captures take minutes, so
/// the caller picks the timeout.
pub async fn store_iq(device: &mut Device, path: &str, timeout: Duration) -> DeviceResult<()> {
    let channel = device.get("channel_type").await?;
    if channel != Value::from("IQ") {
        return Err(DeviceError::command(format!(
            "I/Q capture needs the IQ channel, analyzer is in {channel}"
        )));
    }
    info!(device = %device.id(), path, "storing I/Q capture");
    let command = format!("MMEM:STOR:IQ:STAT 1,'{path}'");
    overlap_and_block(device, &[command.as_str()], timeout).await
}

/// Catalog entry for the FSW analyzers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FswFactory;

impl DriverFactory for FswFactory {
    fn driver_type(&self) -> &'static str {
        "rohde_schwarz_fsw"
    }

    fn name(&self) -> &'static str {
        "Rohde & Schwarz FSW signal analyzer"
    }

    fn device_type(&self) -> DeviceResult<Arc<DeviceType>> {
        shared(&FSW)
    }

    fn simulator(&self) -> SimulatedInstrument {
        let mut sim = SimulatedInstrument::new()
            .with_register("FREQ:CENT", "+1.00000000000E+009")
            .with_register("FREQ:SPAN", "+1.00000000000E+008")
            .with_register("FREQ:STAR", "+9.50000000000E+008")
            .with_register("FREQ:STOP", "+1.05000000000E+009")
            .with_register("INIT:CONT", "1")
            .with_register("INST", "SAN")
            .with_register("SWE:POIN", "1001")
            .with_register("CALC:IQ", "0")
            .with_register("TRAC:IQ:RLEN", "1001")
            .with_register("TRAC:IQ:SRAT", "+3.20000000000E+007")
            .with_register("CALC:FORM", "RIM")
            .with_register("CALC:MARK1:X", "+1.00000000000E+009")
            .with_register("CALC:MARK1:Y", "-31.25")
            .with_register("CALC:MARK1:FUNC:BPOW:RES", "-28.4")
            .with_register("*ESR", "+1")
            .with_register("SYST:ERR", "+0,\"No error\"")
            .with_responder(|command| match command {
                "TRAC:DATA? TRACE1" => Some("-80.5,-31.25,-79.75".to_string()),
                "TRAC:DATA:X? TRACE1" => Some("9.5E+08,1.0E+09,1.05E+09".to_string()),
                _ => None,
            });
        for trace in TRACES {
            sim = sim
                .with_register(&format!("DISP:TRAC{trace}:Y:RLEV"), "0")
                .with_register(&format!("DISP:TRAC{trace}:Y:RLEV:OFFS"), "0");
        }
        sim
    }
}
