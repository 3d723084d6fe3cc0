//! Streaming serial GPS receivers (SwiftNav Piksi and NMEA-speaking modules).
//!
//! The receiver talks unprompted; streaming reads one line per poll and queues it. With
//! checksum validation on, lines that are not `$`-framed sentences or carry a bad checksum
//! are dropped.

use super::{shared, DriverFactory, TypeCell};
use crate::backend::{Backend, BackendKind, SerialParams, SimulatedInstrument};
use crate::device::DeviceType;
use crate::error::DeviceResult;
use crate::poller::{PollOutcome, PollSource};
use crate::value::Value;
use async_trait::async_trait;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

/// Factory setting of the Piksi's USB UART.
pub const DEFAULT_BAUD_RATE: u32 = 1_000_000;

static RECEIVER: TypeCell = LazyLock::new(|| build().map_err(|e| e.to_string()));

fn build() -> DeviceResult<Arc<DeviceType>> {
    DeviceType::builder("Serial GPS receiver")
        .accepts(BackendKind::Serial)
        .poll_source(|| Box::new(LineSource::new()))
        .build()
}

/// Serial settings for a receiver on `port`.
pub fn serial_params(port: impl Into<String>) -> SerialParams {
    SerialParams::new(port, DEFAULT_BAUD_RATE).with_termination("\r\n", "\n")
}

/// Reads one line per poll; a quiet line is `Idle`.
#[derive(Debug)]
pub struct LineSource {
    validate_checksums: bool,
    rejected: u64,
}

impl LineSource {
    /// Source that checks NMEA checksums.
    #[must_use]
    pub fn new() -> Self {
        Self {
            validate_checksums: true,
            rejected: 0,
        }
    }

    /// Pass every line through unchecked.
    #[must_use]
    pub fn unchecked() -> Self {
        Self {
            validate_checksums: false,
            rejected: 0,
        }
    }

    /// Lines dropped as malformed or for a bad checksum.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

impl Default for LineSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PollSource for LineSource {
    async fn on_start(&mut self, backend: &mut dyn Backend) -> DeviceResult<()> {
        // Whatever accumulated while nobody was listening is stale.
        backend.clear().await
    }

    async fn poll(&mut self, backend: &mut dyn Backend) -> DeviceResult<PollOutcome> {
        let raw = match backend.read().await {
            Ok(raw) => raw,
            Err(e) if e.is_timeout() => return Ok(PollOutcome::Idle),
            Err(e) => return Err(e),
        };
        let text = match String::from_utf8(raw) {
            Ok(text) => text,
            Err(e) => return Ok(PollOutcome::Data(Value::Bytes(e.into_bytes()))),
        };
        let line = text.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Ok(PollOutcome::Idle);
        }
        if self.validate_checksums && !nmea_checksum_ok(line) {
            self.rejected += 1;
            warn!(line, rejected = self.rejected, "dropping malformed NMEA sentence");
            return Ok(PollOutcome::Idle);
        }
        Ok(PollOutcome::Data(Value::String(line.to_string())))
    }

    async fn on_stop(&mut self, _backend: &mut dyn Backend) {
        debug!(rejected = self.rejected, "line source stopped");
    }
}

/// XOR of the bytes between `$` and `*`.
#[must_use]
pub fn nmea_checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

/// Frame `body` as a sentence: `$body*CS`.
#[must_use]
pub fn nmea_sentence(body: &str) -> String {
    format!("${body}*{:02X}", nmea_checksum(body))
}

/// Whether a `$...*CS` sentence carries a matching checksum. Sentences without one pass.
#[must_use]
pub fn nmea_checksum_ok(sentence: &str) -> bool {
    let Some(body) = sentence.strip_prefix('$') else {
        return false;
    };
    match body.rsplit_once('*') {
        Some((payload, checksum)) => u8::from_str_radix(checksum.trim(), 16)
            .is_ok_and(|expected| expected == nmea_checksum(payload)),
        None => true,
    }
}

/// Catalog entry for streaming receivers.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpsReceiverFactory;

impl DriverFactory for GpsReceiverFactory {
    fn driver_type(&self) -> &'static str {
        "gps_receiver"
    }

    fn name(&self) -> &'static str {
        "Streaming NMEA GPS receiver"
    }

    fn device_type(&self) -> DeviceResult<Arc<DeviceType>> {
        shared(&RECEIVER)
    }

    fn simulator(&self) -> SimulatedInstrument {
        SimulatedInstrument::new().with_stream(|sequence| {
            let seconds = sequence % 60;
            let minutes = (sequence / 60) % 60;
            let body = format!(
                "GPGGA,12{minutes:02}{seconds:02}.00,3959.6000,N,10515.6000,W,1,08,0.9,1655.0,M,-21.0,M,,"
            );
            Some(nmea_sentence(&body).into_bytes())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ConnectionParams, SimulatedParams};
    use crate::device::{Device, DeviceOptions};
    use crate::poller::{PollRate, PollerConfig};
    use std::time::Duration;

    #[test]
    fn test_nmea_checksum() {
        let sentence = "$GPGGA,092750.000,5321.6802,N,00630.3372,W,1,8,1.03,61.7,M,55.2,M,,*76";
        assert!(nmea_checksum_ok(sentence));
        assert!(!nmea_checksum_ok(&sentence.replace("*76", "*77")));
        assert!(nmea_checksum_ok("$PSRF100"));
        assert!(!nmea_checksum_ok("GPGGA"));
        assert!(nmea_checksum_ok(&nmea_sentence("GPRMC,1,2,3")));
    }

    #[tokio::test]
    async fn test_stream_lines() {
        let sim = GpsReceiverFactory.simulator();
        let options = DeviceOptions {
            poller: PollerConfig {
                poll_rate: PollRate::Interval(Duration::from_millis(10)),
                max_queue_size: 100,
            },
            ..DeviceOptions::default()
        };
        let mut gps = Device::new(
            "gps",
            GpsReceiverFactory.device_type().unwrap(),
            ConnectionParams::Simulated(SimulatedParams::new(sim).with_baud_rate(DEFAULT_BAUD_RATE)),
        )
        .with_options(options);

        gps.connect().await.unwrap();
        gps.start().await.unwrap();
        let results = gps.fetch(Some(Duration::from_secs(2))).await.unwrap();
        gps.stop().await.unwrap();

        assert!(!results.is_empty());
        let first = results[0].payload.as_str().unwrap();
        assert!(first.starts_with("$GPGGA,1200"));
        assert!(nmea_checksum_ok(first));
        assert!(!gps.is_running());
        gps.disconnect().await;
    }

    #[tokio::test]
    async fn test_bad_checksum_is_dropped() {
        let sim = SimulatedInstrument::new().with_stream(|n| {
            let line = if n == 0 { "$GPGGA,bad*00".to_string() } else { nmea_sentence("GPGGA,ok") };
            Some(line.into_bytes())
        });
        let mut backend = crate::backend::SimulatedBackend::new(SimulatedParams::new(sim));
        backend.open().await.unwrap();

        let mut source = LineSource::new();
        assert_eq!(source.poll(&mut backend).await.unwrap(), PollOutcome::Idle);
        assert_eq!(source.rejected(), 1);
        assert!(matches!(
            source.poll(&mut backend).await.unwrap(),
            PollOutcome::Data(Value::String(_))
        ));
    }

    #[tokio::test]
    async fn test_unframed_fragment_is_dropped() {
        let sim = SimulatedInstrument::new().with_stream(|n| {
            let line = if n == 0 { ",N,01131.000,E*47".to_string() } else { nmea_sentence("GPZDA,1") };
            Some(line.into_bytes())
        });
        let mut backend = crate::backend::SimulatedBackend::new(SimulatedParams::new(sim));
        backend.open().await.unwrap();

        let mut source = LineSource::new();
        assert_eq!(source.poll(&mut backend).await.unwrap(), PollOutcome::Idle);
        assert_eq!(source.rejected(), 1);
        assert_eq!(
            source.poll(&mut backend).await.unwrap(),
            PollOutcome::Data(Value::String(nmea_sentence("GPZDA,1")))
        );

        let mut raw = LineSource::unchecked();
        assert!(matches!(
            raw.poll(&mut backend).await.unwrap(),
            PollOutcome::Data(Value::String(_))
        ));
        assert_eq!(raw.rejected(), 0);
    }

    #[test]
    fn test_serial_params() {
        let params = serial_params("/dev/ttyUSB0");
        assert_eq!(params.baud_rate, 1_000_000);
    }
}
