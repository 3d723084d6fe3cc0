//! iperf (version 2) throughput tests through the process backend.
//!
//! Test options are local attributes: they live on the host and become command-line flags
//! when [`start`] launches iperf. iperf runs with CSV reports (`-y C`), and every report line
//! is queued as a string payload; [`IperfReport::parse`] turns one into fields.

use super::{shared, DriverFactory, TypeCell};
use crate::backend::{Backend, BackendKind, ProcessBackend, SimulatedInstrument};
use crate::device::{Device, DeviceType};
use crate::error::{DeviceError, DeviceResult};
use crate::poller::{PollOutcome, PollSource};
use crate::state::StateDescriptor;
use crate::value::Value;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

/// Options always passed to iperf.
pub const BASE_ARGUMENTS: [&str; 2] = ["-y", "C"];

/// Local attribute → flag. Booleans are switches; other values follow their flag.
const FLAGS: [(&str, &str); 9] = [
    ("port", "-p"),
    ("bind", "-B"),
    ("tcp_window_size", "-w"),
    ("buffer_size", "-l"),
    ("interval", "-i"),
    ("bidirectional", "-d"),
    ("udp", "-u"),
    ("bit_rate", "-b"),
    ("time", "-t"),
];

static IPERF: TypeCell = LazyLock::new(|| build().map_err(|e| e.to_string()));

fn build() -> DeviceResult<Arc<DeviceType>> {
    DeviceType::builder("iperf")
        .accepts(BackendKind::Process)
        .attributes([
            StateDescriptor::string("host").with_help("server to connect to; unset runs a server"),
            StateDescriptor::int("port").with_min(1.0).with_help("connection port"),
            StateDescriptor::string("bind").with_help("bind to this local address"),
            StateDescriptor::int("tcp_window_size").with_min(1.0).with_unit("bytes"),
            StateDescriptor::int("buffer_size")
                .with_min(1.0)
                .with_unit("bytes")
                .with_help("size of the buffer that generates traffic"),
            StateDescriptor::float("interval")
                .with_min(0.01)
                .with_default(0.25)
                .with_unit("s")
                .with_help("interval between throughput reports"),
            StateDescriptor::bool("bidirectional")
                .with_default(false)
                .with_help("send and receive simultaneously"),
            StateDescriptor::bool("udp").with_default(false),
            StateDescriptor::int("bit_rate")
                .with_min(0.0)
                .with_unit("bps")
                .with_help("maximum bit rate"),
            StateDescriptor::int("time")
                .with_range(0.0, 16535.0)
                .with_unit("s")
                .with_help("transmit time before quitting"),
        ])
        .build()
}

/// Command-line arguments for the device's current options.
pub fn arguments(device: &Device) -> Vec<String> {
    let mut args: Vec<String> = BASE_ARGUMENTS.iter().map(ToString::to_string).collect();
    match device.cached("host") {
        Some(host) => args.extend(["-c".to_string(), host.to_string()]),
        None => args.push("-s".to_string()),
    }
    for (name, flag) in FLAGS {
        match device.cached(name) {
            Some(Value::Bool(true)) => args.push(flag.to_string()),
            Some(Value::Bool(false)) | None => {}
            Some(value) => args.extend([flag.to_string(), value.to_string()]),
        }
    }
    args
}

/// Launch iperf with the device's options and stream its reports.
pub async fn start(device: &mut Device) -> DeviceResult<()> {
    if device.cached("udp") == Some(Value::Bool(true)) && device.cached("buffer_size").is_some() {
        warn!(device = %device.id(), "iperf may misbehave with udp and buffer_size both set");
    }
    let args = arguments(device);
    info!(
        device = %device.id(),
        mode = if device.cached("host").is_some() { "client" } else { "server" },
        "starting iperf"
    );
    device.start_with(Box::new(IperfSource::new(args))).await
}

/// Runs iperf in the background and yields one report line per poll.
///
/// On a non-process backend (the simulator) lines are read from the backend instead.
#[derive(Debug)]
pub struct IperfSource {
    args: Vec<String>,
    partial: String,
    lines: VecDeque<String>,
    exit_seen: bool,
}

impl IperfSource {
    /// Source that launches iperf with `args`.
    #[must_use]
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            partial: String::new(),
            lines: VecDeque::new(),
            exit_seen: false,
        }
    }

    fn absorb(&mut self, output: &[u8]) {
        self.partial.push_str(&String::from_utf8_lossy(output));
        while let Some(end) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=end).collect();
            let line = line.trim();
            if !line.is_empty() {
                self.lines.push_back(line.to_string());
            }
        }
    }

    fn poll_process(&mut self, process: &mut ProcessBackend) -> PollOutcome {
        let alive = process.running();
        self.absorb(&process.take_output());
        if let Some(line) = self.lines.pop_front() {
            return PollOutcome::Data(Value::String(line));
        }
        if alive {
            return PollOutcome::Idle;
        }
        // Output pumps may still hold the last report when the exit is first noticed.
        if !self.exit_seen {
            self.exit_seen = true;
            return PollOutcome::Idle;
        }
        let tail = std::mem::take(&mut self.partial);
        let tail = tail.trim();
        if tail.is_empty() {
            let stderr = process.stderr();
            if !stderr.is_empty() {
                warn!(stderr = %String::from_utf8_lossy(&stderr).trim(), "iperf exited");
            }
            PollOutcome::Finished
        } else {
            PollOutcome::Data(Value::String(tail.to_string()))
        }
    }
}

#[async_trait]
impl PollSource for IperfSource {
    async fn on_start(&mut self, backend: &mut dyn Backend) -> DeviceResult<()> {
        match backend.as_any_mut().downcast_mut::<ProcessBackend>() {
            Some(process) => process.execute(&self.args).await,
            None => Ok(()),
        }
    }

    async fn poll(&mut self, backend: &mut dyn Backend) -> DeviceResult<PollOutcome> {
        if let Some(process) = backend.as_any_mut().downcast_mut::<ProcessBackend>() {
            return Ok(self.poll_process(process));
        }
        match backend.read().await {
            Ok(raw) => {
                let line = String::from_utf8_lossy(&raw).trim().to_string();
                Ok(if line.is_empty() {
                    PollOutcome::Idle
                } else {
                    PollOutcome::Data(Value::String(line))
                })
            }
            Err(e) if e.is_timeout() => Ok(PollOutcome::Idle),
            Err(e) => Err(e),
        }
    }

    async fn on_stop(&mut self, backend: &mut dyn Backend) {
        if let Some(process) = backend.as_any_mut().downcast_mut::<ProcessBackend>() {
            process.kill().await;
        }
    }
}

/// UDP-only report columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UdpStats {
    /// Jitter in milliseconds
    pub jitter_ms: f64,
    /// Datagrams lost
    pub datagrams_lost: u64,
    /// Datagrams sent
    pub datagrams_sent: u64,
    /// Loss percentage
    pub loss_percentage: f64,
    /// Datagrams received out of order
    pub out_of_order: u64,
}

/// One CSV report line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IperfReport {
    /// Report time (local clock of the iperf host, second resolution)
    pub timestamp: NaiveDateTime,
    /// Sending side address
    pub source_address: String,
    /// Sending side port
    pub source_port: u16,
    /// Receiving side address
    pub destination_address: String,
    /// Receiving side port
    pub destination_port: u16,
    /// iperf's stream identifier
    pub test_id: i64,
    /// Start and end of the reporting interval, seconds into the test
    pub interval: (f64, f64),
    /// Bytes moved during the interval
    pub transferred_bytes: u64,
    /// Throughput over the interval
    pub bits_per_second: f64,
    /// Present for UDP tests
    pub udp: Option<UdpStats>,
}

impl IperfReport {
    /// Parse a CSV report (9 columns for TCP, 14 for UDP).
    pub fn parse(line: &str) -> DeviceResult<Self> {
        let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        let bad = |what: &str| DeviceError::decode("iperf", format!("bad {what}"), line);
        if fields.len() != 9 && fields.len() != 14 {
            return Err(bad("column count"));
        }
        fn num<T: std::str::FromStr>(text: &str) -> Option<T> {
            text.parse().ok()
        }

        let (start, end) = fields[6].split_once('-').ok_or_else(|| bad("interval"))?;
        let udp = if fields.len() == 14 {
            Some(UdpStats {
                jitter_ms: num(fields[9]).ok_or_else(|| bad("jitter"))?,
                datagrams_lost: num(fields[10]).ok_or_else(|| bad("lost datagrams"))?,
                datagrams_sent: num(fields[11]).ok_or_else(|| bad("sent datagrams"))?,
                loss_percentage: num(fields[12]).ok_or_else(|| bad("loss percentage"))?,
                out_of_order: num(fields[13]).ok_or_else(|| bad("out-of-order count"))?,
            })
        } else {
            None
        };
        Ok(Self {
            timestamp: NaiveDateTime::parse_from_str(fields[0], "%Y%m%d%H%M%S")
                .map_err(|_| bad("timestamp"))?,
            source_address: fields[1].to_string(),
            source_port: num(fields[2]).ok_or_else(|| bad("source port"))?,
            destination_address: fields[3].to_string(),
            destination_port: num(fields[4]).ok_or_else(|| bad("destination port"))?,
            test_id: num(fields[5]).ok_or_else(|| bad("test id"))?,
            interval: (
                num(start).ok_or_else(|| bad("interval"))?,
                num(end).ok_or_else(|| bad("interval"))?,
            ),
            transferred_bytes: num(fields[7]).ok_or_else(|| bad("byte count"))?,
            bits_per_second: num(fields[8]).ok_or_else(|| bad("bit rate"))?,
            udp,
        })
    }
}

/// Catalog entry for iperf.
#[derive(Debug, Clone, Copy, Default)]
pub struct IperfFactory;

impl DriverFactory for IperfFactory {
    fn driver_type(&self) -> &'static str {
        "iperf"
    }

    fn name(&self) -> &'static str {
        "iperf throughput tester"
    }

    fn device_type(&self) -> DeviceResult<Arc<DeviceType>> {
        shared(&IPERF)
    }

    fn simulator(&self) -> SimulatedInstrument {
        SimulatedInstrument::new().with_stream(|n| {
            let start = n as f64 * 0.25;
            Some(
                format!(
                    "20210302140751,10.0.0.2,5001,10.0.0.1,52344,3,{start:.1}-{:.1},3276800,{}",
                    start + 0.25,
                    104_857_600 + (n % 7) * 1_048_576
                )
                .into_bytes(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ConnectionParams, SimulatedParams};
    use std::time::Duration;

    fn device(params: ConnectionParams) -> Device {
        Device::new("iperf", IperfFactory.device_type().unwrap(), params)
    }

    #[tokio::test]
    async fn test_arguments_from_options() {
        let mut iperf = device(ConnectionParams::Simulated(SimulatedParams::default()));
        assert_eq!(arguments(&iperf), ["-y", "C", "-s", "-i", "0.25"]);

        iperf.set("host", "10.0.0.1").await.unwrap();
        iperf.set("port", 5201).await.unwrap();
        iperf.set("udp", true).await.unwrap();
        iperf.set("time", 30).await.unwrap();
        assert_eq!(
            arguments(&iperf),
            ["-y", "C", "-c", "10.0.0.1", "-p", "5201", "-i", "0.25", "-u", "-t", "30"]
        );

        assert!(iperf.set("interval", 0.001).await.is_err());
        assert!(iperf.set("time", 20000).await.is_err());
    }

    #[test]
    fn test_parse_tcp_report() {
        let report =
            IperfReport::parse("20210302140751,10.0.0.2,5001,10.0.0.1,52344,3,0.0-0.2,3276800,104857600")
                .unwrap();
        assert_eq!(report.timestamp.to_string(), "2021-03-02 14:07:51");
        assert_eq!(report.destination_port, 52344);
        assert_eq!(report.interval, (0.0, 0.2));
        assert_eq!(report.bits_per_second, 104_857_600.0);
        assert!(report.udp.is_none());
    }

    #[test]
    fn test_parse_udp_report() {
        let report = IperfReport::parse(
            "20210302140751,10.0.0.1,5001,10.0.0.2,40000,3,0.0-1.0,131250,1050000,0.012,2,94,2.128,0",
        )
        .unwrap();
        let udp = report.udp.unwrap();
        assert_eq!(udp.datagrams_lost, 2);
        assert_eq!(udp.loss_percentage, 2.128);

        assert!(IperfReport::parse("1,2,3").is_err());
    }

    #[tokio::test]
    async fn test_simulated_stream() {
        let sim = IperfFactory.simulator();
        let mut iperf = device(ConnectionParams::Simulated(SimulatedParams::new(sim)));
        iperf.connect().await.unwrap();
        start(&mut iperf).await.unwrap();
        let results = iperf.fetch(Some(Duration::from_secs(2))).await.unwrap();
        iperf.stop().await.unwrap();

        assert!(!results.is_empty());
        let report = IperfReport::parse(results[0].payload.as_str().unwrap()).unwrap();
        assert_eq!(report.test_id, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_output_is_streamed_until_exit() {
        use crate::backend::ProcessParams;

        let script = "printf '20210302140751,a,1,b,2,3,0.0-1.0,100,800\\n20210302140752,a,1,b,2,3,1.0-2.0,100,800\\n'";
        let params = ProcessParams::new("/bin/sh").with_args(["-c", script]);
        let mut iperf = device(ConnectionParams::Process(params));
        iperf.connect().await.unwrap();

        // The shell ignores the extra iperf arguments after the script.
        start(&mut iperf).await.unwrap();
        let mut lines = Vec::new();
        for _ in 0..50 {
            lines.extend(iperf.fetch(Some(Duration::from_millis(100))).await.unwrap());
            if !iperf.is_running() {
                break;
            }
        }
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].sequence, 1);
        assert!(!iperf.is_running());
    }
}
