//! In-memory simulated instrument.
//!
//! The simulator speaks a forgiving SCPI-like dialect so that devices can be exercised
//! without hardware:
//!
//! - `KEY?` replies with the register `KEY` (or `ERR` when unknown).
//! - `KEY value` and `KEY=value` store `value` in register `KEY`.
//! - Anything else is accepted silently, or acknowledged when an ack reply is configured.
//! - `;` separates several commands in one write.
//!
//! Set and query keys can differ (`:SETATT=` vs `:ATT?`); [`SimulatedInstrument::with_alias`]
//! links them. A custom responder can take over individual commands, and a stream generator
//! feeds `read()` calls that have no pending reply, which is how streaming receivers are
//! simulated. Every command is logged, and the next open or command can be made to fail.
//!
//! The [`SimulatedInstrument`] handle is cheap to clone; tests keep one to inspect the log
//! while the device owns the backend.

use super::{Backend, BackendKind};
use crate::error::{DeviceError, DeviceResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type Responder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;
type StreamGenerator = Arc<dyn Fn(u64) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Default)]
struct SimState {
    registers: HashMap<String, String>,
    aliases: HashMap<String, String>,
    command_log: Vec<String>,
    responder: Option<Responder>,
    stream: Option<StreamGenerator>,
    stream_sequence: u64,
    ack: Option<String>,
    latency: Duration,
    fail_next_open: bool,
    fail_next_command: bool,
    hang_reads: bool,
    open_count: usize,
    close_count: usize,
}

/// Shared handle to a simulated instrument's state.
#[derive(Clone, Default)]
pub struct SimulatedInstrument {
    state: Arc<Mutex<SimState>>,
}

impl fmt::Debug for SimulatedInstrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimulatedInstrument")
            .field("registers", &state.registers.len())
            .field("commands", &state.command_log.len())
            .finish()
    }
}

impl SimulatedInstrument {
    /// Empty instrument.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload a register.
    pub fn with_register(self, key: &str, value: &str) -> Self {
        self.state
            .lock()
            .registers
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Store writes to `set_key` in `get_key`.
    pub fn with_alias(self, set_key: &str, get_key: &str) -> Self {
        self.state
            .lock()
            .aliases
            .insert(set_key.to_string(), get_key.to_string());
        self
    }

    /// Answer every non-query command with `reply`, like instruments that acknowledge writes.
    pub fn with_ack(self, reply: &str) -> Self {
        self.state.lock().ack = Some(reply.to_string());
        self
    }

    /// Delay every write and read.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Answer commands before the register logic sees them. Returning `None` falls through.
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.state.lock().responder = Some(Arc::new(responder));
        self
    }

    /// Produce unsolicited data for reads, given a running sequence number.
    /// Returning `None` behaves like a quiet line (read timeout).
    pub fn with_stream<F>(self, generator: F) -> Self
    where
        F: Fn(u64) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.state.lock().stream = Some(Arc::new(generator));
        self
    }

    /// Make the next `open()` fail.
    pub fn fail_next_open(&self) {
        self.state.lock().fail_next_open = true;
    }

    /// Make the next write or read fail.
    pub fn fail_next_command(&self) {
        self.state.lock().fail_next_command = true;
    }

    /// Make reads block until the line is released, simulating a wedged transport.
    pub fn hang_reads(&self, hang: bool) {
        self.state.lock().hang_reads = hang;
    }

    /// Every command received, in order.
    #[must_use]
    pub fn command_log(&self) -> Vec<String> {
        self.state.lock().command_log.clone()
    }

    /// Forget logged commands.
    pub fn clear_log(&self) {
        self.state.lock().command_log.clear();
    }

    /// Current register value.
    #[must_use]
    pub fn register(&self, key: &str) -> Option<String> {
        self.state.lock().registers.get(key).cloned()
    }

    /// Overwrite a register, as if the instrument changed on its own.
    pub fn set_register(&self, key: &str, value: &str) {
        self.state
            .lock()
            .registers
            .insert(key.to_string(), value.to_string());
    }

    /// Number of successful opens.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    /// Number of closes of an open backend.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    fn latency(&self) -> Duration {
        self.state.lock().latency
    }

    fn take_failure(&self) -> bool {
        std::mem::take(&mut self.state.lock().fail_next_command)
    }

    /// Apply one command and return the replies it produced.
    fn handle(&self, command: &str) -> Vec<String> {
        let responder = self.state.lock().responder.clone();
        let mut replies = Vec::new();

        for part in command.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            self.state.lock().command_log.push(part.to_string());

            if let Some(reply) = responder.as_ref().and_then(|r| r(part)) {
                replies.push(reply);
                continue;
            }

            let mut state = self.state.lock();
            if let Some(key) = part.strip_suffix('?') {
                let reply = state
                    .registers
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| "ERR".to_string());
                replies.push(reply);
                continue;
            }
            if let Some((key, value)) = part
                .split_once('=')
                .or_else(|| part.split_once(char::is_whitespace))
            {
                let key = state
                    .aliases
                    .get(key.trim())
                    .cloned()
                    .unwrap_or_else(|| key.trim().to_string());
                state.registers.insert(key, value.trim().to_string());
            }
            if let Some(ack) = &state.ack {
                replies.push(ack.clone());
            }
        }
        replies
    }

    fn next_stream_item(&self) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        let generator = state.stream.clone()?;
        let sequence = state.stream_sequence;
        state.stream_sequence += 1;
        drop(state);
        generator(sequence)
    }
}

/// Simulated connection parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatedParams {
    /// Name shown as the resource
    #[serde(default)]
    pub name: Option<String>,
    /// Nominal baud rate, for devices that describe a serial link
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// The instrument behind the backend; a fresh one when deserialized
    #[serde(skip)]
    pub instrument: SimulatedInstrument,
}

impl SimulatedParams {
    /// Parameters for an existing instrument handle.
    pub fn new(instrument: SimulatedInstrument) -> Self {
        Self {
            name: None,
            baud_rate: None,
            instrument,
        }
    }

    /// Record a nominal baud rate.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = Some(baud_rate);
        self
    }

    /// Resource label.
    #[must_use]
    pub fn resource(&self) -> String {
        match (&self.name, self.baud_rate) {
            (Some(name), _) => name.clone(),
            (None, Some(baud)) => format!("simulated@{baud}"),
            (None, None) => "simulated".to_string(),
        }
    }
}

/// Backend over a [`SimulatedInstrument`].
pub struct SimulatedBackend {
    resource: String,
    instrument: SimulatedInstrument,
    open: bool,
    pending: VecDeque<Vec<u8>>,
}

impl SimulatedBackend {
    /// Unopened backend.
    pub fn new(params: SimulatedParams) -> Self {
        Self {
            resource: params.resource(),
            instrument: params.instrument,
            open: false,
            pending: VecDeque::new(),
        }
    }

    /// The instrument handle.
    #[must_use]
    pub fn instrument(&self) -> &SimulatedInstrument {
        &self.instrument
    }

    async fn delay(&self) {
        let latency = self.instrument.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn ensure_open(&self) -> DeviceResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(DeviceError::command("simulated backend is not open"))
        }
    }
}

#[async_trait]
impl Backend for SimulatedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    fn resource(&self) -> &str {
        &self.resource
    }

    async fn open(&mut self) -> DeviceResult<()> {
        {
            let mut state = self.instrument.state.lock();
            if std::mem::take(&mut state.fail_next_open) {
                return Err(DeviceError::connection(
                    &self.resource,
                    "simulated open failure",
                ));
            }
            state.open_count += 1;
        }
        self.delay().await;
        self.open = true;
        self.pending.clear();
        debug!(resource = %self.resource, "simulated backend opened");
        Ok(())
    }

    async fn close(&mut self) {
        if self.open {
            self.open = false;
            self.pending.clear();
            self.instrument.state.lock().close_count += 1;
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn write(&mut self, command: &[u8]) -> DeviceResult<()> {
        self.ensure_open()?;
        self.delay().await;
        if self.instrument.take_failure() {
            return Err(DeviceError::command("simulated write failure"));
        }
        let text = String::from_utf8_lossy(command);
        for reply in self.instrument.handle(&text) {
            self.pending.push_back(reply.into_bytes());
        }
        Ok(())
    }

    async fn read(&mut self) -> DeviceResult<Vec<u8>> {
        self.ensure_open()?;
        self.delay().await;
        if self.instrument.take_failure() {
            return Err(DeviceError::command("simulated read failure"));
        }
        if let Some(reply) = self.pending.pop_front() {
            return Ok(reply);
        }
        while self.instrument.state.lock().hang_reads {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.instrument
            .next_stream_item()
            .ok_or_else(|| DeviceError::command_timeout("simulated read", Duration::ZERO))
    }

    async fn clear(&mut self) -> DeviceResult<()> {
        self.pending.clear();
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
