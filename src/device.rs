//! Devices: typed state over a backend, with a connection lifecycle.
//!
//! A [`DeviceType`] is the immutable, shared description of a model of instrument: its
//! attribute registry, command translator, accepted backend kinds, init commands, named
//! actions, scenario commands and (for streaming instruments) a poll source factory. It is
//! built once and shared by every [`Device`] of that model.
//!
//! A [`Device`] is one instrument. Its lifecycle:
//!
//! ```text
//! Disconnected --connect--> Connecting --> Connected --start--> Running
//!      ^                                      |  ^                 |
//!      |                                      |  +------stop-------+
//!      +----------- Disconnecting <--disconnect (from any state)---+
//! ```
//!
//! # Example
//!
//! ```
//! use lab_devices::backend::{ConnectionParams, SimulatedInstrument, SimulatedParams};
//! use lab_devices::device::{Device, DeviceType};
//! use lab_devices::state::StateDescriptor;
//! use lab_devices::translator::CommandSpec;
//!
//! # tokio_test::block_on(async {
//! let model = DeviceType::builder("Demo attenuator")
//!     .attribute(
//!         StateDescriptor::float("attenuation")
//!             .with_range(0.0, 115.0)
//!             .with_command(CommandSpec::scpi("ATT")),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let sim = SimulatedInstrument::new();
//! let params = ConnectionParams::Simulated(SimulatedParams::new(sim.clone()));
//! let mut device = Device::new("att1", model, params);
//!
//! device.connect().await.unwrap();
//! device.set("attenuation", 20.0).await.unwrap();
//! assert_eq!(device.get("attenuation").await.unwrap().as_f64(), Some(20.0));
//! device.disconnect().await;
//! # })
//! ```

use crate::backend::{wrap_shared, Backend, BackendKind, ConnectionParams, SharedBackend};
use crate::error::{DeviceError, DeviceResult};
use crate::poller::{PollResult, PollSource, Poller, PollerConfig, ResultQueue};
use crate::state::{StateDescriptor, StateRegistry, StateRegistryBuilder, StateTable, CONNECTED};
use crate::translator::{render_template, BoolTokens, CommandTranslator, TemplateTranslator};
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Builds a fresh poll source for each `start()`.
pub type PollSourceFactory = Arc<dyn Fn() -> Box<dyn PollSource> + Send + Sync>;

// =============================================================================
// Lifecycle
// =============================================================================

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// No backend held
    Disconnected,
    /// Backend being opened
    Connecting,
    /// Backend open, no poller
    Connected,
    /// Backend open, poller active
    Running,
    /// Backend being released
    Disconnecting,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::Connecting => "connecting",
            DeviceState::Connected => "connected",
            DeviceState::Running => "running",
            DeviceState::Disconnecting => "disconnecting",
        })
    }
}

/// Per-device tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceOptions {
    /// Backend I/O timeout, unless the connection parameters name one
    pub timeout: Duration,
    /// How long `stop()` and `disconnect()` wait for the poller
    pub stop_timeout: Duration,
    /// Poller cadence and queue size
    pub poller: PollerConfig,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(5),
            poller: PollerConfig::default(),
        }
    }
}

// =============================================================================
// DeviceType
// =============================================================================

/// Commands used to load and save scenario files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioCommands {
    /// Template with a `${path}` placeholder
    pub load: String,
    /// Template with a `${path}` placeholder, if saving is supported
    pub save: Option<String>,
}

/// Shared description of one instrument model.
pub struct DeviceType {
    model: String,
    registry: Arc<StateRegistry>,
    translator: Arc<dyn CommandTranslator>,
    accepts: Vec<BackendKind>,
    init_commands: Vec<String>,
    acknowledged: bool,
    actions: BTreeMap<String, String>,
    scenario: Option<ScenarioCommands>,
    poll_source: Option<PollSourceFactory>,
}

impl fmt::Debug for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceType")
            .field("model", &self.model)
            .field("attributes", &self.registry.names())
            .field("accepts", &self.accepts)
            .field("streaming", &self.poll_source.is_some())
            .finish()
    }
}

impl DeviceType {
    /// Start describing a model.
    pub fn builder(model: impl Into<String>) -> DeviceTypeBuilder {
        DeviceTypeBuilder {
            model: model.into(),
            attributes: StateRegistry::builder(),
            translator: None,
            accepts: Vec::new(),
            init_commands: Vec::new(),
            acknowledged: false,
            actions: BTreeMap::new(),
            scenario: None,
            poll_source: None,
        }
    }

    /// Model name.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Attribute registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<StateRegistry> {
        &self.registry
    }

    /// Command translator.
    #[must_use]
    pub fn translator(&self) -> &Arc<dyn CommandTranslator> {
        &self.translator
    }

    /// Backend kinds this model can use. The simulator is always accepted.
    #[must_use]
    pub fn accepts(&self) -> &[BackendKind] {
        &self.accepts
    }

    /// Whether `kind` may back this model.
    #[must_use]
    pub fn accepts_kind(&self, kind: BackendKind) -> bool {
        kind == BackendKind::Simulated || self.accepts.is_empty() || self.accepts.contains(&kind)
    }

    /// Named actions.
    pub fn actions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.actions.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether `start()` works without an explicit source.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.poll_source.is_some()
    }
}

/// Builder for [`DeviceType`].
pub struct DeviceTypeBuilder {
    model: String,
    attributes: StateRegistryBuilder,
    translator: Option<Arc<dyn CommandTranslator>>,
    accepts: Vec<BackendKind>,
    init_commands: Vec<String>,
    acknowledged: bool,
    actions: BTreeMap<String, String>,
    scenario: Option<ScenarioCommands>,
    poll_source: Option<PollSourceFactory>,
}

impl DeviceTypeBuilder {
    /// Declare an attribute.
    pub fn attribute(mut self, descriptor: StateDescriptor) -> Self {
        self.attributes = self.attributes.attribute(descriptor);
        self
    }

    /// Declare several attributes.
    pub fn attributes(mut self, descriptors: impl IntoIterator<Item = StateDescriptor>) -> Self {
        self.attributes = self.attributes.attributes(descriptors);
        self
    }

    /// Use a custom translator instead of [`TemplateTranslator`].
    pub fn translator(mut self, translator: impl CommandTranslator + 'static) -> Self {
        self.translator = Some(Arc::new(translator));
        self
    }

    /// Accept a backend kind. With none declared, every kind is accepted.
    pub fn accepts(mut self, kind: BackendKind) -> Self {
        if !self.accepts.contains(&kind) {
            self.accepts.push(kind);
        }
        self
    }

    /// Command written right after the backend opens.
    pub fn init_command(mut self, command: impl Into<String>) -> Self {
        self.init_commands.push(command.into());
        self
    }

    /// The instrument answers every write; the answer is read and passed to
    /// [`CommandTranslator::check_ack`].
    pub fn acknowledged(mut self) -> Self {
        self.acknowledged = true;
        self
    }

    /// Named command template, run with [`Device::invoke`].
    pub fn action(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.actions.insert(name.into(), template.into());
        self
    }

    /// Scenario load/save templates.
    pub fn scenario(mut self, load: impl Into<String>, save: Option<String>) -> Self {
        self.scenario = Some(ScenarioCommands {
            load: load.into(),
            save,
        });
        self
    }

    /// Default poll source for `start()`.
    pub fn poll_source<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn PollSource> + Send + Sync + 'static,
    {
        self.poll_source = Some(Arc::new(factory));
        self
    }

    /// Validate and freeze.
    pub fn build(self) -> DeviceResult<Arc<DeviceType>> {
        if self.model.trim().is_empty() {
            return Err(DeviceError::Configuration("model name is empty".to_string()));
        }
        let registry = Arc::new(self.attributes.build()?);
        Ok(Arc::new(DeviceType {
            model: self.model,
            registry,
            translator: self
                .translator
                .unwrap_or_else(|| Arc::new(TemplateTranslator::new())),
            accepts: self.accepts,
            init_commands: self.init_commands,
            acknowledged: self.acknowledged,
            actions: self.actions,
            scenario: self.scenario,
            poll_source: self.poll_source,
        }))
    }
}

// =============================================================================
// Device
// =============================================================================

/// One instrument instance.
pub struct Device {
    id: String,
    device_type: Arc<DeviceType>,
    params: ConnectionParams,
    options: DeviceOptions,
    lifecycle: DeviceState,
    backend: Option<SharedBackend>,
    state: StateTable,
    poller: Option<Poller>,
    queue: Arc<ResultQueue>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("model", &self.device_type.model)
            .field("resource", &self.params.resource())
            .field("state", &self.lifecycle)
            .finish()
    }
}

impl Device {
    /// A disconnected device. Parameters are not checked until `connect()`.
    pub fn new(id: impl Into<String>, device_type: Arc<DeviceType>, params: ConnectionParams) -> Self {
        let options = DeviceOptions::default();
        let state = device_type.registry.instantiate();
        Self {
            id: id.into(),
            device_type,
            params,
            queue: Arc::new(ResultQueue::new(options.poller.max_queue_size)),
            options,
            lifecycle: DeviceState::Disconnected,
            backend: None,
            state,
            poller: None,
        }
    }

    /// Replace the options.
    pub fn with_options(mut self, options: DeviceOptions) -> Self {
        self.options = options;
        self
    }

    /// Instance identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Model description.
    #[must_use]
    pub fn device_type(&self) -> &Arc<DeviceType> {
        &self.device_type
    }

    /// Connection parameters.
    #[must_use]
    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Change connection parameters. Only allowed while disconnected.
    pub fn set_params(&mut self, params: ConnectionParams) -> DeviceResult<()> {
        if self.lifecycle != DeviceState::Disconnected {
            return Err(DeviceError::InvalidState {
                operation: "change connection parameters",
                state: self.lifecycle,
            });
        }
        self.params = params;
        Ok(())
    }

    /// Options in effect.
    #[must_use]
    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    /// Mutable options; changes to the poller apply at the next `start()`.
    pub fn options_mut(&mut self) -> &mut DeviceOptions {
        &mut self.options
    }

    /// Lifecycle state. A poller that ended on its own, by fault or by finishing, leaves
    /// the device `Connected` even before the next `fetch()` collects it.
    #[must_use]
    pub fn lifecycle(&self) -> DeviceState {
        match self.lifecycle {
            DeviceState::Running if !self.is_running() => DeviceState::Connected,
            state => state,
        }
    }

    /// Whether a backend is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self.lifecycle, DeviceState::Connected | DeviceState::Running)
            && self.backend.is_some()
    }

    /// Whether the poller is producing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.poller.as_ref().is_some_and(Poller::is_running)
    }

    /// Attribute descriptors in declaration order.
    pub fn attributes(&self) -> impl Iterator<Item = &Arc<StateDescriptor>> {
        self.device_type.registry.iter()
    }

    /// Descriptor by name.
    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<&Arc<StateDescriptor>> {
        self.device_type.registry.get(name)
    }

    /// Cached value without I/O. `connected` reports the live flag.
    #[must_use]
    pub fn cached(&self, name: &str) -> Option<Value> {
        if name == CONNECTED {
            return Some(Value::Bool(self.is_connected()));
        }
        self.state.get(name).and_then(|a| a.cached_value.clone())
    }

    /// Whether the cached value may be out of date.
    #[must_use]
    pub fn is_stale(&self, name: &str) -> Option<bool> {
        self.state.get(name).map(|a| a.is_stale)
    }

    /// Cached values in declaration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, Option<Value>)> {
        let mut snapshot = self.state.snapshot();
        if let Some(entry) = snapshot.iter_mut().find(|(name, _)| name == CONNECTED) {
            entry.1 = Some(Value::Bool(self.is_connected()));
        }
        snapshot
    }

    /// Results dropped by the queue of the current or last run.
    #[must_use]
    pub fn dropped_results(&self) -> u64 {
        self.queue.dropped()
    }

    /// The open backend, for transport-specific operations.
    pub fn backend(&self) -> DeviceResult<SharedBackend> {
        self.live_backend()
    }

    fn live_backend(&self) -> DeviceResult<SharedBackend> {
        match (&self.backend, self.lifecycle) {
            (Some(backend), DeviceState::Connected | DeviceState::Running) => {
                Ok(Arc::clone(backend))
            }
            _ => Err(DeviceError::NotConnected(self.id.clone())),
        }
    }

    fn lookup(&self, name: &str) -> DeviceResult<Arc<StateDescriptor>> {
        self.device_type
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownAttribute(name.to_string()))
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Validate parameters, open the backend and run init commands.
    ///
    /// Already connected devices are left alone. On any failure the backend is released and
    /// the device stays disconnected.
    pub async fn connect(&mut self) -> DeviceResult<()> {
        match self.lifecycle {
            DeviceState::Connected | DeviceState::Running => return Ok(()),
            DeviceState::Disconnected | DeviceState::Connecting => {}
            DeviceState::Disconnecting => {
                return Err(DeviceError::InvalidState {
                    operation: "connect",
                    state: self.lifecycle,
                })
            }
        }

        self.lifecycle = DeviceState::Connecting;
        match self.open_backend().await {
            Ok(backend) => {
                self.backend = Some(backend);
                self.lifecycle = DeviceState::Connected;
                info!(
                    device = %self.id,
                    model = %self.device_type.model,
                    resource = %self.params.resource(),
                    "connected"
                );
                Ok(())
            }
            Err(e) => {
                self.lifecycle = DeviceState::Disconnected;
                warn!(device = %self.id, error = %e, "connect failed");
                Err(e)
            }
        }
    }

    async fn open_backend(&self) -> DeviceResult<SharedBackend> {
        let resource = self.params.resource();
        let kind = self.params.kind();
        if !self.device_type.accepts_kind(kind) {
            return Err(DeviceError::connection(
                &resource,
                format!("{} does not support {kind} backends", self.device_type.model),
            ));
        }

        let mut backend = self.params.build(self.options.timeout)?;
        backend.open().await.map_err(|e| match e {
            DeviceError::Connection { .. } => e,
            other => DeviceError::connection(&resource, other.to_string()),
        })?;

        for command in &self.device_type.init_commands {
            if let Err(e) = backend.write(command.as_bytes()).await {
                backend.close().await;
                return Err(DeviceError::connection(
                    &resource,
                    format!("init command '{command}' failed: {e}"),
                ));
            }
        }
        Ok(wrap_shared(backend))
    }

    /// Stop any poller, release the backend and mark all remote attributes stale.
    ///
    /// Safe to call in any state and any number of times. Problems are logged, not returned.
    pub async fn disconnect(&mut self) {
        if self.lifecycle == DeviceState::Disconnected && self.backend.is_none() {
            return;
        }
        self.lifecycle = DeviceState::Disconnecting;

        if let Some(mut poller) = self.poller.take() {
            if let Err(e) = poller.stop(self.options.stop_timeout).await {
                error!(device = %self.id, error = %e, "poller did not stop; aborting it");
                poller.abort();
            }
        }

        if let Some(backend) = self.backend.take() {
            match tokio::time::timeout(self.options.stop_timeout, backend.lock()).await {
                Ok(mut guard) => guard.close().await,
                Err(_) => error!(
                    device = %self.id,
                    "backend still busy; it will be released when the last handle drops"
                ),
            }
        }

        self.state.mark_all_stale();
        self.lifecycle = DeviceState::Disconnected;
        info!(device = %self.id, "disconnected");
    }

    // -------------------------------------------------------------------------
    // State access
    // -------------------------------------------------------------------------

    /// Read an attribute.
    ///
    /// Remote attributes are queried unless they are marked `cached` and already known. When
    /// the device is disconnected the last known (stale) value is returned if there is one.
    pub async fn get(&mut self, name: &str) -> DeviceResult<Value> {
        let descriptor = self.lookup(name)?;
        descriptor.check_readable()?;
        if name == CONNECTED {
            return Ok(Value::Bool(self.is_connected()));
        }

        let cached = self
            .state
            .get(name)
            .and_then(|a| a.cached_value.clone().map(|v| (v, a.is_stale)));

        if descriptor.is_local() {
            return cached.map(|(v, _)| v).ok_or_else(|| {
                DeviceError::validation(name, "has no value yet")
            });
        }
        if descriptor.cache {
            if let Some((value, false)) = &cached {
                return Ok(value.clone());
            }
        }

        let backend = match self.live_backend() {
            Ok(backend) => backend,
            Err(e) => {
                return match cached {
                    Some((value, _)) => {
                        debug!(device = %self.id, attribute = name, "serving stale value");
                        Ok(value)
                    }
                    None => Err(e),
                }
            }
        };
        self.read_remote(&descriptor, &backend).await
    }

    async fn read_remote(
        &mut self,
        descriptor: &StateDescriptor,
        backend: &SharedBackend,
    ) -> DeviceResult<Value> {
        let translator = Arc::clone(&self.device_type.translator);
        let command = translator.encode_get(descriptor)?;
        let reply = backend.lock().await.query(&command).await?;
        let value = translator.decode(descriptor, &reply).map_err(|e| {
            warn!(device = %self.id, attribute = %descriptor.name, error = %e, "bad reply");
            e
        })?;
        if let Some(attr) = self.state.get_mut(&descriptor.name) {
            attr.store(value.clone());
        }
        debug!(device = %self.id, attribute = %descriptor.name, %value, "read");
        Ok(value)
    }

    /// Write an attribute.
    ///
    /// The value is validated locally first; an invalid value never reaches the backend.
    /// The cache is updated optimistically, and refreshed from the instrument only when the
    /// attribute's command spec asks for confirmation.
    pub async fn set(&mut self, name: &str, value: impl Into<Value>) -> DeviceResult<()> {
        let value = value.into();
        let descriptor = self.lookup(name)?;
        descriptor.check_writable()?;
        let canonical = descriptor.validate(&value)?;

        if descriptor.is_local() {
            if let Some(attr) = self.state.get_mut(name) {
                attr.store(canonical);
            }
            return Ok(());
        }

        let backend = self.live_backend()?;
        let translator = Arc::clone(&self.device_type.translator);
        let command = translator.encode_set(&descriptor, &canonical)?;
        if let Err(e) = self.send(&backend, &command).await {
            if let Some(attr) = self.state.get_mut(name) {
                attr.is_stale = true;
            }
            return Err(e);
        }
        debug!(device = %self.id, attribute = name, value = %canonical, "set");

        let confirm = descriptor.command.as_ref().is_some_and(|c| c.confirm);
        if let Some(attr) = self.state.get_mut(name) {
            attr.store(canonical.clone());
        }
        if confirm && descriptor.access.readable() {
            let actual = self.read_remote(&descriptor, &backend).await?;
            if actual != canonical {
                warn!(
                    device = %self.id,
                    attribute = name,
                    requested = %canonical,
                    %actual,
                    "instrument applied a different value"
                );
            }
        }
        Ok(())
    }

    /// Apply several writes in order, stopping at the first failure. Earlier writes stay
    /// applied.
    pub async fn setup<I, K, V>(&mut self, pairs: I) -> DeviceResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        for (name, value) in pairs {
            self.set(name.as_ref(), value).await?;
        }
        Ok(())
    }

    /// Re-read every readable remote attribute, returning how many were refreshed.
    pub async fn refresh(&mut self) -> DeviceResult<usize> {
        let backend = self.live_backend()?;
        let readable: Vec<Arc<StateDescriptor>> = self
            .device_type
            .registry
            .iter()
            .filter(|d| !d.is_local() && d.access.readable())
            .cloned()
            .collect();
        for descriptor in &readable {
            self.read_remote(descriptor, &backend).await?;
        }
        Ok(readable.len())
    }

    // -------------------------------------------------------------------------
    // Raw commands, actions, scenarios
    // -------------------------------------------------------------------------

    /// Send a raw command.
    pub async fn write_raw(&mut self, command: &str) -> DeviceResult<()> {
        let backend = self.live_backend()?;
        let mut guard = backend.lock().await;
        guard.write(command.as_bytes()).await
    }

    /// Send a raw query and return the trimmed reply text.
    pub async fn query_raw(&mut self, command: &str) -> DeviceResult<String> {
        let backend = self.live_backend()?;
        let reply = backend.lock().await.query(command.as_bytes()).await?;
        Ok(String::from_utf8_lossy(&reply).trim().to_string())
    }

    /// Run a named action.
    pub async fn invoke(&mut self, action: &str) -> DeviceResult<()> {
        self.invoke_with(action, &[]).await
    }

    /// Run a named action whose template has placeholders.
    pub async fn invoke_with(&mut self, action: &str, params: &[(&str, &Value)]) -> DeviceResult<()> {
        let template = self.device_type.actions.get(action).ok_or_else(|| {
            DeviceError::Configuration(format!(
                "{} has no action '{action}'",
                self.device_type.model
            ))
        })?;
        let command = render_template(template, params, &BoolTokens::default())?;
        let backend = self.live_backend()?;
        debug!(device = %self.id, action, "invoke");
        self.send(&backend, &command).await
    }

    /// Ask the instrument to load a scenario file. The path is passed through verbatim.
    pub async fn load_scenario(&mut self, path: impl AsRef<Path>) -> DeviceResult<()> {
        let template = self.scenario()?.load.clone();
        self.send_scenario(&template, path.as_ref()).await
    }

    /// Ask the instrument to save its scenario. The path is passed through verbatim.
    pub async fn save_scenario(&mut self, path: impl AsRef<Path>) -> DeviceResult<()> {
        let template = self.scenario()?.save.clone().ok_or_else(|| {
            DeviceError::Configuration(format!(
                "{} cannot save scenarios",
                self.device_type.model
            ))
        })?;
        self.send_scenario(&template, path.as_ref()).await
    }

    fn scenario(&self) -> DeviceResult<&ScenarioCommands> {
        self.device_type.scenario.as_ref().ok_or_else(|| {
            DeviceError::Configuration(format!(
                "{} does not use scenario files",
                self.device_type.model
            ))
        })
    }

    async fn send_scenario(&mut self, template: &str, path: &Path) -> DeviceResult<()> {
        let path = Value::String(path.to_string_lossy().into_owned());
        let command = render_template(template, &[("path", &path)], &BoolTokens::default())?;
        let backend = self.live_backend()?;
        info!(device = %self.id, scenario = %path, "scenario command");
        self.send(&backend, &command).await
    }

    /// Write a command, reading and checking the acknowledgement when the type expects one.
    async fn send(&self, backend: &SharedBackend, command: &[u8]) -> DeviceResult<()> {
        let mut guard = backend.lock().await;
        if self.device_type.acknowledged {
            let reply = guard.query(command).await?;
            self.device_type.translator.check_ack(&reply)
        } else {
            guard.write(command).await
        }
    }

    /// Poll `query` every `interval` until `predicate` accepts the reply or `timeout` passes.
    ///
    /// Returns the accepted reply; a timeout is a command error flagged as timed out.
    pub async fn wait_until<F>(
        &mut self,
        query: &str,
        predicate: F,
        timeout: Duration,
        interval: Duration,
    ) -> DeviceResult<String>
    where
        F: Fn(&str) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let reply = self.query_raw(query).await?;
            if predicate(&reply) {
                return Ok(reply);
            }
            if Instant::now() + interval > deadline {
                return Err(DeviceError::command_timeout(
                    &format!("waiting on '{query}'"),
                    timeout,
                ));
            }
            tokio::time::sleep(interval).await;
        }
    }

    // -------------------------------------------------------------------------
    // Streaming
    // -------------------------------------------------------------------------

    /// Start the model's default poll source.
    pub async fn start(&mut self) -> DeviceResult<()> {
        let factory = self.device_type.poll_source.clone().ok_or_else(|| {
            DeviceError::Configuration(format!(
                "{} has no streaming source",
                self.device_type.model
            ))
        })?;
        self.start_with(factory()).await
    }

    /// Start polling with an explicit source. Only valid while connected and not running.
    pub async fn start_with(&mut self, mut source: Box<dyn PollSource>) -> DeviceResult<()> {
        self.reap_poller();
        if self.lifecycle != DeviceState::Connected {
            return Err(DeviceError::InvalidState {
                operation: "start",
                state: self.lifecycle,
            });
        }
        let backend = self.live_backend()?;
        {
            let mut guard = backend.lock().await;
            source.on_start(&mut **guard).await?;
        }

        let leftover = self.queue.len();
        if leftover > 0 {
            debug!(device = %self.id, leftover, "discarding unfetched results");
        }
        if let Some(fault) = self.queue.take_fault() {
            warn!(device = %self.id, error = %fault, "discarding unreported poller fault");
        }
        let config = self.options.poller;
        self.queue = Arc::new(ResultQueue::new(config.max_queue_size));
        self.poller = Some(Poller::spawn(
            &self.id,
            backend,
            source,
            config,
            Arc::clone(&self.queue),
        ));
        self.lifecycle = DeviceState::Running;
        Ok(())
    }

    /// Stop the poller, waiting up to the configured `stop_timeout`.
    pub async fn stop(&mut self) -> DeviceResult<()> {
        self.stop_within(self.options.stop_timeout).await
    }

    /// Stop the poller, waiting up to `stop_timeout`.
    ///
    /// A poller that does not finish in time is reported as `UnresponsiveWorker` and left in
    /// place; the device stays `Running` until a later stop or `disconnect()` succeeds.
    pub async fn stop_within(&mut self, stop_timeout: Duration) -> DeviceResult<()> {
        let Some(poller) = self.poller.as_mut() else {
            return Ok(());
        };
        let result = poller.stop(stop_timeout).await;
        if matches!(result, Err(DeviceError::UnresponsiveWorker(_))) {
            return result;
        }
        self.poller = None;
        if self.lifecycle == DeviceState::Running {
            self.lifecycle = DeviceState::Connected;
        }
        info!(device = %self.id, "stopped");
        result
    }

    /// Drain queued results, oldest first.
    ///
    /// With `None` this never blocks. With a timeout it waits for the first result if the
    /// queue is empty and the poller is alive. A poller that died on an error reports it
    /// here as `PollerFault`, once.
    pub async fn fetch(&mut self, timeout: Option<Duration>) -> DeviceResult<Vec<PollResult>> {
        if let Some(timeout) = timeout {
            if self.queue.is_empty() {
                let alive = self.poller.as_ref().map(Poller::running_flag);
                self.queue
                    .wait(timeout, || {
                        alive.as_ref().is_some_and(|f| f.load(Ordering::SeqCst))
                    })
                    .await;
            }
        }
        if let Some(fault) = self.queue.take_fault() {
            self.reap_poller();
            return Err(DeviceError::PollerFault(Box::new(fault)));
        }
        self.reap_poller();
        Ok(self.queue.drain())
    }

    /// Forget a poller whose task has already ended on its own.
    fn reap_poller(&mut self) {
        if self.poller.as_ref().is_some_and(|p| !p.is_running()) {
            self.poller = None;
            if self.lifecycle == DeviceState::Running {
                self.lifecycle = DeviceState::Connected;
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.as_ref() {
            poller.request_stop();
        }
    }
}

/// Run a closure against the concrete backend type, if the device uses it.
pub async fn with_backend<B, R, F>(device: &Device, f: F) -> DeviceResult<Option<R>>
where
    B: Backend + 'static,
    F: FnOnce(&mut B) -> R,
{
    let backend = device.backend()?;
    let mut guard = backend.lock().await;
    Ok(guard.as_any_mut().downcast_mut::<B>().map(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SimulatedBackend, SimulatedInstrument, SimulatedParams};
    use crate::translator::CommandSpec;

    fn model() -> Arc<DeviceType> {
        DeviceType::builder("Test instrument")
            .accepts(BackendKind::Serial)
            .attribute(
                StateDescriptor::float("level")
                    .with_range(0.0, 10.0)
                    .with_command(CommandSpec::scpi("LEV")),
            )
            .attribute(
                StateDescriptor::string("serial_number")
                    .read_only()
                    .cached()
                    .with_command(CommandSpec::query("SN")),
            )
            .attribute(StateDescriptor::int("port").with_default(5201))
            .init_command("*CLS")
            .action("reset", "*RST")
            .build()
            .unwrap()
    }

    fn device(sim: &SimulatedInstrument) -> Device {
        Device::new(
            "dev",
            model(),
            ConnectionParams::Simulated(SimulatedParams::new(sim.clone())),
        )
    }

    #[tokio::test]
    async fn test_connect_runs_init_commands() {
        let sim = SimulatedInstrument::new();
        let mut dev = device(&sim);
        dev.connect().await.unwrap();
        dev.connect().await.unwrap();
        assert_eq!(sim.command_log(), vec!["*CLS"]);
        assert_eq!(sim.open_count(), 1);
        assert_eq!(dev.lifecycle(), DeviceState::Connected);
    }

    #[tokio::test]
    async fn test_failed_open_leaves_disconnected() {
        let sim = SimulatedInstrument::new();
        sim.fail_next_open();
        let mut dev = device(&sim);
        assert!(matches!(dev.connect().await, Err(DeviceError::Connection { .. })));
        assert_eq!(dev.lifecycle(), DeviceState::Disconnected);
        dev.connect().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_backend_kind() {
        let mut dev = Device::new(
            "dev",
            model(),
            ConnectionParams::Process(crate::backend::ProcessParams::new("iperf")),
        );
        let err = dev.connect().await.unwrap_err();
        assert!(err.to_string().contains("does not support process backends"));
    }

    #[tokio::test]
    async fn test_cached_attribute_reads_once() {
        let sim = SimulatedInstrument::new().with_register("SN", "12345");
        let mut dev = device(&sim);
        dev.connect().await.unwrap();
        sim.clear_log();

        assert_eq!(dev.get("serial_number").await.unwrap(), Value::from("12345"));
        assert_eq!(dev.get("serial_number").await.unwrap(), Value::from("12345"));
        assert_eq!(sim.command_log(), vec!["SN?"]);
    }

    #[tokio::test]
    async fn test_local_attribute_never_touches_backend() {
        let sim = SimulatedInstrument::new();
        let mut dev = device(&sim);
        assert_eq!(dev.get("port").await.unwrap(), Value::Int(5201));
        dev.set("port", 5202).await.unwrap();
        assert_eq!(dev.get("port").await.unwrap(), Value::Int(5202));
        assert!(sim.command_log().is_empty());
    }

    #[tokio::test]
    async fn test_decode_error_keeps_cache() {
        let sim = SimulatedInstrument::new();
        let mut dev = device(&sim);
        dev.connect().await.unwrap();
        dev.set("level", 5.0).await.unwrap();
        sim.set_register("LEV", "not-a-number");
        assert!(matches!(dev.get("level").await, Err(DeviceError::Decode { .. })));
        assert_eq!(dev.cached("level"), Some(Value::Float(5.0)));
    }

    #[tokio::test]
    async fn test_disconnected_get_serves_stale_or_fails() {
        let sim = SimulatedInstrument::new();
        let mut dev = device(&sim);
        assert!(matches!(dev.get("level").await, Err(DeviceError::NotConnected(_))));
        assert!(matches!(dev.set("level", 1.0).await, Err(DeviceError::NotConnected(_))));

        dev.connect().await.unwrap();
        dev.set("level", 2.5).await.unwrap();
        dev.disconnect().await;
        assert_eq!(dev.is_stale("level"), Some(true));
        assert_eq!(dev.get("level").await.unwrap(), Value::Float(2.5));
    }

    #[tokio::test]
    async fn test_actions_and_raw_commands() {
        let sim = SimulatedInstrument::new().with_register("*IDN", "ACME,X1,1,0");
        let mut dev = device(&sim);
        dev.connect().await.unwrap();
        dev.invoke("reset").await.unwrap();
        assert!(dev.invoke("explode").await.is_err());
        assert_eq!(dev.query_raw("*IDN?").await.unwrap(), "ACME,X1,1,0");
        assert!(sim.command_log().contains(&"*RST".to_string()));
        assert!(dev.load_scenario("a.scn").await.is_err());
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let sim = SimulatedInstrument::new().with_register("STAT", "busy");
        let mut dev = device(&sim);
        dev.connect().await.unwrap();
        let err = dev
            .wait_until(
                "STAT?",
                |r| r == "idle",
                Duration::from_millis(50),
                Duration::from_millis(10),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        sim.set_register("STAT", "idle");
        let reply = dev
            .wait_until("STAT?", |r| r == "idle", Duration::from_secs(1), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(reply, "idle");
    }

    #[tokio::test]
    async fn test_with_backend_downcasts() {
        let sim = SimulatedInstrument::new();
        let mut dev = device(&sim);
        dev.connect().await.unwrap();
        let opens = with_backend::<SimulatedBackend, _, _>(&dev, |b| b.instrument().open_count())
            .await
            .unwrap();
        assert_eq!(opens, Some(1));
    }

    #[tokio::test]
    async fn test_start_requires_streaming_model() {
        let sim = SimulatedInstrument::new();
        let mut dev = device(&sim);
        assert!(dev.start().await.is_err());
        dev.connect().await.unwrap();
        assert!(matches!(dev.start().await, Err(DeviceError::Configuration(_))));
        assert!(dev.stop().await.is_ok());
    }
}
