//! Device types described in TOML.
//!
//! A definition file declares what a catalog driver declares in code: the model, the
//! transports it accepts, init commands, reply error markers, and one `[[state]]` table per
//! attribute. Files are validated when loaded (unique names, compilable patterns, defaults
//! within their constraints), so a bad definition fails before any device connects.
//!
//! ```toml
//! [device]
//! model = "Generic SCPI signal generator"
//! accepts = ["visa"]
//! init = ["*CLS"]
//! error_markers = ["ERR"]
//!
//! [[state]]
//! name = "frequency"
//! type = "float"
//! min = 9e3
//! max = 6e9
//! unit = "Hz"
//! key = "FREQ"
//!
//! [[state]]
//! name = "identity"
//! type = "string"
//! access = "ro"
//! cache = true
//! command = { get = "*IDN?" }
//!
//! [actions]
//! reset = "*RST"
//! ```

use crate::backend::BackendKind;
use crate::device::DeviceType;
use crate::error::{DeviceError, DeviceResult};
use crate::state::{Access, StateDescriptor};
use crate::translator::{CommandSpec, TemplateTranslator};
use crate::value::{Value, ValueType};
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A TOML instrument definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Model-level settings
    pub device: DeviceSection,
    /// Attributes, in declaration order
    #[serde(default)]
    pub state: Vec<StateEntry>,
    /// Named command templates
    #[serde(default)]
    pub actions: BTreeMap<String, String>,
    /// Scenario file commands
    #[serde(default)]
    pub scenario: Option<ScenarioSection>,
}

/// `[device]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSection {
    /// Model name
    pub model: String,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Accepted transports; empty accepts all
    #[serde(default)]
    pub accepts: Vec<BackendKind>,
    /// Commands written after every connect
    #[serde(default)]
    pub init: Vec<String>,
    /// Reply prefixes that signal an instrument error
    #[serde(default)]
    pub error_markers: Vec<String>,
    /// Reply that acknowledges every write; implies acknowledged writes
    #[serde(default)]
    pub ack: Option<String>,
    /// Read (and check) a reply after every write
    #[serde(default)]
    pub acknowledged: bool,
}

/// `[scenario]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSection {
    /// Load template with a `${path}` placeholder
    pub load: String,
    /// Save template with a `${path}` placeholder
    #[serde(default)]
    pub save: Option<String>,
}

fn default_access() -> Access {
    Access::ReadWrite
}

/// One `[[state]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    /// Attribute name
    pub name: String,
    /// Value type
    #[serde(rename = "type")]
    pub value_type: ValueType,
    /// `ro`, `wo` or `rw`
    #[serde(default = "default_access")]
    pub access: Access,
    /// Initial or documented default
    #[serde(default)]
    pub default: Option<Value>,
    /// Lower bound
    #[serde(default)]
    pub min: Option<f64>,
    /// Upper bound
    #[serde(default)]
    pub max: Option<f64>,
    /// Resolution
    #[serde(default)]
    pub step: Option<f64>,
    /// Enum choices
    #[serde(default)]
    pub choices: Vec<String>,
    /// Exact-case enum matching
    #[serde(default)]
    pub case_sensitive: bool,
    /// Longest accepted string
    #[serde(default)]
    pub max_length: Option<usize>,
    /// Physical unit
    #[serde(default)]
    pub unit: Option<String>,
    /// Help text
    #[serde(default)]
    pub help: Option<String>,
    /// Read once per connection
    #[serde(default)]
    pub cache: bool,
    /// SCPI shorthand: `KEY?` to read, `KEY ${value}` to write
    #[serde(default)]
    pub key: Option<String>,
    /// Explicit command grammar
    #[serde(default)]
    pub command: Option<CommandSpec>,
}

impl StateEntry {
    fn descriptor(&self) -> DeviceResult<StateDescriptor> {
        let mut d = StateDescriptor::new(&self.name, self.value_type).with_access(self.access);
        d.constraints.min = self.min;
        d.constraints.max = self.max;
        d.constraints.step = self.step;
        d.constraints.choices.clone_from(&self.choices);
        d.constraints.case_sensitive = self.case_sensitive;
        d.constraints.max_length = self.max_length;
        d.default.clone_from(&self.default);
        d.unit.clone_from(&self.unit);
        d.help.clone_from(&self.help);
        d.cache = self.cache;

        d.command = match (&self.key, &self.command) {
            (Some(_), Some(_)) => {
                return Err(DeviceError::Configuration(format!(
                    "state '{}' has both 'key' and 'command'",
                    self.name
                )))
            }
            (Some(key), None) => Some(scpi_for_access(key, self.access)),
            (None, command) => command.clone(),
        };
        Ok(d)
    }
}

/// SCPI shorthand trimmed to what the access mode allows.
fn scpi_for_access(key: &str, access: Access) -> CommandSpec {
    let mut spec = CommandSpec::scpi(key);
    if !access.readable() {
        spec.get_template = None;
    }
    if !access.writable() {
        spec.set_template = None;
    }
    spec
}

impl DeviceDefinition {
    /// Parse and validate a definition file.
    pub fn load_file(path: &Path) -> DeviceResult<Self> {
        if !path.exists() {
            return Err(DeviceError::Configuration(format!(
                "definition file not found: {}",
                path.display()
            )));
        }
        debug!("Loading instrument definition from: {}", path.display());
        let definition: Self = Figment::new().merge(Toml::file(path)).extract()?;
        definition.validate()?;
        info!(
            model = %definition.device.model,
            attributes = definition.state.len(),
            "loaded instrument definition"
        );
        Ok(definition)
    }

    /// Parse and validate definition text.
    pub fn from_toml_str(text: &str) -> DeviceResult<Self> {
        let definition: Self = toml::from_str(text)
            .map_err(|e| DeviceError::Configuration(format!("invalid definition: {e}")))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Check everything that can be checked without hardware.
    pub fn validate(&self) -> DeviceResult<()> {
        self.build().map(|_| ())
    }

    /// Build the shared device type.
    pub fn into_device_type(self) -> DeviceResult<Arc<DeviceType>> {
        self.build()
    }

    fn build(&self) -> DeviceResult<Arc<DeviceType>> {
        let section = &self.device;
        let mut translator = TemplateTranslator::new().with_error_markers(section.error_markers.clone());
        if let Some(ack) = &section.ack {
            translator = translator.with_ack(ack.clone());
        }

        let mut builder = DeviceType::builder(&section.model).translator(translator);
        for kind in &section.accepts {
            builder = builder.accepts(*kind);
        }
        for command in &section.init {
            builder = builder.init_command(command.clone());
        }
        if section.acknowledged || section.ack.is_some() {
            builder = builder.acknowledged();
        }
        for entry in &self.state {
            builder = builder.attribute(entry.descriptor()?);
        }
        for (name, template) in &self.actions {
            builder = builder.action(name.clone(), template.clone());
        }
        if let Some(scenario) = &self.scenario {
            if !scenario.load.contains("${path}") {
                return Err(DeviceError::Configuration(
                    "scenario load template has no ${path} placeholder".to_string(),
                ));
            }
            builder = builder.scenario(scenario.load.clone(), scenario.save.clone());
        }
        builder.build()
    }
}

/// Load every `*.toml` definition in a directory. Files that fail to load are logged and
/// skipped.
pub fn load_all(dir: &Path) -> DeviceResult<Vec<DeviceDefinition>> {
    if !dir.is_dir() {
        return Err(DeviceError::Configuration(format!(
            "not a directory: {}",
            dir.display()
        )));
    }
    let mut definitions = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("toml") {
            continue;
        }
        match DeviceDefinition::load_file(&path) {
            Ok(definition) => definitions.push(definition),
            Err(e) => warn!("Failed to load definition {}: {}", path.display(), e),
        }
    }
    Ok(definitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ConnectionParams, SimulatedInstrument, SimulatedParams};
    use crate::device::Device;

    const SIGNAL_GENERATOR: &str = r#"
[device]
model = "Generic SCPI signal generator"
accepts = ["visa"]
init = ["*CLS"]
error_markers = ["ERR"]

[[state]]
name = "frequency"
type = "float"
min = 9e3
max = 6e9
unit = "Hz"
key = "FREQ"

[[state]]
name = "output"
type = "bool"
command = { get = "OUTP?", set = "OUTP ${value}", bool_tokens = { on = "ON", off = "OFF" } }

[[state]]
name = "identity"
type = "string"
access = "ro"
cache = true
command = { get = "*IDN?", decode = { rule = "split", delimiter = ",", index = 1 } }

[[state]]
name = "channel"
type = "enum"
choices = ["A", "B"]
default = "A"

[actions]
reset = "*RST"

[scenario]
load = "MMEM:LOAD '${path}'"
"#;

    #[tokio::test]
    async fn test_definition_drives_device() {
        let device_type = DeviceDefinition::from_toml_str(SIGNAL_GENERATOR)
            .unwrap()
            .into_device_type()
            .unwrap();
        assert_eq!(device_type.model(), "Generic SCPI signal generator");
        assert!(!device_type.accepts_kind(BackendKind::Serial));

        let sim = SimulatedInstrument::new()
            .with_register("FREQ", "1.0E+9")
            .with_register("*IDN", "ACME,SG-6000,1234,1.0");
        let mut sg = Device::new(
            "sg",
            device_type,
            ConnectionParams::Simulated(SimulatedParams::new(sim.clone())),
        );
        sg.connect().await.unwrap();

        assert_eq!(sg.get("frequency").await.unwrap(), Value::Float(1e9));
        assert_eq!(sg.get("identity").await.unwrap(), Value::from("SG-6000"));
        assert_eq!(sg.get("channel").await.unwrap(), Value::from("A"));

        sg.set("output", true).await.unwrap();
        assert_eq!(sim.register("OUTP").as_deref(), Some("ON"));
        assert!(sg.set("frequency", 1.0).await.is_err());

        sg.invoke("reset").await.unwrap();
        sg.load_scenario("/tmp/setup.sta").await.unwrap();
        let log = sim.command_log();
        assert_eq!(log.first().map(String::as_str), Some("*CLS"));
        assert!(log.contains(&"MMEM:LOAD '/tmp/setup.sta'".to_string()));
    }

    #[test]
    fn test_invalid_definitions() {
        let duplicate = r#"
[device]
model = "X"
[[state]]
name = "a"
type = "int"
[[state]]
name = "a"
type = "int"
"#;
        assert!(DeviceDefinition::from_toml_str(duplicate).is_err());

        let bad_pattern = r#"
[device]
model = "X"
[[state]]
name = "a"
type = "int"
command = { get = "A?", decode = { rule = "pattern", regex = "(unclosed" } }
access = "ro"
"#;
        assert!(DeviceDefinition::from_toml_str(bad_pattern).is_err());

        let bad_default = r#"
[device]
model = "X"
[[state]]
name = "a"
type = "int"
max = 5
default = 10
"#;
        assert!(DeviceDefinition::from_toml_str(bad_default).is_err());

        let both = r#"
[device]
model = "X"
[[state]]
name = "a"
type = "int"
key = "A"
command = { get = "A?" }
"#;
        assert!(DeviceDefinition::from_toml_str(both).is_err());
    }

    #[test]
    fn test_load_file_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sg.toml"), SIGNAL_GENERATOR).unwrap();
        std::fs::write(dir.path().join("broken.toml"), "[device]\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let definition = DeviceDefinition::load_file(&dir.path().join("sg.toml")).unwrap();
        assert_eq!(definition.state.len(), 4);
        assert!(DeviceDefinition::load_file(&dir.path().join("missing.toml")).is_err());

        let all = load_all(dir.path()).unwrap();
        assert_eq!(all.len(), 1);
    }
}
