//! State descriptors and the per-type attribute registry.
//!
//! A device type declares its attributes once as [`StateDescriptor`]s collected in a
//! [`StateRegistry`]. The registry is immutable, shared through an `Arc` by every device of
//! that type, and keeps declaration order so that introspection and bulk operations are
//! deterministic. Each device instance owns a [`StateTable`] with one [`StateAttribute`]
//! (cached value plus staleness flag) per descriptor.
//!
//! # Example
//!
//! ```
//! use lab_devices::state::{StateDescriptor, StateRegistry};
//! use lab_devices::translator::CommandSpec;
//!
//! let registry = StateRegistry::builder()
//!     .attribute(
//!         StateDescriptor::float("attenuation")
//!             .with_range(0.0, 115.0)
//!             .with_step(0.25)
//!             .with_unit("dB")
//!             .with_command(CommandSpec::new("ATT?", "SETATT=${value}")),
//!     )
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(registry.names(), vec!["connected", "attenuation"]);
//! ```

use crate::error::{DeviceError, DeviceResult};
use crate::translator::CommandSpec;
use crate::value::{Value, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Name of the intrinsic attribute every registry carries.
pub const CONNECTED: &str = "connected";

// =============================================================================
// Access
// =============================================================================

/// Access mode of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    /// Readable only
    #[serde(rename = "ro")]
    ReadOnly,
    /// Writable only
    #[serde(rename = "wo")]
    WriteOnly,
    /// Readable and writable
    #[serde(rename = "rw")]
    ReadWrite,
}

impl Access {
    /// Whether `get` is permitted.
    #[must_use]
    pub fn readable(self) -> bool {
        !matches!(self, Access::WriteOnly)
    }

    /// Whether `set` is permitted.
    #[must_use]
    pub fn writable(self) -> bool {
        !matches!(self, Access::ReadOnly)
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Access::ReadOnly => "ro",
            Access::WriteOnly => "wo",
            Access::ReadWrite => "rw",
        })
    }
}

// =============================================================================
// Constraints
// =============================================================================

/// Local validation rules applied before any command is encoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// Inclusive lower bound for numeric attributes
    #[serde(default)]
    pub min: Option<f64>,
    /// Inclusive upper bound for numeric attributes
    #[serde(default)]
    pub max: Option<f64>,
    /// Resolution; values are snapped to `min + n * step`
    #[serde(default)]
    pub step: Option<f64>,
    /// Allowed spellings for enum attributes
    #[serde(default)]
    pub choices: Vec<String>,
    /// Whether enum choices must match exactly
    #[serde(default)]
    pub case_sensitive: bool,
    /// Maximum length of string attributes
    #[serde(default)]
    pub max_length: Option<usize>,
}

impl Constraints {
    fn check_range(&self, name: &str, value: f64) -> DeviceResult<()> {
        if let Some(min) = self.min {
            if value < min {
                return Err(DeviceError::validation(
                    name,
                    format!("{value} is below the minimum {min}"),
                ));
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return Err(DeviceError::validation(
                    name,
                    format!("{value} is above the maximum {max}"),
                ));
            }
        }
        Ok(())
    }

    fn snap_to_step(&self, value: f64) -> f64 {
        match self.step {
            Some(step) if step > 0.0 => {
                let origin = self.min.unwrap_or(0.0);
                let mut steps = ((value - origin) / step).round();
                // A max off the grid: the nearest point may lie above it, so take the one below.
                if let Some(max) = self.max {
                    if origin + steps * step > max + 1e-9 {
                        steps -= 1.0;
                    }
                }
                // Re-round to shed accumulated binary error (10.5 stays 10.5, not 10.500000001)
                let snapped = origin + steps * step;
                (snapped * 1e9).round() / 1e9
            }
            _ => value,
        }
    }

    /// Canonical spelling of `candidate` among the declared choices.
    ///
    /// Matching is case-insensitive unless `case_sensitive` is set. SCPI-style short forms
    /// are accepted when they are an unambiguous prefix of one choice (`NORM` for `NORMAL`).
    #[must_use]
    pub fn canonical_choice(&self, candidate: &str) -> Option<&str> {
        let candidate = candidate.trim();
        let same = |choice: &str| {
            if self.case_sensitive {
                choice == candidate
            } else {
                choice.eq_ignore_ascii_case(candidate)
            }
        };
        if let Some(exact) = self.choices.iter().find(|c| same(c)) {
            return Some(exact);
        }
        if candidate.is_empty() || self.case_sensitive {
            return None;
        }
        let upper = candidate.to_ascii_uppercase();
        let mut prefixed = self
            .choices
            .iter()
            .filter(|c| c.to_ascii_uppercase().starts_with(&upper));
        match (prefixed.next(), prefixed.next()) {
            (Some(only), None) => Some(only),
            _ => None,
        }
    }
}

// =============================================================================
// StateDescriptor
// =============================================================================

/// Declaration of one typed attribute.
///
/// Descriptors without a [`CommandSpec`] are *local* attributes: they hold a value on the
/// host (for example options that are later turned into command-line flags) and never touch
/// the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct StateDescriptor {
    /// Attribute name, unique within a registry
    pub name: String,
    /// Declared value type
    pub value_type: ValueType,
    /// Access mode
    pub access: Access,
    /// Initial value for local attributes, or documentation default for remote ones
    pub default: Option<Value>,
    /// Validation rules
    pub constraints: Constraints,
    /// How reads and writes are encoded; `None` for local attributes
    pub command: Option<CommandSpec>,
    /// Once read, the value never changes while connected (serial numbers, options)
    pub cache: bool,
    /// Physical unit, informational and used to strip reply suffixes
    pub unit: Option<String>,
    /// Human-readable description
    pub help: Option<String>,
}

impl StateDescriptor {
    /// Create a read-write descriptor of the given type.
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            access: Access::ReadWrite,
            default: None,
            constraints: Constraints::default(),
            command: None,
            cache: false,
            unit: None,
            help: None,
        }
    }

    /// Boolean attribute.
    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, ValueType::Bool)
    }

    /// Integer attribute.
    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, ValueType::Int)
    }

    /// Float attribute.
    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, ValueType::Float)
    }

    /// String attribute.
    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ValueType::String)
    }

    /// Enum attribute with the given choices.
    pub fn choice<I, S>(name: impl Into<String>, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut descriptor = Self::new(name, ValueType::Enum);
        descriptor.constraints.choices = choices.into_iter().map(Into::into).collect();
        descriptor
    }

    /// Bytes attribute.
    pub fn bytes(name: impl Into<String>) -> Self {
        Self::new(name, ValueType::Bytes)
    }

    /// Mark read-only.
    pub fn read_only(mut self) -> Self {
        self.access = Access::ReadOnly;
        self
    }

    /// Mark write-only.
    pub fn write_only(mut self) -> Self {
        self.access = Access::WriteOnly;
        self
    }

    /// Set access mode explicitly.
    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// Inclusive numeric range.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.constraints.min = Some(min);
        self.constraints.max = Some(max);
        self
    }

    /// Lower bound only.
    pub fn with_min(mut self, min: f64) -> Self {
        self.constraints.min = Some(min);
        self
    }

    /// Numeric resolution.
    pub fn with_step(mut self, step: f64) -> Self {
        self.constraints.step = Some(step);
        self
    }

    /// Maximum string length.
    pub fn with_max_length(mut self, len: usize) -> Self {
        self.constraints.max_length = Some(len);
        self
    }

    /// Require exact-case enum matches.
    pub fn case_sensitive(mut self) -> Self {
        self.constraints.case_sensitive = true;
        self
    }

    /// Default value.
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Bind to a command spec, making the attribute remote.
    pub fn with_command(mut self, command: CommandSpec) -> Self {
        self.command = Some(command);
        self
    }

    /// Read once per connection and serve from cache afterwards.
    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    /// Physical unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Help text.
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Whether reads and writes stay on the host.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.command.is_none()
    }

    /// Fail with an access error unless the attribute can be read.
    pub fn check_readable(&self) -> DeviceResult<()> {
        if self.access.readable() {
            Ok(())
        } else {
            Err(DeviceError::Access {
                name: self.name.clone(),
                message: "is write-only and cannot be read".to_string(),
            })
        }
    }

    /// Fail with an access error unless the attribute can be written.
    pub fn check_writable(&self) -> DeviceResult<()> {
        if self.access.writable() {
            Ok(())
        } else {
            Err(DeviceError::Access {
                name: self.name.clone(),
                message: "is read-only and cannot be set".to_string(),
            })
        }
    }

    /// Validate a candidate value and return its canonical form.
    ///
    /// Integers are accepted for float attributes, integral floats for integer attributes,
    /// text for byte attributes. Numeric values are range-checked and snapped to `step`;
    /// enum values are replaced by the declared spelling of the matching choice.
    pub fn validate(&self, value: &Value) -> DeviceResult<Value> {
        let mismatch = || {
            DeviceError::validation(
                &self.name,
                format!("expected {}, got {}", self.value_type, value.kind()),
            )
        };

        match self.value_type {
            ValueType::Bool => value.as_bool().map(Value::Bool).ok_or_else(mismatch),
            ValueType::Int => {
                let v = match value {
                    Value::Int(_) | Value::Float(_) => value.as_i64().ok_or_else(mismatch)?,
                    _ => return Err(mismatch()),
                };
                self.constraints.check_range(&self.name, v as f64)?;
                if let Some(step) = self.constraints.step {
                    let origin = self.constraints.min.unwrap_or(0.0);
                    if step > 0.0 && ((v as f64 - origin) / step).fract().abs() > 1e-9 {
                        return Err(DeviceError::validation(
                            &self.name,
                            format!("{v} is not a multiple of the step {step}"),
                        ));
                    }
                }
                Ok(Value::Int(v))
            }
            ValueType::Float => {
                let v = value.as_f64().ok_or_else(mismatch)?;
                if !v.is_finite() {
                    return Err(DeviceError::validation(&self.name, "value is not finite"));
                }
                self.constraints.check_range(&self.name, v)?;
                let snapped = self.constraints.snap_to_step(v);
                self.constraints.check_range(&self.name, snapped)?;
                Ok(Value::Float(snapped))
            }
            ValueType::String => {
                let v = value.as_str().ok_or_else(mismatch)?;
                if let Some(max) = self.constraints.max_length {
                    if v.chars().count() > max {
                        return Err(DeviceError::validation(
                            &self.name,
                            format!("longer than {max} characters"),
                        ));
                    }
                }
                Ok(Value::String(v.to_string()))
            }
            ValueType::Enum => {
                let v = value.as_str().ok_or_else(mismatch)?;
                self.constraints
                    .canonical_choice(v)
                    .map(|c| Value::String(c.to_string()))
                    .ok_or_else(|| {
                        DeviceError::validation(
                            &self.name,
                            format!(
                                "'{v}' is not one of [{}]",
                                self.constraints.choices.join(", ")
                            ),
                        )
                    })
            }
            ValueType::Bytes => match value {
                Value::Bytes(b) => Ok(Value::Bytes(b.clone())),
                Value::String(s) => Ok(Value::Bytes(s.as_bytes().to_vec())),
                _ => Err(mismatch()),
            },
        }
    }

    /// Parse user-supplied text (CLI arguments, config strings) into a validated value.
    pub fn parse_text(&self, text: &str) -> DeviceResult<Value> {
        let text = text.trim();
        let bad = || {
            DeviceError::validation(
                &self.name,
                format!("cannot parse '{text}' as {}", self.value_type),
            )
        };
        let raw = match self.value_type {
            ValueType::Bool => Value::Bool(parse_bool_token(text).ok_or_else(bad)?),
            ValueType::Int => Value::Int(text.parse().map_err(|_| bad())?),
            ValueType::Float => Value::Float(text.parse().map_err(|_| bad())?),
            ValueType::String | ValueType::Enum => Value::String(text.to_string()),
            ValueType::Bytes => Value::Bytes(text.as_bytes().to_vec()),
        };
        self.validate(&raw)
    }

    fn structural_check(&self) -> DeviceResult<()> {
        let problem = |msg: &str| {
            Err(DeviceError::Configuration(format!(
                "attribute '{}' {msg}",
                self.name
            )))
        };
        if self.name.trim().is_empty() {
            return Err(DeviceError::Configuration(
                "attribute name must not be empty".to_string(),
            ));
        }
        if let (Some(min), Some(max)) = (self.constraints.min, self.constraints.max) {
            if min > max {
                return problem("has min greater than max");
            }
        }
        if self.value_type == ValueType::Enum && self.constraints.choices.is_empty() {
            return problem("is an enum without choices");
        }
        if let Some(spec) = &self.command {
            spec.check(&self.name)?;
            if self.access.readable() && spec.get_template.is_none() {
                return problem("is readable but has no get template");
            }
            if self.access.writable() && spec.set_template.is_none() {
                return problem("is writable but has no set template");
            }
        }
        if let Some(default) = &self.default {
            self.validate(default).map_err(|e| {
                DeviceError::Configuration(format!("invalid default for '{}': {e}", self.name))
            })?;
        }
        Ok(())
    }
}

/// Parse the boolean spellings instruments commonly use.
pub(crate) fn parse_bool_token(text: &str) -> Option<bool> {
    match text.trim().to_ascii_uppercase().as_str() {
        "1" | "ON" | "TRUE" | "YES" | "+1" => Some(true),
        "0" | "OFF" | "FALSE" | "NO" | "+0" => Some(false),
        _ => None,
    }
}

// =============================================================================
// StateRegistry
// =============================================================================

/// Ordered, immutable collection of descriptors for one device type.
#[derive(Debug)]
pub struct StateRegistry {
    descriptors: Vec<Arc<StateDescriptor>>,
    index: HashMap<String, usize>,
}

impl StateRegistry {
    /// Start declaring attributes.
    pub fn builder() -> StateRegistryBuilder {
        StateRegistryBuilder::default()
    }

    /// Look up a descriptor by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<StateDescriptor>> {
        self.index.get(name).map(|&i| &self.descriptors[i])
    }

    /// Descriptors in declaration order, starting with `connected`.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<StateDescriptor>> {
        self.descriptors.iter()
    }

    /// Attribute names in declaration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.name.as_str()).collect()
    }

    /// Number of attributes including `connected`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Always false; `connected` is always present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Fresh per-instance state for a new device.
    #[must_use]
    pub fn instantiate(self: &Arc<Self>) -> StateTable {
        let attributes = self
            .descriptors
            .iter()
            .map(|d| StateAttribute {
                descriptor: Arc::clone(d),
                cached_value: if d.is_local() { d.default.clone() } else { None },
                is_stale: !d.is_local(),
            })
            .collect();
        StateTable {
            registry: Arc::clone(self),
            attributes,
        }
    }
}

/// Builder for [`StateRegistry`].
#[derive(Debug, Default)]
pub struct StateRegistryBuilder {
    descriptors: Vec<StateDescriptor>,
}

impl StateRegistryBuilder {
    /// Declare an attribute. Order of calls is the registry order.
    pub fn attribute(mut self, descriptor: StateDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Declare several attributes at once.
    pub fn attributes(mut self, descriptors: impl IntoIterator<Item = StateDescriptor>) -> Self {
        self.descriptors.extend(descriptors);
        self
    }

    /// Check the declarations and freeze them.
    pub fn build(self) -> DeviceResult<StateRegistry> {
        let connected = StateDescriptor::bool(CONNECTED)
            .read_only()
            .with_help("Whether the backend is open");

        let mut descriptors = Vec::with_capacity(self.descriptors.len() + 1);
        let mut index = HashMap::new();
        index.insert(CONNECTED.to_string(), 0);
        descriptors.push(Arc::new(connected));

        for descriptor in self.descriptors {
            descriptor.structural_check()?;
            if index.contains_key(&descriptor.name) {
                return Err(DeviceError::Configuration(format!(
                    "duplicate attribute '{}'",
                    descriptor.name
                )));
            }
            index.insert(descriptor.name.clone(), descriptors.len());
            descriptors.push(Arc::new(descriptor));
        }

        Ok(StateRegistry { descriptors, index })
    }
}

// =============================================================================
// Per-instance state
// =============================================================================

/// One attribute's runtime state on a device instance.
#[derive(Debug, Clone)]
pub struct StateAttribute {
    /// Shared declaration
    pub descriptor: Arc<StateDescriptor>,
    /// Last value read or written, if any
    pub cached_value: Option<Value>,
    /// Whether the cached value may no longer reflect the instrument
    pub is_stale: bool,
}

impl StateAttribute {
    /// Record a value that is known to match the instrument.
    pub fn store(&mut self, value: Value) {
        self.cached_value = Some(value);
        self.is_stale = false;
    }
}

/// Per-device attribute table, aligned with its registry.
#[derive(Debug, Clone)]
pub struct StateTable {
    registry: Arc<StateRegistry>,
    attributes: Vec<StateAttribute>,
}

impl StateTable {
    /// Attribute by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StateAttribute> {
        self.registry.index.get(name).map(|&i| &self.attributes[i])
    }

    /// Mutable attribute by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut StateAttribute> {
        self.registry.index.get(name).map(|&i| &mut self.attributes[i])
    }

    /// All attributes in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &StateAttribute> {
        self.attributes.iter()
    }

    /// Mark every remote attribute stale, e.g. after the backend closes.
    pub fn mark_all_stale(&mut self) {
        for attr in &mut self.attributes {
            if !attr.descriptor.is_local() {
                attr.is_stale = true;
            }
        }
    }

    /// Cached values in declaration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, Option<Value>)> {
        self.attributes
            .iter()
            .map(|a| (a.descriptor.name.clone(), a.cached_value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attenuation() -> StateDescriptor {
        StateDescriptor::float("attenuation")
            .with_range(0.0, 115.0)
            .with_step(0.25)
            .with_command(CommandSpec::new("ATT?", "SETATT=${value}"))
    }

    #[test]
    fn test_float_range_and_step() {
        let d = attenuation();
        assert_eq!(d.validate(&Value::Float(10.5)).unwrap(), Value::Float(10.5));
        assert_eq!(d.validate(&Value::Int(10)).unwrap(), Value::Float(10.0));
        assert_eq!(d.validate(&Value::Float(10.6)).unwrap(), Value::Float(10.5));
        assert!(matches!(
            d.validate(&Value::Float(999.0)),
            Err(DeviceError::Validation { .. })
        ));
        assert!(d.validate(&Value::Float(f64::NAN)).is_err());
        assert!(d.validate(&Value::from("ten")).is_err());
    }

    #[test]
    fn test_snapping_never_leaves_the_range() {
        let d = StateDescriptor::float("level").with_range(0.0, 10.0).with_step(4.0);
        assert_eq!(d.validate(&Value::Float(10.0)).unwrap(), Value::Float(8.0));
        assert_eq!(d.validate(&Value::Float(9.9)).unwrap(), Value::Float(8.0));
        assert_eq!(d.validate(&Value::Float(5.0)).unwrap(), Value::Float(4.0));
        assert_eq!(d.validate(&Value::Float(0.0)).unwrap(), Value::Float(0.0));

        let offset = StateDescriptor::float("offset").with_range(-1.0, 1.0).with_step(0.75);
        assert_eq!(offset.validate(&Value::Float(1.0)).unwrap(), Value::Float(0.5));
        assert_eq!(offset.validate(&Value::Float(-1.0)).unwrap(), Value::Float(-1.0));
    }

    #[test]
    fn test_int_step_is_strict() {
        let d = StateDescriptor::int("count").with_range(0.0, 200.0).with_step(2.0);
        assert_eq!(d.validate(&Value::Int(4)).unwrap(), Value::Int(4));
        assert!(d.validate(&Value::Int(5)).is_err());
        assert!(d.validate(&Value::Float(4.5)).is_err());
    }

    #[test]
    fn test_enum_canonicalisation() {
        let d = StateDescriptor::choice("rate", ["NORMAL", "DOUBLE", "FAST"]);
        assert_eq!(d.validate(&Value::from("fast")).unwrap(), Value::from("FAST"));
        assert_eq!(d.validate(&Value::from("NORM")).unwrap(), Value::from("NORMAL"));
        assert!(d.validate(&Value::from("SLOW")).is_err());

        let exact = StateDescriptor::choice("mode", ["Auto"]).case_sensitive();
        assert!(exact.validate(&Value::from("auto")).is_err());
    }

    #[test]
    fn test_ambiguous_prefix_is_rejected() {
        let d = StateDescriptor::choice("source", ["INT", "INT1", "EXT"]);
        assert_eq!(d.validate(&Value::from("int")).unwrap(), Value::from("INT"));
        assert!(d.constraints.canonical_choice("IN").is_none());
    }

    #[test]
    fn test_parse_text() {
        let d = StateDescriptor::bool("output");
        assert_eq!(d.parse_text("ON").unwrap(), Value::Bool(true));
        assert_eq!(d.parse_text("0").unwrap(), Value::Bool(false));
        assert!(d.parse_text("maybe").is_err());
        assert_eq!(attenuation().parse_text(" 10.5 ").unwrap(), Value::Float(10.5));
    }

    #[test]
    fn test_registry_order_and_connected() {
        let registry = StateRegistry::builder()
            .attribute(attenuation())
            .attribute(StateDescriptor::string("serial_number").read_only().with_command(
                CommandSpec::query("SN?"),
            ))
            .build()
            .unwrap();
        assert_eq!(registry.names(), vec!["connected", "attenuation", "serial_number"]);
        let connected = registry.get(CONNECTED).unwrap();
        assert_eq!(connected.access, Access::ReadOnly);
        assert!(connected.is_local());
    }

    #[test]
    fn test_registry_rejects_bad_declarations() {
        let dup = StateRegistry::builder()
            .attribute(attenuation())
            .attribute(attenuation())
            .build();
        assert!(matches!(dup, Err(DeviceError::Configuration(_))));

        let reserved = StateRegistry::builder()
            .attribute(StateDescriptor::bool(CONNECTED))
            .build();
        assert!(reserved.is_err());

        let no_setter = StateRegistry::builder()
            .attribute(StateDescriptor::float("power").with_command(CommandSpec::query("POW?")))
            .build();
        assert!(no_setter.is_err());

        let bad_default = StateRegistry::builder()
            .attribute(StateDescriptor::int("port").with_range(1.0, 4.0).with_default(9))
            .build();
        assert!(bad_default.is_err());
    }

    #[test]
    fn test_state_table_staleness() {
        let registry = Arc::new(
            StateRegistry::builder()
                .attribute(attenuation())
                .attribute(StateDescriptor::int("port").with_default(5201))
                .build()
                .unwrap(),
        );
        let mut table = registry.instantiate();
        assert!(table.get("attenuation").unwrap().is_stale);
        assert_eq!(table.get("port").unwrap().cached_value, Some(Value::Int(5201)));

        table.get_mut("attenuation").unwrap().store(Value::Float(3.0));
        assert!(!table.get("attenuation").unwrap().is_stale);

        table.mark_all_stale();
        assert!(table.get("attenuation").unwrap().is_stale);
        assert!(!table.get("port").unwrap().is_stale);
        assert_eq!(table.snapshot().len(), 3);
    }
}
