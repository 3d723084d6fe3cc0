//! Command translation between typed attribute values and instrument command bytes.
//!
//! A [`CommandSpec`] is the declarative half: a get template, a set template and a
//! [`DecodeRule`] describing where the value sits in a reply. A [`CommandTranslator`] is the
//! behavioural half that turns a descriptor and value into bytes and back. Most instruments
//! are served by [`TemplateTranslator`]; vendors whose replies are framed in some envelope
//! supply their own implementation of the trait.
//!
//! Templates use `${name}` placeholders, with an optional format specifier after a colon:
//!
//! | Placeholder       | Output for `42.0` |
//! |-------------------|-------------------|
//! | `${value}`        | `42`              |
//! | `${value:04d}`    | `0042`            |
//! | `${value:X}`      | `2A`              |
//! | `${value:.3f}`    | `42.000`          |

use crate::error::{DeviceError, DeviceResult};
use crate::state::{parse_bool_token, StateDescriptor};
use crate::value::{Value, ValueType};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

/// Cached regex for template interpolation (compiled once).
/// Matches patterns like `${value}` or `${value:format}`.
static INTERPOLATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("Invalid interpolation regex"));

/// Leading number with optional trailing unit text.
static NUMBER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([+-]?(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?)\s*(.*)$")
        .expect("Invalid number regex")
});

/// Compiled reply patterns, keyed by source text.
static PATTERN_CACHE: LazyLock<Mutex<HashMap<String, Regex>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

// =============================================================================
// CommandSpec
// =============================================================================

/// Where the value sits inside a reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum DecodeRule {
    /// The whole reply is the value.
    #[default]
    Typed,
    /// Split on a delimiter and take one field.
    Split {
        /// Field separator
        delimiter: String,
        /// Zero-based field index
        index: usize,
    },
    /// Take a fixed character window.
    Fixed {
        /// First character
        start: usize,
        /// Number of characters
        width: usize,
    },
    /// Regex with a `value` named group (or the first group, or the whole match).
    Pattern {
        /// Regular expression source
        regex: String,
    },
}

/// Boolean spellings used when formatting a bool into a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoolTokens {
    /// Text for `true`
    pub on: String,
    /// Text for `false`
    pub off: String,
}

impl Default for BoolTokens {
    fn default() -> Self {
        Self {
            on: "1".to_string(),
            off: "0".to_string(),
        }
    }
}

/// Command grammar for one attribute. Immutable and shared by all devices of a type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Query sent by `get`
    #[serde(default, rename = "get")]
    pub get_template: Option<String>,
    /// Command sent by `set`, with `${value}` placeholder
    #[serde(default, rename = "set")]
    pub set_template: Option<String>,
    /// Reply extraction rule
    #[serde(default)]
    pub decode: DecodeRule,
    /// Read the value back after every write
    #[serde(default)]
    pub confirm: bool,
    /// Bool spellings for set commands
    #[serde(default)]
    pub bool_tokens: BoolTokens,
}

impl CommandSpec {
    /// Read-write attribute with explicit templates.
    pub fn new(get: impl Into<String>, set: impl Into<String>) -> Self {
        Self {
            get_template: Some(get.into()),
            set_template: Some(set.into()),
            decode: DecodeRule::Typed,
            confirm: false,
            bool_tokens: BoolTokens::default(),
        }
    }

    /// Query-only attribute.
    pub fn query(get: impl Into<String>) -> Self {
        Self {
            set_template: None,
            ..Self::new(get, String::new())
        }
    }

    /// Write-only attribute.
    pub fn write(set: impl Into<String>) -> Self {
        Self {
            get_template: None,
            ..Self::new(String::new(), set)
        }
    }

    /// SCPI-style key: `KEY?` to read, `KEY ${value}` to write.
    pub fn scpi(key: &str) -> Self {
        Self::new(format!("{key}?"), format!("{key} ${{value}}"))
    }

    /// Replace the decode rule.
    pub fn with_decode(mut self, decode: DecodeRule) -> Self {
        self.decode = decode;
        self
    }

    /// Read back after writes.
    pub fn confirmed(mut self) -> Self {
        self.confirm = true;
        self
    }

    /// Use other words than `1`/`0` for booleans.
    pub fn with_bool_tokens(mut self, on: impl Into<String>, off: impl Into<String>) -> Self {
        self.bool_tokens = BoolTokens {
            on: on.into(),
            off: off.into(),
        };
        self
    }

    /// Check the spec for mistakes that would only show up at run time.
    pub fn check(&self, name: &str) -> DeviceResult<()> {
        if let DecodeRule::Pattern { regex } = &self.decode {
            Regex::new(regex).map_err(|e| {
                DeviceError::Configuration(format!("invalid reply pattern for '{name}': {e}"))
            })?;
        }
        if let DecodeRule::Split { delimiter, .. } = &self.decode {
            if delimiter.is_empty() {
                return Err(DeviceError::Configuration(format!(
                    "empty split delimiter for '{name}'"
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Template rendering
// =============================================================================

/// Render a template, substituting `${name}` and `${name:fmt}` placeholders.
///
/// Byte values are spliced in raw; everything else is formatted as text.
pub fn render_template(
    template: &str,
    params: &[(&str, &Value)],
    bool_tokens: &BoolTokens,
) -> DeviceResult<Vec<u8>> {
    let mut out = Vec::with_capacity(template.len() + 16);
    let mut last = 0;

    for caps in INTERPOLATION_REGEX.captures_iter(template) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.extend_from_slice(template[last..whole.start()].as_bytes());
        last = whole.end();

        let (key, format) = match inner.as_str().split_once(':') {
            Some((key, format)) => (key, Some(format)),
            None => (inner.as_str(), None),
        };
        let value = params
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| *value)
            .ok_or_else(|| {
                DeviceError::Configuration(format!(
                    "template '{template}' references unknown placeholder '{key}'"
                ))
            })?;

        match (value, format) {
            (Value::Bytes(bytes), None) => out.extend_from_slice(bytes),
            (value, format) => {
                out.extend_from_slice(format_value(key, value, format, bool_tokens)?.as_bytes())
            }
        }
    }
    out.extend_from_slice(template[last..].as_bytes());
    Ok(out)
}

fn format_value(
    key: &str,
    value: &Value,
    format: Option<&str>,
    bool_tokens: &BoolTokens,
) -> DeviceResult<String> {
    let Some(format) = format else {
        return Ok(match value {
            Value::Bool(true) => bool_tokens.on.clone(),
            Value::Bool(false) => bool_tokens.off.clone(),
            other => other.to_string(),
        });
    };

    let number = value.as_f64().ok_or_else(|| {
        DeviceError::validation(key, format!("format '{format}' needs a number"))
    })?;
    let width = |suffix: char| {
        format
            .trim_start_matches('0')
            .trim_end_matches(suffix)
            .parse::<usize>()
            .unwrap_or(0)
    };

    // Integer formats refuse what they cannot represent rather than saturating.
    let integer = || -> DeviceResult<i128> {
        if let Value::Int(exact) = value {
            return Ok(i128::from(*exact));
        }
        let rounded = number.round();
        if !rounded.is_finite() || rounded.abs() >= 2f64.powi(127) {
            return Err(DeviceError::validation(
                key,
                format!("{number} cannot be written with format '{format}'"),
            ));
        }
        Ok(rounded as i128)
    };
    let fit = |n: i128| {
        DeviceError::validation(key, format!("{n} does not fit format '{format}'"))
    };

    match format {
        f if f.ends_with('X') => {
            let n = integer()?;
            let n = u64::try_from(n).map_err(|_| fit(n))?;
            Ok(format!("{n:0w$X}", w = width('X')))
        }
        f if f.ends_with('x') => {
            let n = integer()?;
            let n = u64::try_from(n).map_err(|_| fit(n))?;
            Ok(format!("{n:0w$x}", w = width('x')))
        }
        f if f.ends_with('d') => {
            let n = integer()?;
            let n = i64::try_from(n).map_err(|_| fit(n))?;
            Ok(format!("{n:0w$}", w = width('d')))
        }
        f if f.ends_with('e') => Ok(format!("{number:e}")),
        f if f.ends_with('f') => {
            let precision = f
                .trim_start_matches('.')
                .trim_end_matches('f')
                .parse::<usize>()
                .unwrap_or(6);
            Ok(format!("{number:.precision$}"))
        }
        other => Err(DeviceError::Configuration(format!(
            "unsupported format specifier '{other}' for '{key}'"
        ))),
    }
}

// =============================================================================
// Translator
// =============================================================================

/// Converts attribute operations into command bytes and replies into values.
pub trait CommandTranslator: Send + Sync + fmt::Debug {
    /// Bytes of the query that reads `descriptor`.
    fn encode_get(&self, descriptor: &StateDescriptor) -> DeviceResult<Vec<u8>>;

    /// Bytes of the command that writes `value`. The value is validated first; on
    /// failure nothing is produced.
    fn encode_set(&self, descriptor: &StateDescriptor, value: &Value) -> DeviceResult<Vec<u8>>;

    /// Parse a reply into the descriptor's type, in canonical form.
    fn decode(&self, descriptor: &StateDescriptor, raw: &[u8]) -> DeviceResult<Value>;

    /// Inspect the acknowledgement an instrument sends after every write. Only called for
    /// device types that declare acknowledged writes.
    fn check_ack(&self, _reply: &[u8]) -> DeviceResult<()> {
        Ok(())
    }
}

/// Template-driven translator with configurable error markers.
#[derive(Debug, Clone, Default)]
pub struct TemplateTranslator {
    error_markers: Vec<String>,
    ack: Option<String>,
}

impl TemplateTranslator {
    /// Translator with no error markers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replies starting with any of these markers are reported as decode errors.
    pub fn with_error_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.error_markers = markers.into_iter().map(Into::into).collect();
        self
    }

    /// Acknowledgement that marks a successful write.
    pub fn with_ack(mut self, ack: impl Into<String>) -> Self {
        self.ack = Some(ack.into());
        self
    }

    fn spec<'a>(&self, descriptor: &'a StateDescriptor) -> DeviceResult<&'a CommandSpec> {
        descriptor.command.as_ref().ok_or_else(|| {
            DeviceError::Configuration(format!(
                "attribute '{}' has no command binding",
                descriptor.name
            ))
        })
    }

    /// Error marker the reply starts with, if any.
    #[must_use]
    pub fn check_for_error(&self, reply: &str) -> Option<&str> {
        let upper = reply.to_ascii_uppercase();
        self.error_markers
            .iter()
            .find(|m| upper.starts_with(&m.to_ascii_uppercase()))
            .map(String::as_str)
    }
}

impl CommandTranslator for TemplateTranslator {
    fn encode_get(&self, descriptor: &StateDescriptor) -> DeviceResult<Vec<u8>> {
        let spec = self.spec(descriptor)?;
        let template = spec.get_template.as_deref().ok_or_else(|| DeviceError::Access {
            name: descriptor.name.clone(),
            message: "has no read command".to_string(),
        })?;
        render_template(template, &[], &spec.bool_tokens)
    }

    fn encode_set(&self, descriptor: &StateDescriptor, value: &Value) -> DeviceResult<Vec<u8>> {
        let spec = self.spec(descriptor)?;
        let template = spec.set_template.as_deref().ok_or_else(|| DeviceError::Access {
            name: descriptor.name.clone(),
            message: "has no write command".to_string(),
        })?;
        let canonical = descriptor.validate(value)?;
        render_template(template, &[("value", &canonical)], &spec.bool_tokens)
    }

    fn decode(&self, descriptor: &StateDescriptor, raw: &[u8]) -> DeviceResult<Value> {
        if descriptor.value_type == ValueType::Bytes {
            return Ok(Value::Bytes(raw.to_vec()));
        }
        let text = String::from_utf8_lossy(raw);
        let reply = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');

        if let Some(marker) = self.check_for_error(reply) {
            return Err(DeviceError::decode(
                &descriptor.name,
                format!("instrument reported an error ({marker})"),
                reply,
            ));
        }

        let rule = descriptor
            .command
            .as_ref()
            .map(|s| &s.decode)
            .unwrap_or(&DecodeRule::Typed);
        let token = extract(descriptor, rule, reply)?;
        cast(descriptor, &token, reply)
    }

    fn check_ack(&self, reply: &[u8]) -> DeviceResult<()> {
        let text = String::from_utf8_lossy(reply);
        let reply = text.trim();
        if let Some(marker) = self.check_for_error(reply) {
            return Err(DeviceError::command(format!(
                "instrument rejected command ({marker}): {reply}"
            )));
        }
        match &self.ack {
            Some(ack) if ack != reply => Err(DeviceError::command(format!(
                "instrument rejected command: expected '{ack}', got '{reply}'"
            ))),
            _ => Ok(()),
        }
    }
}

/// Pull the value text out of a reply according to `rule`.
pub(crate) fn extract(
    descriptor: &StateDescriptor,
    rule: &DecodeRule,
    reply: &str,
) -> DeviceResult<String> {
    match rule {
        DecodeRule::Typed => Ok(reply.to_string()),
        DecodeRule::Split { delimiter, index } => reply
            .split(delimiter.as_str())
            .nth(*index)
            .map(|field| field.trim().to_string())
            .ok_or_else(|| {
                DeviceError::decode(&descriptor.name, format!("no field {index}"), reply)
            }),
        DecodeRule::Fixed { start, width } => {
            let field: String = reply.chars().skip(*start).take(*width).collect();
            if field.chars().count() < *width {
                return Err(DeviceError::decode(
                    &descriptor.name,
                    format!("reply shorter than {} characters", start + width),
                    reply,
                ));
            }
            Ok(field.trim().to_string())
        }
        DecodeRule::Pattern { regex } => {
            let mut cache = PATTERN_CACHE.lock();
            if !cache.contains_key(regex) {
                let compiled = Regex::new(regex).map_err(|e| {
                    DeviceError::Configuration(format!("invalid reply pattern: {e}"))
                })?;
                cache.insert(regex.clone(), compiled);
            }
            let Some(compiled) = cache.get(regex) else {
                return Err(DeviceError::Configuration("reply pattern cache miss".into()));
            };
            let caps = compiled.captures(reply).ok_or_else(|| {
                DeviceError::decode(&descriptor.name, "reply does not match pattern", reply)
            })?;
            let found = caps
                .name("value")
                .or_else(|| caps.get(1))
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().trim().to_string());
            found.ok_or_else(|| DeviceError::decode(&descriptor.name, "empty match", reply))
        }
    }
}

/// Convert extracted text into the descriptor's type.
pub(crate) fn cast(descriptor: &StateDescriptor, token: &str, reply: &str) -> DeviceResult<Value> {
    let fail = |msg: String| DeviceError::decode(&descriptor.name, msg, reply);

    match descriptor.value_type {
        ValueType::Bool => parse_bool_token(token)
            .map(Value::Bool)
            .ok_or_else(|| fail(format!("'{token}' is not a boolean"))),
        ValueType::Int => {
            let number = parse_number(descriptor, token).map_err(fail)?;
            if number.fract() != 0.0 {
                return Err(fail(format!("'{token}' is not an integer")));
            }
            Ok(Value::Int(number as i64))
        }
        ValueType::Float => parse_number(descriptor, token)
            .map(Value::Float)
            .map_err(fail),
        ValueType::Enum => descriptor
            .constraints
            .canonical_choice(unquote(token))
            .map(|c| Value::String(c.to_string()))
            .ok_or_else(|| fail(format!("'{token}' is not a declared choice"))),
        ValueType::String => Ok(Value::String(unquote(token).to_string())),
        ValueType::Bytes => Ok(Value::Bytes(token.as_bytes().to_vec())),
    }
}

fn parse_number(descriptor: &StateDescriptor, token: &str) -> Result<f64, String> {
    let caps = NUMBER_REGEX
        .captures(token.trim())
        .ok_or_else(|| format!("'{token}' is not a number"))?;
    let number = caps
        .get(1)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .ok_or_else(|| format!("'{token}' is not a number"))?;
    let suffix = caps.get(2).map_or("", |m| m.as_str().trim());
    if suffix.is_empty() {
        return Ok(number);
    }
    match &descriptor.unit {
        Some(unit) if unit.eq_ignore_ascii_case(suffix) => Ok(number),
        Some(unit) => Err(format!("unit '{suffix}' does not match '{unit}'")),
        None => Err(format!("unexpected trailing text '{suffix}'")),
    }
}

fn unquote(token: &str) -> &str {
    let t = token.trim();
    t.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| t.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attenuation() -> StateDescriptor {
        StateDescriptor::float("attenuation")
            .with_range(0.0, 115.0)
            .with_step(0.25)
            .with_unit("dB")
            .with_command(CommandSpec::new(":ATT?", ":SETATT=${value}"))
    }

    #[test]
    fn test_encode_set_formats_value() {
        let t = TemplateTranslator::new();
        let bytes = t.encode_set(&attenuation(), &Value::Float(10.5)).unwrap();
        assert_eq!(bytes, b":SETATT=10.5");
    }

    #[test]
    fn test_encode_set_rejects_before_encoding() {
        let t = TemplateTranslator::new();
        let err = t.encode_set(&attenuation(), &Value::Float(999.0)).unwrap_err();
        assert!(matches!(err, DeviceError::Validation { .. }));
    }

    #[test]
    fn test_encode_bool_tokens() {
        let d = StateDescriptor::bool("continuous")
            .with_command(CommandSpec::scpi("INIT:CONT").with_bool_tokens("ON", "OFF"));
        let t = TemplateTranslator::new();
        assert_eq!(t.encode_set(&d, &Value::Bool(true)).unwrap(), b"INIT:CONT ON");
        assert_eq!(t.encode_get(&d).unwrap(), b"INIT:CONT?");
    }

    #[test]
    fn test_format_specifiers() {
        let tokens = BoolTokens::default();
        let v = Value::Float(42.0);
        let render = |t: &str| render_template(t, &[("value", &v)], &tokens).unwrap();
        assert_eq!(render("${value:04d}"), b"0042");
        assert_eq!(render("${value:X}"), b"2A");
        assert_eq!(render("${value:02x}"), b"2a");
        assert_eq!(render("P${value:.3f}"), b"P42.000");
        assert!(render_template("${other}", &[("value", &v)], &tokens).is_err());
    }

    #[test]
    fn test_integer_formats_refuse_unrepresentable_values() {
        let tokens = BoolTokens::default();
        let render = |t: &str, v: Value| render_template(t, &[("value", &v)], &tokens);

        for value in [Value::Int(-1), Value::Float(-0.6)] {
            let err = render("${value:X}", value).unwrap_err();
            assert!(matches!(err, DeviceError::Validation { .. }));
        }
        assert!(render("${value:x}", Value::Float(1e30)).is_err());
        assert!(render("${value:d}", Value::Float(1e19)).is_err());
        assert!(render("${value:d}", Value::Float(f64::INFINITY)).is_err());

        assert_eq!(render("${value:d}", Value::Int(-5)).unwrap(), b"-5");
        assert_eq!(render("${value:X}", Value::Float(-0.4)).unwrap(), b"0");
        assert_eq!(render("${value:X}", Value::Int(i64::MAX)).unwrap(), b"7FFFFFFFFFFFFFFF");
    }

    #[test]
    fn test_bytes_are_spliced_raw() {
        let payload = Value::Bytes(vec![0x02, 0xff]);
        let out = render_template("W${value};", &[("value", &payload)], &BoolTokens::default())
            .unwrap();
        assert_eq!(out, vec![b'W', 0x02, 0xff, b';']);
    }

    #[test]
    fn test_decode_strips_units_and_terminators() {
        let t = TemplateTranslator::new();
        let d = attenuation();
        assert_eq!(t.decode(&d, b"10.5\r\n").unwrap(), Value::Float(10.5));
        assert_eq!(t.decode(&d, b"+1.05E+01 dB").unwrap(), Value::Float(10.5));
        assert!(matches!(
            t.decode(&d, b"10.5 dBm"),
            Err(DeviceError::Decode { .. })
        ));
        assert!(t.decode(&d, b"garbage").is_err());
    }

    #[test]
    fn test_decode_canonical_bool_and_enum() {
        let t = TemplateTranslator::new();
        let b = StateDescriptor::bool("output").with_command(CommandSpec::scpi("OUTP:TRIG"));
        assert_eq!(t.decode(&b, b"ON").unwrap(), Value::Bool(true));
        assert_eq!(t.decode(&b, b"0\n").unwrap(), Value::Bool(false));

        let e = StateDescriptor::choice("rate", ["NORMAL", "DOUBLE", "FAST"])
            .with_command(CommandSpec::scpi("SENS:MRAT"));
        assert_eq!(t.decode(&e, b"NORM").unwrap(), Value::from("NORMAL"));
        assert_eq!(t.decode(&e, b"fast").unwrap(), Value::from("FAST"));
        assert!(t.decode(&e, b"TURBO").is_err());
    }

    #[test]
    fn test_decode_rules() {
        let t = TemplateTranslator::new();
        let split = StateDescriptor::float("power").read_only().with_command(
            CommandSpec::query("FETC?").with_decode(DecodeRule::Split {
                delimiter: ",".into(),
                index: 1,
            }),
        );
        assert_eq!(t.decode(&split, b"-3.5,-4.25").unwrap(), Value::Float(-4.25));
        assert!(t.decode(&split, b"-3.5").is_err());

        let fixed = StateDescriptor::int("code").read_only().with_command(
            CommandSpec::query("ST?").with_decode(DecodeRule::Fixed { start: 2, width: 3 }),
        );
        assert_eq!(t.decode(&fixed, b"ST042XX").unwrap(), Value::Int(42));

        let pattern = StateDescriptor::string("model").read_only().with_command(
            CommandSpec::query("*IDN?").with_decode(DecodeRule::Pattern {
                regex: r"^[^,]+,(?P<value>[^,]+),".into(),
            }),
        );
        assert_eq!(
            t.decode(&pattern, b"Keysight,U2001A,MY123,A1").unwrap(),
            Value::from("U2001A")
        );
    }

    #[test]
    fn test_error_markers() {
        let t = TemplateTranslator::new().with_error_markers(["ERR", "-113"]);
        let d = attenuation();
        let err = t.decode(&d, b"-113,\"Undefined header\"").unwrap_err();
        assert!(matches!(err, DeviceError::Decode { .. }));
        assert!(t.check_for_error("ERROR: bad").is_some());
        assert!(t.check_for_error("10.5").is_none());
    }

    #[test]
    fn test_write_acknowledgement() {
        let t = TemplateTranslator::new().with_ack("1").with_error_markers(["ERR"]);
        assert!(t.check_ack(b"1\r\n").is_ok());
        assert!(matches!(t.check_ack(b"0"), Err(DeviceError::Command { .. })));
        assert!(t.check_ack(b"ERR").is_err());
        assert!(TemplateTranslator::new().check_ack(b"anything").is_ok());
    }

    #[test]
    fn test_string_unquoting() {
        let t = TemplateTranslator::new();
        let d = StateDescriptor::string("name").read_only().with_command(CommandSpec::query("N?"));
        assert_eq!(t.decode(&d, b"\"RCDAT-6000-110\"").unwrap(), Value::from("RCDAT-6000-110"));
    }
}
