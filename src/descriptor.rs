use std::fmt;

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

use crate::module::ModuleParameters;

/// Keys that name the module implementation. `module` wins when both exist.
const MODULE_KEYS: [&str; 2] = ["module", "type"];

/// Layout and identity fields set by the program editor. Never execution inputs.
const PRESENTATION_KEYS: [&str; 4] = ["x", "y", "name", "id"];

/// One step exactly as written in the program file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepSpec(pub Map<String, Value>);

impl StepSpec {
    pub fn module_key(&self) -> Option<&'static str> {
        MODULE_KEYS.into_iter().find(|key| self.0.contains_key(*key))
    }

    pub fn module(&self) -> Option<&str> {
        self.module_key()
            .and_then(|key| self.0.get(key))
            .and_then(Value::as_str)
    }

    /// Human readable label for logs: `name`, then `id`, then the module type.
    pub fn label(&self) -> String {
        for key in ["name", "id"] {
            match self.0.get(key) {
                Some(Value::String(s)) if !s.is_empty() => return s.clone(),
                Some(Value::Number(n)) => return n.to_string(),
                _ => {}
            }
        }
        self.module().unwrap_or("<unnamed>").to_string()
    }
}

impl From<Map<String, Value>> for StepSpec {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Normalized invocation of a step.
///
/// Two descriptors are equivalent iff their module types and normalized
/// parameter maps are structurally equal. Key order never matters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub module: String,
    #[serde(default)]
    pub parameters: ModuleParameters,
}

impl Descriptor {
    pub fn new(module: impl Into<String>, parameters: ModuleParameters) -> Self {
        let parameters = parameters
            .into_iter()
            .map(|(key, value)| (key, normalize_value(value)))
            .collect();
        Self {
            module: module.into(),
            parameters,
        }
    }

    pub fn from_spec(spec: &StepSpec) -> Result<Self> {
        let key = spec
            .module_key()
            .ok_or_else(|| anyhow!("Step is missing a 'module' (or 'type') field"))?;
        let module = match spec.0.get(key) {
            Some(Value::String(name)) if !name.trim().is_empty() => name.trim().to_string(),
            other => bail!(
                "Step field '{key}' must be a non-empty string, found {}",
                other.cloned().unwrap_or(Value::Null)
            ),
        };

        let parameters = spec
            .0
            .iter()
            .filter(|(name, _)| name.as_str() != key && !PRESENTATION_KEYS.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Ok(Self::new(module, parameters))
    }

    /// SHA-256 over the canonical JSON encoding.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.module.as_bytes());
        hasher.update([0u8]);
        let serialized = serde_json::to_vec(&self.parameters).unwrap_or_default();
        hasher.update(serialized);
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.module)?;
        for (idx, (key, value)) in self.parameters.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str(")")
    }
}

/// Numeric-looking strings become numbers, `true`/`false` in any case become
/// booleans. Arrays and objects are normalized element-wise.
pub fn normalize_value(value: Value) -> Value {
    match value {
        Value::String(text) => normalize_string(text),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, normalize_value(value)))
                .collect(),
        ),
        other => other,
    }
}

fn normalize_string(text: String) -> Value {
    if text.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if text.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    parse_number(&text)
        .map(Value::Number)
        .unwrap_or(Value::String(text))
}

/// Accepts unsigned decimals: `12`, `0.5`, `.5`. Signs, exponents and
/// surrounding whitespace keep the value a string.
fn parse_number(text: &str) -> Option<Number> {
    let bytes = text.as_bytes();
    if !bytes.last()?.is_ascii_digit() {
        return None;
    }
    let dots = bytes.iter().filter(|b| **b == b'.').count();
    if dots > 1 || !bytes.iter().all(|b| b.is_ascii_digit() || *b == b'.') {
        return None;
    }
    if dots == 0
        && let Ok(integer) = text.parse::<u64>()
    {
        return Some(Number::from(integer));
    }
    text.parse::<f64>().ok().and_then(Number::from_f64)
}
