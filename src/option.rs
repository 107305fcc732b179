//! Typed module options and the option validator.
//!
//! A module declares an ordered schema of [`OptionSpec`]s. The session holds
//! raw user-supplied strings; [`validate`] turns them into
//! [`ResolvedOptions`] in three passes:
//!
//! ```text
//!   unknown names ──→ coerce + rule per option ──→ required check
//! ```
//!
//! Validation is a pure function over `(schema, values)`.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ShellError, ShellResult, ValidationError};

/// Option names the shell reserves for session-level settings.
pub const RESERVED_NAMES: &[&str] = &["BACKEND", "SHOTS"];

/// Declared type of an option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionKind {
    String,
    Int,
    Float,
    Bool,
    /// One of a fixed set of choices (case-sensitive).
    Enum(Vec<String>),
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionKind::String => write!(f, "string"),
            OptionKind::Int => write!(f, "int"),
            OptionKind::Float => write!(f, "float"),
            OptionKind::Bool => write!(f, "bool"),
            OptionKind::Enum(choices) => write!(f, "one of [{}]", choices.join(", ")),
        }
    }
}

/// Validation rule applied after type coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptionRule {
    /// Inclusive numeric range.
    Range { min: f64, max: f64 },
    /// String must fully match the pattern.
    Pattern(String),
    /// String must be one of the listed values.
    OneOf(Vec<String>),
}

/// A typed option value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl OptionValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            OptionValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            OptionValue::Float(v) => Some(*v),
            #[allow(clippy::cast_precision_loss)]
            OptionValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(v) => write!(f, "{v}"),
            OptionValue::Int(v) => write!(f, "{v}"),
            OptionValue::Float(v) => write!(f, "{v}"),
            OptionValue::String(v) => write!(f, "{v}"),
        }
    }
}

/// Declaration of a single module option.
///
/// Immutable once declared; only the session-held value changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionSpec {
    /// Name, unique within the module.
    pub name: String,
    /// Declared type.
    pub kind: OptionKind,
    /// Default used when no explicit value is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<OptionValue>,
    /// Whether a value (explicit or default) must be present.
    pub required: bool,
    /// Rule checked after coercion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<OptionRule>,
    /// One-line help text.
    #[serde(default)]
    pub description: String,
}

impl OptionSpec {
    /// Declare an optional option with no default.
    pub fn new(name: impl Into<String>, kind: OptionKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            required: false,
            rule: None,
            description: String::new(),
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, OptionKind::String)
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, OptionKind::Int)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, OptionKind::Float)
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, OptionKind::Bool)
    }

    pub fn choice<S: Into<String>>(
        name: impl Into<String>,
        choices: impl IntoIterator<Item = S>,
    ) -> Self {
        Self::new(
            name,
            OptionKind::Enum(choices.into_iter().map(Into::into).collect()),
        )
    }

    /// Mark the option as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: OptionValue) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_rule(mut self, rule: OptionRule) -> Self {
        self.rule = Some(rule);
        self
    }

    /// Shorthand for an inclusive [`OptionRule::Range`].
    pub fn with_range(self, min: f64, max: f64) -> Self {
        self.with_rule(OptionRule::Range { min, max })
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Coerce a raw string to this option's declared type.
    pub fn coerce(&self, raw: &str) -> Result<OptionValue, ValidationError> {
        let raw = raw.trim();
        let mismatch = || ValidationError::TypeMismatch {
            name: self.name.clone(),
            expected: self.kind.to_string(),
            raw: raw.to_string(),
        };
        match &self.kind {
            OptionKind::String => Ok(OptionValue::String(raw.to_string())),
            OptionKind::Int => raw.parse().map(OptionValue::Int).map_err(|_| mismatch()),
            OptionKind::Float => raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(OptionValue::Float)
                .ok_or_else(mismatch),
            OptionKind::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(OptionValue::Bool(true)),
                "false" | "no" | "off" | "0" => Ok(OptionValue::Bool(false)),
                _ => Err(mismatch()),
            },
            OptionKind::Enum(choices) => {
                if choices.iter().any(|c| c == raw) {
                    Ok(OptionValue::String(raw.to_string()))
                } else {
                    Err(mismatch())
                }
            }
        }
    }

    /// Check a typed value against the declared type and rule.
    pub fn check(&self, value: &OptionValue) -> Result<(), ValidationError> {
        let violation = |reason: String| ValidationError::RuleViolation {
            name: self.name.clone(),
            reason,
        };

        let type_ok = match (&self.kind, value) {
            (OptionKind::String, OptionValue::String(_))
            | (OptionKind::Int, OptionValue::Int(_))
            | (OptionKind::Float, OptionValue::Float(_) | OptionValue::Int(_))
            | (OptionKind::Bool, OptionValue::Bool(_)) => true,
            (OptionKind::Enum(choices), OptionValue::String(s)) => choices.contains(s),
            _ => false,
        };
        if !type_ok {
            return Err(ValidationError::TypeMismatch {
                name: self.name.clone(),
                expected: self.kind.to_string(),
                raw: value.to_string(),
            });
        }

        match &self.rule {
            None => Ok(()),
            Some(OptionRule::Range { min, max }) => match value.as_float() {
                Some(v) if v >= *min && v <= *max => Ok(()),
                Some(v) => Err(violation(format!("{v} is outside {min}..={max}"))),
                None => Err(violation("range rule on a non-numeric value".into())),
            },
            Some(OptionRule::Pattern(pattern)) => {
                let re = compile_anchored(pattern).map_err(|e| violation(e.to_string()))?;
                if re.is_match(&value.to_string()) {
                    Ok(())
                } else {
                    Err(violation(format!("'{value}' does not match /{pattern}/")))
                }
            }
            Some(OptionRule::OneOf(allowed)) => {
                let s = value.to_string();
                if allowed.contains(&s) {
                    Ok(())
                } else {
                    Err(violation(format!(
                        "'{s}' is not one of [{}]",
                        allowed.join(", ")
                    )))
                }
            }
        }
    }
}

fn compile_anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

/// Option values accepted by the validator for one module.
///
/// Only [`validate`] constructs this, so holding one proves every required
/// option is present and every value passed its rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedOptions {
    module_id: String,
    values: BTreeMap<String, OptionValue>,
}

impl ResolvedOptions {
    /// Module these options were resolved against.
    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.values.get(name)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(OptionValue::as_int)
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(OptionValue::as_float)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(OptionValue::as_bool)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(OptionValue::as_str)
    }

    /// Snapshot of all resolved values, in name order.
    pub fn values(&self) -> &BTreeMap<String, OptionValue> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Validate raw option values against a module schema.
///
/// Unknown names are rejected before anything else so a typo never reaches
/// a remote job. Values are then coerced and rule-checked in schema order;
/// finally every required option must have an explicit value or a default.
pub fn validate(
    module_id: &str,
    schema: &[OptionSpec],
    proposed: &BTreeMap<String, String>,
) -> Result<ResolvedOptions, ValidationError> {
    if let Some(name) = proposed
        .keys()
        .find(|name| !schema.iter().any(|spec| &spec.name == *name))
    {
        return Err(ValidationError::UnknownOption {
            module: module_id.to_string(),
            name: name.clone(),
        });
    }

    let mut values = BTreeMap::new();
    for spec in schema {
        let value = match proposed.get(&spec.name) {
            Some(raw) => Some(spec.coerce(raw)?),
            None => spec.default.clone(),
        };
        if let Some(value) = value {
            spec.check(&value)?;
            values.insert(spec.name.clone(), value);
        }
    }

    if let Some(missing) = schema
        .iter()
        .find(|spec| spec.required && !values.contains_key(&spec.name))
    {
        return Err(ValidationError::MissingRequired {
            name: missing.name.clone(),
        });
    }

    Ok(ResolvedOptions {
        module_id: module_id.to_string(),
        values,
    })
}

/// Check a schema for internal consistency.
///
/// Run once per module at registration; any problem is a startup bug and
/// reported as [`ShellError::Fatal`].
pub fn check_schema(module_id: &str, schema: &[OptionSpec]) -> ShellResult<()> {
    let fatal = |msg: String| Err(ShellError::Fatal(format!("module '{module_id}': {msg}")));

    for (i, spec) in schema.iter().enumerate() {
        if spec.name.trim().is_empty() || spec.name.contains(char::is_whitespace) {
            return fatal(format!("invalid option name '{}'", spec.name));
        }
        if RESERVED_NAMES
            .iter()
            .any(|r| r.eq_ignore_ascii_case(&spec.name))
        {
            return fatal(format!("option name '{}' is reserved", spec.name));
        }
        if schema[..i].iter().any(|other| other.name == spec.name) {
            return fatal(format!("duplicate option '{}'", spec.name));
        }
        if let OptionKind::Enum(choices) = &spec.kind {
            if choices.is_empty() {
                return fatal(format!("enum option '{}' has no choices", spec.name));
            }
        }
        if let Some(OptionRule::Pattern(pattern)) = &spec.rule {
            if let Err(e) = compile_anchored(pattern) {
                return fatal(format!("option '{}' has invalid pattern: {e}", spec.name));
            }
        }
        if let Some(OptionRule::Range { min, max }) = &spec.rule {
            if min > max {
                return fatal(format!("option '{}' has empty range", spec.name));
            }
        }
        if let Some(default) = &spec.default {
            if let Err(e) = spec.check(default) {
                return fatal(format!("default violates its own rule: {e}"));
            }
        }
    }
    Ok(())
}
