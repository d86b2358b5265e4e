//! Stage parameter values and typed readers.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use mx_core::{Error, Result};

/// A single stage parameter as written in a preset or override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl ParamValue {
    /// Parse a command-line style value: numbers and booleans are typed,
    /// everything else stays text.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(n) = trimmed.parse::<f64>() {
            if n.is_finite() {
                return ParamValue::Number(n);
            }
        }
        match trimmed {
            "true" => ParamValue::Bool(true),
            "false" => ParamValue::Bool(false),
            _ => ParamValue::Text(raw.to_string()),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Number(n) => f.write_str(&num(*n)),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(n: f64) -> Self {
        ParamValue::Number(n)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Text(s)
    }
}

/// Format a number for an engine argument: integral values without a
/// fractional part.
pub fn num(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Parameter map of one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageParams(BTreeMap<String, ParamValue>);

impl StageParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut ParamValue)> {
        self.0.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reject keys the engine does not understand.
    pub fn ensure_known(&self, stage: &str, known: &[&str]) -> Result<()> {
        if let Some(key) = self.0.keys().find(|k| !known.contains(&k.as_str())) {
            return Err(Error::invalid_stage(
                stage,
                format!("unknown parameter '{key}' (expected one of: {})", known.join(", ")),
            ));
        }
        Ok(())
    }

    /// Optional number. Text that parses as a number is accepted.
    pub fn number(&self, stage: &str, key: &str) -> Result<Option<f64>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(ParamValue::Number(n)) if n.is_finite() => Ok(Some(*n)),
            Some(ParamValue::Text(s)) => match s.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(Some(n)),
                _ => Err(not_numeric(stage, key, s)),
            },
            Some(other) => Err(not_numeric(stage, key, &other.to_string())),
        }
    }

    pub fn number_or(&self, stage: &str, key: &str, default: f64) -> Result<f64> {
        Ok(self.number(stage, key)?.unwrap_or(default))
    }

    /// Optional number that must lie in `range` (inclusive).
    pub fn number_in(
        &self,
        stage: &str,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Option<f64>> {
        match self.number(stage, key)? {
            Some(n) if n < min || n > max => Err(Error::invalid_stage(
                stage,
                format!("'{key}' must be between {} and {}, got {}", num(min), num(max), num(n)),
            )),
            other => Ok(other),
        }
    }

    /// Optional positive integer.
    pub fn positive_int(&self, stage: &str, key: &str) -> Result<Option<u32>> {
        match self.number(stage, key)? {
            None => Ok(None),
            Some(n) if n >= 1.0 && n.fract() == 0.0 && n <= u32::MAX as f64 => Ok(Some(n as u32)),
            Some(n) => Err(Error::invalid_stage(
                stage,
                format!("'{key}' must be a positive integer, got {}", num(n)),
            )),
        }
    }

    pub fn flag_or(&self, stage: &str, key: &str, default: bool) -> Result<bool> {
        match self.0.get(key) {
            None => Ok(default),
            Some(ParamValue::Bool(b)) => Ok(*b),
            Some(ParamValue::Text(s)) if s == "true" => Ok(true),
            Some(ParamValue::Text(s)) if s == "false" => Ok(false),
            Some(other) => Err(Error::invalid_stage(
                stage,
                format!("'{key}' must be true or false, got '{other}'"),
            )),
        }
    }

    pub fn text(&self, key: &str) -> Option<String> {
        self.0.get(key).map(ToString::to_string)
    }

    /// Optional list of numbers written as `"a b c"` or `"a|b|c"` (a single
    /// number is a one-element list).
    pub fn number_list(&self, stage: &str, key: &str) -> Result<Option<Vec<f64>>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(ParamValue::Number(n)) => Ok(Some(vec![*n])),
            Some(ParamValue::Text(s)) => {
                let items = s
                    .split(|c: char| c.is_whitespace() || c == '|')
                    .filter(|t| !t.is_empty())
                    .map(|t| match t.parse::<f64>() {
                        Ok(n) if n.is_finite() => Ok(n),
                        _ => Err(not_numeric(stage, key, t)),
                    })
                    .collect::<Result<Vec<_>>>()?;
                if items.is_empty() {
                    return Err(Error::invalid_stage(stage, format!("'{key}' is an empty list")));
                }
                Ok(Some(items))
            }
            Some(other) => Err(not_numeric(stage, key, &other.to_string())),
        }
    }
}

impl FromIterator<(String, ParamValue)> for StageParams {
    fn from_iter<T: IntoIterator<Item = (String, ParamValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn not_numeric(stage: &str, key: &str, value: &str) -> Error {
    Error::invalid_stage(stage, format!("'{key}' is not numeric: '{value}'"))
}
