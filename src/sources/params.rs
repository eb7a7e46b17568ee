//! Structured query parameters and their query-string serialization rules.

use std::fmt;

use serde_json::Value;

const FIELDS_KEY: &str = "fields";
const GEO_FILTER_KEY: &str = "filter.geo";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Null,
    Scalar(String),
    List(Vec<Option<String>>),
    Object(QueryParams),
}

/// Ordered parameter set sent with a study request.
///
/// Serialization (see [`QueryParams::pairs`]):
/// - `fields` lists collapse to one comma-joined pair; upstream rejects repeated `fields`.
/// - objects shaped `{latitude, longitude, radius}` collapse to `filter.geo=distance(..)`,
///   other objects flatten to dotted keys.
/// - other lists repeat the key once per element, in order.
/// - nulls are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    entries: Vec<(String, ParamValue)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value)
    }

    /// Sets `key`, replacing an existing value in place so parameter order stays stable.
    pub fn set(&mut self, key: impl Into<String>, value: ParamValue) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn scalar(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, ParamValue::Scalar(value.to_string()));
        self
    }

    pub fn opt_scalar<T: ToString>(mut self, key: impl Into<String>, value: Option<T>) -> Self {
        let value = match value {
            Some(v) => ParamValue::Scalar(v.to_string()),
            None => ParamValue::Null,
        };
        self.set(key, value);
        self
    }

    pub fn list<I, T>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        let values = values.into_iter().map(|v| Some(v.to_string())).collect();
        self.set(key, ParamValue::List(values));
        self
    }

    pub fn object(mut self, key: impl Into<String>, value: QueryParams) -> Self {
        self.set(key, ParamValue::Object(value));
        self
    }

    /// Returns a copy of `self` with every entry of `overrides` applied on top.
    pub fn merge_over(&self, overrides: &QueryParams) -> QueryParams {
        let mut out = self.clone();
        for (key, value) in &overrides.entries {
            out.set(key.clone(), value.clone());
        }
        out
    }

    /// Builds parameters from a JSON object. Non-object input yields an empty set.
    ///
    /// Key order follows `serde_json::Map` iteration order.
    pub fn from_json(value: &Value) -> QueryParams {
        let Some(map) = value.as_object() else {
            return QueryParams::new();
        };
        let mut out = QueryParams::new();
        for (key, value) in map {
            out.set(key.clone(), ParamValue::from_json(value));
        }
        out
    }

    /// Flattens the parameter tree into ordered `(key, value)` pairs ready for encoding.
    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        self.push_pairs(None, &mut out);
        out
    }

    fn push_pairs(&self, prefix: Option<&str>, out: &mut Vec<(String, String)>) {
        for (key, value) in &self.entries {
            let full_key = match prefix {
                Some(prefix) => format!("{prefix}.{key}"),
                None => key.clone(),
            };
            match value {
                ParamValue::Null => {}
                ParamValue::Scalar(v) => out.push((full_key, v.clone())),
                ParamValue::List(values) if key == FIELDS_KEY => {
                    let joined = values.iter().flatten().cloned().collect::<Vec<_>>();
                    if !joined.is_empty() {
                        out.push((full_key, joined.join(",")));
                    }
                }
                ParamValue::List(values) => {
                    for v in values.iter().flatten() {
                        out.push((full_key.clone(), v.clone()));
                    }
                }
                ParamValue::Object(nested) => match nested.geo_distance() {
                    Some(distance) => out.push((GEO_FILTER_KEY.to_string(), distance)),
                    None => nested.push_pairs(Some(&full_key), out),
                },
            }
        }
    }

    fn scalar_of(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            ParamValue::Scalar(v) => Some(v.as_str()),
            _ => None,
        }
    }

    fn geo_distance(&self) -> Option<String> {
        let lat = self.scalar_of("latitude")?;
        let lng = self.scalar_of("longitude")?;
        let radius = self.scalar_of("radius")?;
        Some(format!("distance({lat},{lng},{radius})"))
    }
}

impl ParamValue {
    fn from_json(value: &Value) -> ParamValue {
        match value {
            Value::Null => ParamValue::Null,
            Value::Array(items) => ParamValue::List(items.iter().map(json_scalar).collect()),
            Value::Object(_) => ParamValue::Object(QueryParams::from_json(value)),
            other => json_scalar(other).map_or(ParamValue::Null, ParamValue::Scalar),
        }
    }
}

fn json_scalar(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Unencoded `k=v&k=v` form, used for logging.
impl fmt::Display for QueryParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.pairs().iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}
