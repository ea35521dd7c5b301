//! Session properties: the per-query `SET SESSION` overrides a client can
//! apply on top of the coordinator's declared defaults, each validated
//! against its declared type and stored in a canonical string form the
//! client protocol can round-trip verbatim.
//!
//! A registry of declared properties plus a per-connection override map
//! implement the validate/evaluate/serialize contract this engine needs.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{EngineError, ErrorKind, Result};

/// The declared type of a session property, used to validate and
/// canonicalize a client-supplied override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Boolean,
    Bigint,
    Double,
    Varchar,
    Duration,
}

/// One declared session property: name, type, description, and default.
#[derive(Debug, Clone)]
pub struct PropertyMetadata {
    pub name: String,
    pub description: String,
    pub property_type: PropertyType,
    pub default_value: String,
}

impl PropertyMetadata {
    fn new(name: &str, description: &str, property_type: PropertyType, default_value: &str) -> Self {
        Self { name: name.to_string(), description: description.to_string(), property_type, default_value: default_value.to_string() }
    }
}

/// Parses a duration literal (`"30s"`, `"500ms"`, `"2m"`, `"1h"`, a bare
/// number meaning seconds) into a `Duration`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    let split_at = input.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(input.len());
    let (number, unit) = input.split_at(split_at);
    let value: f64 = number.parse().map_err(|_| EngineError::new(ErrorKind::InvalidSessionProperty, format!("'{input}' is not a valid duration")))?;
    let seconds = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        "d" => value * 86400.0,
        other => return Err(EngineError::new(ErrorKind::InvalidSessionProperty, format!("unrecognized duration unit '{other}' in '{input}'"))),
    };
    if seconds < 0.0 || !seconds.is_finite() {
        return Err(EngineError::new(ErrorKind::InvalidSessionProperty, format!("'{input}' is not a valid duration")));
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// The canonical textual form of a duration: fixed two-decimal seconds.
pub fn format_duration(d: Duration) -> String {
    format!("{:.2}s", d.as_secs_f64())
}

fn canonicalize(property_type: PropertyType, raw: &str) -> Result<String> {
    match property_type {
        PropertyType::Boolean => {
            let value: bool = raw
                .parse()
                .map_err(|_| EngineError::new(ErrorKind::InvalidSessionProperty, format!("'{raw}' is not a valid boolean")))?;
            Ok(value.to_string())
        }
        PropertyType::Bigint => {
            let value: i64 = raw
                .parse()
                .map_err(|_| EngineError::new(ErrorKind::InvalidSessionProperty, format!("'{raw}' is not a valid bigint")))?;
            Ok(value.to_string())
        }
        PropertyType::Double => {
            let value: f64 = raw
                .parse()
                .map_err(|_| EngineError::new(ErrorKind::InvalidSessionProperty, format!("'{raw}' is not a valid double")))?;
            Ok(value.to_string())
        }
        PropertyType::Varchar => Ok(raw.to_string()),
        PropertyType::Duration => Ok(format_duration(parse_duration(raw)?)),
    }
}

/// Process-wide registry of declared session properties, seeded with the
/// engine config keys that are exposed as session-settable.
pub struct SessionPropertyManager {
    properties: RwLock<HashMap<String, PropertyMetadata>>,
}

impl SessionPropertyManager {
    pub fn new() -> Self {
        let manager = Self { properties: RwLock::new(HashMap::new()) };
        manager.register(PropertyMetadata::new(
            "query.max-age",
            "Maximum age a finished query's history is retained before garbage collection",
            PropertyType::Duration,
            "15m",
        ));
        manager.register(PropertyMetadata::new(
            "query.client.timeout",
            "Cancel a query once its client has not polled for this long",
            PropertyType::Duration,
            "5m",
        ));
        manager.register(PropertyMetadata::new(
            "query.initial-hash-partitions",
            "Number of partitions to use for distributed joins and aggregations",
            PropertyType::Bigint,
            "100",
        ));
        manager.register(PropertyMetadata::new(
            "query.max-concurrent-queries",
            "Maximum number of queries running at once before admission is rejected",
            PropertyType::Bigint,
            "1000",
        ));
        manager.register(PropertyMetadata::new(
            "deterministic-sampling",
            "Use a deterministic seed for sampled-table reads instead of a random one",
            PropertyType::Boolean,
            "false",
        ));
        manager
    }

    pub fn register(&self, metadata: PropertyMetadata) {
        self.properties.write().insert(metadata.name.clone(), metadata);
    }

    pub fn get_metadata(&self, name: &str) -> Result<PropertyMetadata> {
        self.properties.read().get(name).cloned().ok_or_else(|| EngineError::new(ErrorKind::InvalidSessionProperty, format!("unknown session property '{name}'")))
    }

    pub fn list(&self) -> Vec<PropertyMetadata> {
        self.properties.read().values().cloned().collect()
    }
}

impl Default for SessionPropertyManager {
    fn default() -> Self {
        Self::new()
    }
}

/// One client session: its declared-property overrides, each stored in
/// canonical string form once validated.
pub struct Session {
    manager: std::sync::Arc<SessionPropertyManager>,
    overrides: RwLock<HashMap<String, String>>,
}

impl Session {
    pub fn new(manager: std::sync::Arc<SessionPropertyManager>) -> Self {
        Self { manager, overrides: RwLock::new(HashMap::new()) }
    }

    /// Validates `raw_value` against the property's declared type and
    /// stores its canonical form. Unknown names and unparsable values both
    /// fail with `INVALID_SESSION_PROPERTY`.
    pub fn set(&self, name: &str, raw_value: &str) -> Result<()> {
        let metadata = self.manager.get_metadata(name)?;
        let canonical = canonicalize(metadata.property_type, raw_value)?;
        self.overrides.write().insert(name.to_string(), canonical);
        Ok(())
    }

    /// The session's current value for `name`: its override if set, else
    /// the declared default — both in canonical form.
    pub fn get(&self, name: &str) -> Result<String> {
        if let Some(value) = self.overrides.read().get(name) {
            return Ok(value.clone());
        }
        let metadata = self.manager.get_metadata(name)?;
        canonicalize(metadata.property_type, &metadata.default_value)
    }

    pub fn get_duration(&self, name: &str) -> Result<Duration> {
        parse_duration(&self.get(name)?)
    }

    pub fn get_bool(&self, name: &str) -> Result<bool> {
        self.get(name)?.parse().map_err(|_| EngineError::internal(format!("'{name}' is not a boolean property")))
    }

    pub fn get_i64(&self, name: &str) -> Result<i64> {
        self.get(name)?.parse().map_err(|_| EngineError::internal(format!("'{name}' is not a bigint property")))
    }

    /// The full set of this session's overrides, for the client protocol to
    /// echo back in its response headers.
    pub fn overrides(&self) -> HashMap<String, String> {
        self.overrides.read().clone()
    }
}
