//! Normalized data model shared by the server and the plugin host
//!
//! Deltas are the unit of change flowing through the pub/sub data model.
//! Server events are coarse lifecycle/telemetry notifications that travel
//! on a separate channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Protocol version a delta was produced against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkVersion {
    #[default]
    V1,
    V2,
}

impl SkVersion {
    /// Map the integer used across the module boundary (2 means v2)
    pub fn from_abi(version: i32) -> Self {
        if version == 2 { Self::V2 } else { Self::V1 }
    }
}

/// A single path/value pair inside an update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathValue {
    pub path: String,
    pub value: Value,
}

/// One update block of a delta
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Update {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
    #[serde(rename = "$source", default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub values: Vec<PathValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Vec<Value>>,
}

/// A normalized sensor-value update message
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub updates: Vec<Update>,
}

impl Delta {
    /// Parse a delta from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        let delta: Delta = serde_json::from_str(text)
            .map_err(|e| Error::InvalidDelta(format!("{e}")))?;
        Ok(delta)
    }

    /// Build a single-value delta stamped with the current time
    pub fn single(context: Option<&str>, path: &str, value: Value) -> Self {
        Self {
            context: context.map(str::to_string),
            updates: vec![Update {
                timestamp: Some(chrono::Utc::now().to_rfc3339()),
                values: vec![PathValue {
                    path: path.to_string(),
                    value,
                }],
                ..Default::default()
            }],
        }
    }

    /// Every value path carried by this delta, in order
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.updates
            .iter()
            .flat_map(|u| u.values.iter().map(|v| v.path.as_str()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Severity of a notification published into the data model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationState {
    Normal,
    Alert,
    Warn,
    Alarm,
    Emergency,
}

impl std::str::FromStr for NotificationState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(Self::Normal),
            "alert" => Ok(Self::Alert),
            "warn" => Ok(Self::Warn),
            "alarm" => Ok(Self::Alarm),
            "emergency" => Ok(Self::Emergency),
            other => Err(Error::InvalidNotificationState(other.to_string())),
        }
    }
}

/// Notification payload as carried under `notifications.*` paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub state: NotificationState,
    #[serde(default)]
    pub method: Vec<String>,
    #[serde(default)]
    pub message: String,
}

impl Notification {
    /// Wrap this notification in a delta under `notifications.<path>`
    pub fn into_delta(self, path: &str) -> Result<Delta> {
        let path = if path.starts_with("notifications.") {
            path.to_string()
        } else {
            format!("notifications.{path}")
        };
        Ok(Delta::single(Some("vessels.self"), &path, serde_json::to_value(self)?))
    }
}

/// A coarse server lifecycle/telemetry event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default)]
    pub data: Value,
    /// Milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ServerEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            from: None,
            data,
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
        }
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }
}
