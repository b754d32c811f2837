//! Telemetry table written by the pipeline and read by the query service.
//!
//! All operations are serialised under one coarse lock; telemetry traffic is
//! orders of magnitude lower than the visibility rate.
//!
//! # Example
//! ```
//! use rust_ingest::monitoring::{MonitoringStore, PointStatus};
//!
//! let store = MonitoringStore::new();
//! store.update("ingest.cycles", 5i64, PointStatus::Ok, "");
//! assert_eq!(store.get(&["ingest.cycles", "unknown"]).len(), 1);
//! store.invalidate("ingest.cycles");
//! assert!(store.get(&["ingest.cycles"]).is_empty());
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Value carried by a monitoring point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MonitorValue {
    /// Boolean
    Bool(bool),
    /// 32-bit integer
    Int32(i32),
    /// 64-bit integer
    Int64(i64),
    /// Single precision float
    Float(f32),
    /// Double precision float
    Double(f64),
    /// Text
    String(String),
}

impl From<bool> for MonitorValue {
    fn from(v: bool) -> Self {
        MonitorValue::Bool(v)
    }
}

impl From<i32> for MonitorValue {
    fn from(v: i32) -> Self {
        MonitorValue::Int32(v)
    }
}

impl From<i64> for MonitorValue {
    fn from(v: i64) -> Self {
        MonitorValue::Int64(v)
    }
}

impl From<f32> for MonitorValue {
    fn from(v: f32) -> Self {
        MonitorValue::Float(v)
    }
}

impl From<f64> for MonitorValue {
    fn from(v: f64) -> Self {
        MonitorValue::Double(v)
    }
}

impl From<&str> for MonitorValue {
    fn from(v: &str) -> Self {
        MonitorValue::String(v.to_string())
    }
}

impl From<String> for MonitorValue {
    fn from(v: String) -> Self {
        MonitorValue::String(v)
    }
}

/// Alarm state of a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PointStatus {
    /// Value is valid and in range
    Ok,
    /// Value is not meaningful
    Invalid,
    /// Value outside the nominal range
    MinorAlarm,
    /// Value outside the safe range
    MajorAlarm,
}

impl fmt::Display for PointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointStatus::Ok => write!(f, "OK"),
            PointStatus::Invalid => write!(f, "INVALID"),
            PointStatus::MinorAlarm => write!(f, "MINORALARM"),
            PointStatus::MajorAlarm => write!(f, "MAJORALARM"),
        }
    }
}

/// One named telemetry value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringPoint {
    /// Unique key
    pub name: String,
    /// Time of the last update
    pub timestamp: DateTime<Utc>,
    /// Current value
    pub value: MonitorValue,
    /// Alarm state
    pub status: PointStatus,
    /// Unit label
    pub unit: String,
}

/// Concurrent telemetry table.
///
/// Constructed explicitly by the process entry point and shared by `Arc`.
#[derive(Default)]
pub struct MonitoringStore {
    points: Mutex<HashMap<String, MonitoringPoint>>,
}

impl MonitoringStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or fully overwrite a point.
    pub fn update(
        &self,
        name: impl Into<String>,
        value: impl Into<MonitorValue>,
        status: PointStatus,
        unit: impl Into<String>,
    ) {
        let name = name.into();
        let point = MonitoringPoint {
            name: name.clone(),
            timestamp: Utc::now(),
            value: value.into(),
            status,
            unit: unit.into(),
        };
        self.points.lock().insert(name, point);
    }

    /// The requested points that exist, in request order.
    ///
    /// Unknown names are skipped, so the result may be shorter than the request.
    pub fn get<S: AsRef<str>>(&self, names: &[S]) -> Vec<MonitoringPoint> {
        let points = self.points.lock();
        names
            .iter()
            .filter_map(|name| points.get(name.as_ref()).cloned())
            .collect()
    }

    /// Remove a point; no-op if absent.
    pub fn invalidate(&self, name: &str) {
        self.points.lock().remove(name);
    }

    /// Number of points currently held.
    pub fn len(&self) -> usize {
        self.points.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.points.lock().is_empty()
    }

    /// Sorted names of all points.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.points.lock().keys().cloned().collect();
        names.sort();
        names
    }
}
