//! Device state snapshots and the edge-triggered diff between them.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Value of one observed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Bool(bool),
    /// Discrete level such as air quality or light level
    Ordinal(u8),
    /// Fixed-point measurement in tenths (215 = 21.5)
    Tenths(i32),
}

impl FieldValue {
    /// Build a tenths value from a float, rounding to one decimal.
    pub fn from_decimal(value: f32) -> Self {
        FieldValue::Tenths((value * 10.0).round() as i32)
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_decimal(self) -> Option<f32> {
        match self {
            FieldValue::Tenths(t) => Some(t as f32 / 10.0),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Ordinal(o) => write!(f, "{}", o),
            FieldValue::Tenths(t) => {
                let sign = if *t < 0 { "-" } else { "" };
                write!(f, "{}{}.{}", sign, t.abs() / 10, t.abs() % 10)
            }
        }
    }
}

/// Direction of a boolean transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Rose,
    Fell,
}

/// Notification produced by diffing two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StateEvent {
    /// Emitted once per field whose value differs
    Changed {
        field: String,
        old: FieldValue,
        new: FieldValue,
        edge: Option<Edge>,
    },
    BecameTrue { field: String },
    BecameFalse { field: String },
}

impl StateEvent {
    pub fn field(&self) -> &str {
        match self {
            StateEvent::Changed { field, .. }
            | StateEvent::BecameTrue { field }
            | StateEvent::BecameFalse { field } => field,
        }
    }
}

/// Snapshot of every field a device family reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DeviceState {
    fields: BTreeMap<String, FieldValue>,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: FieldValue) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: FieldValue) {
        self.fields.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<FieldValue> {
        self.fields.get(field).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Events describing how `self` differs from `previous`.
    ///
    /// Each changed field yields one `Changed`; boolean fields additionally
    /// yield exactly one of `BecameTrue`/`BecameFalse`. Fields missing from
    /// `previous` have no baseline and stay silent.
    pub fn diff(&self, previous: &DeviceState) -> Vec<StateEvent> {
        let mut events = Vec::new();
        for (field, &new) in &self.fields {
            let Some(&old) = previous.fields.get(field) else {
                continue;
            };
            if old == new {
                continue;
            }

            let edge = match (old, new) {
                (FieldValue::Bool(false), FieldValue::Bool(true)) => Some(Edge::Rose),
                (FieldValue::Bool(true), FieldValue::Bool(false)) => Some(Edge::Fell),
                _ => None,
            };
            events.push(StateEvent::Changed {
                field: field.clone(),
                old,
                new,
                edge,
            });
            match edge {
                Some(Edge::Rose) => events.push(StateEvent::BecameTrue {
                    field: field.clone(),
                }),
                Some(Edge::Fell) => events.push(StateEvent::BecameFalse {
                    field: field.clone(),
                }),
                None => {}
            }
        }
        events
    }
}
