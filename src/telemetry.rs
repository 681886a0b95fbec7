//! Telemetry documents and the snapshot assembler.
//!
//! Each device family fills in a typed document as response frames are
//! decoded. Fields stay `None` until a frame provides them. Assembling a
//! [`TelemetrySnapshot`] serializes the document and strips everything that is
//! absent, NaN, or an empty nested map or list.

use serde::Serialize;
use serde_json::{Map, Value};

/// Anything that can render itself as a telemetry document.
pub trait TelemetrySource {
    fn to_document(&self) -> Value;
}

/// The reported state of a battery pack
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct BatteryTelemetry {
    pub voltage: PackVoltage,
    pub cells_count: Option<u32>,
    /// Load current in A. Positive while discharging.
    pub current_load: Option<f64>,
    /// Load power in W
    pub power_load: Option<f64>,
    pub capacity: Capacity,
    pub cycles_count: Option<u32>,
    /// State of charge in %
    pub state_of_charge: Option<f64>,
    /// One reading per temperature sensor, in °C
    pub temperatures: Option<Vec<f64>>,
    pub mosfet: Option<MosfetStatus>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct PackVoltage {
    /// Pack voltage in V
    pub total: Option<f64>,
    /// The voltage of each cell in mV
    pub cells: Option<Vec<f64>>,
}

/// Capacities in Ah
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct Capacity {
    pub remaining: Option<f64>,
    pub total: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MosfetStatus {
    pub charging: bool,
    pub discharging: bool,
}

impl TelemetrySource for BatteryTelemetry {
    fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// The reported state of a solar charge controller
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ChargeControllerTelemetry {
    pub model: Option<String>,
    pub device_address: Option<u8>,
    pub charging_status: Option<&'static str>,
    /// °C
    pub controller_temperature: Option<f64>,
    pub photovoltaic: PowerChannel,
    pub load: LoadChannel,
    pub battery: BatteryChannel,
    pub statistics: Statistics,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct PowerChannel {
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub voltage: Option<f64>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct LoadChannel {
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub status: Option<&'static str>,
    pub voltage: Option<f64>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct BatteryChannel {
    pub temperature: Option<f64>,
    #[serde(rename = "type")]
    pub battery_type: Option<&'static str>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub state_of_charge: Option<f64>,
}

/// Daily and lifetime counters kept by the controller.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub max_charging_power_today: Option<f64>,
    pub max_discharging_power_today: Option<f64>,
    pub charging_amp_hours_today: Option<f64>,
    pub discharging_amp_hours_today: Option<f64>,
    pub power_generation_today: Option<f64>,
    pub power_consumption_today: Option<f64>,
    pub power_generation_total: Option<f64>,
}

impl TelemetrySource for ChargeControllerTelemetry {
    fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// The normalized result of one fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TelemetrySnapshot(Map<String, Value>);

impl TelemetrySnapshot {
    /// Build a snapshot from a document, dropping absent and NaN values.
    pub fn assemble(source: &dyn TelemetrySource) -> Self {
        match prune(source.to_document()) {
            Some(Value::Object(map)) => Self(map),
            _ => Self::default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Look up a nested value by a `/`-separated path.
    pub fn pointer(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('/');
        let first = self.0.get(segments.next()?)?;
        segments.try_fold(first, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Remove nulls, non-finite numbers and empty containers, recursively.
fn prune(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Number(n) if n.as_f64().is_some_and(|f| !f.is_finite()) => None,
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(key, value)| prune(value).map(|v| (key, v)))
                .filter(|(_, value)| !is_empty_container(value))
                .collect();
            Some(Value::Object(pruned))
        }
        Value::Array(items) => Some(Value::Array(items.into_iter().filter_map(prune).collect())),
        other => Some(other),
    }
}

fn is_empty_container(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
