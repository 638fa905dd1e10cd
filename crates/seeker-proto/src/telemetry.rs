use serde::{Deserialize, Serialize};

/// Battery bank switch state reported by the power-switch GPIO bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryState {
    pub bat1_active: bool,
    pub bat2_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryBank {
    Bat1,
    Bat2,
    BothOn,
    BothOff,
}

impl BatteryState {
    pub fn bank(&self) -> BatteryBank {
        match (self.bat1_active, self.bat2_active) {
            (true, false) => BatteryBank::Bat1,
            (false, true) => BatteryBank::Bat2,
            (true, true) => BatteryBank::BothOn,
            (false, false) => BatteryBank::BothOff,
        }
    }

    /// 1 or 2 for a single active bank, 0 when the switch state is invalid.
    pub fn active_bank(&self) -> i32 {
        match self.bank() {
            BatteryBank::Bat1 => 1,
            BatteryBank::Bat2 => 2,
            _ => 0,
        }
    }
}

/// Answer from the external depth-query service for one track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthReading {
    pub track_id: u32,
    pub depth_m: f32,
    #[serde(default)]
    pub ts_unix_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i32),
    Float(f32),
}

/// A named value annotation for the ground station. Names longer than the
/// 10 bytes the link allows are truncated on send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedValue {
    pub name: String,
    pub value: Value,
}

impl NamedValue {
    pub fn int(name: impl Into<String>, value: i32) -> Self {
        Self { name: name.into(), value: Value::Int(value) }
    }

    pub fn float(name: impl Into<String>, value: f32) -> Self {
        Self { name: name.into(), value: Value::Float(value) }
    }
}

/// Aggregated external telemetry forwarded as-is to the ground station.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryValues {
    pub values: Vec<NamedValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_bank_only_for_exclusive_switch() {
        let s = |a, b| BatteryState { bat1_active: a, bat2_active: b };
        assert_eq!(s(true, false).active_bank(), 1);
        assert_eq!(s(false, true).active_bank(), 2);
        assert_eq!(s(true, true).active_bank(), 0);
        assert_eq!(s(false, false).active_bank(), 0);
    }

    #[test]
    fn named_values_parse_ints_and_floats() {
        let raw = r#"{"values":[{"name":"CPU_TEMP","value":61.5},{"name":"FPS","value":30}]}"#;
        let v: TelemetryValues = serde_json::from_str(raw).unwrap();
        assert_eq!(v.values[0].value, Value::Float(61.5));
        assert_eq!(v.values[1].value, Value::Int(30));
    }
}
