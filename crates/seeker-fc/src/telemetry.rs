//! Named-value side channel: battery, lock status, error angles, forwarded
//! debug values, each on its own clock.

use std::time::{Duration, Instant};

use serde::Deserialize;

use seeker_proto::control::ErrorSnapshot;
use seeker_proto::lock::LockSnapshot;
use seeker_proto::telemetry::{BatteryState, NamedValue, TelemetryValues};
use seeker_proto::track::TrackSnapshot;

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryRates {
    #[serde(default = "default_battery_hz")]
    pub battery_hz: f32,
    #[serde(default = "default_one_hz")]
    pub lock_hz: f32,
    /// Yaw/pitch error channel; off when absent.
    #[serde(default)]
    pub errors_hz: Option<f32>,
    #[serde(default = "default_one_hz")]
    pub debug_hz: f32,
    #[serde(default = "default_report_cap")]
    pub track_report_max: usize,
}

fn default_battery_hz() -> f32 {
    2.0
}

fn default_one_hz() -> f32 {
    1.0
}

fn default_report_cap() -> usize {
    16
}

impl Default for TelemetryRates {
    fn default() -> Self {
        Self {
            battery_hz: default_battery_hz(),
            lock_hz: default_one_hz(),
            errors_hz: Some(5.0),
            debug_hz: default_one_hz(),
            track_report_max: default_report_cap(),
        }
    }
}

#[derive(Debug, Clone)]
struct Periodic {
    period: Duration,
    next: Option<Instant>,
}

impl Periodic {
    fn new(hz: f32) -> Self {
        Self { period: Duration::from_secs_f32(1.0 / hz.max(0.01)), next: None }
    }

    /// Fixed-rate: the next slot follows the previous one, unless we fell a
    /// whole period behind.
    fn due(&mut self, now: Instant) -> bool {
        match self.next {
            Some(t) if now < t => false,
            Some(t) if now - t < self.period => {
                self.next = Some(t + self.period);
                true
            }
            _ => {
                self.next = Some(now + self.period);
                true
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryInputs<'a> {
    pub battery: Option<&'a BatteryState>,
    pub lock: Option<&'a LockSnapshot>,
    pub errors: Option<&'a ErrorSnapshot>,
    pub debug: Option<&'a TelemetryValues>,
}

#[derive(Debug)]
pub struct TelemetryScheduler {
    battery: Periodic,
    lock: Periodic,
    errors: Option<Periodic>,
    debug: Periodic,
    report_cap: usize,
}

impl TelemetryScheduler {
    pub fn new(rates: &TelemetryRates) -> Self {
        Self {
            battery: Periodic::new(rates.battery_hz),
            lock: Periodic::new(rates.lock_hz),
            errors: rates.errors_hz.map(Periodic::new),
            debug: Periodic::new(rates.debug_hz),
            report_cap: rates.track_report_max,
        }
    }

    /// Values due at `now`. A channel with no input yet stays quiet and keeps
    /// its slot, so it fires as soon as data shows up.
    pub fn collect(&mut self, now: Instant, inputs: TelemetryInputs<'_>) -> Vec<NamedValue> {
        let mut out = Vec::new();

        if let Some(b) = inputs.battery {
            if self.battery.due(now) {
                out.push(NamedValue::int("BAT1_ACTIVE", b.bat1_active as i32));
                out.push(NamedValue::int("BAT2_ACTIVE", b.bat2_active as i32));
                out.push(NamedValue::int("ACTIVE_BAT", b.active_bank()));
            }
        }

        if self.lock.due(now) {
            let (locked, id, count) = match inputs.lock {
                Some(l) => (
                    l.state.is_locked(),
                    l.state.locked_track_id().map_or(-1, |id| id as i32),
                    l.track_count as i32,
                ),
                None => (false, -1, 0),
            };
            out.push(NamedValue::int("TRK_LOCKED", locked as i32));
            out.push(NamedValue::int("TRK_LOCK_ID", id));
            out.push(NamedValue::int("TRK_COUNT", count));
        }

        if let (Some(ch), Some(e)) = (self.errors.as_mut(), inputs.errors.filter(|e| e.lock_valid)) {
            if ch.due(now) {
                out.push(NamedValue::float("TRK_YAW_ERR", e.yaw_error.to_degrees()));
                out.push(NamedValue::float("TRK_PIT_ERR", e.pitch_error.to_degrees()));
            }
        }

        if let Some(d) = inputs.debug.filter(|d| !d.values.is_empty()) {
            if self.debug.due(now) {
                out.extend(d.values.iter().cloned());
            }
        }

        out
    }

    /// Reply to a track-list request: the count, then one `TRK_ID` per track.
    pub fn track_report(&self, snapshot: &TrackSnapshot) -> Vec<NamedValue> {
        let mut out = vec![NamedValue::int("TRK_COUNT", snapshot.tracks.len() as i32)];
        out.extend(
            snapshot.tracks.iter().take(self.report_cap).map(|t| NamedValue::int("TRK_ID", t.id as i32)),
        );
        out
    }
}
