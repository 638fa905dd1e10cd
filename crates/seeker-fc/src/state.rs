use std::fmt;
use std::time::{Duration, Instant};

use mavlink::common::{MavAutopilot, MavModeFlag, HEARTBEAT_DATA, SYS_STATUS_DATA};

use crate::offboard::LinkPhase;

/// PX4 custom main mode for OFFBOARD.
pub const PX4_MAIN_MODE_OFFBOARD: u8 = 6;

/// Autopilot battery from SYS_STATUS. Fields the autopilot marks unknown are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FcBattery {
    pub volts: Option<f32>,
    pub amps: Option<f32>,
    pub percent: Option<u8>,
}

impl FcBattery {
    pub fn from_sys_status(s: &SYS_STATUS_DATA) -> Self {
        Self::from_raw(s.voltage_battery, s.current_battery, s.battery_remaining)
    }

    /// Millivolts (`u16::MAX` unknown), centiamps (negative unknown), percent (-1 unknown).
    pub fn from_raw(millivolts: u16, centiamps: i16, remaining: i8) -> Self {
        Self {
            volts: (millivolts != u16::MAX).then(|| f32::from(millivolts) / 1000.0),
            amps: (centiamps >= 0).then(|| f32::from(centiamps) / 100.0),
            percent: u8::try_from(remaining).ok().filter(|p| *p <= 100),
        }
    }
}

impl fmt::Display for FcBattery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.volts {
            Some(v) => write!(f, "{:.2}V", v)?,
            None => f.write_str("-V")?,
        }
        if let Some(a) = self.amps {
            write!(f, " {:.1}A", a)?;
        }
        match self.percent {
            Some(p) => write!(f, " {}%", p),
            None => f.write_str(" -%"),
        }
    }
}

/// What the bridge knows about the autopilot; logged once a second.
#[derive(Debug, Clone, Default)]
pub struct LinkStatus {
    pub phase: LinkPhase,
    pub url: Option<String>,
    pub last_heartbeat: Option<Instant>,
    pub armed: bool,
    pub mode: Option<String>,
    pub battery: Option<FcBattery>,
}

impl LinkStatus {
    pub fn hb_age(&self, now: Instant) -> Option<Duration> {
        self.last_heartbeat.map(|t| now.saturating_duration_since(t))
    }
}

/// Autopilot-relevant fields of a HEARTBEAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutopilotBeat {
    pub armed: bool,
    pub main_mode: u8,
}

impl AutopilotBeat {
    /// `None` for heartbeats from non-autopilots (ground stations, companions).
    pub fn parse(hb: &HEARTBEAT_DATA) -> Option<Self> {
        if hb.autopilot == MavAutopilot::MAV_AUTOPILOT_INVALID {
            return None;
        }
        Some(Self {
            armed: hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED),
            main_mode: ((hb.custom_mode >> 16) & 0xFF) as u8,
        })
    }

    pub fn is_offboard(&self) -> bool {
        self.main_mode == PX4_MAIN_MODE_OFFBOARD
    }
}

pub fn px4_mode_name(main_mode: u8) -> String {
    match main_mode {
        0 => "MANUAL".into(),
        1 => "ALTITUDE".into(),
        2 => "POSITION".into(),
        3 => "AUTO.MISSION".into(),
        4 => "AUTO.LOITER".into(),
        5 => "AUTO.RTL".into(),
        6 => "OFFBOARD".into(),
        7 => "STABILIZED".into(),
        8 => "ACRO".into(),
        other => format!("MODE_{}", other),
    }
}
