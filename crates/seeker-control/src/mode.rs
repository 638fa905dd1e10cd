use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONSTRAINED: &str = "constrained";
pub const FULL_ENVELOPE: &str = "full-envelope";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailsafeTarget {
    /// Keep streaming neutral setpoints.
    Neutral,
    /// Stream neutral and hand control back to the autopilot (loiter) while in OFFBOARD.
    LoiterHandoff,
}

/// Per-deployment control envelope. Loaded once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeConfig {
    pub thrust_enabled: bool,
    pub roll_limit_deg: f32,
    pub pitch_limit_deg: f32,
    pub track_timeout_ms: u64,
    pub failsafe_target: FailsafeTarget,
    /// Ramp to neutral through the slew limiter (true) or snap at once (false).
    #[serde(default = "default_true")]
    pub failsafe_ramp: bool,

    pub ema_alpha: f32,
    pub max_slew_deg_per_tick: f32,
    pub max_thrust_slew_per_tick: f32,
    pub commanded_range_m: f32,

    pub yaw_to_roll_gain: f32,
    pub pitch_gain: f32,
    pub range_to_thrust_gain: f32,
    pub thrust_max: f32,

    #[serde(default = "default_angle_deadband")]
    pub yaw_deadband_rad: f32,
    #[serde(default = "default_angle_deadband")]
    pub pitch_deadband_rad: f32,
    #[serde(default = "default_range_deadband")]
    pub range_deadband_m: f32,

    #[serde(default = "default_tick_hz")]
    pub tick_hz: f32,

    /// Continuous valid input required before leaving failsafe.
    #[serde(default = "default_recovery_confirm_ms")]
    pub recovery_confirm_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_angle_deadband() -> f32 {
    0.02
}

fn default_range_deadband() -> f32 {
    0.5
}

fn default_tick_hz() -> f32 {
    30.0
}

fn default_recovery_confirm_ms() -> u64 {
    500
}

impl ModeConfig {
    /// Bench / first-flight envelope: no thrust, tight limits.
    pub fn constrained() -> Self {
        Self {
            thrust_enabled: false,
            roll_limit_deg: 20.0,
            pitch_limit_deg: 10.0,
            track_timeout_ms: 500,
            failsafe_target: FailsafeTarget::Neutral,
            failsafe_ramp: true,
            ema_alpha: 0.3,
            max_slew_deg_per_tick: 1.0,
            max_thrust_slew_per_tick: 0.02,
            commanded_range_m: 15.0,
            yaw_to_roll_gain: 30.0,
            pitch_gain: 20.0,
            range_to_thrust_gain: 0.05,
            thrust_max: 0.0,
            yaw_deadband_rad: default_angle_deadband(),
            pitch_deadband_rad: default_angle_deadband(),
            range_deadband_m: default_range_deadband(),
            tick_hz: default_tick_hz(),
            recovery_confirm_ms: default_recovery_confirm_ms(),
        }
    }

    pub fn full_envelope() -> Self {
        Self {
            thrust_enabled: true,
            roll_limit_deg: 45.0,
            pitch_limit_deg: 20.0,
            track_timeout_ms: 300,
            failsafe_target: FailsafeTarget::LoiterHandoff,
            max_slew_deg_per_tick: 2.0,
            thrust_max: 0.8,
            ..Self::constrained()
        }
    }

    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            CONSTRAINED => Some(Self::constrained()),
            FULL_ENVELOPE => Some(Self::full_envelope()),
            _ => None,
        }
    }

    /// A profile from the config file replaces the built-in of the same name.
    pub fn resolve(name: &str, overrides: &BTreeMap<String, ModeConfig>) -> Result<Self> {
        let cfg = match overrides.get(name) {
            Some(m) => m.clone(),
            None => Self::builtin(name)
                .with_context(|| format!("unknown mode '{}' (expected {} or {})", name, CONSTRAINED, FULL_ENVELOPE))?,
        };
        cfg.validate().with_context(|| format!("mode '{}'", name))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.roll_limit_deg > 0.0 && self.roll_limit_deg <= 90.0, "roll_limit_deg out of range");
        anyhow::ensure!(self.pitch_limit_deg > 0.0 && self.pitch_limit_deg <= 90.0, "pitch_limit_deg out of range");
        anyhow::ensure!(self.track_timeout_ms > 0, "track_timeout_ms must be > 0");
        anyhow::ensure!(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0, "ema_alpha must be in (0, 1]");
        anyhow::ensure!(self.max_slew_deg_per_tick > 0.0, "max_slew_deg_per_tick must be > 0");
        anyhow::ensure!(self.max_thrust_slew_per_tick > 0.0, "max_thrust_slew_per_tick must be > 0");
        anyhow::ensure!(self.commanded_range_m > 0.0, "commanded_range_m must be > 0");
        anyhow::ensure!((0.0..=1.0).contains(&self.thrust_max), "thrust_max must be in [0, 1]");
        anyhow::ensure!(self.tick_hz >= 2.0, "tick_hz must be >= 2 (offboard stream floor)");
        anyhow::ensure!(
            self.yaw_deadband_rad >= 0.0 && self.pitch_deadband_rad >= 0.0 && self.range_deadband_m >= 0.0,
            "deadbands must be >= 0"
        );
        Ok(())
    }

    pub fn track_timeout(&self) -> Duration {
        Duration::from_millis(self.track_timeout_ms)
    }

    pub fn recovery_confirm(&self) -> Duration {
        Duration::from_millis(self.recovery_confirm_ms)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.tick_hz)
    }

    /// Upper bound on ticks for a ramped return to neutral from the limits.
    pub fn ramp_ticks(&self) -> u32 {
        let worst = self.roll_limit_deg.max(self.pitch_limit_deg);
        (worst / self.max_slew_deg_per_tick).ceil() as u32
    }
}
