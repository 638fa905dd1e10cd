use std::time::Instant;

/// Geometric tracking error for the current tick.
///
/// When `lock_valid` is false the three errors are zero; consumers must read
/// the flags, not infer validity from the values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorSnapshot {
    /// Radians, positive when the target is right of boresight.
    pub yaw_error: f32,
    /// Radians, positive when the target is above boresight.
    pub pitch_error: f32,
    /// Meters, positive when the target is farther than the commanded range.
    pub range_error: f32,
    pub track_valid: bool,
    pub depth_valid: bool,
    pub lock_valid: bool,
    pub timestamp: Instant,
}

impl ErrorSnapshot {
    pub fn invalid(timestamp: Instant) -> Self {
        Self {
            yaw_error: 0.0,
            pitch_error: 0.0,
            range_error: 0.0,
            track_valid: false,
            depth_valid: false,
            lock_valid: false,
            timestamp,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.yaw_error.is_finite() && self.pitch_error.is_finite() && self.range_error.is_finite()
    }
}

/// How far the mapper has escalated after losing valid input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailsafeLevel {
    #[default]
    Nominal,
    /// Input invalid, still inside the track-timeout grace window.
    Warning,
    /// Input invalid for longer than the track timeout.
    Failsafe,
    /// Input valid again after a failsafe, waiting out the confirmation window.
    Recovery,
}

/// Attitude/thrust command for the autopilot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Setpoint {
    /// Degrees, positive banks right.
    pub roll: f32,
    /// Degrees, positive noses up.
    pub pitch: f32,
    /// Degrees, normally 0 (a fixed wing turns by banking).
    pub yaw: f32,
    /// Normalized 0..1.
    pub thrust: f32,
    /// Set while the targets are forced to neutral.
    pub failsafe: bool,
    pub level: FailsafeLevel,
    pub timestamp: Instant,
}

impl Setpoint {
    pub fn neutral(timestamp: Instant) -> Self {
        Self {
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            thrust: 0.0,
            failsafe: false,
            level: FailsafeLevel::Nominal,
            timestamp,
        }
    }

    pub fn is_neutral(&self) -> bool {
        self.roll == 0.0 && self.pitch == 0.0 && self.yaw == 0.0 && self.thrust == 0.0
    }

    /// Input has been gone for longer than the grace window.
    pub fn escalated(&self) -> bool {
        self.level == FailsafeLevel::Failsafe
    }
}
