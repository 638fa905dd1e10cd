use std::time::Instant;

use crate::track::Track;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Unlocked,
    Locking,
    Locked,
    Lost,
}

impl LockStatus {
    /// States in which a track id is designated.
    pub fn holds_target(self) -> bool {
        matches!(self, LockStatus::Locking | LockStatus::Locked)
    }
}

/// Target lock state. `locked_track_id` is present exactly when the status
/// holds a target; the constructors below are the only way to build one.
#[derive(Debug, Clone, PartialEq)]
pub struct LockState {
    status: LockStatus,
    locked_track_id: Option<u32>,
    lock_timestamp: Option<Instant>,
    frames_since_seen: u32,
}

impl Default for LockState {
    fn default() -> Self {
        Self::unlocked()
    }
}

impl LockState {
    pub fn unlocked() -> Self {
        Self {
            status: LockStatus::Unlocked,
            locked_track_id: None,
            lock_timestamp: None,
            frames_since_seen: 0,
        }
    }

    pub fn locking(id: u32, at: Instant) -> Self {
        Self {
            status: LockStatus::Locking,
            locked_track_id: Some(id),
            lock_timestamp: Some(at),
            frames_since_seen: 0,
        }
    }

    pub fn locked(id: u32, at: Instant) -> Self {
        Self {
            status: LockStatus::Locked,
            locked_track_id: Some(id),
            lock_timestamp: Some(at),
            frames_since_seen: 0,
        }
    }

    /// Same target and status, one more frame without a sighting.
    pub fn missed_frame(&self) -> Self {
        Self { frames_since_seen: self.frames_since_seen.saturating_add(1), ..self.clone() }
    }

    pub fn status(&self) -> LockStatus {
        self.status
    }

    pub fn locked_track_id(&self) -> Option<u32> {
        self.locked_track_id
    }

    pub fn lock_timestamp(&self) -> Option<Instant> {
        self.lock_timestamp
    }

    pub fn frames_since_seen(&self) -> u32 {
        self.frames_since_seen
    }

    pub fn is_locked(&self) -> bool {
        self.status == LockStatus::Locked
    }
}

/// Valid depth window in meters, operator adjustable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthRange {
    pub min_m: f32,
    pub max_m: f32,
}

impl DepthRange {
    pub fn contains(&self, depth_m: f32) -> bool {
        depth_m.is_finite() && depth_m >= self.min_m && depth_m <= self.max_m
    }
}

/// What the lock manager publishes every tick.
#[derive(Debug, Clone, PartialEq)]
pub struct LockSnapshot {
    pub state: LockState,
    /// The locked track as it appears in the newest track list, if it does.
    pub track: Option<Track>,
    pub tracking_enabled: bool,
    pub depth_range: DepthRange,
    pub track_count: usize,
}
