use std::time::Instant;

use anyhow::{ensure, Result};
use seeker_proto::control::ErrorSnapshot;
use seeker_proto::lock::{LockSnapshot, LockStatus};

use crate::depth::DepthQuery;

/// Pinhole approximation: angle is linear in pixel offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraModel {
    pub width_px: f32,
    pub height_px: f32,
    pub hfov_deg: f32,
    pub vfov_deg: f32,
}

impl CameraModel {
    /// Angular offset (yaw, pitch) in radians of pixel (u, v) from image center.
    /// Yaw is positive right of center, pitch positive above it.
    pub fn angular_offset(&self, u: f32, v: f32) -> (f32, f32) {
        let yaw = (u - self.width_px / 2.0) * (self.hfov_deg.to_radians() / self.width_px);
        let pitch = (self.height_px / 2.0 - v) * (self.vfov_deg.to_radians() / self.height_px);
        (yaw, pitch)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.width_px >= 1.0 && self.height_px >= 1.0, "camera image size must be > 0");
        for fov in [self.hfov_deg, self.vfov_deg] {
            ensure!(fov > 0.0 && fov < 180.0, "camera FOV must be in (0, 180) degrees, got {}", fov);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ErrorComputer {
    camera: CameraModel,
    commanded_range_m: f32,
}

impl ErrorComputer {
    pub fn new(camera: CameraModel, commanded_range_m: f32) -> Self {
        Self { camera, commanded_range_m }
    }

    pub fn compute(&self, lock: &LockSnapshot, depth: &dyn DepthQuery, now: Instant) -> ErrorSnapshot {
        let track = match (&lock.track, lock.state.status()) {
            (Some(t), LockStatus::Locked) => t,
            _ => return ErrorSnapshot::invalid(now),
        };

        let (cx, cy) = track.bbox.center();
        let (yaw_error, pitch_error) = self.camera.angular_offset(cx, cy);
        if !(yaw_error.is_finite() && pitch_error.is_finite()) {
            return ErrorSnapshot::invalid(now);
        }

        let depth_m = depth.depth_for(track, now).filter(|d| lock.depth_range.contains(*d));
        let range_error = depth_m.map_or(0.0, |d| d - self.commanded_range_m);

        ErrorSnapshot {
            yaw_error,
            pitch_error,
            range_error,
            track_valid: true,
            depth_valid: depth_m.is_some(),
            lock_valid: true,
            timestamp: now,
        }
    }
}
