pub mod depth;
pub mod errors;
pub mod lock;
pub mod node;

use std::time::Duration;

use seeker_proto::lock::DepthRange;

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Grace window after the last sighting before a lock is dropped.
    pub track_timeout: Duration,
    /// Pixel selections farther than this from every box center are rejected.
    pub max_pixel_distance: f32,
    /// Depth window in effect until the operator changes it.
    pub default_depth_range: DepthRange,
}
