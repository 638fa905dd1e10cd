use std::time::{Duration, Instant};

use seeker_proto::bus::Subscriber;
use seeker_proto::telemetry::DepthReading;
use seeker_proto::track::Track;

/// Source of range-to-target readings.
///
/// Implementations must not block: a query either has an answer for `track`
/// that is recent enough, or returns `None`.
pub trait DepthQuery {
    fn depth_for(&self, track: &Track, now: Instant) -> Option<f32>;
}

/// Reads the newest reading published on the `depth` topic.
pub struct DepthTopicQuery {
    sub: Subscriber<DepthReading>,
    deadline: Duration,
}

impl DepthTopicQuery {
    pub fn new(sub: Subscriber<DepthReading>, deadline: Duration) -> Self {
        Self { sub, deadline }
    }
}

impl DepthQuery for DepthTopicQuery {
    fn depth_for(&self, track: &Track, now: Instant) -> Option<f32> {
        let reading = self.sub.latest_fresh(now, self.deadline)?;
        (reading.value.track_id == track.id).then_some(reading.value.depth_m)
    }
}
