use std::time::Instant;

use anyhow::Result;
use seeker_proto::bus::{Subscriber, Topic};
use seeker_proto::control::{ErrorSnapshot, Setpoint};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::mapper::SafetyMapper;

/// Publishes a setpoint every tick whether or not new errors arrived.
pub struct ControlNode {
    pub mapper: SafetyMapper,
    pub errors: Subscriber<ErrorSnapshot>,
    pub setpoints: Topic<Setpoint>,
}

impl ControlNode {
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let period = self.mapper.config().tick_period();
        info!(
            "control: loop started ({:?} tick, {} -> {}, thrust_enabled={})",
            period,
            self.errors.name(),
            self.setpoints.name(),
            self.mapper.config().thrust_enabled
        );
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks = 0u64;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            let now = Instant::now();
            let input = self.errors.latest();
            let sp = self.mapper.tick(input.as_ref().map(|e| &e.value), now);
            self.setpoints.publish_at(sp, now);

            ticks += 1;
            if ticks % 100 == 0 {
                debug!(
                    "control: roll={:.1} pitch={:.1} thrust={:.2} failsafe={:?}",
                    sp.roll, sp.pitch, sp.thrust, sp.level
                );
            }
        }

        let sp = self.mapper.force_neutral(Instant::now());
        self.setpoints.publish(sp);
        info!("control: loop stopped (neutral published)");
        Ok(())
    }
}
