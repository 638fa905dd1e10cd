//! Tick loops that connect the lock manager and error computer to the bus.

use std::time::{Duration, Instant};

use anyhow::Result;
use seeker_proto::bus::{Subscriber, Topic};
use seeker_proto::command::CommandBatch;
use seeker_proto::control::ErrorSnapshot;
use seeker_proto::lock::LockSnapshot;
use seeker_proto::track::TrackSnapshot;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::depth::DepthQuery;
use crate::errors::ErrorComputer;
use crate::lock::{LockEvent, LockManager};

pub struct LockNode {
    pub manager: LockManager,
    pub tracks: Subscriber<TrackSnapshot>,
    pub commands: Subscriber<CommandBatch>,
    pub lock_state: Topic<LockSnapshot>,
    pub track_report: Topic<TrackSnapshot>,
}

impl LockNode {
    pub async fn run(mut self, tick: Duration, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "lock: loop started ({:?} tick, {} + {} -> {})",
            tick,
            self.tracks.name(),
            self.commands.name(),
            self.lock_state.name()
        );
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cmd_seq = 0u64;
        let mut ticks = 0u64;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            let now = Instant::now();
            self.step(&mut cmd_seq, now);

            ticks += 1;
            if ticks % 100 == 0 {
                debug!("lock: {:?} tracking={}", self.manager.state(), self.manager.tracking_enabled());
            }
        }
        info!("lock: loop stopped");
        Ok(())
    }

    fn step(&mut self, cmd_seq: &mut u64, now: Instant) {
        let tracks = self.tracks.latest();
        let batch = self.commands.newer_than(*cmd_seq);
        let commands = match &batch {
            Some(b) => {
                if b.seq > *cmd_seq + 1 {
                    warn!("lock: missed {} batch(es) on {}", b.seq - *cmd_seq - 1, self.commands.name());
                }
                *cmd_seq = b.seq;
                b.value.commands.as_slice()
            }
            None => &[],
        };

        let out = self.manager.tick(tracks.as_ref().map(|t| &t.value), commands, now);
        for ev in &out.events {
            if let LockEvent::TrackListRequested = ev {
                let report = tracks.as_ref().map(|t| t.value.clone()).unwrap_or_default();
                self.track_report.publish_at(report, now);
            }
        }
        self.lock_state.publish_at(out.snapshot, now);
    }
}

pub struct ErrorNode<D> {
    pub computer: ErrorComputer,
    pub depth: D,
    pub lock_state: Subscriber<LockSnapshot>,
    pub errors: Topic<ErrorSnapshot>,
    /// Lock snapshots older than this are treated as absent.
    pub max_lock_age: Duration,
}

impl<D: DepthQuery> ErrorNode<D> {
    pub async fn run(self, tick: Duration, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("errors: loop started ({:?} tick, {} -> {})", tick, self.lock_state.name(), self.errors.name());
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            let now = Instant::now();
            self.errors.publish_at(self.step(now), now);
        }
        info!("errors: loop stopped");
        Ok(())
    }

    fn step(&self, now: Instant) -> ErrorSnapshot {
        match self.lock_state.latest_fresh(now, self.max_lock_age) {
            Some(lock) => self.computer.compute(&lock.value, &self.depth, now),
            None => ErrorSnapshot::invalid(now),
        }
    }
}
