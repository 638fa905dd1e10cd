use std::time::Instant;

use seeker_proto::command::OperatorCommand;
use seeker_proto::lock::{DepthRange, LockSnapshot, LockState};
use seeker_proto::track::TrackSnapshot;
use tracing::{debug, info, warn};

use crate::LockConfig;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandRejected {
    #[error("tracking is disabled")]
    TrackingDisabled,
    #[error("no track list received yet")]
    NoTracks,
    #[error("track {0} is not in the current track list")]
    UnknownTrack(u32),
    #[error("no track within {max_px} px of ({u}, {v})")]
    NothingNearPixel { u: f32, v: f32, max_px: f32 },
    #[error("invalid depth range {min_m}..{max_m} m")]
    InvalidDepthRange { min_m: f32, max_m: f32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum LockEvent {
    TrackingEnabled,
    TrackingDisabled,
    Selected(u32),
    Confirmed(u32),
    Lost { id: u32, frames_missed: u32 },
    Cleared(u32),
    DepthRangeSet(DepthRange),
    TrackListRequested,
    Rejected { command: &'static str, reason: CommandRejected },
}

#[derive(Debug, Clone)]
pub struct LockOutput {
    pub snapshot: LockSnapshot,
    pub events: Vec<LockEvent>,
}

/// Owns the target lock state machine.
///
/// One call to [`LockManager::tick`] per control tick: operator commands are
/// applied first, then the locked id is looked up in the newest track list.
#[derive(Debug)]
pub struct LockManager {
    cfg: LockConfig,
    state: LockState,
    tracking_enabled: bool,
    depth_range: DepthRange,
    last_frame_seq: Option<u64>,
}

impl LockManager {
    pub fn new(cfg: LockConfig) -> Self {
        let depth_range = cfg.default_depth_range;
        Self {
            cfg,
            state: LockState::unlocked(),
            tracking_enabled: false,
            depth_range,
            last_frame_seq: None,
        }
    }

    pub fn state(&self) -> &LockState {
        &self.state
    }

    pub fn tracking_enabled(&self) -> bool {
        self.tracking_enabled
    }

    pub fn depth_range(&self) -> DepthRange {
        self.depth_range
    }

    pub fn tick(
        &mut self,
        tracks: Option<&TrackSnapshot>,
        commands: &[OperatorCommand],
        now: Instant,
    ) -> LockOutput {
        let mut events = Vec::new();

        let mut ordered: Vec<&OperatorCommand> = commands.iter().collect();
        ordered.sort_by_key(|c| precedence(c));
        for cmd in ordered {
            self.apply(cmd, tracks, now, &mut events);
        }

        self.reacquire(tracks, now, &mut events);

        let track = match (self.state.locked_track_id(), tracks) {
            (Some(id), Some(snap)) => snap.find(id).cloned(),
            _ => None,
        };
        let snapshot = LockSnapshot {
            state: self.state.clone(),
            track,
            tracking_enabled: self.tracking_enabled,
            depth_range: self.depth_range,
            track_count: tracks.map_or(0, |t| t.tracks.len()),
        };
        LockOutput { snapshot, events }
    }

    fn apply(
        &mut self,
        cmd: &OperatorCommand,
        tracks: Option<&TrackSnapshot>,
        now: Instant,
        events: &mut Vec<LockEvent>,
    ) {
        match *cmd {
            OperatorCommand::StartTracking => {
                if !self.tracking_enabled {
                    self.tracking_enabled = true;
                    info!("lock: tracking enabled");
                    events.push(LockEvent::TrackingEnabled);
                }
            }
            OperatorCommand::StopTracking => {
                self.release(events);
                if self.tracking_enabled {
                    self.tracking_enabled = false;
                    info!("lock: tracking disabled");
                    events.push(LockEvent::TrackingDisabled);
                }
            }
            OperatorCommand::ClearLock => self.release(events),
            OperatorCommand::SelectTargetById(id) => {
                let res = self.check_enabled(tracks).and_then(|snap| {
                    if snap.contains(id) { Ok(id) } else { Err(CommandRejected::UnknownTrack(id)) }
                });
                self.select(cmd, res, tracks, now, events);
            }
            OperatorCommand::SelectTargetByPixel { u, v } => {
                let max_px = self.cfg.max_pixel_distance;
                let res = self
                    .check_enabled(tracks)
                    .and_then(|snap| pick_by_pixel(snap, u, v, max_px).ok_or(CommandRejected::NothingNearPixel { u, v, max_px }));
                self.select(cmd, res, tracks, now, events);
            }
            OperatorCommand::SetDepthRange { min_m, max_m } => {
                if min_m.is_finite() && max_m.is_finite() && min_m >= 0.0 && min_m < max_m {
                    self.depth_range = DepthRange { min_m, max_m };
                    info!("lock: depth range set to {:.1}..{:.1} m", min_m, max_m);
                    events.push(LockEvent::DepthRangeSet(self.depth_range));
                } else {
                    reject(cmd, CommandRejected::InvalidDepthRange { min_m, max_m }, events);
                }
            }
            OperatorCommand::RequestTrackList => events.push(LockEvent::TrackListRequested),
        }
    }

    fn check_enabled<'a>(&self, tracks: Option<&'a TrackSnapshot>) -> Result<&'a TrackSnapshot, CommandRejected> {
        if !self.tracking_enabled {
            return Err(CommandRejected::TrackingDisabled);
        }
        tracks.ok_or(CommandRejected::NoTracks)
    }

    fn select(
        &mut self,
        cmd: &OperatorCommand,
        res: Result<u32, CommandRejected>,
        tracks: Option<&TrackSnapshot>,
        now: Instant,
        events: &mut Vec<LockEvent>,
    ) {
        match res {
            Ok(id) => {
                self.state = LockState::locking(id, now);
                // confirmation has to come from a later frame than the one we picked from
                self.last_frame_seq = tracks.map(|t| t.frame_seq);
                info!("lock: selected track {} ({})", id, cmd.name());
                events.push(LockEvent::Selected(id));
            }
            Err(reason) => reject(cmd, reason, events),
        }
    }

    fn release(&mut self, events: &mut Vec<LockEvent>) {
        if let Some(id) = self.state.locked_track_id() {
            info!("lock: cleared lock on track {}", id);
            events.push(LockEvent::Cleared(id));
        }
        self.state = LockState::unlocked();
    }

    fn reacquire(&mut self, tracks: Option<&TrackSnapshot>, now: Instant, events: &mut Vec<LockEvent>) {
        let fresh = tracks.filter(|t| Some(t.frame_seq) != self.last_frame_seq);
        if let Some(t) = fresh {
            self.last_frame_seq = Some(t.frame_seq);
        }

        let Some(id) = self.state.locked_track_id() else { return };

        match fresh {
            Some(snap) if snap.contains(id) => {
                if !self.state.is_locked() {
                    info!("lock: track {} confirmed", id);
                    events.push(LockEvent::Confirmed(id));
                }
                self.state = LockState::locked(id, now);
                return;
            }
            Some(_) => {
                self.state = self.state.missed_frame();
                debug!("lock: track {} missing for {} frame(s)", id, self.state.frames_since_seen());
            }
            None => {}
        }

        let since = self.state.lock_timestamp().map(|t| now.saturating_duration_since(t));
        if since.map_or(false, |d| d > self.cfg.track_timeout) {
            let frames_missed = self.state.frames_since_seen();
            warn!(
                "lock: LOST track {} after {:?} ({} frames missed) -> UNLOCKED",
                id,
                since.unwrap_or_default(),
                frames_missed
            );
            events.push(LockEvent::Lost { id, frames_missed });
            self.state = LockState::unlocked();
        }
    }
}

/// Tie order inside a batch: tracking on/off, clear, selections, then the rest.
fn precedence(cmd: &OperatorCommand) -> u8 {
    match cmd {
        OperatorCommand::StartTracking | OperatorCommand::StopTracking => 0,
        OperatorCommand::ClearLock => 1,
        OperatorCommand::SelectTargetById(_) => 2,
        OperatorCommand::SelectTargetByPixel { .. } => 3,
        OperatorCommand::SetDepthRange { .. } => 4,
        OperatorCommand::RequestTrackList => 5,
    }
}

fn reject(cmd: &OperatorCommand, reason: CommandRejected, events: &mut Vec<LockEvent>) {
    warn!("lock: {} rejected: {}", cmd.name(), reason);
    events.push(LockEvent::Rejected { command: cmd.name(), reason });
}

/// Box containing the point (closest center among several), else the nearest
/// center within `max_px`.
pub fn pick_by_pixel(snap: &TrackSnapshot, u: f32, v: f32, max_px: f32) -> Option<u32> {
    let by_distance = |a: &&seeker_proto::track::Track, b: &&seeker_proto::track::Track| {
        a.bbox
            .center_distance(u, v)
            .partial_cmp(&b.bbox.center_distance(u, v))
            .unwrap_or(std::cmp::Ordering::Equal)
    };

    if let Some(t) = snap.tracks.iter().filter(|t| t.bbox.contains(u, v)).min_by(by_distance) {
        return Some(t.id);
    }
    snap.tracks
        .iter()
        .min_by(by_distance)
        .filter(|t| t.bbox.center_distance(u, v) <= max_px)
        .map(|t| t.id)
}
