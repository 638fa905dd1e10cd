//! Offboard handshake state machine.
//!
//! Pure: the bridge feeds it heartbeats, ACKs and "setpoint sent" events, and
//! asks it once per tick whether to request offboard. It never blocks and never
//! gates the setpoint stream.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::safety::Backoff;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkPhase {
    #[default]
    Disconnected,
    /// Autopilot heartbeat seen, nothing streamed yet.
    Connected,
    Streaming,
    OffboardRequested,
    OffboardActive,
}

#[derive(Debug, Clone)]
pub struct SessionTiming {
    /// Autopilot heartbeat silence before the link counts as lost.
    pub link_timeout: Duration,
    /// Continuous streaming required before a mode request.
    pub min_stream: Duration,
    /// A pause between setpoints longer than this restarts the streaming clock.
    pub max_setpoint_gap: Duration,
    pub ack_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            link_timeout: Duration::from_secs(3),
            min_stream: Duration::from_millis(500),
            max_setpoint_gap: Duration::from_millis(500),
            ack_timeout: Duration::from_millis(1500),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    RequestOffboard,
}

#[derive(Debug)]
pub struct OffboardSession {
    timing: SessionTiming,
    phase: LinkPhase,
    last_heartbeat: Option<Instant>,
    stream_since: Option<Instant>,
    last_setpoint: Option<Instant>,
    requested_at: Option<Instant>,
    retry_at: Option<Instant>,
    backoff: Backoff,
    engaged: bool,
    handed_off: bool,
}

impl OffboardSession {
    pub fn new(timing: SessionTiming) -> Self {
        let backoff = Backoff::new(timing.backoff_initial, timing.backoff_max);
        Self {
            timing,
            phase: LinkPhase::Disconnected,
            last_heartbeat: None,
            stream_since: None,
            last_setpoint: None,
            requested_at: None,
            retry_at: None,
            backoff,
            engaged: false,
            handed_off: false,
        }
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    /// Whether the operator wants guidance. A fresh engagement clears a
    /// previous loiter handoff.
    pub fn set_engaged(&mut self, engaged: bool) {
        if engaged && !self.engaged {
            self.handed_off = false;
        }
        self.engaged = engaged;
    }

    pub fn on_heartbeat(&mut self, offboard: bool, now: Instant) {
        self.last_heartbeat = Some(now);

        if self.phase == LinkPhase::Disconnected {
            info!("offboard: autopilot heartbeat seen -> CONNECTED");
            self.phase = LinkPhase::Connected;
        }

        match (self.phase, offboard) {
            (LinkPhase::OffboardActive, true) => {}
            (_, true) => {
                info!("offboard: autopilot reports OFFBOARD -> OFFBOARD_ACTIVE");
                self.phase = LinkPhase::OffboardActive;
                self.requested_at = None;
                self.backoff.reset();
            }
            (LinkPhase::OffboardActive, false) => {
                let delay = self.backoff.next_delay();
                warn!("offboard: autopilot left OFFBOARD -> STREAMING (retry in {:?})", delay);
                self.phase = self.streaming_phase();
                self.retry_at = Some(now + delay);
            }
            _ => {}
        }
    }

    pub fn on_mode_ack(&mut self, accepted: bool, now: Instant) {
        if self.phase != LinkPhase::OffboardRequested {
            return;
        }
        if accepted {
            info!("offboard: mode change accepted -> OFFBOARD_ACTIVE");
            self.phase = LinkPhase::OffboardActive;
            self.requested_at = None;
            self.backoff.reset();
        } else {
            self.reject("rejected", now);
        }
    }

    /// Setpoints streamed before an autopilot heartbeat (or while no link is
    /// open) do not count toward the streaming clock.
    pub fn on_setpoint_sent(&mut self, now: Instant) {
        if self.phase == LinkPhase::Disconnected {
            return;
        }
        let gap = self.last_setpoint.map(|t| now.saturating_duration_since(t));
        if gap.map_or(true, |g| g > self.timing.max_setpoint_gap) {
            if gap.is_some() {
                debug!("offboard: setpoint gap {:?}, streaming clock restarted", gap.unwrap_or_default());
            }
            self.stream_since = Some(now);
        }
        self.last_setpoint = Some(now);

        if self.phase == LinkPhase::Connected {
            self.phase = LinkPhase::Streaming;
        }
    }

    /// Autopilot was told to loiter; stop asking for offboard until re-engaged.
    pub fn hand_off(&mut self) {
        if self.phase == LinkPhase::OffboardActive {
            info!("offboard: loiter handoff -> STREAMING");
            self.phase = self.streaming_phase();
        }
        self.handed_off = true;
    }

    /// Link closed underneath us.
    pub fn on_link_lost(&mut self) {
        if self.phase != LinkPhase::Disconnected {
            warn!("offboard: link closed -> DISCONNECTED");
        }
        self.disconnect();
    }

    pub fn poll(&mut self, now: Instant) -> Option<SessionAction> {
        if self.phase != LinkPhase::Disconnected {
            let silent = self.last_heartbeat.map_or(true, |t| now.saturating_duration_since(t) > self.timing.link_timeout);
            if silent {
                warn!("offboard: no autopilot heartbeat for > {:?} -> DISCONNECTED", self.timing.link_timeout);
                self.disconnect();
                return None;
            }
        }

        if self.phase == LinkPhase::OffboardRequested {
            let waited = self.requested_at.map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
            if waited > self.timing.ack_timeout {
                self.reject("timed out", now);
            }
        }

        let ready = self.phase == LinkPhase::Streaming
            && self.engaged
            && !self.handed_off
            && self.streamed_for(now) >= self.timing.min_stream
            && self.retry_at.map_or(true, |t| now >= t);
        if ready {
            info!("offboard: requesting OFFBOARD");
            self.phase = LinkPhase::OffboardRequested;
            self.requested_at = Some(now);
            return Some(SessionAction::RequestOffboard);
        }
        None
    }

    /// Continuous streaming time, zero if the stream is currently paused.
    pub fn streamed_for(&self, now: Instant) -> Duration {
        match (self.stream_since, self.last_setpoint) {
            (Some(since), Some(last)) if now.saturating_duration_since(last) <= self.timing.max_setpoint_gap => {
                now.saturating_duration_since(since)
            }
            _ => Duration::ZERO,
        }
    }

    fn reject(&mut self, why: &str, now: Instant) {
        let delay = self.backoff.next_delay();
        warn!("offboard: mode change {} -> STREAMING (retry in {:?})", why, delay);
        self.phase = self.streaming_phase();
        self.requested_at = None;
        self.retry_at = Some(now + delay);
    }

    fn streaming_phase(&self) -> LinkPhase {
        if self.last_setpoint.is_some() { LinkPhase::Streaming } else { LinkPhase::Connected }
    }

    fn disconnect(&mut self) {
        self.phase = LinkPhase::Disconnected;
        self.requested_at = None;
        self.retry_at = None;
        self.stream_since = None;
        self.last_setpoint = None;
        self.backoff.reset();
    }
}
