//! Autopilot bridge.
//!
//! `BridgeCore` owns every decision (what to stream, when to ask for
//! OFFBOARD, which commands to accept, what telemetry is due) and only ever
//! returns messages to send. `Bridge` wraps it with the link, the reader
//! channel, reconnects and the topics.

use std::time::{Duration, Instant};

use anyhow::Result;
use mavlink::common::{MavCmd, MavMessage, MavResult};
use mavlink::MavHeader;
use tokio::sync::{mpsc::error::TryRecvError, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use seeker_control::FailsafeTarget;
use seeker_proto::bus::{Stamped, Subscriber, Topic};
use seeker_proto::command::{CommandBatch, OperatorCommand};
use seeker_proto::control::{ErrorSnapshot, FailsafeLevel, Setpoint};
use seeker_proto::lock::LockSnapshot;
use seeker_proto::telemetry::{BatteryState, TelemetryValues};
use seeker_proto::track::TrackSnapshot;

use crate::autodetect::{self, OpenLink};
use crate::commands::{decode_command_long, decode_named_int, name_from_bytes, CommandDecodeError};
use crate::mav;
use crate::offboard::{LinkPhase, OffboardSession, SessionAction, SessionTiming};
use crate::safety::{Backoff, CommandRateLimit};
use crate::state::{px4_mode_name, AutopilotBeat, FcBattery, LinkStatus};
use crate::telemetry::{TelemetryInputs, TelemetryRates, TelemetryScheduler};
use crate::FcConfig;

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub sys_id: u8,
    pub comp_id: u8,
    pub target_sys: u8,
    pub target_comp: u8,
    pub heartbeat_period: Duration,
    pub setpoint_stale: Duration,
    pub failsafe_target: FailsafeTarget,
    pub allow_hold: bool,
    pub timing: SessionTiming,
    pub rates: TelemetryRates,
}

impl BridgeSettings {
    pub fn from_config(fc: &FcConfig, rates: TelemetryRates, failsafe_target: FailsafeTarget) -> Self {
        Self {
            sys_id: fc.sys_id,
            comp_id: fc.comp_id,
            target_sys: fc.target_sys,
            target_comp: fc.target_comp,
            heartbeat_period: fc.heartbeat_period(),
            setpoint_stale: fc.setpoint_stale(),
            failsafe_target,
            allow_hold: fc.allow_hold,
            timing: fc.session_timing(),
            rates,
        }
    }
}

/// Latest values the bridge reads each tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeInputs<'a> {
    pub setpoint: Option<&'a Setpoint>,
    pub lock: Option<&'a LockSnapshot>,
    pub errors: Option<&'a ErrorSnapshot>,
    pub battery: Option<&'a BatteryState>,
    pub debug: Option<&'a TelemetryValues>,
    pub report: Option<&'a Stamped<TrackSnapshot>>,
}

pub struct BridgeCore {
    settings: BridgeSettings,
    session: OffboardSession,
    telemetry: TelemetryScheduler,
    hold_limit: CommandRateLimit,
    boot: Instant,
    last_hb_sent: Option<Instant>,
    status: LinkStatus,
    pending: Vec<OperatorCommand>,
    cmd_seq: u64,
    report_seen: u64,
    neutral_reason: Option<&'static str>,
}

impl BridgeCore {
    pub fn new(settings: BridgeSettings, boot: Instant) -> Self {
        Self {
            session: OffboardSession::new(settings.timing.clone()),
            telemetry: TelemetryScheduler::new(&settings.rates),
            hold_limit: CommandRateLimit::new(Duration::from_secs(2)),
            settings,
            boot,
            last_hb_sent: None,
            status: LinkStatus::default(),
            pending: Vec::new(),
            cmd_seq: 0,
            report_seen: 0,
            // startup is quiet; the first transition to live setpoints logs
            neutral_reason: Some("link down"),
        }
    }

    pub fn phase(&self) -> LinkPhase {
        self.session.phase()
    }

    pub fn status(&self) -> &LinkStatus {
        &self.status
    }

    pub fn set_url(&mut self, url: Option<String>) {
        self.status.url = url;
    }

    /// Handle one inbound frame. Returns replies (COMMAND_ACKs).
    pub fn on_message(&mut self, hdr: &MavHeader, msg: &MavMessage, now: Instant) -> Vec<MavMessage> {
        match msg {
            MavMessage::HEARTBEAT(hb) if hdr.system_id == self.settings.target_sys => {
                if let Some(beat) = AutopilotBeat::parse(hb) {
                    self.on_autopilot_beat(beat, now);
                }
            }
            MavMessage::SYS_STATUS(s) if hdr.system_id == self.settings.target_sys => {
                self.status.battery = Some(FcBattery::from_sys_status(s));
            }
            MavMessage::COMMAND_ACK(ack) if ack.command == MavCmd::MAV_CMD_DO_SET_MODE => {
                self.session.on_mode_ack(ack.result == MavResult::MAV_RESULT_ACCEPTED, now);
            }
            MavMessage::COMMAND_LONG(cmd) if self.addressed_to_us(cmd.target_system, cmd.target_component) => {
                let result = match decode_command_long(cmd.command as u32, cmd.param1, cmd.param2) {
                    Ok(c) => {
                        info!("fc: operator command {} from {}/{}", c.name(), hdr.system_id, hdr.component_id);
                        self.pending.push(c);
                        MavResult::MAV_RESULT_ACCEPTED
                    }
                    // broadcast commands we don't know are for someone else
                    Err(e @ CommandDecodeError::UnknownId(_)) if cmd.target_component == 0 => {
                        debug!("fc: ignoring broadcast COMMAND_LONG: {}", e);
                        return Vec::new();
                    }
                    Err(e @ CommandDecodeError::UnknownId(_)) => {
                        warn!("fc: unsupported COMMAND_LONG: {}", e);
                        MavResult::MAV_RESULT_UNSUPPORTED
                    }
                    Err(e) => {
                        warn!("fc: rejecting COMMAND_LONG: {}", e);
                        MavResult::MAV_RESULT_DENIED
                    }
                };
                return vec![mav::command_ack(cmd.command, result)];
            }
            MavMessage::NAMED_VALUE_INT(nv) => {
                let name = name_from_bytes(&nv.name);
                if let Some(c) = decode_named_int(&name, nv.value) {
                    info!("fc: operator command {} via {}", c.name(), name);
                    self.pending.push(c);
                }
            }
            _ => {}
        }
        Vec::new()
    }

    /// Commands received since the last call, as one batch.
    pub fn take_commands(&mut self) -> Option<CommandBatch> {
        if self.pending.is_empty() {
            return None;
        }
        self.cmd_seq += 1;
        Some(CommandBatch { seq: self.cmd_seq, commands: std::mem::take(&mut self.pending) })
    }

    /// One stream tick: heartbeat when due, exactly one attitude setpoint,
    /// offboard handshake, telemetry.
    pub fn tick(&mut self, inputs: BridgeInputs<'_>, now: Instant) -> Vec<MavMessage> {
        let mut out = Vec::new();
        let boot_ms = mav::boot_ms(self.boot, now);

        if self.last_hb_sent.map_or(true, |t| now.saturating_duration_since(t) >= self.settings.heartbeat_period) {
            out.push(mav::companion_heartbeat());
            self.last_hb_sent = Some(now);
        }

        self.session.set_engaged(inputs.lock.map_or(false, |l| l.tracking_enabled));

        let sp = self.select_setpoint(inputs.setpoint, now);
        out.push(mav::attitude_target(&sp, self.settings.target_sys, self.settings.target_comp, boot_ms));
        self.session.on_setpoint_sent(now);

        if sp.escalated() && self.session.phase() == LinkPhase::OffboardActive {
            if let Some(m) = self.loiter_handoff(now) {
                out.push(m);
            }
        }

        if let Some(SessionAction::RequestOffboard) = self.session.poll(now) {
            out.push(mav::set_mode_offboard(self.settings.target_sys, self.settings.target_comp));
        }
        self.status.phase = self.session.phase();
        self.status.last_heartbeat = self.session.last_heartbeat();

        let mut values = self.telemetry.collect(
            now,
            TelemetryInputs { battery: inputs.battery, lock: inputs.lock, errors: inputs.errors, debug: inputs.debug },
        );
        if let Some(r) = inputs.report.filter(|r| r.seq > self.report_seen) {
            self.report_seen = r.seq;
            values.extend(self.telemetry.track_report(&r.value));
        }
        out.extend(values.iter().map(|v| mav::named_value(v, boot_ms)));

        out
    }

    pub fn on_link_lost(&mut self) {
        self.session.on_link_lost();
        self.status.phase = self.session.phase();
    }

    pub fn neutral_setpoint(&self, now: Instant) -> MavMessage {
        mav::attitude_target(
            &Setpoint::neutral(now),
            self.settings.target_sys,
            self.settings.target_comp,
            mav::boot_ms(self.boot, now),
        )
    }

    fn on_autopilot_beat(&mut self, beat: AutopilotBeat, now: Instant) {
        if self.status.last_heartbeat.is_some() && beat.armed != self.status.armed {
            info!("fc: {}", if beat.armed { "ARMED" } else { "DISARMED" });
        }
        let mode = px4_mode_name(beat.main_mode);
        if self.status.mode.as_deref() != Some(mode.as_str()) {
            info!("fc: autopilot mode {}", mode);
        }
        self.status.armed = beat.armed;
        self.status.mode = Some(mode);
        self.status.last_heartbeat = Some(now);
        self.session.on_heartbeat(beat.is_offboard(), now);
    }

    fn addressed_to_us(&self, sys: u8, comp: u8) -> bool {
        (sys == 0 || sys == self.settings.sys_id) && (comp == 0 || comp == self.settings.comp_id)
    }

    /// Live setpoint only when the link is up and the control output is fresh.
    fn select_setpoint(&mut self, sp: Option<&Setpoint>, now: Instant) -> Setpoint {
        let reason = if self.session.phase() == LinkPhase::Disconnected {
            Some("link down")
        } else {
            match sp {
                None => Some("no setpoints"),
                Some(s) if now.saturating_duration_since(s.timestamp) > self.settings.setpoint_stale => {
                    Some("setpoints stale")
                }
                Some(_) => None,
            }
        };

        if reason != self.neutral_reason {
            match reason {
                Some(r) => warn!("fc: streaming neutral ({})", r),
                None => info!("fc: streaming live setpoints"),
            }
            self.neutral_reason = reason;
        }

        match (reason, sp) {
            (None, Some(s)) => *s,
            (Some(_), _) => Setpoint { failsafe: true, level: FailsafeLevel::Failsafe, ..Setpoint::neutral(now) },
            (None, None) => Setpoint::neutral(now),
        }
    }

    fn loiter_handoff(&mut self, now: Instant) -> Option<MavMessage> {
        if self.settings.failsafe_target != FailsafeTarget::LoiterHandoff {
            return None;
        }
        if !self.settings.allow_hold {
            debug!("fc: loiter handoff wanted but allow_hold=false");
            return None;
        }
        if !self.hold_limit.allow(now) {
            return None;
        }
        warn!("fc: failsafe in OFFBOARD, handing off to LOITER");
        self.session.hand_off();
        Some(mav::loiter_unlim(self.settings.target_sys, self.settings.target_comp))
    }
}

/// Where the link comes from.
#[derive(Debug, Clone)]
pub enum LinkSource {
    Url(String),
    Autodetect { candidates: Vec<String>, probe_timeout: Duration },
}

impl LinkSource {
    pub fn from_config(fc: &FcConfig) -> Result<Self> {
        if fc.autodetect {
            return Ok(Self::Autodetect { candidates: autodetect::candidate_urls(fc), probe_timeout: fc.probe_timeout() });
        }
        match &fc.url {
            Some(url) => Ok(Self::Url(url.clone())),
            None => anyhow::bail!("fc.url is required when fc.autodetect=false"),
        }
    }

    async fn open(&self, sys_id: u8, comp_id: u8) -> Result<OpenLink> {
        match self {
            Self::Url(url) => autodetect::open_async(url.clone(), sys_id, comp_id).await,
            Self::Autodetect { candidates, probe_timeout } => {
                let res = autodetect::autodetect_fc(candidates.clone(), *probe_timeout, sys_id, comp_id).await?;
                res.chosen.ok_or_else(|| anyhow::anyhow!("no autopilot on {} candidate(s)", res.probes.len()))
            }
        }
    }

    /// Opens (or autodetects) on its own task; the bridge tick polls the result.
    fn spawn_open(&self, sys_id: u8, comp_id: u8) -> PendingOpen {
        let (tx, rx) = oneshot::channel();
        let source = self.clone();
        let task = tokio::spawn(async move {
            // a closed receiver means the bridge stopped; the link is dropped here
            let _ = tx.send(source.open(sys_id, comp_id).await);
        });
        PendingOpen { task, rx }
    }
}

struct PendingOpen {
    task: JoinHandle<()>,
    rx: oneshot::Receiver<Result<OpenLink>>,
}

pub struct BridgeTopics {
    pub setpoints: Subscriber<Setpoint>,
    pub lock_state: Subscriber<LockSnapshot>,
    pub errors: Subscriber<ErrorSnapshot>,
    pub battery: Subscriber<BatteryState>,
    pub debug: Subscriber<TelemetryValues>,
    pub track_report: Subscriber<TrackSnapshot>,
    pub commands: Topic<CommandBatch>,
}

pub struct Bridge {
    core: BridgeCore,
    source: LinkSource,
    topics: BridgeTopics,
    tick: Duration,
    neutral_burst: u32,
}

impl Bridge {
    pub fn new(core: BridgeCore, source: LinkSource, topics: BridgeTopics, tick: Duration, neutral_burst: u32) -> Self {
        Self { core, source, topics, tick, neutral_burst }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let (sys_id, comp_id) = (self.core.settings.sys_id, self.core.settings.comp_id);
        let link_timeout = self.core.settings.timing.link_timeout;
        let mut link: Option<OpenLink> = None;
        let mut opening: Option<PendingOpen> = None;
        let mut opened_at = Instant::now();
        let mut reconnect = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        let mut reconnect_at = Instant::now();
        let mut status_at = Instant::now();
        let mut send_failing = false;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            let now = Instant::now();

            if link.is_none() && opening.is_none() && now >= reconnect_at {
                opening = Some(self.source.spawn_open(sys_id, comp_id));
            }
            if let Some(pending) = opening.as_mut() {
                let result = match pending.rx.try_recv() {
                    Ok(r) => Some(r),
                    Err(oneshot::error::TryRecvError::Empty) => None,
                    Err(oneshot::error::TryRecvError::Closed) => Some(Err(anyhow::anyhow!("connect task ended"))),
                };
                match result {
                    None => {}
                    Some(Ok(open)) => {
                        self.core.set_url(Some(open.link.url().to_string()));
                        opened_at = now;
                        link = Some(open);
                        opening = None;
                    }
                    Some(Err(e)) => {
                        let delay = reconnect.next_delay();
                        warn!("fc: connect failed: {:#} (retry in {:?})", e, delay);
                        reconnect_at = now + delay;
                        opening = None;
                    }
                }
            }

            let mut out = Vec::new();
            let mut closed = None;
            if let Some(open) = link.as_mut() {
                loop {
                    match open.events.try_recv() {
                        Ok(mav::LinkEvent::Message(hdr, msg)) => out.extend(self.core.on_message(&hdr, &msg, now)),
                        Ok(mav::LinkEvent::Closed(why)) => {
                            closed = Some(why);
                            break;
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            closed = Some("reader stopped".to_string());
                            break;
                        }
                    }
                }
            }
            if closed.is_none() {
                if let Some(open) = link.as_ref() {
                    let heard = self.core.status().last_heartbeat.map_or(opened_at, |t| t.max(opened_at));
                    let silent = now.saturating_duration_since(heard);
                    if self.core.phase() == LinkPhase::Disconnected
                        && silent > link_timeout
                        && mav::reopens_on_silence(open.link.url())
                    {
                        closed = Some(format!("no autopilot heartbeat for {:?}", silent));
                    }
                }
            }
            if let Some(why) = closed {
                let delay = reconnect.next_delay();
                warn!("fc: link down: {} (reconnect in {:?})", why, delay);
                link = None;
                self.core.on_link_lost();
                self.core.set_url(None);
                reconnect_at = now + delay;
            }

            if self.core.phase() != LinkPhase::Disconnected {
                reconnect.reset();
            }

            if let Some(batch) = self.core.take_commands() {
                self.topics.commands.publish_at(batch, now);
            }

            let setpoint = self.topics.setpoints.latest();
            let lock = self.topics.lock_state.latest();
            let errors = self.topics.errors.latest();
            let battery = self.topics.battery.latest();
            let debug = self.topics.debug.latest();
            let report = self.topics.track_report.latest();
            let inputs = BridgeInputs {
                setpoint: setpoint.as_deref().map(|s| &s.value),
                lock: lock.as_deref().map(|s| &s.value),
                errors: errors.as_deref().map(|s| &s.value),
                battery: battery.as_deref().map(|s| &s.value),
                debug: debug.as_deref().map(|s| &s.value),
                report: report.as_deref(),
            };
            out.extend(self.core.tick(inputs, now));

            if let Some(open) = link.as_mut() {
                let mut failed = None;
                for m in &out {
                    if let Err(e) = open.link.send(m) {
                        failed = Some(e);
                        break;
                    }
                }
                match failed {
                    Some(e) if !send_failing => {
                        warn!("fc: send failed: {:#}", e);
                        send_failing = true;
                    }
                    None if send_failing => {
                        info!("fc: send recovered");
                        send_failing = false;
                    }
                    _ => {}
                }
            }

            if now >= status_at {
                let st = self.core.status();
                debug!(
                    "fc: phase={:?} mode={} armed={} hb_age={:?} battery={}",
                    st.phase,
                    st.mode.as_deref().unwrap_or("-"),
                    st.armed,
                    st.hb_age(now),
                    st.battery.map_or_else(|| "-".to_string(), |b| b.to_string())
                );
                status_at = now + Duration::from_secs(1);
            }
        }

        if let Some(pending) = opening {
            pending.task.abort();
        }
        if let Some(mut open) = link {
            info!("fc: shutdown, sending {} neutral setpoints", self.neutral_burst);
            let mut failures = 0u32;
            for _ in 0..self.neutral_burst {
                if let Err(e) = open.link.send(&self.core.neutral_setpoint(Instant::now())) {
                    if failures == 0 {
                        warn!("fc: neutral setpoint send failed: {:#}", e);
                    }
                    failures += 1;
                }
                tokio::time::sleep(self.tick).await;
            }
            if failures > 0 {
                warn!("fc: {} of {} shutdown setpoints not sent", failures, self.neutral_burst);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::{
        MavAutopilot, MavModeFlag, MavState, MavType, COMMAND_ACK_DATA, COMMAND_LONG_DATA, HEARTBEAT_DATA,
        NAMED_VALUE_INT_DATA,
    };
    use seeker_proto::lock::{DepthRange, LockState};

    use crate::commands::name_to_bytes;
    use crate::quat::Quaternion;

    const FC: MavHeader = MavHeader { system_id: 1, component_id: 1, sequence: 0 };
    const GCS: MavHeader = MavHeader { system_id: 255, component_id: 190, sequence: 0 };

    fn settings(failsafe_target: FailsafeTarget, allow_hold: bool) -> BridgeSettings {
        BridgeSettings {
            sys_id: 42,
            comp_id: 191,
            target_sys: 1,
            target_comp: 1,
            heartbeat_period: Duration::from_secs(1),
            setpoint_stale: Duration::from_millis(200),
            failsafe_target,
            allow_hold,
            timing: SessionTiming::default(),
            rates: TelemetryRates::default(),
        }
    }

    fn heartbeat(main_mode: u8) -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: u32::from(main_mode) << 16,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_PX4,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED | MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    fn command(command: MavCmd, target_system: u8, target_component: u8, param1: f32) -> MavMessage {
        MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system,
            target_component,
            command,
            confirmation: 0,
            param1,
            param2: 0.0,
            param3: 0.0,
            param4: 0.0,
            param5: 0.0,
            param6: 0.0,
            param7: 0.0,
        })
    }

    fn engaged() -> LockSnapshot {
        LockSnapshot {
            state: LockState::unlocked(),
            track: None,
            tracking_enabled: true,
            depth_range: DepthRange { min_m: 0.0, max_m: 50.0 },
            track_count: 0,
        }
    }

    fn escalated(now: Instant) -> Setpoint {
        Setpoint { failsafe: true, level: FailsafeLevel::Failsafe, ..Setpoint::neutral(now) }
    }

    fn attitudes(out: &[MavMessage]) -> Vec<(Quaternion, f32)> {
        out.iter()
            .filter_map(|m| match m {
                MavMessage::SET_ATTITUDE_TARGET(d) => {
                    Some((Quaternion { w: d.q[0], x: d.q[1], y: d.q[2], z: d.q[3] }, d.thrust))
                }
                _ => None,
            })
            .collect()
    }

    fn acks(out: &[MavMessage]) -> Vec<MavResult> {
        out.iter()
            .filter_map(|m| match m {
                MavMessage::COMMAND_ACK(a) => Some(a.result),
                _ => None,
            })
            .collect()
    }

    fn has_command(out: &[MavMessage], cmd: MavCmd) -> bool {
        out.iter().any(|m| matches!(m, MavMessage::COMMAND_LONG(c) if c.command == cmd))
    }

    #[test]
    fn every_tick_streams_exactly_one_setpoint() {
        let t0 = Instant::now();
        let mut core = BridgeCore::new(settings(FailsafeTarget::Neutral, false), t0);
        for i in 0..10 {
            let out = core.tick(BridgeInputs::default(), t0 + Duration::from_millis(33 * i));
            assert_eq!(attitudes(&out).len(), 1);
        }
    }

    #[test]
    fn stale_or_missing_setpoints_go_out_neutral() {
        let t0 = Instant::now();
        let mut core = BridgeCore::new(settings(FailsafeTarget::Neutral, false), t0);
        core.on_message(&FC, &heartbeat(2), t0);

        let live = Setpoint { roll: 10.0, pitch: -5.0, thrust: 0.3, ..Setpoint::neutral(t0) };
        let out = core.tick(BridgeInputs { setpoint: Some(&live), ..Default::default() }, t0);
        let (q, thrust) = attitudes(&out)[0];
        assert!(q.x.abs() > 0.01);
        assert_eq!(thrust, 0.3);

        let later = t0 + Duration::from_millis(300);
        let out = core.tick(BridgeInputs { setpoint: Some(&live), ..Default::default() }, later);
        let (q, thrust) = attitudes(&out)[0];
        assert_eq!(q.to_array(), [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(thrust, 0.0);
    }

    #[test]
    fn nothing_live_before_an_autopilot_heartbeat() {
        let t0 = Instant::now();
        let mut core = BridgeCore::new(settings(FailsafeTarget::Neutral, false), t0);
        let live = Setpoint { roll: 10.0, thrust: 0.5, ..Setpoint::neutral(t0) };
        let out = core.tick(BridgeInputs { setpoint: Some(&live), ..Default::default() }, t0);
        assert_eq!(attitudes(&out)[0].1, 0.0);
        assert_eq!(core.phase(), LinkPhase::Disconnected);
    }

    #[test]
    fn operator_commands_are_acked_and_batched() {
        let t0 = Instant::now();
        let mut core = BridgeCore::new(settings(FailsafeTarget::Neutral, false), t0);

        let out = core.on_message(&GCS, &command(MavCmd::MAV_CMD_WAYPOINT_USER_1, 42, 191, 0.0), t0);
        assert_eq!(acks(&out), vec![MavResult::MAV_RESULT_ACCEPTED]);
        let out = core.on_message(&GCS, &command(MavCmd::MAV_CMD_WAYPOINT_USER_3, 0, 0, 7.0), t0);
        assert_eq!(acks(&out), vec![MavResult::MAV_RESULT_ACCEPTED]);

        // bad track id, unknown id to us, unknown id broadcast, someone else's command
        let out = core.on_message(&GCS, &command(MavCmd::MAV_CMD_WAYPOINT_USER_3, 42, 191, -1.0), t0);
        assert_eq!(acks(&out), vec![MavResult::MAV_RESULT_DENIED]);
        let out = core.on_message(&GCS, &command(MavCmd::MAV_CMD_SPATIAL_USER_3, 42, 191, 0.0), t0);
        assert_eq!(acks(&out), vec![MavResult::MAV_RESULT_UNSUPPORTED]);
        assert!(core.on_message(&GCS, &command(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, 42, 0, 1.0), t0).is_empty());
        assert!(core.on_message(&GCS, &command(MavCmd::MAV_CMD_WAYPOINT_USER_2, 7, 0, 0.0), t0).is_empty());

        let batch = core.take_commands().unwrap();
        assert_eq!(batch.seq, 1);
        assert_eq!(batch.commands, vec![OperatorCommand::StartTracking, OperatorCommand::SelectTargetById(7)]);
        assert!(core.take_commands().is_none());
    }

    #[test]
    fn named_int_shortcuts_become_commands() {
        let t0 = Instant::now();
        let mut core = BridgeCore::new(settings(FailsafeTarget::Neutral, false), t0);
        let nv = |name: &str, value| {
            MavMessage::NAMED_VALUE_INT(NAMED_VALUE_INT_DATA { time_boot_ms: 0, value, name: name_to_bytes(name) })
        };
        core.on_message(&GCS, &nv("TRK_STOP", 1), t0);
        core.on_message(&GCS, &nv("CPU_TEMP", 61), t0);
        assert_eq!(core.take_commands().unwrap().commands, vec![OperatorCommand::StopTracking]);
    }

    #[test]
    fn offboard_handshake_and_loiter_handoff() {
        let t0 = Instant::now();
        let mut core = BridgeCore::new(settings(FailsafeTarget::LoiterHandoff, true), t0);
        let lock = engaged();
        let ms = |n: u64| t0 + Duration::from_millis(n);

        core.on_message(&FC, &heartbeat(3), t0);
        let mut requested_at = None;
        for i in 0..30 {
            let now = ms(33 * i);
            let sp = Setpoint::neutral(now);
            let out = core.tick(BridgeInputs { setpoint: Some(&sp), lock: Some(&lock), ..Default::default() }, now);
            if has_command(&out, MavCmd::MAV_CMD_DO_SET_MODE) {
                requested_at = Some(33 * i);
                break;
            }
        }
        let requested_at = requested_at.unwrap();
        assert!(requested_at >= 500, "requested after {} ms", requested_at);
        assert_eq!(core.phase(), LinkPhase::OffboardRequested);

        let ack = MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
            command: MavCmd::MAV_CMD_DO_SET_MODE,
            result: MavResult::MAV_RESULT_ACCEPTED,
        });
        core.on_message(&FC, &ack, ms(requested_at + 20));
        assert_eq!(core.phase(), LinkPhase::OffboardActive);

        // a missed frame inside the grace window keeps OFFBOARD
        let now = ms(requested_at + 33);
        let sp = Setpoint { failsafe: true, level: FailsafeLevel::Warning, ..Setpoint::neutral(now) };
        let out = core.tick(BridgeInputs { setpoint: Some(&sp), lock: Some(&lock), ..Default::default() }, now);
        assert!(!has_command(&out, MavCmd::MAV_CMD_NAV_LOITER_UNLIM));
        assert_eq!(core.phase(), LinkPhase::OffboardActive);

        let now = ms(requested_at + 66);
        let sp = escalated(now);
        let out = core.tick(BridgeInputs { setpoint: Some(&sp), lock: Some(&lock), ..Default::default() }, now);
        assert!(has_command(&out, MavCmd::MAV_CMD_NAV_LOITER_UNLIM));
        assert_eq!(core.phase(), LinkPhase::Streaming);

        // handed off: no new request while still engaged
        for i in 3..60 {
            let now = ms(requested_at + 33 * i);
            let sp = Setpoint::neutral(now);
            let out = core.tick(BridgeInputs { setpoint: Some(&sp), lock: Some(&lock), ..Default::default() }, now);
            assert!(!has_command(&out, MavCmd::MAV_CMD_DO_SET_MODE));
        }
    }

    #[test]
    fn failsafe_without_hold_permission_keeps_streaming_neutral() {
        let t0 = Instant::now();
        let mut core = BridgeCore::new(settings(FailsafeTarget::LoiterHandoff, false), t0);
        core.on_message(&FC, &heartbeat(6), t0);
        assert_eq!(core.phase(), LinkPhase::OffboardActive);

        let sp = escalated(t0);
        let out = core.tick(BridgeInputs { setpoint: Some(&sp), ..Default::default() }, t0);
        assert!(!has_command(&out, MavCmd::MAV_CMD_NAV_LOITER_UNLIM));
        assert_eq!(attitudes(&out).len(), 1);
    }

    #[test]
    fn track_report_goes_out_once_per_publication() {
        let t0 = Instant::now();
        let mut core = BridgeCore::new(settings(FailsafeTarget::Neutral, false), t0);
        let report = Stamped { seq: 1, at: t0, value: TrackSnapshot::default() };
        let count = |out: &[MavMessage]| {
            out.iter()
                .filter(|m| matches!(m, MavMessage::NAMED_VALUE_INT(d) if name_from_bytes(&d.name) == "TRK_COUNT"))
                .count()
        };

        let first = core.tick(BridgeInputs { report: Some(&report), ..Default::default() }, t0);
        // lock channel fires on the first tick too
        assert_eq!(count(&first), 2);
        let second = core.tick(BridgeInputs { report: Some(&report), ..Default::default() }, t0 + Duration::from_millis(33));
        assert_eq!(count(&second), 0);
    }

    #[test]
    fn link_loss_drops_to_disconnected() {
        let t0 = Instant::now();
        let mut core = BridgeCore::new(settings(FailsafeTarget::Neutral, false), t0);
        core.on_message(&FC, &heartbeat(2), t0);
        core.tick(BridgeInputs::default(), t0);
        assert_eq!(core.phase(), LinkPhase::Streaming);
        assert_eq!(core.status().mode.as_deref(), Some("POSITION"));
        assert!(core.status().armed);

        core.on_link_lost();
        assert_eq!(core.phase(), LinkPhase::Disconnected);
        assert_eq!(core.status().phase, LinkPhase::Disconnected);
    }

    #[test]
    fn setpoints_before_the_first_heartbeat_do_not_count_as_streaming() {
        let t0 = Instant::now();
        let mut core = BridgeCore::new(settings(FailsafeTarget::Neutral, false), t0);
        let lock = engaged();
        let ms = |n: u64| t0 + Duration::from_millis(n);

        for i in 0..60 {
            let now = ms(33 * i);
            let out = core.tick(BridgeInputs { lock: Some(&lock), ..Default::default() }, now);
            assert!(!has_command(&out, MavCmd::MAV_CMD_DO_SET_MODE));
        }

        let hb_at = 33 * 60;
        core.on_message(&FC, &heartbeat(2), ms(hb_at));
        let mut requested_at = None;
        for i in 0..30 {
            let now = ms(hb_at + 33 * i);
            let sp = Setpoint::neutral(now);
            let out = core.tick(BridgeInputs { setpoint: Some(&sp), lock: Some(&lock), ..Default::default() }, now);
            if has_command(&out, MavCmd::MAV_CMD_DO_SET_MODE) {
                requested_at = Some(33 * i);
                break;
            }
        }
        assert!(requested_at.unwrap() >= 500);

        // same again after the link drops and comes back
        core.on_link_lost();
        let back = hb_at + 33 * 60;
        core.tick(BridgeInputs { lock: Some(&lock), ..Default::default() }, ms(back - 33));
        core.on_message(&FC, &heartbeat(2), ms(back));
        let out = core.tick(BridgeInputs { lock: Some(&lock), ..Default::default() }, ms(back));
        assert!(!has_command(&out, MavCmd::MAV_CMD_DO_SET_MODE));
    }

    #[tokio::test]
    async fn slow_autodetect_does_not_hold_up_ticks_or_shutdown() {
        let t0 = Instant::now();
        let core = BridgeCore::new(settings(FailsafeTarget::Neutral, false), t0);
        // binds fine but no autopilot will ever answer
        let source = LinkSource::Autodetect {
            candidates: vec!["udpin:127.0.0.1:0".into()],
            probe_timeout: Duration::from_secs(30),
        };
        let commands = Topic::new("qgc_cmds");
        let topics = BridgeTopics {
            setpoints: Topic::new("setpoints").subscribe(),
            lock_state: Topic::new("lock_state").subscribe(),
            errors: Topic::new("errors").subscribe(),
            battery: Topic::new("battery_state").subscribe(),
            debug: Topic::new("telemetry").subscribe(),
            track_report: Topic::new("track_report").subscribe(),
            commands,
        };
        let bridge = Bridge::new(core, source, topics, Duration::from_millis(33), 10);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(bridge.run(rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(2), task).await;
        assert!(stopped.expect("bridge stops while autodetect is still probing").unwrap().is_ok());
    }
}
