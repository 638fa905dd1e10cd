use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mavlink::{
    common::{
        AttitudeTargetTypemask, MavAutopilot, MavCmd, MavMessage, MavModeFlag, MavResult, MavState, MavType,
        COMMAND_ACK_DATA, COMMAND_LONG_DATA, HEARTBEAT_DATA, NAMED_VALUE_FLOAT_DATA, NAMED_VALUE_INT_DATA,
        SET_ATTITUDE_TARGET_DATA,
    },
    error::MessageReadError,
    MavConnection, MavHeader,
};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use seeker_proto::control::Setpoint;
use seeker_proto::telemetry::{NamedValue, Value};

use crate::commands::name_to_bytes;
use crate::quat::Quaternion;
use crate::state::PX4_MAIN_MODE_OFFBOARD;

type Conn = Arc<dyn MavConnection<MavMessage> + Send + Sync>;

#[derive(Debug)]
pub enum LinkEvent {
    Message(MavHeader, MavMessage),
    /// The reader hit an I/O error and stopped.
    Closed(String),
}

pub struct FcLink {
    conn: Conn,
    hdr: MavHeader,
    url: String,
}

impl FcLink {
    pub fn connect(url: &str, sys_id: u8, comp_id: u8) -> Result<Self> {
        if let Some((dev, baud)) = parse_serial_url(url) {
            // quick validate device
            let _ = tokio_serial::new(dev, baud)
                .open_native_async()
                .with_context(|| format!("open fc serial device {}", dev))?;
        }

        let conn = mavlink::connect::<MavMessage>(url).with_context(|| format!("mavlink connect {}", url))?;
        info!("fc: link open on {}", url);

        Ok(Self {
            conn: Arc::from(conn),
            hdr: MavHeader { system_id: sys_id, component_id: comp_id, sequence: 0 },
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Blocking receive loop on its own thread. Ends on an I/O error (after
    /// reporting `Closed`) or once the receiving side is dropped and the next
    /// read returns.
    pub fn spawn_reader(&self, tx: mpsc::Sender<LinkEvent>) -> Result<JoinHandle<()>> {
        let conn = self.conn.clone();
        let url = self.url.clone();
        std::thread::Builder::new()
            .name("mav-reader".into())
            .spawn(move || loop {
                if tx.is_closed() {
                    debug!("fc: reader on {} released", url);
                    break;
                }
                match conn.recv() {
                    Ok((hdr, msg)) => {
                        if tx.blocking_send(LinkEvent::Message(hdr, msg)).is_err() {
                            break;
                        }
                    }
                    Err(MessageReadError::Io(e)) => match e.kind() {
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted => {
                            std::thread::sleep(Duration::from_millis(1));
                        }
                        _ => {
                            warn!("fc: reader on {} stopped: {}", url, e);
                            let _ = tx.blocking_send(LinkEvent::Closed(e.to_string()));
                            break;
                        }
                    },
                    // unknown ids and CRC failures are routine on a shared link
                    Err(e) => debug!("fc: dropped frame: {}", e),
                }
            })
            .context("spawn mavlink reader")
    }

    pub fn send(&mut self, msg: &MavMessage) -> Result<()> {
        self.hdr.sequence = self.hdr.sequence.wrapping_add(1);
        self.conn.send(&self.hdr, msg).context("mavlink send")?;
        Ok(())
    }
}

/// Whether a silent link is worth reopening. A UDP listener just keeps
/// listening; serial and TCP links can go stale underneath us.
pub fn reopens_on_silence(url: &str) -> bool {
    !url.starts_with("udp")
}

/// `serial:<dev>:<baud>` -> (dev, baud).
pub fn parse_serial_url(url: &str) -> Option<(&str, u32)> {
    let rest = url.strip_prefix("serial:")?;
    let (dev, baud) = rest.rsplit_once(':')?;
    Some((dev, baud.parse().ok()?))
}

/// Wrapping milliseconds since `boot`, for `time_boot_ms` fields.
pub fn boot_ms(boot: Instant, now: Instant) -> u32 {
    (now.saturating_duration_since(boot).as_millis() & 0xFFFF_FFFF) as u32
}

pub fn companion_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

/// Attitude + thrust, body rates ignored.
pub fn attitude_target(sp: &Setpoint, target_sys: u8, target_comp: u8, time_boot_ms: u32) -> MavMessage {
    let q = Quaternion::from_euler_deg(sp.roll, sp.pitch, sp.yaw);
    MavMessage::SET_ATTITUDE_TARGET(SET_ATTITUDE_TARGET_DATA {
        time_boot_ms,
        q: q.to_array(),
        body_roll_rate: 0.0,
        body_pitch_rate: 0.0,
        body_yaw_rate: 0.0,
        thrust: sp.thrust.clamp(0.0, 1.0),
        target_system: target_sys,
        target_component: target_comp,
        type_mask: AttitudeTargetTypemask::ATTITUDE_TARGET_TYPEMASK_BODY_ROLL_RATE_IGNORE
            | AttitudeTargetTypemask::ATTITUDE_TARGET_TYPEMASK_BODY_PITCH_RATE_IGNORE
            | AttitudeTargetTypemask::ATTITUDE_TARGET_TYPEMASK_BODY_YAW_RATE_IGNORE,
    })
}

/// DO_SET_MODE with the custom-mode flag and PX4 main mode OFFBOARD.
pub fn set_mode_offboard(target_sys: u8, target_comp: u8) -> MavMessage {
    command_long(target_sys, target_comp, MavCmd::MAV_CMD_DO_SET_MODE, [
        MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32,
        f32::from(PX4_MAIN_MODE_OFFBOARD),
        0.0,
    ])
}

pub fn loiter_unlim(target_sys: u8, target_comp: u8) -> MavMessage {
    command_long(target_sys, target_comp, MavCmd::MAV_CMD_NAV_LOITER_UNLIM, [0.0; 3])
}

fn command_long(target_sys: u8, target_comp: u8, command: MavCmd, p: [f32; 3]) -> MavMessage {
    MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
        target_system: target_sys,
        target_component: target_comp,
        command,
        confirmation: 0,
        param1: p[0],
        param2: p[1],
        param3: p[2],
        param4: 0.0,
        param5: 0.0,
        param6: 0.0,
        param7: 0.0,
    })
}

pub fn command_ack(command: MavCmd, result: MavResult) -> MavMessage {
    MavMessage::COMMAND_ACK(COMMAND_ACK_DATA { command, result })
}

pub fn named_value(v: &NamedValue, time_boot_ms: u32) -> MavMessage {
    let name = name_to_bytes(&v.name);
    match v.value {
        Value::Int(value) => MavMessage::NAMED_VALUE_INT(NAMED_VALUE_INT_DATA { time_boot_ms, value, name }),
        Value::Float(value) => MavMessage::NAMED_VALUE_FLOAT(NAMED_VALUE_FLOAT_DATA { time_boot_ms, value, name }),
    }
}
