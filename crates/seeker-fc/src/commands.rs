//! Operator command decoding from COMMAND_LONG and NAMED_VALUE_INT.

use seeker_proto::command::OperatorCommand;

pub const CMD_START_TRACKING: u32 = 31000;
pub const CMD_STOP_TRACKING: u32 = 31001;
pub const CMD_SELECT_TARGET_ID: u32 = 31002;
pub const CMD_SELECT_TARGET_PIXEL: u32 = 31003;
pub const CMD_SET_DEPTH_RANGE: u32 = 31004;
pub const CMD_CLEAR_LOCK: u32 = 31005;
pub const CMD_REQUEST_TRACK_LIST: u32 = 31006;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandDecodeError {
    #[error("unknown command id {0}")]
    UnknownId(u32),
    #[error("{command}: bad {param} = {value}")]
    BadParam { command: &'static str, param: &'static str, value: f32 },
}

pub fn decode_command_long(id: u32, param1: f32, param2: f32) -> Result<OperatorCommand, CommandDecodeError> {
    let cmd = match id {
        CMD_START_TRACKING => OperatorCommand::StartTracking,
        CMD_STOP_TRACKING => OperatorCommand::StopTracking,
        CMD_SELECT_TARGET_ID => OperatorCommand::SelectTargetById(track_id("SELECT_TARGET_ID", param1)?),
        CMD_SELECT_TARGET_PIXEL => OperatorCommand::SelectTargetByPixel {
            u: pixel("SELECT_TARGET_PIXEL", "u", param1)?,
            v: pixel("SELECT_TARGET_PIXEL", "v", param2)?,
        },
        // range sanity is the lock manager's call
        CMD_SET_DEPTH_RANGE => OperatorCommand::SetDepthRange { min_m: param1, max_m: param2 },
        CMD_CLEAR_LOCK => OperatorCommand::ClearLock,
        CMD_REQUEST_TRACK_LIST => OperatorCommand::RequestTrackList,
        other => return Err(CommandDecodeError::UnknownId(other)),
    };
    Ok(cmd)
}

/// Shortcut channel for ground stations that can only send named ints.
/// Names outside the `TRK_` command set return `None`.
pub fn decode_named_int(name: &str, value: i32) -> Option<OperatorCommand> {
    match (name, value) {
        ("TRK_START", 1) => Some(OperatorCommand::StartTracking),
        ("TRK_STOP", 1) => Some(OperatorCommand::StopTracking),
        ("TRK_SEL_ID", id) if id >= 0 => Some(OperatorCommand::SelectTargetById(id as u32)),
        ("TRK_CLEAR", 1) => Some(OperatorCommand::ClearLock),
        _ => None,
    }
}

fn track_id(command: &'static str, v: f32) -> Result<u32, CommandDecodeError> {
    if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f32 {
        Ok(v as u32)
    } else {
        Err(CommandDecodeError::BadParam { command, param: "track_id", value: v })
    }
}

fn pixel(command: &'static str, param: &'static str, v: f32) -> Result<f32, CommandDecodeError> {
    if v.is_finite() && v >= 0.0 {
        Ok(v)
    } else {
        Err(CommandDecodeError::BadParam { command, param, value: v })
    }
}

/// MAVLink names are 10 bytes, NUL padded, not necessarily terminated.
pub fn name_from_bytes(raw: &[u8; 10]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Truncates to 10 bytes.
pub fn name_to_bytes(name: &str) -> [u8; 10] {
    let mut out = [0u8; 10];
    for (dst, src) in out.iter_mut().zip(name.bytes()) {
        *dst = src;
    }
    out
}
