//! Messages exchanged between the guidance components and the last-value bus
//! that carries them.

pub mod bus;
pub mod command;
pub mod control;
pub mod lock;
pub mod telemetry;
pub mod track;

/// Topic names, shared by publishers, subscribers and log lines.
pub mod topics {
    pub const TRACKS: &str = "tracks";
    pub const LOCK_STATE: &str = "lock_state";
    pub const ERRORS: &str = "errors";
    pub const SETPOINTS: &str = "setpoints";
    pub const BATTERY_STATE: &str = "battery_state";
    pub const QGC_CMDS: &str = "qgc_cmds";
    pub const TELEMETRY: &str = "telemetry";
    pub const DEPTH: &str = "depth";
    pub const TRACK_REPORT: &str = "track_report";
}
