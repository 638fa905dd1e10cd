pub mod autodetect;
pub mod bridge;
pub mod commands;
pub mod mav;
pub mod offboard;
pub mod quat;
pub mod safety;
pub mod state;
pub mod telemetry;

use std::time::Duration;

use anyhow::{ensure, Result};
use serde::Deserialize;

use crate::offboard::SessionTiming;

#[derive(Debug, Clone, Deserialize)]
pub struct FcConfig {
    /// MAVLink connection URL when autodetect=false. Examples:
    /// "udpin:0.0.0.0:14540", "serial:/dev/ttyTHS1:921600"
    pub url: Option<String>,

    /// If true, probe candidates and keep the first that yields an autopilot
    /// HEARTBEAT.
    #[serde(default)]
    pub autodetect: bool,

    /// Extra autodetect candidates tried before the serial grid.
    pub candidate_urls: Option<Vec<String>>,
    pub candidate_devs: Option<Vec<String>>,
    pub candidate_bauds: Option<Vec<u32>>,

    /// Heartbeat wait per probe attempt
    pub heartbeat_timeout_ms: Option<u64>,

    /// MAVLink ids we use (companion side)
    pub sys_id: u8,
    pub comp_id: u8,

    /// target system/component (autopilot side)
    pub target_sys: u8,
    pub target_comp: u8,

    /// Allow the loiter handoff when the mode's failsafe target asks for it.
    #[serde(default)]
    pub allow_hold: bool,

    /// Companion heartbeat rate. Default 1 Hz.
    pub send_heartbeat_hz: Option<f32>,

    pub link_timeout_ms: Option<u64>,
    pub mode_ack_timeout_ms: Option<u64>,
    pub mode_retry_initial_ms: Option<u64>,
    pub mode_retry_max_ms: Option<u64>,
    pub min_stream_ms: Option<u64>,

    /// Setpoints older than this are replaced with neutral on the wire.
    pub setpoint_stale_ms: Option<u64>,

    /// Neutral setpoints sent on shutdown. Default 10.
    pub neutral_burst: Option<u32>,
}

impl FcConfig {
    pub fn session_timing(&self) -> SessionTiming {
        let d = SessionTiming::default();
        let ms = |v: Option<u64>, fallback: Duration| v.map(Duration::from_millis).unwrap_or(fallback);
        SessionTiming {
            link_timeout: ms(self.link_timeout_ms, d.link_timeout),
            min_stream: ms(self.min_stream_ms, d.min_stream),
            max_setpoint_gap: d.max_setpoint_gap,
            ack_timeout: ms(self.mode_ack_timeout_ms, d.ack_timeout),
            backoff_initial: ms(self.mode_retry_initial_ms, d.backoff_initial),
            backoff_max: ms(self.mode_retry_max_ms, d.backoff_max),
        }
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.send_heartbeat_hz.unwrap_or(1.0).max(0.1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms.unwrap_or(1500))
    }

    pub fn setpoint_stale(&self) -> Duration {
        Duration::from_millis(self.setpoint_stale_ms.unwrap_or(200))
    }

    pub fn neutral_burst(&self) -> u32 {
        self.neutral_burst.unwrap_or(10)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.autodetect || self.url.is_some(), "fc.url is required when fc.autodetect=false");
        ensure!(self.sys_id != 0, "fc.sys_id must be non-zero");
        ensure!(
            (self.sys_id, self.comp_id) != (self.target_sys, self.target_comp),
            "fc.sys_id/comp_id collide with fc.target_sys/target_comp"
        );
        ensure!(self.send_heartbeat_hz.map_or(true, |hz| hz > 0.0), "fc.send_heartbeat_hz must be > 0");
        let t = self.session_timing();
        ensure!(t.backoff_initial <= t.backoff_max, "fc.mode_retry_initial_ms exceeds fc.mode_retry_max_ms");
        ensure!(t.min_stream < t.link_timeout, "fc.min_stream_ms must be shorter than fc.link_timeout_ms");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> FcConfig {
        toml::from_str(raw).unwrap()
    }

    #[test]
    fn defaults_fill_unset_timings() {
        let cfg = parse("url = \"udpin:0.0.0.0:14540\"\nsys_id = 42\ncomp_id = 191\ntarget_sys = 1\ntarget_comp = 1\n");
        cfg.validate().unwrap();
        let t = cfg.session_timing();
        assert_eq!(t.link_timeout, Duration::from_secs(3));
        assert_eq!(t.backoff_max, Duration::from_secs(8));
        assert_eq!(cfg.setpoint_stale(), Duration::from_millis(200));
        assert_eq!(cfg.heartbeat_period(), Duration::from_secs(1));
        assert!(!cfg.allow_hold);
    }

    #[test]
    fn missing_url_without_autodetect_is_rejected() {
        let cfg = parse("sys_id = 42\ncomp_id = 191\ntarget_sys = 1\ntarget_comp = 1\n");
        assert!(cfg.validate().is_err());
    }
}
