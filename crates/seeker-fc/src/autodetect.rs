use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mavlink::common::MavMessage;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::mav::{FcLink, LinkEvent};
use crate::state::AutopilotBeat;
use crate::FcConfig;

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub url: String,
    pub hb_seen: bool,
    pub elapsed_ms: u64,
    pub note: String,
}

/// A probe that saw an autopilot, still open so the bridge can keep it.
pub struct OpenLink {
    pub link: FcLink,
    pub events: mpsc::Receiver<LinkEvent>,
}

pub struct AutodetectResult {
    pub chosen: Option<OpenLink>,
    pub probes: Vec<ProbeResult>,
}

pub fn default_candidate_devs() -> Vec<String> {
    vec![
        "/dev/ttyTHS1".into(),
        "/dev/ttyTHS0".into(),
        "/dev/serial0".into(),
        "/dev/ttyAMA0".into(),
        "/dev/ttyUSB0".into(),
        "/dev/ttyACM0".into(),
    ]
}

pub fn default_candidate_bauds() -> Vec<u32> {
    vec![921600, 57600, 115200]
}

/// Explicit URLs first, then every dev x baud pair.
pub fn candidate_urls(cfg: &FcConfig) -> Vec<String> {
    let devs = cfg.candidate_devs.clone().unwrap_or_else(default_candidate_devs);
    let bauds = cfg.candidate_bauds.clone().unwrap_or_else(default_candidate_bauds);

    let mut out = cfg.candidate_urls.clone().unwrap_or_default();
    for dev in &devs {
        for baud in &bauds {
            out.push(format!("serial:{}:{}", dev, baud));
        }
    }
    out
}

/// Open a link and start its reader.
pub fn open(url: &str, sys_id: u8, comp_id: u8) -> Result<OpenLink> {
    let link = FcLink::connect(url, sys_id, comp_id)?;
    let (tx, events) = mpsc::channel(256);
    link.spawn_reader(tx)?;
    Ok(OpenLink { link, events })
}

/// [`open`] on the blocking pool: serial opens and UDP binds can stall.
pub async fn open_async(url: String, sys_id: u8, comp_id: u8) -> Result<OpenLink> {
    tokio::task::spawn_blocking(move || open(&url, sys_id, comp_id))
        .await
        .context("link open task")?
}

pub async fn autodetect_fc(
    candidates: Vec<String>,
    heartbeat_timeout: Duration,
    sys_id: u8,
    comp_id: u8,
) -> Result<AutodetectResult> {
    let mut probes = Vec::new();

    for url in candidates {
        let start = Instant::now();

        let note = match open_async(url.clone(), sys_id, comp_id).await {
            Ok(mut open) => {
                if wait_for_autopilot(&mut open.events, heartbeat_timeout).await {
                    probes.push(ProbeResult {
                        url: url.clone(),
                        hb_seen: true,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                        note: "heartbeat".into(),
                    });
                    info!("fc autodetect: OK {}", url);
                    return Ok(AutodetectResult { chosen: Some(open), probes });
                }
                // dropping `open` ends its reader on the next frame
                "no heartbeat".to_string()
            }
            Err(e) => {
                warn!("fc autodetect probe failed url={} err={:#}", url, e);
                format!("open/connect failed: {:#}", e)
            }
        };

        probes.push(ProbeResult { url, hb_seen: false, elapsed_ms: start.elapsed().as_millis() as u64, note });
    }

    Ok(AutodetectResult { chosen: None, probes })
}

async fn wait_for_autopilot(events: &mut mpsc::Receiver<LinkEvent>, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(LinkEvent::Message(_, MavMessage::HEARTBEAT(hb)))) if AutopilotBeat::parse(&hb).is_some() => {
                return true
            }
            Ok(Some(LinkEvent::Message(..))) => {}
            Ok(Some(LinkEvent::Closed(_))) | Ok(None) | Err(_) => return false,
        }
    }
}
