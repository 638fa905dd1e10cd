mod ingest;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use seeker_control::mode::CONSTRAINED;
use seeker_control::node::ControlNode;
use seeker_control::{FailsafeTarget, ModeConfig, SafetyMapper};
use seeker_proto::bus::Topic;
use seeker_proto::lock::DepthRange;
use seeker_proto::topics;
use seeker_target::depth::DepthTopicQuery;
use seeker_target::errors::{CameraModel, ErrorComputer};
use seeker_target::lock::LockManager;
use seeker_target::node::{ErrorNode, LockNode};
use seeker_target::LockConfig;

use seeker_fc::autodetect::{autodetect_fc, candidate_urls};
use seeker_fc::bridge::{Bridge, BridgeCore, BridgeSettings, BridgeTopics, LinkSource};
use seeker_fc::telemetry::TelemetryRates;
use seeker_fc::FcConfig;

use crate::ingest::IngestTopics;

#[derive(Debug, Parser)]
#[command(name = "seeker", version, about = "Seeker - target lock and attitude guidance core")]
struct Cli {
    #[arg(long)]
    config: String,

    /// Control profile: constrained, full-envelope, or a [modes.<name>] table.
    #[arg(long, default_value = CONSTRAINED)]
    mode: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Doctor,
    Run,
    /// Print the resolved control profile.
    Modes,
    Fc { #[command(subcommand)] cmd: FcCmd },
}

#[derive(Debug, Subcommand)]
enum FcCmd {
    /// Probe candidate links for an autopilot heartbeat.
    Autodetect,
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    camera: CameraCfg,
    lock: Option<LockCfg>,
    depth: Option<DepthCfg>,
    ingest: IngestCfg,
    fc: FcConfig,
    telemetry: Option<TelemetryRates>,

    #[serde(default)]
    modes: BTreeMap<String, ModeConfig>,
}

#[derive(Debug, serde::Deserialize)]
struct CameraCfg {
    width_px: u32,
    height_px: u32,
    hfov_deg: f32,
    vfov_deg: f32,
}

#[derive(Debug, serde::Deserialize)]
struct LockCfg {
    max_pixel_distance: Option<f32>,
}

#[derive(Debug, serde::Deserialize)]
struct DepthCfg {
    min_m: Option<f32>,
    max_m: Option<f32>,
    deadline_ms: Option<u64>,
}

#[derive(Debug, serde::Deserialize)]
struct IngestCfg {
    bind: String,
}

impl Config {
    fn camera(&self) -> CameraModel {
        CameraModel {
            width_px: self.camera.width_px as f32,
            height_px: self.camera.height_px as f32,
            hfov_deg: self.camera.hfov_deg,
            vfov_deg: self.camera.vfov_deg,
        }
    }

    fn depth_range(&self) -> DepthRange {
        let d = self.depth.as_ref();
        DepthRange {
            min_m: d.and_then(|d| d.min_m).unwrap_or(3.0),
            max_m: d.and_then(|d| d.max_m).unwrap_or(50.0),
        }
    }

    fn depth_deadline(&self) -> Duration {
        Duration::from_millis(self.depth.as_ref().and_then(|d| d.deadline_ms).unwrap_or(200))
    }

    fn lock_config(&self, mode: &ModeConfig) -> LockConfig {
        LockConfig {
            track_timeout: mode.track_timeout(),
            max_pixel_distance: self.max_pixel_distance(),
            default_depth_range: self.depth_range(),
        }
    }

    fn max_pixel_distance(&self) -> f32 {
        self.lock.as_ref().and_then(|l| l.max_pixel_distance).unwrap_or(100.0)
    }

    fn telemetry_rates(&self) -> TelemetryRates {
        self.telemetry.clone().unwrap_or_default()
    }

    /// Checks every section and returns the selected profile. Both `doctor`
    /// and `run` go through here.
    fn validate(&self, mode_name: &str) -> Result<ModeConfig> {
        self.camera().validate()?;

        let r = self.depth_range();
        anyhow::ensure!(
            r.min_m.is_finite() && r.max_m.is_finite() && r.min_m >= 0.0 && r.min_m < r.max_m,
            "depth range must satisfy 0 <= min_m < max_m"
        );
        let d = self.max_pixel_distance();
        anyhow::ensure!(d.is_finite() && d > 0.0, "lock.max_pixel_distance must be > 0");

        self.ingest.bind.parse::<std::net::SocketAddr>().with_context(|| format!("ingest.bind '{}'", self.ingest.bind))?;
        self.fc.validate()?;

        for name in self.modes.keys() {
            ModeConfig::resolve(name, &self.modes)?;
        }
        ModeConfig::resolve(mode_name, &self.modes)
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg, &cli.mode)?,
        Command::Run => run(&cfg, &cli.mode).await?,
        Command::Modes => modes(&cfg, &cli.mode)?,
        Command::Fc { cmd } => fc_cmd(&cfg, cmd).await?,
    }
    Ok(())
}

fn doctor(cfg: &Config, mode_name: &str) -> Result<()> {
    info!("doctor: starting");

    let mode = cfg.validate(mode_name)?;
    if mode.failsafe_target == FailsafeTarget::LoiterHandoff && !cfg.fc.allow_hold {
        warn!("doctor: mode '{}' wants loiter handoff but fc.allow_hold=false; failsafe will stream neutral only", mode_name);
    }
    if cfg.fc.autodetect {
        info!("doctor: fc autodetect enabled ({} candidates)", candidate_urls(&cfg.fc).len());
    }

    info!("doctor: OK (mode {})", mode_name);
    Ok(())
}

fn modes(cfg: &Config, mode_name: &str) -> Result<()> {
    let mode = ModeConfig::resolve(mode_name, &cfg.modes)?;
    println!("mode: {}", mode_name);
    print!("{}", toml::to_string_pretty(&mode).context("render mode")?);
    println!("ramp_ticks = {}", mode.ramp_ticks());
    Ok(())
}

async fn fc_cmd(cfg: &Config, cmd: FcCmd) -> Result<()> {
    match cmd {
        FcCmd::Autodetect => {
            let fc = &cfg.fc;
            let res = autodetect_fc(candidate_urls(fc), fc.probe_timeout(), fc.sys_id, fc.comp_id).await?;
            match &res.chosen {
                Some(open) => println!("CHOSEN: {}", open.link.url()),
                None => println!("CHOSEN: none"),
            }
            for p in res.probes {
                println!("probe url={} hb={} {}ms note={}", p.url, p.hb_seen, p.elapsed_ms, p.note);
            }
            Ok(())
        }
    }
}

async fn run(cfg: &Config, mode_name: &str) -> Result<()> {
    let mode = cfg.validate(mode_name).context("config check failed (see `seeker doctor`)")?;
    info!(
        "run: starting (mode {}, roll/pitch limits {}/{} deg, thrust_enabled={})",
        mode_name, mode.roll_limit_deg, mode.pitch_limit_deg, mode.thrust_enabled
    );
    let tick = mode.tick_period();

    let tracks = Topic::new(topics::TRACKS);
    let battery = Topic::new(topics::BATTERY_STATE);
    let depth = Topic::new(topics::DEPTH);
    let telemetry = Topic::new(topics::TELEMETRY);
    let lock_state = Topic::new(topics::LOCK_STATE);
    let track_report = Topic::new(topics::TRACK_REPORT);
    let errors = Topic::new(topics::ERRORS);
    let setpoints = Topic::new(topics::SETPOINTS);

    let bridge_topics = BridgeTopics {
        setpoints: setpoints.subscribe(),
        lock_state: lock_state.subscribe(),
        errors: errors.subscribe(),
        battery: battery.subscribe(),
        debug: telemetry.subscribe(),
        track_report: track_report.subscribe(),
        commands: Topic::new(topics::QGC_CMDS),
    };
    let lock_node = LockNode {
        manager: LockManager::new(cfg.lock_config(&mode)),
        tracks: tracks.subscribe(),
        commands: bridge_topics.commands.subscribe(),
        lock_state,
        track_report,
    };
    let error_node = ErrorNode {
        computer: ErrorComputer::new(cfg.camera(), mode.commanded_range_m),
        depth: DepthTopicQuery::new(depth.subscribe(), cfg.depth_deadline()),
        lock_state: lock_node.lock_state.subscribe(),
        errors,
        max_lock_age: mode.track_timeout(),
    };
    let control_node = ControlNode {
        mapper: SafetyMapper::new(mode.clone()),
        errors: error_node.errors.subscribe(),
        setpoints,
    };

    let socket = ingest::bind(&cfg.ingest.bind).await?;
    let ingest_topics = IngestTopics { tracks, battery, depth, telemetry };

    let settings = BridgeSettings::from_config(&cfg.fc, cfg.telemetry_rates(), mode.failsafe_target);
    let bridge = Bridge::new(
        BridgeCore::new(settings, std::time::Instant::now()),
        LinkSource::from_config(&cfg.fc)?,
        bridge_topics,
        tick,
        cfg.fc.neutral_burst(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks: Vec<(&str, JoinHandle<Result<()>>)> = vec![
        ("ingest", tokio::spawn(ingest::run(socket, ingest_topics, shutdown_rx.clone()))),
        ("lock", tokio::spawn(lock_node.run(tick, shutdown_rx.clone()))),
        ("errors", tokio::spawn(error_node.run(tick, shutdown_rx.clone()))),
        ("control", tokio::spawn(control_node.run(shutdown_rx.clone()))),
        ("bridge", tokio::spawn(bridge.run(shutdown_rx))),
    ];

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("run: shutdown requested");
    let _ = shutdown_tx.send(true);

    for (name, handle) in tasks {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("run: {} task failed: {:#}", name, e),
            Err(e) => error!("run: {} task panicked: {}", name, e),
        }
    }
    info!("run: stopped");
    Ok(())
}
