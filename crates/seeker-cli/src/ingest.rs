//! UDP JSON ingest: perception, battery, depth and debug values arrive as one
//! datagram per record, tagged by `"topic"`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use seeker_proto::bus::Topic;
use seeker_proto::telemetry::{BatteryState, DepthReading, TelemetryValues};
use seeker_proto::track::TrackSnapshot;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum IngestRecord {
    Tracks(TrackSnapshot),
    BatteryState(BatteryState),
    Depth(DepthReading),
    Telemetry(TelemetryValues),
}

/// Decodes one record. Non-finite numbers (serde turns out-of-range floats
/// into infinities) reject the whole record.
pub fn parse_datagram(buf: &[u8]) -> Result<IngestRecord> {
    let rec: IngestRecord = serde_json::from_slice(buf).context("decode ingest record")?;
    match &rec {
        IngestRecord::Tracks(s) => {
            if let Some(t) = s.malformed() {
                bail!("frame {}: track {} has a non-finite or empty box", s.frame_seq, t.id);
            }
        }
        IngestRecord::Depth(d) if !d.depth_m.is_finite() => {
            bail!("depth for track {} is not finite", d.track_id);
        }
        _ => {}
    }
    Ok(rec)
}

fn unix_ms_now() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub struct IngestTopics {
    pub tracks: Topic<TrackSnapshot>,
    pub battery: Topic<BatteryState>,
    pub depth: Topic<DepthReading>,
    pub telemetry: Topic<TelemetryValues>,
}

impl IngestTopics {
    /// Producers that leave the wall-clock stamp out get the receive time.
    pub fn dispatch(&self, rec: IngestRecord) {
        match rec {
            IngestRecord::Tracks(mut s) => {
                if s.ts_unix_ms == 0 {
                    s.ts_unix_ms = unix_ms_now();
                }
                self.tracks.publish(s);
            }
            IngestRecord::BatteryState(b) => {
                self.battery.publish(b);
            }
            IngestRecord::Depth(mut d) => {
                if d.ts_unix_ms == 0 {
                    d.ts_unix_ms = unix_ms_now();
                }
                self.depth.publish(d);
            }
            IngestRecord::Telemetry(t) => {
                self.telemetry.publish(t);
            }
        }
    }
}

pub async fn bind(addr: &str) -> Result<UdpSocket> {
    UdpSocket::bind(addr).await.with_context(|| format!("bind ingest socket {}", addr))
}

pub async fn run(socket: UdpSocket, topics: IngestTopics, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    info!("ingest: listening on {}", socket.local_addr().context("ingest local addr")?);
    let mut buf = vec![0u8; 64 * 1024];
    let mut bad_streak = 0u64;

    loop {
        let (n, from) = tokio::select! {
            r = socket.recv_from(&mut buf) => match r {
                Ok(v) => v,
                Err(e) => {
                    warn!("ingest: recv failed: {}", e);
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        match parse_datagram(&buf[..n]) {
            Ok(rec) => {
                if bad_streak > 0 {
                    info!("ingest: valid records again after {} malformed", bad_streak);
                    bad_streak = 0;
                }
                topics.dispatch(rec);
            }
            Err(e) => {
                if bad_streak == 0 {
                    warn!("ingest: dropping malformed datagram from {}: {:#}", from, e);
                } else {
                    debug!("ingest: dropping malformed datagram from {}: {:#}", from, e);
                }
                bad_streak += 1;
            }
        }
    }
    info!("ingest: stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> IngestTopics {
        IngestTopics {
            tracks: Topic::new("tracks"),
            battery: Topic::new("battery_state"),
            depth: Topic::new("depth"),
            telemetry: Topic::new("telemetry"),
        }
    }

    #[test]
    fn records_are_routed_by_topic_tag() {
        let raw = br#"{"topic":"tracks","frame_seq":12,"tracks":[
            {"id":4,"bbox":{"x1":10,"y1":20,"x2":50,"y2":80},"class_id":0,"label":"person","confidence":0.9}]}"#;
        match parse_datagram(raw).unwrap() {
            IngestRecord::Tracks(s) => {
                assert_eq!(s.frame_seq, 12);
                assert_eq!(s.tracks[0].id, 4);
            }
            other => panic!("unexpected {:?}", other),
        }

        let raw = br#"{"topic":"battery_state","bat1_active":false,"bat2_active":true}"#;
        assert_eq!(
            parse_datagram(raw).unwrap(),
            IngestRecord::BatteryState(BatteryState { bat1_active: false, bat2_active: true })
        );
    }

    #[test]
    fn malformed_records_are_errors() {
        assert!(parse_datagram(b"not json").is_err());
        assert!(parse_datagram(br#"{"topic":"weather","temp":3}"#).is_err());
        assert!(parse_datagram(br#"{"topic":"depth","track_id":"x"}"#).is_err());
    }

    #[test]
    fn out_of_range_numbers_are_rejected() {
        let raw = br#"{"topic":"tracks","frame_seq":3,"tracks":[
            {"id":9,"bbox":{"x1":-1e39,"y1":20,"x2":1e39,"y2":80},"confidence":0.9}]}"#;
        let err = parse_datagram(raw).unwrap_err();
        assert!(format!("{:#}", err).contains("track 9"));

        let raw = br#"{"topic":"tracks","frame_seq":3,"tracks":[
            {"id":9,"bbox":{"x1":10,"y1":20,"x2":50,"y2":80},"confidence":1e40}]}"#;
        assert!(parse_datagram(raw).is_err());
        assert!(parse_datagram(br#"{"topic":"depth","track_id":4,"depth_m":-1e39}"#).is_err());
    }

    #[test]
    fn dispatch_publishes_and_stamps() {
        let t = topics();
        let depth = t.depth.subscribe();
        let debug = t.telemetry.subscribe();

        t.dispatch(parse_datagram(br#"{"topic":"depth","track_id":4,"depth_m":12.5}"#).unwrap());
        t.dispatch(parse_datagram(br#"{"topic":"telemetry","values":[{"name":"FPS","value":30}]}"#).unwrap());

        let d = depth.latest().unwrap();
        assert_eq!(d.value.depth_m, 12.5);
        assert!(d.value.ts_unix_ms > 0);
        assert_eq!(debug.latest().unwrap().value.values.len(), 1);
    }

    #[tokio::test]
    async fn udp_datagrams_reach_the_topics() {
        let socket = bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let t = topics();
        let battery = t.battery.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(socket, t, stop_rx));

        let tx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        tx.send_to(b"garbage", addr).await.unwrap();
        tx.send_to(br#"{"topic":"battery_state","bat1_active":true,"bat2_active":false}"#, addr).await.unwrap();

        for _ in 0..100 {
            if battery.latest().is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(battery.latest().unwrap().value.active_bank(), 1);

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
