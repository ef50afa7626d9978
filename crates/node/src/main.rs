//! Hydroponic controller emulator.
//!
//! Speaks the hub's MQTT envelope protocol: publishes `sensor_data` every
//! `SAMPLE_EVERY_S`, `relay_status` whenever a relay changes and
//! `system_status` on connect. Commands arriving on the commands topic are
//! applied to local state and answered with an `ack`.

mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{Actuators, Sample, Scenario, TankSim};

/// Profile ids the emulated controller knows about.
const PROFILE_IDS: [&str; 4] = ["1", "2", "3", "4"];

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct Relays {
    tds_relay: bool,
    humidity_relay: bool,
    air_circulation_relay: bool,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Command {
    SetRelay {
        id: String,
        relay: String,
        state: bool,
    },
    SetAutoMode {
        id: String,
        enabled: bool,
    },
    SetProfile {
        id: String,
        #[serde(rename = "profileId")]
        profile_id: String,
    },
}

fn envelope(kind: &str, data: Value, at: OffsetDateTime) -> Vec<u8> {
    let timestamp = at
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();
    json!({ "type": kind, "data": data, "timestamp": timestamp })
        .to_string()
        .into_bytes()
}

fn reading_json(s: &Sample) -> Value {
    json!({
        "airTemperature": s.air_temperature,
        "airHumidity": s.air_humidity,
        "waterTemperature": s.water_temperature,
        "tds": s.tds,
        "ph": s.ph,
    })
}

/// Body for the backend's `POST /sensors`.
#[derive(Debug, Serialize)]
struct SensorPost<'a> {
    device_id: &'a str,
    air_temperature: f64,
    air_humidity: f64,
    water_temperature: f64,
    tds: f64,
    ph: f64,
    tds_relay: bool,
    humidity_relay: bool,
    air_circulation_relay: bool,
    status: &'a str,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Device state
// ---------------------------------------------------------------------------

struct Device {
    relays: Relays,
    auto_mode: bool,
    profile_id: String,
}

impl Device {
    fn new() -> Self {
        Self {
            relays: Relays {
                tds_relay: false,
                humidity_relay: true,
                air_circulation_relay: false,
            },
            auto_mode: true,
            profile_id: PROFILE_IDS[0].to_string(),
        }
    }

    fn actuators(&self) -> Actuators {
        Actuators {
            dosing: self.relays.tds_relay,
            humidifier: self.relays.humidity_relay,
            circulation: self.relays.air_circulation_relay,
        }
    }

    /// Threshold control while auto mode is on. Returns true when a relay
    /// changed.
    fn auto_control(&mut self, s: &Sample) -> bool {
        if !self.auto_mode {
            return false;
        }
        let before = self.relays;
        self.relays.tds_relay = s.tds < 700.0;
        self.relays.humidity_relay = s.air_humidity < 60.0;
        self.relays.air_circulation_relay = s.air_temperature > 26.0;
        self.relays != before
    }

    /// Apply one command. Returns the ack payload and whether the relay
    /// triple changed.
    fn handle(&mut self, cmd: Command) -> (Value, bool) {
        match cmd {
            Command::SetRelay { id, relay, state } => {
                if self.auto_mode {
                    return (reject(&id, "auto mode is active"), false);
                }
                let slot = match relay.as_str() {
                    "tdsRelay" => &mut self.relays.tds_relay,
                    "humidityRelay" => &mut self.relays.humidity_relay,
                    "airCirculationRelay" => &mut self.relays.air_circulation_relay,
                    other => return (reject(&id, &format!("unknown relay '{other}'")), false),
                };
                let changed = *slot != state;
                *slot = state;
                (json!({ "id": id, "ok": true, "relays": self.relays }), changed)
            }
            Command::SetAutoMode { id, enabled } => {
                self.auto_mode = enabled;
                (json!({ "id": id, "ok": true, "autoMode": enabled }), false)
            }
            Command::SetProfile { id, profile_id } => {
                if !PROFILE_IDS.contains(&profile_id.as_str()) {
                    return (reject(&id, &format!("profile '{profile_id}' not found")), false);
                }
                self.profile_id = profile_id;
                (json!({ "id": id, "ok": true, "profileId": self.profile_id }), false)
            }
        }
    }
}

fn reject(id: &str, reason: &str) -> Value {
    json!({ "id": id, "ok": false, "error": reason })
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

enum Inbound {
    Connected,
    Command(Vec<u8>),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| "hydrobuddy-001".to_string());
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let api_url = env::var("API_URL").ok();

    let events_topic = format!("hydro/{device_id}/events");
    let commands_topic = format!("hydro/{device_id}/commands");

    let mut mqttoptions = MqttOptions::new(format!("hydro-node-{device_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    // The event loop task forwards connects and commands to the main loop.
    let (tx, mut rx) = mpsc::channel::<Inbound>(32);
    let sub_client = client.clone();
    let sub_topic = commands_topic.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                    if let Err(e) = sub_client.try_subscribe(&sub_topic, QoS::AtLeastOnce) {
                        warn!(error = %e, "subscribe failed");
                    }
                    let _ = tx.send(Inbound::Connected).await;
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    let _ = tx.send(Inbound::Command(p.payload.to_vec())).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt error; retrying");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let http = reqwest::Client::new();
    let mut device = Device::new();
    let start = Sample {
        air_temperature: 23.5,
        air_humidity: 68.0,
        water_temperature: 21.3,
        tds: 780.0,
        ph: 6.2,
    };
    let mut tank = TankSim::new(scenario, start, fastrand::Rng::new());
    let mut ticker = interval(Duration::from_secs(sample_every_s.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(%device_id, %events_topic, %scenario, sample_every_s, "node started");

    let publish = |payload: Vec<u8>| {
        let client = client.clone();
        let topic = events_topic.clone();
        async move {
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
                warn!(error = %e, "publish error");
            }
        }
    };

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = OffsetDateTime::now_utc();
                let sample = tank.step(device.actuators());
                publish(envelope("sensor_data", reading_json(&sample), now)).await;
                debug!(tds = sample.tds, ph = sample.ph, "published reading");

                if device.auto_control(&sample) {
                    info!(relays = ?device.relays, "auto mode switched relays");
                    publish(envelope("relay_status", json!(device.relays), now)).await;
                }

                if let Some(base) = &api_url {
                    let body = SensorPost {
                        device_id: &device_id,
                        air_temperature: sample.air_temperature,
                        air_humidity: sample.air_humidity,
                        water_temperature: sample.water_temperature,
                        tds: sample.tds,
                        ph: sample.ph,
                        tds_relay: device.relays.tds_relay,
                        humidity_relay: device.relays.humidity_relay,
                        air_circulation_relay: device.relays.air_circulation_relay,
                        status: "online",
                        timestamp: now,
                    };
                    let url = format!("{}/sensors", base.trim_end_matches('/'));
                    match http.post(&url).json(&body).send().await.and_then(|r| r.error_for_status()) {
                        Ok(_) => debug!(%url, "posted reading"),
                        Err(e) => warn!(%url, error = %e, "post reading failed"),
                    }
                }
            }
            Some(msg) = rx.recv() => {
                let now = OffsetDateTime::now_utc();
                match msg {
                    Inbound::Connected => {
                        publish(envelope("system_status", json!({ "status": "online" }), now)).await;
                        publish(envelope("auto_mode", json!({ "autoMode": device.auto_mode }), now)).await;
                        publish(envelope("relay_status", json!(device.relays), now)).await;
                    }
                    Inbound::Command(payload) => match serde_json::from_slice::<Command>(&payload) {
                        Ok(cmd) => {
                            debug!(?cmd, "command");
                            let (ack, relays_changed) = device.handle(cmd);
                            publish(envelope("ack", ack, now)).await;
                            if relays_changed {
                                publish(envelope("relay_status", json!(device.relays), now)).await;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "bad command json");
                            publish(envelope("error", json!({ "message": format!("bad command: {e}") }), now)).await;
                        }
                    },
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn manual() -> Device {
        Device {
            auto_mode: false,
            ..Device::new()
        }
    }

    fn cmd(v: Value) -> Command {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn command_parses_hub_envelopes() {
        let c = cmd(json!({
            "type": "set_relay", "id": "cmd-1", "deviceId": "d",
            "relay": "tdsRelay", "state": true
        }));
        assert_eq!(
            c,
            Command::SetRelay {
                id: "cmd-1".into(),
                relay: "tdsRelay".into(),
                state: true
            }
        );
        let c = cmd(json!({ "type": "set_profile", "id": "cmd-2", "profileId": "3" }));
        assert_eq!(
            c,
            Command::SetProfile {
                id: "cmd-2".into(),
                profile_id: "3".into()
            }
        );
    }

    #[test]
    fn set_relay_acks_full_triple() {
        let mut d = manual();
        let (ack, changed) = d.handle(cmd(json!({
            "type": "set_relay", "id": "cmd-1", "relay": "tdsRelay", "state": true
        })));
        assert!(changed);
        assert_eq!(ack["ok"], true);
        assert_eq!(ack["relays"]["tdsRelay"], true);
        assert_eq!(ack["relays"]["humidityRelay"], true);
    }

    #[test]
    fn set_relay_rejected_in_auto_mode() {
        let mut d = Device::new();
        let (ack, changed) = d.handle(cmd(json!({
            "type": "set_relay", "id": "cmd-1", "relay": "tdsRelay", "state": true
        })));
        assert!(!changed);
        assert_eq!(ack["ok"], false);
        assert_eq!(ack["error"], "auto mode is active");
        assert!(!d.relays.tds_relay);
    }

    #[test]
    fn unknown_relay_rejected() {
        let mut d = manual();
        let (ack, _) = d.handle(cmd(json!({
            "type": "set_relay", "id": "x", "relay": "pump", "state": true
        })));
        assert_eq!(ack["ok"], false);
    }

    #[test]
    fn unknown_profile_rejected() {
        let mut d = manual();
        let (ack, _) = d.handle(cmd(json!({ "type": "set_profile", "id": "x", "profileId": "9" })));
        assert_eq!(ack["ok"], false);
        assert_eq!(d.profile_id, "1");
    }

    #[test]
    fn auto_mode_ack() {
        let mut d = Device::new();
        let (ack, _) = d.handle(cmd(json!({ "type": "set_auto_mode", "id": "x", "enabled": false })));
        assert_eq!(ack["autoMode"], false);
        assert!(!d.auto_mode);
    }

    #[test]
    fn auto_control_switches_relays_on_thresholds() {
        let mut d = Device::new();
        let low_tds = Sample {
            air_temperature: 27.0,
            air_humidity: 70.0,
            water_temperature: 21.0,
            tds: 650.0,
            ph: 6.2,
        };
        assert!(d.auto_control(&low_tds));
        assert!(d.relays.tds_relay);
        assert!(!d.relays.humidity_relay);
        assert!(d.relays.air_circulation_relay);
        assert!(!d.auto_control(&low_tds));

        let mut m = manual();
        assert!(!m.auto_control(&low_tds));
    }

    #[test]
    fn envelope_shape() {
        let at = OffsetDateTime::from_unix_timestamp(1_714_564_800).unwrap();
        let bytes = envelope("system_status", json!({ "status": "online" }), at);
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["type"], "system_status");
        assert_eq!(v["data"]["status"], "online");
        assert_eq!(v["timestamp"], "2024-05-01T12:00:00Z");
    }

    #[test]
    fn sensor_post_is_snake_case() {
        let post = SensorPost {
            device_id: "d",
            air_temperature: 23.5,
            air_humidity: 68.0,
            water_temperature: 21.3,
            tds: 780.0,
            ph: 6.2,
            tds_relay: false,
            humidity_relay: true,
            air_circulation_relay: false,
            status: "online",
            timestamp: OffsetDateTime::from_unix_timestamp(0).unwrap(),
        };
        let v = serde_json::to_value(&post).unwrap();
        assert_eq!(v["device_id"], "d");
        assert_eq!(v["water_temperature"], 21.3);
        assert_eq!(v["humidity_relay"], true);
    }
}
