//! MQTT push transport.
//!
//! The device publishes JSON envelopes on `hydro/<device>/events` and reads
//! commands from `hydro/<device>/commands`. A single event-loop task owns the
//! connection; when rumqttc reports an error it waits a fixed backoff and
//! polls again, which makes rumqttc reconnect. There is never more than one
//! reconnect in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{report_link, Ack, Transport};
use crate::engine::EngineHandle;
use crate::error::EngineError;
use crate::model::{RelayStates, SensorReading, SystemStatus};
use crate::reconciler::{Change, Confirmation, InboundEvent, InboundKind, Tier};

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub backoff: Duration,
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

pub fn events_topic(device_id: &str) -> String {
    format!("hydro/{device_id}/events")
}

pub fn commands_topic(device_id: &str) -> String {
    format!("hydro/{device_id}/commands")
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default, with = "time::serde::rfc3339::option")]
    timestamp: Option<OffsetDateTime>,
}

/// `sensor_data` payload; the reading's own timestamp is optional and falls
/// back to the envelope's.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadingData {
    air_temperature: f64,
    air_humidity: f64,
    water_temperature: f64,
    tds: f64,
    ph: f64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    timestamp: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    status: SystemStatus,
}

#[derive(Debug, Deserialize)]
struct AutoModeData {
    #[serde(rename = "autoMode", alias = "enabled")]
    auto_mode: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorData {
    message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AckData {
    pub(crate) id: String,
    pub(crate) ok: bool,
    #[serde(default)]
    pub(crate) error: Option<String>,
    #[serde(default)]
    pub(crate) relays: Option<RelayStates>,
    #[serde(default)]
    pub(crate) auto_mode: Option<bool>,
    #[serde(default)]
    pub(crate) profile_id: Option<String>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Decoded {
    Event(InboundEvent),
    Ack(AckData, OffsetDateTime),
}

fn data<T: serde::de::DeserializeOwned>(kind: &str, value: serde_json::Value) -> Result<T, EngineError> {
    serde_json::from_value(value)
        .map_err(|e| EngineError::MalformedMessage(format!("{kind} payload: {e}")))
}

/// Parse one payload from the events topic. `now` stamps envelopes that
/// carry no timestamp.
pub(crate) fn decode(payload: &[u8], now: OffsetDateTime) -> Result<Decoded, EngineError> {
    let env: Envelope = serde_json::from_slice(payload)
        .map_err(|e| EngineError::MalformedMessage(format!("envelope: {e}")))?;
    let at = env.timestamp.unwrap_or(now);
    let event = |kind: InboundKind| -> Result<Decoded, EngineError> {
        Ok(Decoded::Event(InboundEvent::new(Tier::Push, at, kind)))
    };

    match env.kind.as_str() {
        "sensor_data" => {
            let r: ReadingData = data(&env.kind, env.data)?;
            let timestamp = r.timestamp.unwrap_or(at);
            let reading = SensorReading {
                air_temperature: r.air_temperature,
                air_humidity: r.air_humidity,
                water_temperature: r.water_temperature,
                tds: r.tds,
                ph: r.ph,
                timestamp,
            };
            Ok(Decoded::Event(InboundEvent::new(
                Tier::Push,
                timestamp,
                InboundKind::Reading(reading),
            )))
        }
        "relay_status" => event(InboundKind::RelayUpdate(data(&env.kind, env.data)?)),
        "system_status" => {
            let s: StatusData = data(&env.kind, env.data)?;
            event(InboundKind::StatusUpdate(s.status))
        }
        "auto_mode" => {
            let a: AutoModeData = data(&env.kind, env.data)?;
            event(InboundKind::AutoMode(a.auto_mode))
        }
        "error" => {
            let e: ErrorData = data(&env.kind, env.data)?;
            event(InboundKind::Error(e.message))
        }
        "ack" => Ok(Decoded::Ack(data(&env.kind, env.data)?, at)),
        other => Err(EngineError::MalformedMessage(format!(
            "unknown message type '{other}'"
        ))),
    }
}

pub(crate) fn encode_command(id: &str, device_id: &str, change: &Change) -> Vec<u8> {
    let body = match change {
        Change::Relay { key, on } => json!({
            "type": "set_relay",
            "id": id,
            "deviceId": device_id,
            "relay": key,
            "state": on,
        }),
        Change::AutoMode(enabled) => json!({
            "type": "set_auto_mode",
            "id": id,
            "deviceId": device_id,
            "enabled": enabled,
        }),
        Change::ActivateProfile(profile_id) => json!({
            "type": "set_profile",
            "id": id,
            "deviceId": device_id,
            "profileId": profile_id,
        }),
    };
    body.to_string().into_bytes()
}

/// Turn an ack into the confirmation for `change`.
pub(crate) fn confirmation(change: &Change, ack: &AckData) -> Result<Confirmation, EngineError> {
    if !ack.ok {
        let reason = ack
            .error
            .clone()
            .unwrap_or_else(|| "rejected by device".to_string());
        return Err(EngineError::CommandRejected(reason));
    }
    let missing = |field: &str| EngineError::MalformedMessage(format!("ack {} has no {field}", ack.id));
    match change {
        Change::Relay { .. } => ack
            .relays
            .map(Confirmation::Relays)
            .ok_or_else(|| missing("relays")),
        Change::AutoMode(_) => ack
            .auto_mode
            .map(Confirmation::AutoMode)
            .ok_or_else(|| missing("autoMode")),
        Change::ActivateProfile(_) => ack
            .profile_id
            .clone()
            .map(Confirmation::ProfileActivated)
            .ok_or_else(|| missing("profileId")),
    }
}

// ---------------------------------------------------------------------------
// Shared connection state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct AckReply {
    data: AckData,
    at: OffsetDateTime,
}

#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    acks: Mutex<HashMap<String, oneshot::Sender<AckReply>>>,
}

impl Shared {
    fn acks(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<AckReply>>> {
        self.acks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: &str) -> oneshot::Receiver<AckReply> {
        let (tx, rx) = oneshot::channel();
        self.acks().insert(id.to_string(), tx);
        rx
    }

    fn resolve(&self, data: AckData, at: OffsetDateTime) {
        match self.acks().remove(&data.id) {
            Some(tx) => {
                let _ = tx.send(AckReply { data, at });
            }
            None => debug!(id = %data.id, "ack for unknown or expired command"),
        }
    }

    async fn mark_up(&self, engine: &EngineHandle) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            report_link(engine, Tier::Push, true).await;
        }
    }

    /// Drops every waiting sender, so in-flight sends fail fast.
    async fn mark_down(&self, engine: &EngineHandle) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.acks().clear();
            report_link(engine, Tier::Push, false).await;
        }
    }
}

/// Removes a pending ack when `send` returns or is cancelled.
struct PendingAck<'a> {
    shared: &'a Shared,
    id: String,
}

impl Drop for PendingAck<'_> {
    fn drop(&mut self) {
        self.shared.acks().remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct PushTransport {
    device_id: String,
    settings: MqttSettings,
    engine: EngineHandle,
    shared: Arc<Shared>,
    client: tokio::sync::Mutex<Option<AsyncClient>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl PushTransport {
    pub fn new(device_id: impl Into<String>, settings: MqttSettings, engine: EngineHandle) -> Self {
        Self {
            device_id: device_id.into(),
            settings,
            engine,
            shared: Arc::new(Shared::default()),
            client: tokio::sync::Mutex::new(None),
            task: tokio::sync::Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Transport for PushTransport {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn tier(&self) -> Tier {
        Tier::Push
    }

    async fn connect(&self) -> Result<(), EngineError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        let mut options = MqttOptions::new(
            format!("hydro-hub-{}", self.device_id),
            self.settings.host.clone(),
            self.settings.port,
        );
        options.set_keep_alive(self.settings.keep_alive);
        let (client, eventloop) = AsyncClient::new(options, 20);

        *self.client.lock().await = Some(client.clone());
        *task = Some(tokio::spawn(run_loop(
            eventloop,
            client,
            Arc::clone(&self.shared),
            self.engine.clone(),
            events_topic(&self.device_id),
            self.settings.backoff,
        )));

        info!(
            host = %self.settings.host,
            port = self.settings.port,
            device = %self.device_id,
            "mqtt transport started"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(client) = self.client.lock().await.take() {
            let _ = client.try_disconnect();
        }
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        self.shared.mark_down(&self.engine).await;
        info!("mqtt transport stopped");
    }

    async fn send(&self, change: &Change) -> Result<Ack, EngineError> {
        if !self.is_connected() {
            return Err(EngineError::TransportUnavailable);
        }
        let client = self
            .client
            .lock()
            .await
            .clone()
            .ok_or(EngineError::TransportUnavailable)?;

        let id = format!("cmd-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let rx = self.shared.register(&id);
        let _pending = PendingAck {
            shared: &self.shared,
            id: id.clone(),
        };

        client
            .publish(
                commands_topic(&self.device_id),
                QoS::AtLeastOnce,
                false,
                encode_command(&id, &self.device_id, change),
            )
            .await
            .map_err(|e| EngineError::RequestFailed(e.to_string()))?;
        debug!(%id, ?change, "command published");

        let reply = rx.await.map_err(|_| EngineError::TransportUnavailable)?;
        let confirmation = confirmation(change, &reply.data)?;
        Ok(Ack {
            confirmation,
            tier: Tier::Push,
            at: reply.at,
        })
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

async fn run_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    engine: EngineHandle,
    topic: String,
    backoff: Duration,
) {
    loop {
        match on_event(eventloop.poll().await, &client, &shared, &engine, &topic).await {
            Step::Continue => {}
            Step::Backoff => {
                debug!(backoff_ms = backoff.as_millis() as u64, "mqtt backing off");
                tokio::time::sleep(backoff).await;
            }
            Step::Stop => return,
        }
    }
}

/// What the event loop does after one event.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    /// Wait out the backoff, then poll again so rumqttc reconnects.
    Backoff,
    /// The engine is gone.
    Stop,
}

async fn on_event(
    event: Result<Event, ConnectionError>,
    client: &AsyncClient,
    shared: &Shared,
    engine: &EngineHandle,
    topic: &str,
) -> Step {
    match event {
        Ok(Event::Incoming(Packet::ConnAck(_))) => {
            // Subscriptions do not survive a clean session; renew them on
            // every connect.
            if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                warn!(error = %e, %topic, "mqtt subscribe failed");
            }
            info!(%topic, "mqtt connected");
            shared.mark_up(engine).await;
        }
        Ok(Event::Incoming(Packet::Publish(p))) => {
            match decode(&p.payload, OffsetDateTime::now_utc()) {
                Ok(Decoded::Event(event)) => {
                    if engine.apply_inbound(event).await.is_err() {
                        debug!("engine stopped; mqtt loop exiting");
                        return Step::Stop;
                    }
                }
                Ok(Decoded::Ack(data, at)) => shared.resolve(data, at),
                Err(e) => warn!(error = %e, topic = %p.topic, "dropping malformed mqtt message"),
            }
        }
        Ok(Event::Incoming(Packet::Disconnect)) => {
            info!("mqtt disconnected by broker");
            shared.mark_down(engine).await;
        }
        Ok(_) => {}
        Err(e) => {
            warn!(error = %e, "mqtt connection error; retrying");
            shared.mark_down(engine).await;
            return Step::Backoff;
        }
    }
    Step::Continue
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine;
    use crate::model::{HistoricalData, RelayKey};
    use crate::reconciler::{Reconciler, Seed};
    use rumqttc::{ConnAck, ConnectReturnCode, Publish};
    use time::macros::datetime;

    fn now() -> OffsetDateTime {
        datetime!(2024-05-01 12:00 UTC)
    }

    fn event(payload: &str) -> InboundEvent {
        match decode(payload.as_bytes(), now()).unwrap() {
            Decoded::Event(e) => e,
            other => panic!("expected event, got {other:?}"),
        }
    }

    // -- Topics -------------------------------------------------------------

    #[test]
    fn topics_are_scoped_by_device() {
        assert_eq!(events_topic("hydrobuddy-001"), "hydro/hydrobuddy-001/events");
        assert_eq!(commands_topic("hydrobuddy-001"), "hydro/hydrobuddy-001/commands");
    }

    // -- decode -------------------------------------------------------------

    #[test]
    fn decode_sensor_data() {
        let e = event(
            r#"{"type":"sensor_data","timestamp":"2024-05-01T12:00:05Z",
                "data":{"airTemperature":23.1,"airHumidity":64,"waterTemperature":21,
                        "tds":790,"ph":6.3}}"#,
        );
        assert_eq!(e.tier, Tier::Push);
        assert_eq!(e.at, datetime!(2024-05-01 12:00:05 UTC));
        match e.kind {
            InboundKind::Reading(r) => {
                assert_eq!(r.tds, 790.0);
                assert_eq!(r.timestamp, e.at);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_sensor_data_prefers_reading_timestamp() {
        let e = event(
            r#"{"type":"sensor_data","timestamp":"2024-05-01T12:00:05Z",
                "data":{"airTemperature":23.1,"airHumidity":64,"waterTemperature":21,
                        "tds":790,"ph":6.3,"timestamp":"2024-05-01T11:59:59Z"}}"#,
        );
        assert_eq!(e.at, datetime!(2024-05-01 11:59:59 UTC));
    }

    #[test]
    fn decode_relay_status() {
        let e = event(
            r#"{"type":"relay_status","data":{"tdsRelay":true,"humidityRelay":false,"airCirculationRelay":true}}"#,
        );
        // no envelope timestamp: stamped with receipt time
        assert_eq!(e.at, now());
        assert_eq!(
            e.kind,
            InboundKind::RelayUpdate(RelayStates {
                tds_relay: true,
                humidity_relay: false,
                air_circulation_relay: true,
            })
        );
    }

    #[test]
    fn decode_system_status() {
        let e = event(r#"{"type":"system_status","data":{"status":"warning"}}"#);
        assert_eq!(e.kind, InboundKind::StatusUpdate(SystemStatus::Warning));
    }

    #[test]
    fn decode_auto_mode_accepts_both_field_names() {
        let a = event(r#"{"type":"auto_mode","data":{"autoMode":false}}"#);
        let b = event(r#"{"type":"auto_mode","data":{"enabled":true}}"#);
        assert_eq!(a.kind, InboundKind::AutoMode(false));
        assert_eq!(b.kind, InboundKind::AutoMode(true));
    }

    #[test]
    fn decode_ack() {
        let d = decode(
            br#"{"type":"ack","timestamp":"2024-05-01T12:00:01Z","data":{"id":"cmd-1","ok":true,"autoMode":true}}"#,
            now(),
        )
        .unwrap();
        match d {
            Decoded::Ack(ack, at) => {
                assert_eq!(ack.id, "cmd-1");
                assert_eq!(ack.auto_mode, Some(true));
                assert_eq!(at, datetime!(2024-05-01 12:00:01 UTC));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode(b"not json", now()),
            Err(EngineError::MalformedMessage(_))
        ));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = decode(br#"{"type":"firmware","data":{}}"#, now()).unwrap_err();
        assert!(err.to_string().contains("firmware"));
    }

    #[test]
    fn decode_rejects_incomplete_reading() {
        let err = decode(br#"{"type":"sensor_data","data":{"tds":1}}"#, now()).unwrap_err();
        assert!(matches!(err, EngineError::MalformedMessage(_)));
    }

    #[test]
    fn decode_rejects_bad_status_value() {
        assert!(decode(br#"{"type":"system_status","data":{"status":"melting"}}"#, now()).is_err());
    }

    // -- encode_command -----------------------------------------------------

    #[test]
    fn encode_set_relay() {
        let bytes = encode_command(
            "cmd-7",
            "dev",
            &Change::Relay {
                key: RelayKey::AirCirculationRelay,
                on: true,
            },
        );
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["type"], "set_relay");
        assert_eq!(v["id"], "cmd-7");
        assert_eq!(v["deviceId"], "dev");
        assert_eq!(v["relay"], "airCirculationRelay");
        assert_eq!(v["state"], true);
    }

    #[test]
    fn encode_set_profile() {
        let bytes = encode_command("cmd-8", "dev", &Change::ActivateProfile("3".into()));
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["type"], "set_profile");
        assert_eq!(v["profileId"], "3");
    }

    // -- confirmation -------------------------------------------------------

    fn ack(ok: bool) -> AckData {
        AckData {
            id: "cmd-1".into(),
            ok,
            error: None,
            relays: None,
            auto_mode: None,
            profile_id: None,
        }
    }

    #[test]
    fn negative_ack_is_rejection() {
        let mut a = ack(false);
        a.error = Some("auto mode is on".into());
        let err = confirmation(&Change::AutoMode(true), &a).unwrap_err();
        assert_eq!(err, EngineError::CommandRejected("auto mode is on".into()));
    }

    #[test]
    fn ack_without_expected_field_is_malformed() {
        let err = confirmation(
            &Change::Relay {
                key: RelayKey::TdsRelay,
                on: true,
            },
            &ack(true),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::MalformedMessage(_)));
    }

    #[test]
    fn ack_maps_to_profile_confirmation() {
        let mut a = ack(true);
        a.profile_id = Some("2".into());
        assert_eq!(
            confirmation(&Change::ActivateProfile("2".into()), &a).unwrap(),
            Confirmation::ProfileActivated("2".into())
        );
    }

    // -- ack routing --------------------------------------------------------

    #[tokio::test]
    async fn resolve_wakes_the_waiting_sender() {
        let shared = Shared::default();
        let rx = shared.register("cmd-1");
        let mut a = ack(true);
        a.auto_mode = Some(false);
        shared.resolve(a.clone(), now());
        let reply = rx.await.unwrap();
        assert_eq!(reply.data, a);
        assert!(shared.acks().is_empty());
    }

    #[test]
    fn pending_guard_cleans_up_on_drop() {
        let shared = Shared::default();
        let _rx = shared.register("cmd-2");
        {
            let _guard = PendingAck {
                shared: &shared,
                id: "cmd-2".into(),
            };
        }
        assert!(shared.acks().is_empty());
    }

    // -- event loop ---------------------------------------------------------

    struct Loop {
        client: AsyncClient,
        _eventloop: EventLoop,
        shared: Shared,
        engine: EngineHandle,
        task: JoinHandle<()>,
    }

    impl Loop {
        fn new() -> Self {
            let reading = SensorReading {
                air_temperature: 23.5,
                air_humidity: 68.0,
                water_temperature: 21.3,
                tds: 780.0,
                ph: 6.2,
                timestamp: now(),
            };
            let seed = Seed {
                reading,
                relays: RelayStates::default(),
                auto_mode: false,
                status: SystemStatus::Online,
                profiles: Vec::new(),
                history: HistoricalData::default(),
                at: now(),
            };
            let (engine, task) = engine::spawn(Reconciler::new("dev", seed, 10), None);
            // no broker: the client only queues requests for the event loop
            let (client, eventloop) = AsyncClient::new(MqttOptions::new("hub-test", "localhost", 1883), 10);
            Self {
                client,
                _eventloop: eventloop,
                shared: Shared::default(),
                engine,
                task,
            }
        }

        async fn step(&self, event: Result<Event, ConnectionError>) -> Step {
            on_event(event, &self.client, &self.shared, &self.engine, "hydro/dev/events").await
        }

        async fn wait_connected(&self, connected: bool) {
            let mut rx = self.engine.subscribe();
            tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.connected == connected))
                .await
                .unwrap()
                .unwrap();
        }
    }

    fn connack() -> Result<Event, ConnectionError> {
        Ok(Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))))
    }

    fn publish(payload: &str) -> Result<Event, ConnectionError> {
        Ok(Event::Incoming(Packet::Publish(Publish::new(
            "hydro/dev/events",
            QoS::AtLeastOnce,
            payload.as_bytes().to_vec(),
        ))))
    }

    #[tokio::test]
    async fn connection_error_marks_down_and_reconnect_marks_up() {
        let l = Loop::new();

        assert_eq!(l.step(connack()).await, Step::Continue);
        l.wait_connected(true).await;
        assert!(l.shared.connected.load(Ordering::SeqCst));

        let pending = l.shared.register("cmd-1");
        assert_eq!(l.step(Err(ConnectionError::NetworkTimeout)).await, Step::Backoff);
        l.wait_connected(false).await;
        // in-flight commands fail fast instead of waiting for their timeout
        assert!(pending.await.is_err());

        // a second error while down still backs off
        assert_eq!(l.step(Err(ConnectionError::NetworkTimeout)).await, Step::Backoff);

        assert_eq!(l.step(connack()).await, Step::Continue);
        l.wait_connected(true).await;
    }

    #[tokio::test]
    async fn broker_disconnect_marks_down_without_backoff() {
        let l = Loop::new();
        l.step(connack()).await;
        l.wait_connected(true).await;

        let step = l.step(Ok(Event::Incoming(Packet::Disconnect))).await;
        assert_eq!(step, Step::Continue);
        l.wait_connected(false).await;
    }

    #[tokio::test]
    async fn malformed_publish_is_skipped_and_loop_continues() {
        let l = Loop::new();
        l.step(connack()).await;

        assert_eq!(l.step(publish("not json")).await, Step::Continue);
        assert_eq!(
            l.step(publish(r#"{"type":"firmware","data":{}}"#)).await,
            Step::Continue
        );
        assert_eq!(
            l.step(publish(r#"{"type":"sensor_data","data":{"tds":1}}"#)).await,
            Step::Continue
        );
        assert_eq!(l.engine.snapshot().reading.tds, 780.0);

        // the next good message still lands
        let good = r#"{"type":"sensor_data","timestamp":"2024-05-01T12:00:05Z",
            "data":{"airTemperature":23.1,"airHumidity":64,"waterTemperature":21,"tds":790,"ph":6.3}}"#;
        assert_eq!(l.step(publish(good)).await, Step::Continue);
        let mut rx = l.engine.subscribe();
        rx.wait_for(|s| s.reading.tds == 790.0).await.unwrap();
        assert_eq!(rx.borrow().reading_source, Tier::Push);
    }

    #[tokio::test]
    async fn ack_publish_resolves_the_registered_command() {
        let l = Loop::new();
        let rx = l.shared.register("cmd-4");

        let step = l
            .step(publish(
                r#"{"type":"ack","timestamp":"2024-05-01T12:00:01Z","data":{"id":"cmd-4","ok":true,"autoMode":true}}"#,
            ))
            .await;
        assert_eq!(step, Step::Continue);

        let reply = rx.await.unwrap();
        assert_eq!(reply.data.auto_mode, Some(true));
        assert_eq!(reply.at, datetime!(2024-05-01 12:00:01 UTC));
    }

    #[tokio::test]
    async fn stopped_engine_stops_the_loop() {
        let l = Loop::new();
        l.task.abort();
        let mut rx = l.engine.subscribe();
        // the watch sender lives in the task; wait until it is gone
        while rx.changed().await.is_ok() {}

        let step = l
            .step(publish(r#"{"type":"auto_mode","data":{"autoMode":true}}"#))
            .await;
        assert_eq!(step, Step::Stop);
    }
}
