//! REST polling transport.
//!
//! One ticker per data class, each with its own period:
//!
//! | class    | endpoints                                             |
//! |----------|-------------------------------------------------------|
//! | live     | `/sensors/latest`, `/devices/{id}/status`, `/relays`  |
//! | history  | `/sensors/history`                                    |
//! | profiles | `/profiles` (also on demand after an activation)      |
//!
//! A failed request keeps whatever the engine already holds. The link is
//! considered up while both the latest-reading and status requests succeed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{report_link, Ack, Transport};
use crate::engine::EngineHandle;
use crate::error::EngineError;
use crate::model::{CropProfile, HistoricalData, RelayStates, SensorReading, SystemStatus};
use crate::reconciler::{Change, Confirmation, InboundEvent, InboundKind, Tier};

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub base_url: String,
    pub request_timeout: Duration,
    pub live_every: Duration,
    pub history_every: Duration,
    pub profiles_every: Duration,
    pub history_limit: usize,
}

#[derive(Debug, Clone, Copy)]
enum DataClass {
    Live,
    History,
    Profiles,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AutoModeResponse {
    auto_mode: bool,
}

// ---------------------------------------------------------------------------
// Shared poller state
// ---------------------------------------------------------------------------

struct Inner {
    client: reqwest::Client,
    settings: PollSettings,
    device_id: String,
    engine: EngineHandle,
    connected: AtomicBool,
}

impl Inner {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.settings.base_url.trim_end_matches('/'))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, EngineError> {
        let resp = self
            .client
            .get(self.url(path))
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<T>().await?)
    }

    async fn put<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> Result<T, EngineError> {
        let resp = self
            .client
            .put(self.url(path))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<T>().await?)
    }

    fn device_query(&self) -> [(&'static str, String); 1] {
        [("deviceId", self.device_id.clone())]
    }

    async fn emit(&self, at: OffsetDateTime, kind: InboundKind) {
        let event = InboundEvent::new(Tier::Poll, at, kind);
        if self.engine.apply_inbound(event).await.is_err() {
            debug!("engine stopped; poll result dropped");
        }
    }

    async fn set_link(&self, up: bool) {
        if self.connected.swap(up, Ordering::SeqCst) != up {
            report_link(&self.engine, Tier::Poll, up).await;
        }
    }

    async fn poll_live(&self) {
        // Stamped with the issue time so a response that raced a command
        // cannot overwrite the command's confirmation.
        let issued = OffsetDateTime::now_utc();
        let query = self.device_query();
        let status_path = format!("/devices/{}/status", self.device_id);

        let (reading, status, relays) = tokio::join!(
            self.get::<SensorReading>("/sensors/latest", &query),
            self.get::<SystemStatus>(&status_path, &[]),
            self.get::<RelayStates>("/relays", &query),
        );

        let mut healthy = true;
        match reading {
            Ok(r) => self.emit(r.timestamp, InboundKind::Reading(r)).await,
            Err(e) => {
                healthy = false;
                warn!(error = %e, "poll: latest reading failed");
            }
        }
        match status {
            Ok(s) => self.emit(issued, InboundKind::StatusUpdate(s)).await,
            Err(e) => {
                healthy = false;
                warn!(error = %e, "poll: device status failed");
            }
        }
        match relays {
            Ok(r) => self.emit(issued, InboundKind::RelayUpdate(r)).await,
            Err(e) => warn!(error = %e, "poll: relay states failed"),
        }
        self.set_link(healthy).await;
    }

    async fn poll_history(&self) {
        let issued = OffsetDateTime::now_utc();
        let query = [
            ("deviceId", self.device_id.clone()),
            ("limit", self.settings.history_limit.to_string()),
        ];
        match self.get::<HistoricalData>("/sensors/history", &query).await {
            Ok(h) => self.emit(issued, InboundKind::History(h)).await,
            Err(e) => warn!(error = %e, "poll: history failed"),
        }
    }

    async fn poll_profiles(&self) {
        let issued = OffsetDateTime::now_utc();
        match self.get::<Vec<CropProfile>>("/profiles", &self.device_query()).await {
            Ok(list) => self.emit(issued, InboundKind::Profiles(list)).await,
            Err(e) => warn!(error = %e, "poll: profiles failed"),
        }
    }
}

async fn run_ticker(inner: Arc<Inner>, class: DataClass, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match class {
            DataClass::Live => inner.poll_live().await,
            DataClass::History => inner.poll_history().await,
            DataClass::Profiles => inner.poll_profiles().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct PollTransport {
    inner: Arc<Inner>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl PollTransport {
    pub fn new(device_id: impl Into<String>, settings: PollSettings, engine: EngineHandle) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                settings,
                device_id: device_id.into(),
                engine,
                connected: AtomicBool::new(false),
            }),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Transport for PollTransport {
    fn name(&self) -> &'static str {
        "rest"
    }

    fn tier(&self) -> Tier {
        Tier::Poll
    }

    async fn connect(&self) -> Result<(), EngineError> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }
        let s = &self.inner.settings;
        for (class, every) in [
            (DataClass::Live, s.live_every),
            (DataClass::History, s.history_every),
            (DataClass::Profiles, s.profiles_every),
        ] {
            tasks.push(tokio::spawn(run_ticker(Arc::clone(&self.inner), class, every)));
        }
        info!(
            base_url = %s.base_url,
            live_ms = s.live_every.as_millis() as u64,
            history_ms = s.history_every.as_millis() as u64,
            profiles_ms = s.profiles_every.as_millis() as u64,
            "rest polling started"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.inner.set_link(false).await;
        info!("rest polling stopped");
    }

    async fn send(&self, change: &Change) -> Result<Ack, EngineError> {
        let device_id = &self.inner.device_id;
        let confirmation = match change {
            Change::Relay { key, on } => {
                let relays: RelayStates = self
                    .inner
                    .put(
                        &format!("/relays/{key}"),
                        json!({ "deviceId": device_id, "state": on }),
                    )
                    .await?;
                Confirmation::Relays(relays)
            }
            Change::AutoMode(enabled) => {
                let resp: AutoModeResponse = self
                    .inner
                    .put(
                        "/system/auto-mode",
                        json!({ "deviceId": device_id, "enabled": enabled }),
                    )
                    .await?;
                Confirmation::AutoMode(resp.auto_mode)
            }
            Change::ActivateProfile(id) => {
                let profile: CropProfile = self
                    .inner
                    .put(
                        &format!("/profiles/{id}/activate"),
                        json!({ "deviceId": device_id }),
                    )
                    .await?;
                Confirmation::ProfileActivated(profile.id)
            }
        };
        Ok(Ack {
            confirmation,
            tier: Tier::Poll,
            at: OffsetDateTime::now_utc(),
        })
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn refresh_profiles(&self) {
        self.inner.poll_profiles().await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
