//! Operator commands: relay toggles, auto mode, profile activation.
//!
//! Each command runs the optimistic protocol against the engine:
//!
//! 1. take the axis lock (a second command on the same axis waits here)
//! 2. propose the desired value (visible to readers immediately)
//! 3. send it through the highest-priority connected transport, falling back
//!    to REST, bounded by the command timeout
//! 4. commit the confirmed value, or roll back on failure

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::engine::EngineHandle;
use crate::error::EngineError;
use crate::model::RelayKey;
use crate::reconciler::{Axis, Change, MutationId, Resolution, Rollback, Stamp, Tier};
use crate::transport::Transport;

/// Default bound on one command round trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum CommandOutcome {
    Confirmed,
    /// The device settled on a different value than requested.
    Corrected { confirmed: ConfirmedValue },
}

/// The value the device reported, flattened for the HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfirmedValue {
    Relay { relay: RelayKey, on: bool },
    AutoMode(bool),
    ActiveProfile(String),
}

impl From<Change> for ConfirmedValue {
    fn from(change: Change) -> Self {
        match change {
            Change::Relay { key, on } => ConfirmedValue::Relay { relay: key, on },
            Change::AutoMode(enabled) => ConfirmedValue::AutoMode(enabled),
            Change::ActivateProfile(id) => ConfirmedValue::ActiveProfile(id),
        }
    }
}

struct AxisLocks {
    relays: [Mutex<()>; 3],
    auto_mode: Mutex<()>,
    profile: Mutex<()>,
}

impl AxisLocks {
    fn new() -> Self {
        Self {
            relays: std::array::from_fn(|_| Mutex::new(())),
            auto_mode: Mutex::new(()),
            profile: Mutex::new(()),
        }
    }

    async fn lock(&self, axis: Axis) -> MutexGuard<'_, ()> {
        match axis {
            Axis::Relay(key) => self.relays[key.index()].lock().await,
            Axis::AutoMode => self.auto_mode.lock().await,
            Axis::Profile => self.profile.lock().await,
        }
    }
}

pub struct Dispatcher {
    engine: EngineHandle,
    transports: Vec<Arc<dyn Transport>>,
    timeout: Duration,
    locks: AxisLocks,
}

impl Dispatcher {
    /// `transports` may be given in any order; they are tried by tier.
    pub fn new(engine: EngineHandle, mut transports: Vec<Arc<dyn Transport>>, timeout: Duration) -> Self {
        transports.sort_by_key(|t| std::cmp::Reverse(t.tier()));
        Self {
            engine,
            transports,
            timeout,
            locks: AxisLocks::new(),
        }
    }

    /// Highest-tier connected transport, else the REST path.
    fn route(&self) -> Option<&Arc<dyn Transport>> {
        self.transports
            .iter()
            .find(|t| t.is_connected())
            .or_else(|| self.transports.iter().find(|t| t.tier() == Tier::Poll))
    }

    // -- Operations ---------------------------------------------------------

    /// Flip one relay. Rejected while auto mode is on.
    pub async fn toggle_relay(&self, key: RelayKey) -> Result<CommandOutcome, EngineError> {
        let _axis = self.locks.lock(Axis::Relay(key)).await;
        let snapshot = self.engine.snapshot();
        if snapshot.auto_mode {
            info!(relay = %key, "toggle rejected: auto mode is active");
            return Err(EngineError::AutoModeActive);
        }
        let on = !snapshot.relays.get(key);
        self.execute(Change::Relay { key, on }).await
    }

    pub async fn set_auto_mode(&self, enabled: bool) -> Result<CommandOutcome, EngineError> {
        let _axis = self.locks.lock(Axis::AutoMode).await;
        self.execute(Change::AutoMode(enabled)).await
    }

    pub async fn activate_profile(&self, id: &str) -> Result<CommandOutcome, EngineError> {
        let _axis = self.locks.lock(Axis::Profile).await;
        if !self.engine.snapshot().has_profile(id) {
            return Err(EngineError::NotFound(id.to_string()));
        }
        let outcome = self.execute(Change::ActivateProfile(id.to_string())).await?;
        if let Some(transport) = self.transports.iter().find(|t| t.tier() == Tier::Poll) {
            transport.refresh_profiles().await;
        }
        Ok(outcome)
    }

    // -- Protocol -----------------------------------------------------------

    async fn execute(&self, change: Change) -> Result<CommandOutcome, EngineError> {
        let axis = change.axis();
        let id = self.engine.propose(change.clone()).await?;

        let Some(transport) = self.route() else {
            self.undo(id, axis).await;
            return Err(EngineError::TransportUnavailable);
        };

        let sent = tokio::time::timeout(self.timeout, transport.send(&change)).await;
        let ack = match sent {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => {
                warn!(%axis, transport = transport.name(), error = %e, "command failed; rolling back");
                self.undo(id, axis).await;
                return Err(e);
            }
            Err(_) => {
                let ms = self.timeout.as_millis() as u64;
                warn!(%axis, transport = transport.name(), timeout_ms = ms, "command timed out; rolling back");
                self.undo(id, axis).await;
                return Err(EngineError::Timeout(ms));
            }
        };

        let resolution = self
            .engine
            .commit(id, ack.confirmation, Stamp::new(ack.tier, ack.at))
            .await?;
        info!(%axis, transport = transport.name(), ?resolution, "command confirmed");
        Ok(match resolution {
            Resolution::Confirmed => CommandOutcome::Confirmed,
            Resolution::Corrected(actual) => CommandOutcome::Corrected {
                confirmed: actual.into(),
            },
        })
    }

    async fn undo(&self, id: MutationId, axis: Axis) {
        match self.engine.rollback(id).await {
            Ok(Rollback::Restored) => {}
            Ok(other) => info!(%axis, ?other, "rollback left newer value in place"),
            Err(e) => warn!(%axis, error = %e, "rollback failed"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
