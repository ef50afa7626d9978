//! Canonical in-memory state for one device.
//!
//! Every field remembers the [`Stamp`] (source tier + timestamp) of its last
//! writer. Inbound updates are applied only when their stamp is not strictly
//! older than the field's current stamp, so a slow poll response can never
//! clobber a push update or an optimistic value that arrived after it.
//!
//! Control changes go through a three-phase protocol:
//!
//! ```text
//! propose ──▶ (transport send) ──┬──▶ commit    (confirmed value wins)
//!                                └──▶ rollback  (prior value + stamp restored)
//! ```
//!
//! The reconciler itself is synchronous and single-owner; the engine task
//! serialises every input into it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::history::HistoryBuffer;
use crate::model::{
    with_active_profile, ChannelRange, CropProfile, HistoricalData, RelayKey, RelayStates,
    SensorReading, SystemStatus,
};

// ---------------------------------------------------------------------------
// Stamps
// ---------------------------------------------------------------------------

/// Source priority, lowest first. `Seed` covers defaults and last-known-good
/// rows loaded at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Seed,
    Simulated,
    Poll,
    Optimistic,
    Push,
}

impl Tier {
    /// Data that came from a real device or backend.
    pub fn is_confirmed(self) -> bool {
        matches!(self, Tier::Poll | Tier::Push)
    }
}

/// Ordered by tier first, then timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp {
    pub tier: Tier,
    pub at: OffsetDateTime,
}

impl Stamp {
    pub fn new(tier: Tier, at: OffsetDateTime) -> Self {
        Self { tier, at }
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub tier: Tier,
    pub at: OffsetDateTime,
    pub kind: InboundKind,
}

impl InboundEvent {
    pub fn new(tier: Tier, at: OffsetDateTime, kind: InboundKind) -> Self {
        Self { tier, at, kind }
    }

    fn stamp(&self) -> Stamp {
        Stamp::new(self.tier, self.at)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundKind {
    Reading(SensorReading),
    RelayUpdate(RelayStates),
    StatusUpdate(SystemStatus),
    AutoMode(bool),
    Profiles(Vec<CropProfile>),
    History(HistoricalData),
    Error(String),
}

/// An operator intent, expressed as the desired end value.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Relay { key: RelayKey, on: bool },
    AutoMode(bool),
    ActivateProfile(String),
}

impl Change {
    pub fn axis(&self) -> Axis {
        match self {
            Change::Relay { key, .. } => Axis::Relay(*key),
            Change::AutoMode(_) => Axis::AutoMode,
            Change::ActivateProfile(_) => Axis::Profile,
        }
    }
}

/// One independently controllable field. At most one command per axis is in
/// flight at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Relay(RelayKey),
    AutoMode,
    Profile,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Relay(key) => write!(f, "relay {key}"),
            Axis::AutoMode => f.write_str("auto mode"),
            Axis::Profile => f.write_str("crop profile"),
        }
    }
}

/// What the backend or device reported back for a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    Relays(RelayStates),
    AutoMode(bool),
    ProfileActivated(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The field now holds the requested value.
    Confirmed,
    /// The authoritative value differs from what was requested; it won.
    Corrected(Change),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollback {
    /// Prior value and stamp were restored.
    Restored,
    /// A newer authoritative write replaced the optimistic value; kept it.
    Superseded,
    /// No pending mutation with that id.
    Unknown,
}

/// Confirmed changes, handed to the store writer for append-only recording.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Reading(SensorReading),
    Relays(RelayStates, OffsetDateTime),
    AutoMode(bool, OffsetDateTime),
    Status(SystemStatus, OffsetDateTime),
    Profiles(Arc<Vec<CropProfile>>, OffsetDateTime),
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Immutable, internally consistent view handed to readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub device_id: String,
    pub reading: SensorReading,
    pub reading_source: Tier,
    pub relays: RelayStates,
    pub auto_mode: bool,
    /// Effective status: `offline` whenever no link is up.
    pub status: SystemStatus,
    pub connected: bool,
    pub profiles: Arc<Vec<CropProfile>>,
    pub history: Arc<HistoricalData>,
    pub pending: Vec<String>,
}

impl Snapshot {
    /// The active profile, or the first one when none is flagged active.
    pub fn active_profile(&self) -> Option<&CropProfile> {
        self.profiles
            .iter()
            .find(|p| p.is_active)
            .or_else(|| self.profiles.first())
    }

    pub fn ranges(&self) -> Vec<ChannelRange> {
        self.active_profile()
            .map(|p| p.check(&self.reading))
            .unwrap_or_default()
    }

    pub fn has_profile(&self, id: &str) -> bool {
        self.profiles.iter().any(|p| p.id == id)
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Starting values, stamped at [`Tier::Seed`].
#[derive(Debug, Clone)]
pub struct Seed {
    pub reading: SensorReading,
    pub relays: RelayStates,
    pub auto_mode: bool,
    pub status: SystemStatus,
    pub profiles: Vec<CropProfile>,
    pub history: HistoricalData,
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone)]
enum Prior {
    Relay(RelayKey, bool),
    AutoMode(bool),
    Profiles(Arc<Vec<CropProfile>>),
}

#[derive(Debug, Clone)]
struct Pending {
    change: Change,
    prior: Prior,
    prior_stamp: Stamp,
    stamp: Stamp,
}

pub struct Reconciler {
    device_id: String,

    reading: SensorReading,
    reading_stamp: Stamp,

    relays: RelayStates,
    relay_stamps: [Stamp; 3],

    auto_mode: bool,
    auto_mode_stamp: Stamp,

    status: SystemStatus,
    status_stamp: Stamp,

    profiles: Arc<Vec<CropProfile>>,
    profiles_stamp: Stamp,

    history: HistoryBuffer,
    history_view: Arc<HistoricalData>,

    push_connected: bool,
    poll_connected: bool,

    pending: HashMap<MutationId, Pending>,
    next_mutation: u64,
    applied: Vec<Applied>,
}

impl Reconciler {
    pub fn new(device_id: impl Into<String>, seed: Seed, history_capacity: usize) -> Self {
        let stamp = Stamp::new(Tier::Seed, seed.at);
        let mut history = HistoryBuffer::new(history_capacity);
        history.merge_all(&seed.history);
        let history_view = Arc::new(history.to_data());

        Self {
            device_id: device_id.into(),
            reading: seed.reading,
            reading_stamp: stamp,
            relays: seed.relays,
            relay_stamps: [stamp; 3],
            auto_mode: seed.auto_mode,
            auto_mode_stamp: stamp,
            status: seed.status,
            status_stamp: stamp,
            profiles: Arc::new(normalize_profiles(seed.profiles)),
            profiles_stamp: stamp,
            history,
            history_view,
            push_connected: false,
            poll_connected: false,
            pending: HashMap::new(),
            next_mutation: 1,
            applied: Vec::new(),
        }
    }

    pub fn connected(&self) -> bool {
        self.push_connected || self.poll_connected
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    /// Drain confirmed changes recorded since the last call.
    pub fn take_applied(&mut self) -> Vec<Applied> {
        std::mem::take(&mut self.applied)
    }

    // -- Inbound ------------------------------------------------------------

    /// Merge one inbound event. Returns true if any visible state changed.
    pub fn apply_inbound(&mut self, event: &InboundEvent) -> bool {
        let stamp = event.stamp();
        match &event.kind {
            InboundKind::Reading(reading) => self.apply_reading(reading, stamp),
            InboundKind::RelayUpdate(relays) => {
                let changed = self.merge_relays(relays, stamp, None);
                if changed && stamp.tier.is_confirmed() {
                    self.applied.push(Applied::Relays(self.relays, stamp.at));
                }
                changed
            }
            InboundKind::StatusUpdate(status) => {
                if stamp < self.status_stamp {
                    return false;
                }
                self.status_stamp = stamp;
                let changed = self.status != *status;
                self.status = *status;
                if changed && stamp.tier.is_confirmed() {
                    self.applied.push(Applied::Status(*status, stamp.at));
                }
                changed
            }
            InboundKind::AutoMode(enabled) => {
                if stamp < self.auto_mode_stamp {
                    return false;
                }
                self.auto_mode_stamp = stamp;
                let changed = self.auto_mode != *enabled;
                self.auto_mode = *enabled;
                if changed && stamp.tier.is_confirmed() {
                    self.applied.push(Applied::AutoMode(*enabled, stamp.at));
                }
                changed
            }
            InboundKind::Profiles(list) => {
                if stamp < self.profiles_stamp {
                    return false;
                }
                self.profiles_stamp = stamp;
                let next = normalize_profiles(list.clone());
                if *self.profiles == next {
                    return false;
                }
                self.profiles = Arc::new(next);
                if stamp.tier.is_confirmed() {
                    self.applied
                        .push(Applied::Profiles(Arc::clone(&self.profiles), stamp.at));
                }
                true
            }
            InboundKind::History(data) => {
                if !stamp.tier.is_confirmed() {
                    return false;
                }
                let added = self.history.merge_all(data);
                if added > 0 {
                    self.history_view = Arc::new(self.history.to_data());
                }
                added > 0
            }
            InboundKind::Error(message) => {
                warn!(tier = ?event.tier, %message, "inbound error reported");
                false
            }
        }
    }

    fn apply_reading(&mut self, reading: &SensorReading, stamp: Stamp) -> bool {
        if stamp.tier == Tier::Simulated && self.connected() {
            debug!("dropping simulated reading: a link is connected");
            return false;
        }
        if stamp < self.reading_stamp {
            debug!(tier = ?stamp.tier, "dropping stale reading");
            return false;
        }
        self.reading_stamp = stamp;
        if self.reading == *reading {
            return false;
        }
        self.reading = *reading;
        if stamp.tier.is_confirmed() {
            self.history.append_reading(reading);
            self.history_view = Arc::new(self.history.to_data());
            self.applied.push(Applied::Reading(*reading));
        }
        true
    }

    /// Merge a full relay triple key by key. `force` names a key that is
    /// written regardless of its stamp (used when committing that key).
    fn merge_relays(&mut self, incoming: &RelayStates, stamp: Stamp, force: Option<RelayKey>) -> bool {
        let mut next = self.relays;
        for key in RelayKey::ALL {
            let idx = key.index();
            if force == Some(key) || stamp >= self.relay_stamps[idx] {
                next = next.with(key, incoming.get(key));
                self.relay_stamps[idx] = stamp;
            }
        }
        let changed = next != self.relays;
        self.relays = next;
        changed
    }

    // -- Links --------------------------------------------------------------

    /// Record a link state change. Losing the push link demotes push-written
    /// fields to the poll tier so polling can replace them; losing the last
    /// link demotes the reading to the seed tier.
    pub fn set_link(&mut self, tier: Tier, connected: bool) -> bool {
        match tier {
            Tier::Push => {
                if self.push_connected == connected {
                    return false;
                }
                self.push_connected = connected;
                if !connected {
                    self.demote_push_stamps();
                }
            }
            Tier::Poll => {
                if self.poll_connected == connected {
                    return false;
                }
                self.poll_connected = connected;
            }
            other => {
                warn!(tier = ?other, "ignoring link change for non-transport tier");
                return false;
            }
        }
        if !self.connected() {
            // With no link left the reading is last-known data the
            // simulator may advance.
            self.reading_stamp.tier = Tier::Seed;
        }
        debug!(?tier, connected, any = self.connected(), "link changed");
        true
    }

    fn demote_push_stamps(&mut self) {
        let demote = |s: &mut Stamp| {
            if s.tier == Tier::Push {
                s.tier = Tier::Poll;
            }
        };
        demote(&mut self.reading_stamp);
        self.relay_stamps.iter_mut().for_each(demote);
        demote(&mut self.auto_mode_stamp);
        demote(&mut self.status_stamp);
        demote(&mut self.profiles_stamp);
        for p in self.pending.values_mut() {
            demote(&mut p.prior_stamp);
        }
    }

    // -- Optimistic mutations ----------------------------------------------

    /// Apply `change` immediately at [`Tier::Optimistic`], remembering the
    /// prior value so it can be rolled back.
    pub fn propose(&mut self, change: Change, at: OffsetDateTime) -> Result<MutationId, EngineError> {
        let axis = change.axis();
        if self.pending.values().any(|p| p.change.axis() == axis) {
            return Err(EngineError::AxisBusy(axis.to_string()));
        }

        let stamp = Stamp::new(Tier::Optimistic, at);
        let (prior, prior_stamp) = match &change {
            Change::Relay { key, on } => {
                if self.auto_mode {
                    return Err(EngineError::AutoModeActive);
                }
                let idx = key.index();
                let prior = (Prior::Relay(*key, self.relays.get(*key)), self.relay_stamps[idx]);
                self.relays = self.relays.with(*key, *on);
                self.relay_stamps[idx] = stamp;
                prior
            }
            Change::AutoMode(enabled) => {
                let prior = (Prior::AutoMode(self.auto_mode), self.auto_mode_stamp);
                self.auto_mode = *enabled;
                self.auto_mode_stamp = stamp;
                prior
            }
            Change::ActivateProfile(id) => {
                let next = with_active_profile(&self.profiles, id)
                    .ok_or_else(|| EngineError::NotFound(id.clone()))?;
                let prior = (Prior::Profiles(Arc::clone(&self.profiles)), self.profiles_stamp);
                self.profiles = Arc::new(next);
                self.profiles_stamp = stamp;
                prior
            }
        };

        let id = MutationId(self.next_mutation);
        self.next_mutation += 1;
        debug!(mutation = %id, %axis, "optimistic change applied");
        self.pending.insert(
            id,
            Pending {
                change,
                prior,
                prior_stamp,
                stamp,
            },
        );
        Ok(id)
    }

    fn axis_stamp(&self, axis: Axis) -> Stamp {
        match axis {
            Axis::Relay(key) => self.relay_stamps[key.index()],
            Axis::AutoMode => self.auto_mode_stamp,
            Axis::Profile => self.profiles_stamp,
        }
    }

    /// Resolve a pending mutation with the authoritative value. If the field
    /// still holds the optimistic value it is overwritten; if something newer
    /// already replaced it, that value is kept and compared instead.
    pub fn commit(
        &mut self,
        id: MutationId,
        confirmation: Confirmation,
        stamp: Stamp,
    ) -> Result<Resolution, EngineError> {
        let Some(pending) = self.pending.get(&id) else {
            return Err(EngineError::CommandRejected(format!("unknown mutation {id}")));
        };
        let axis = pending.change.axis();
        let held = self.axis_stamp(axis) == pending.stamp;
        let requested = pending.change.clone();

        let actual = match (&requested, confirmation) {
            (Change::Relay { key, .. }, Confirmation::Relays(relays)) => {
                let force = held.then_some(*key);
                self.merge_relays(&relays, stamp, force);
                self.applied.push(Applied::Relays(self.relays, stamp.at));
                Change::Relay {
                    key: *key,
                    on: self.relays.get(*key),
                }
            }
            (Change::AutoMode(_), Confirmation::AutoMode(enabled)) => {
                if held {
                    self.auto_mode = enabled;
                    self.auto_mode_stamp = stamp;
                    self.applied.push(Applied::AutoMode(enabled, stamp.at));
                }
                Change::AutoMode(self.auto_mode)
            }
            (Change::ActivateProfile(_), Confirmation::ProfileActivated(active)) => {
                if held {
                    match with_active_profile(&self.profiles, &active) {
                        Some(next) => self.profiles = Arc::new(next),
                        None => warn!(profile = %active, "confirmed profile is not in the current set"),
                    }
                    self.profiles_stamp = stamp;
                    self.applied
                        .push(Applied::Profiles(Arc::clone(&self.profiles), stamp.at));
                }
                let current = self
                    .profiles
                    .iter()
                    .find(|p| p.is_active)
                    .map(|p| p.id.clone())
                    .unwrap_or(active);
                Change::ActivateProfile(current)
            }
            (_, other) => {
                warn!(mutation = %id, ?other, "confirmation does not match the proposed change");
                self.rollback(id);
                return Err(EngineError::MalformedMessage(format!(
                    "confirmation for {axis} has the wrong shape"
                )));
            }
        };

        self.pending.remove(&id);
        if actual == requested {
            Ok(Resolution::Confirmed)
        } else {
            warn!(mutation = %id, ?requested, ?actual, "command confirmed with a different value");
            Ok(Resolution::Corrected(actual))
        }
    }

    /// Undo a pending mutation. The prior value and its original stamp are
    /// restored only if the optimistic value is still in place.
    pub fn rollback(&mut self, id: MutationId) -> Rollback {
        let Some(pending) = self.pending.remove(&id) else {
            return Rollback::Unknown;
        };
        let axis = pending.change.axis();
        if self.axis_stamp(axis) != pending.stamp {
            debug!(mutation = %id, %axis, "rollback skipped: value superseded");
            return Rollback::Superseded;
        }
        match pending.prior {
            Prior::Relay(key, on) => {
                self.relays = self.relays.with(key, on);
                self.relay_stamps[key.index()] = pending.prior_stamp;
            }
            Prior::AutoMode(enabled) => {
                self.auto_mode = enabled;
                self.auto_mode_stamp = pending.prior_stamp;
            }
            Prior::Profiles(list) => {
                self.profiles = list;
                self.profiles_stamp = pending.prior_stamp;
            }
        }
        debug!(mutation = %id, %axis, "optimistic change rolled back");
        Rollback::Restored
    }

    // -- Snapshot -----------------------------------------------------------

    pub fn snapshot(&self) -> Snapshot {
        let connected = self.connected();
        let mut pending: Vec<String> = self
            .pending
            .values()
            .map(|p| p.change.axis().to_string())
            .collect();
        pending.sort();

        Snapshot {
            device_id: self.device_id.clone(),
            reading: self.reading,
            reading_source: self.reading_stamp.tier,
            relays: self.relays,
            auto_mode: self.auto_mode,
            status: if connected {
                self.status
            } else {
                SystemStatus::Offline
            },
            connected,
            profiles: Arc::clone(&self.profiles),
            history: Arc::clone(&self.history_view),
            pending,
        }
    }
}

/// Enforce "at most one active profile": the first active entry wins.
fn normalize_profiles(mut list: Vec<CropProfile>) -> Vec<CropProfile> {
    let mut seen_active = false;
    let mut cleared = 0;
    for p in list.iter_mut() {
        if p.is_active {
            if seen_active {
                p.is_active = false;
                cleared += 1;
            }
            seen_active = true;
        }
    }
    if cleared > 0 {
        warn!(cleared, "profile set had more than one active entry");
    }
    list
}

// ===========================================================================
// Tests
// ===========================================================================
