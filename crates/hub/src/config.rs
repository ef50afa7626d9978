//! TOML config file loading, env overrides and validation.
//!
//! Every field has a default, so an empty or missing file yields a working
//! demo configuration. Connection settings can be overridden from the
//! environment (`DEVICE_ID`, `API_URL`, `MQTT_HOST`, `MQTT_PORT`, `DB_URL`,
//! `WEB_PORT`).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;

use crate::model::{CropProfile, RelayStates, SensorReading, SystemStatus};
use crate::transport::poll::PollSettings;
use crate::transport::push::MqttSettings;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device_id: String,
    /// Initial auto-mode flag before any device data arrives.
    pub auto_mode: bool,
    pub db_url: String,
    pub web_port: u16,
    pub backend: BackendConfig,
    pub mqtt: MqttConfig,
    pub poll: PollConfig,
    pub control: ControlConfig,
    pub history: HistoryConfig,
    pub simulator: SimulatorConfig,
    pub initial: InitialReading,
    pub relays: RelayStates,
    pub profiles: Vec<ProfileEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// REST base URL. Polling is disabled when unset.
    pub url: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub keep_alive_s: u64,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub live_ms: u64,
    pub history_ms: u64,
    pub profiles_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub command_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InitialReading {
    pub air_temperature: f64,
    pub air_humidity: f64,
    pub water_temperature: f64,
    pub tds: f64,
    pub ph: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileEntry {
    pub id: String,
    pub name: String,
    pub air_temp: [f64; 2],
    pub air_humidity: [f64; 2],
    pub water_temp: [f64; 2],
    pub tds: [f64; 2],
    pub ph: [f64; 2],
    #[serde(default)]
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: "hydrobuddy-001".to_string(),
            auto_mode: true,
            db_url: "sqlite:hydro.db?mode=rwc".to_string(),
            web_port: 8080,
            backend: BackendConfig::default(),
            mqtt: MqttConfig::default(),
            poll: PollConfig::default(),
            control: ControlConfig::default(),
            history: HistoryConfig::default(),
            simulator: SimulatorConfig::default(),
            initial: InitialReading::default(),
            relays: RelayStates {
                tds_relay: false,
                humidity_relay: true,
                air_circulation_relay: false,
            },
            profiles: default_profiles(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 5_000,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 1883,
            keep_alive_s: 30,
            backoff_ms: 5_000,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            live_ms: 10_000,
            history_ms: 60_000,
            profiles_ms: 300_000,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: crate::dispatcher::DEFAULT_COMMAND_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: crate::history::DEFAULT_CAPACITY,
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: crate::simulator::DEFAULT_INTERVAL.as_millis() as u64,
        }
    }
}

impl Default for InitialReading {
    fn default() -> Self {
        Self {
            air_temperature: 23.5,
            air_humidity: 68.0,
            water_temperature: 21.3,
            tds: 780.0,
            ph: 6.2,
        }
    }
}

fn entry(id: &str, name: &str, ranges: [[f64; 2]; 5], active: bool) -> ProfileEntry {
    ProfileEntry {
        id: id.to_string(),
        name: name.to_string(),
        air_temp: ranges[0],
        air_humidity: ranges[1],
        water_temp: ranges[2],
        tds: ranges[3],
        ph: ranges[4],
        active,
    }
}

fn default_profiles() -> Vec<ProfileEntry> {
    vec![
        entry("1", "Lettuce", [[18.0, 24.0], [60.0, 80.0], [18.0, 23.0], [560.0, 840.0], [5.8, 6.5]], true),
        entry("2", "Basil", [[20.0, 29.0], [40.0, 60.0], [18.0, 24.0], [700.0, 1120.0], [5.5, 6.5]], false),
        entry("3", "Strawberry", [[18.0, 26.0], [65.0, 75.0], [18.0, 22.0], [500.0, 750.0], [5.5, 6.2]], false),
        entry("4", "Tomato", [[21.0, 29.0], [60.0, 70.0], [20.0, 25.0], [1400.0, 3500.0], [5.5, 6.5]], false),
    ]
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl ProfileEntry {
    pub fn to_profile(&self) -> CropProfile {
        CropProfile {
            id: self.id.clone(),
            name: self.name.clone(),
            min_air_temp: self.air_temp[0],
            max_air_temp: self.air_temp[1],
            min_air_humidity: self.air_humidity[0],
            max_air_humidity: self.air_humidity[1],
            min_water_temp: self.water_temp[0],
            max_water_temp: self.water_temp[1],
            min_tds: self.tds[0],
            max_tds: self.tds[1],
            min_ph: self.ph[0],
            max_ph: self.ph[1],
            is_active: self.active,
        }
    }
}

impl Config {
    pub fn initial_reading(&self, at: OffsetDateTime) -> SensorReading {
        SensorReading {
            air_temperature: self.initial.air_temperature,
            air_humidity: self.initial.air_humidity,
            water_temperature: self.initial.water_temperature,
            tds: self.initial.tds,
            ph: self.initial.ph,
            timestamp: at,
        }
    }

    pub fn initial_status(&self) -> SystemStatus {
        SystemStatus::Online
    }

    pub fn seed_profiles(&self) -> Vec<CropProfile> {
        self.profiles.iter().map(ProfileEntry::to_profile).collect()
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.mqtt.host.clone(),
            port: self.mqtt.port,
            keep_alive: Duration::from_secs(self.mqtt.keep_alive_s),
            backoff: Duration::from_millis(self.mqtt.backoff_ms),
        }
    }

    /// `None` when no backend URL is configured.
    pub fn poll_settings(&self) -> Option<PollSettings> {
        let base_url = self.backend.url.clone()?;
        Some(PollSettings {
            base_url,
            request_timeout: Duration::from_millis(self.backend.timeout_ms),
            live_every: Duration::from_millis(self.poll.live_ms),
            history_every: Duration::from_millis(self.poll.history_ms),
            profiles_every: Duration::from_millis(self.poll.profiles_ms),
            history_limit: self.history.capacity,
        })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.control.command_timeout_ms)
    }

    pub fn simulator_interval(&self) -> Duration {
        Duration::from_millis(self.simulator.interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_connection(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_profiles(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_connection(&self, errors: &mut Vec<String>) {
        if self.device_id.trim().is_empty() {
            errors.push("device_id is empty".to_string());
        } else if self.device_id.contains(['/', '+', '#']) {
            errors.push(format!(
                "device_id '{}' must not contain MQTT topic characters (/ + #)",
                self.device_id
            ));
        }

        if let Some(url) = &self.backend.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(format!("backend.url '{url}' must start with http:// or https://"));
            }
        }

        if self.mqtt.enabled && self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if self.mqtt.enabled && self.mqtt.port == 0 {
            errors.push("mqtt.port must be non-zero".to_string());
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let positive = [
            ("backend.timeout_ms", self.backend.timeout_ms),
            ("mqtt.backoff_ms", self.mqtt.backoff_ms),
            ("mqtt.keep_alive_s", self.mqtt.keep_alive_s),
            ("poll.live_ms", self.poll.live_ms),
            ("poll.history_ms", self.poll.history_ms),
            ("poll.profiles_ms", self.poll.profiles_ms),
            ("control.command_timeout_ms", self.control.command_timeout_ms),
            ("simulator.interval_ms", self.simulator.interval_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                errors.push(format!("{name} must be positive, got 0"));
            }
        }

        if self.history.capacity == 0 {
            errors.push("history.capacity must be at least 1".to_string());
        }
    }

    fn validate_profiles(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut active = 0;

        for (i, p) in self.profiles.iter().enumerate() {
            let ctx = || {
                if p.id.is_empty() {
                    format!("profiles[{i}]")
                } else {
                    format!("profile '{}'", p.id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if p.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(&p.id) {
                errors.push(format!("{}: duplicate id", ctx()));
            }
            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Ranges ──────────────────────────────────────────
            for (field, [min, max]) in [
                ("air_temp", p.air_temp),
                ("air_humidity", p.air_humidity),
                ("water_temp", p.water_temp),
                ("tds", p.tds),
                ("ph", p.ph),
            ] {
                if min >= max {
                    errors.push(format!(
                        "{}: {field} min ({min}) must be less than max ({max})",
                        ctx()
                    ));
                }
            }
            if p.air_humidity[0] < 0.0 || p.air_humidity[1] > 100.0 {
                errors.push(format!("{}: air_humidity outside [0, 100]", ctx()));
            }
            if p.ph[0] < 0.0 || p.ph[1] > 14.0 {
                errors.push(format!("{}: ph outside [0, 14]", ctx()));
            }
            if p.tds[0] < 0.0 {
                errors.push(format!("{}: tds min is negative", ctx()));
            }

            if p.active {
                active += 1;
            }
        }

        if active > 1 {
            errors.push(format!("{active} profiles are marked active; at most one may be"));
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file. A missing file yields the defaults.
pub fn parse(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::warn!(%path, "config file not found; using defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))
}

/// Apply environment overrides on top of the file values.
pub fn apply_env<F>(config: &mut Config, var: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = var("DEVICE_ID") {
        config.device_id = v;
    }
    if let Some(v) = var("API_URL") {
        config.backend.url = Some(v);
    }
    if let Some(v) = var("MQTT_HOST") {
        config.mqtt.host = v;
        config.mqtt.enabled = true;
    }
    if let Some(v) = var("MQTT_PORT") {
        config.mqtt.port = v
            .parse()
            .with_context(|| format!("MQTT_PORT '{v}' is not a port number"))?;
    }
    if let Some(v) = var("DB_URL") {
        config.db_url = v;
    }
    if let Some(v) = var("WEB_PORT") {
        config.web_port = v
            .parse()
            .with_context(|| format!("WEB_PORT '{v}' is not a port number"))?;
    }
    Ok(())
}

/// Parse, apply process env overrides, and validate.
pub fn load(path: &str) -> Result<Config> {
    let mut config = parse(path)?;
    apply_env(&mut config, |k| std::env::var(k).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
