//! Domain types shared by the reconciler, transports and HTTP API. Wire
//! forms are camelCase JSON to match the dashboard REST backend.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

// ---------------------------------------------------------------------------
// Sensor readings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub air_temperature: f64,
    pub air_humidity: f64,
    pub water_temperature: f64,
    pub tds: f64,
    pub ph: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl SensorReading {
    pub fn value(&self, channel: SensorChannel) -> f64 {
        match channel {
            SensorChannel::AirTemperature => self.air_temperature,
            SensorChannel::AirHumidity => self.air_humidity,
            SensorChannel::WaterTemperature => self.water_temperature,
            SensorChannel::Tds => self.tds,
            SensorChannel::Ph => self.ph,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SensorChannel {
    AirTemperature,
    AirHumidity,
    WaterTemperature,
    Tds,
    Ph,
}

impl SensorChannel {
    pub const ALL: [SensorChannel; 5] = [
        SensorChannel::AirTemperature,
        SensorChannel::AirHumidity,
        SensorChannel::WaterTemperature,
        SensorChannel::Tds,
        SensorChannel::Ph,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SensorChannel::AirTemperature => "airTemperature",
            SensorChannel::AirHumidity => "airHumidity",
            SensorChannel::WaterTemperature => "waterTemperature",
            SensorChannel::Tds => "tds",
            SensorChannel::Ph => "ph",
        }
    }
}

impl FromStr for SensorChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "airTemperature" | "air_temperature" => Ok(Self::AirTemperature),
            "airHumidity" | "air_humidity" => Ok(Self::AirHumidity),
            "waterTemperature" | "water_temperature" => Ok(Self::WaterTemperature),
            "tds" => Ok(Self::Tds),
            "ph" => Ok(Self::Ph),
            _ => Err(format!("unknown sensor channel '{s}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Relays
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelayKey {
    TdsRelay,
    HumidityRelay,
    AirCirculationRelay,
}

impl RelayKey {
    pub const ALL: [RelayKey; 3] = [
        RelayKey::TdsRelay,
        RelayKey::HumidityRelay,
        RelayKey::AirCirculationRelay,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelayKey::TdsRelay => "tdsRelay",
            RelayKey::HumidityRelay => "humidityRelay",
            RelayKey::AirCirculationRelay => "airCirculationRelay",
        }
    }
}

impl fmt::Display for RelayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tdsRelay" | "tds_relay" => Ok(Self::TdsRelay),
            "humidityRelay" | "humidity_relay" => Ok(Self::HumidityRelay),
            "airCirculationRelay" | "air_circulation_relay" => Ok(Self::AirCirculationRelay),
            _ => Err(format!("unknown relay '{s}'")),
        }
    }
}

/// The full relay triple. Never partially defined; updates produce a new
/// value via [`RelayStates::with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStates {
    pub tds_relay: bool,
    pub humidity_relay: bool,
    pub air_circulation_relay: bool,
}

impl RelayStates {
    pub fn get(&self, key: RelayKey) -> bool {
        match key {
            RelayKey::TdsRelay => self.tds_relay,
            RelayKey::HumidityRelay => self.humidity_relay,
            RelayKey::AirCirculationRelay => self.air_circulation_relay,
        }
    }

    pub fn with(mut self, key: RelayKey, on: bool) -> Self {
        match key {
            RelayKey::TdsRelay => self.tds_relay = on,
            RelayKey::HumidityRelay => self.humidity_relay = on,
            RelayKey::AirCirculationRelay => self.air_circulation_relay = on,
        }
        self
    }
}

// ---------------------------------------------------------------------------
// System status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Online,
    Offline,
    Warning,
    Error,
}

impl FromStr for SystemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown system status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Crop profiles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CropProfile {
    pub id: String,
    pub name: String,
    pub min_air_temp: f64,
    pub max_air_temp: f64,
    pub min_air_humidity: f64,
    pub max_air_humidity: f64,
    pub min_water_temp: f64,
    pub max_water_temp: f64,
    pub min_tds: f64,
    pub max_tds: f64,
    pub min_ph: f64,
    pub max_ph: f64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RangeState {
    Below,
    InRange,
    Above,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRange {
    pub channel: SensorChannel,
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub state: RangeState,
}

impl CropProfile {
    /// Acceptable `(min, max)` for one channel.
    pub fn bounds(&self, channel: SensorChannel) -> (f64, f64) {
        match channel {
            SensorChannel::AirTemperature => (self.min_air_temp, self.max_air_temp),
            SensorChannel::AirHumidity => (self.min_air_humidity, self.max_air_humidity),
            SensorChannel::WaterTemperature => (self.min_water_temp, self.max_water_temp),
            SensorChannel::Tds => (self.min_tds, self.max_tds),
            SensorChannel::Ph => (self.min_ph, self.max_ph),
        }
    }

    /// Classify every channel of `reading` against this profile's ranges.
    pub fn check(&self, reading: &SensorReading) -> Vec<ChannelRange> {
        SensorChannel::ALL
            .iter()
            .map(|&channel| {
                let value = reading.value(channel);
                let (min, max) = self.bounds(channel);
                let state = if value < min {
                    RangeState::Below
                } else if value > max {
                    RangeState::Above
                } else {
                    RangeState::InRange
                };
                ChannelRange {
                    channel,
                    value,
                    min,
                    max,
                    state,
                }
            })
            .collect()
    }
}

/// Return a copy of `profiles` where exactly `id` is active. `None` if no
/// profile carries that id.
pub fn with_active_profile(profiles: &[CropProfile], id: &str) -> Option<Vec<CropProfile>> {
    if !profiles.iter().any(|p| p.id == id) {
        return None;
    }
    Some(
        profiles
            .iter()
            .map(|p| CropProfile {
                is_active: p.id == id,
                ..p.clone()
            })
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub value: f64,
}

/// Wire form of the per-channel history returned by `GET /sensors/history`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalData {
    #[serde(default)]
    pub air_temperature: Vec<DataPoint>,
    #[serde(default)]
    pub air_humidity: Vec<DataPoint>,
    #[serde(default)]
    pub water_temperature: Vec<DataPoint>,
    #[serde(default)]
    pub tds: Vec<DataPoint>,
    #[serde(default)]
    pub ph: Vec<DataPoint>,
}

impl HistoricalData {
    pub fn channel(&self, channel: SensorChannel) -> &[DataPoint] {
        match channel {
            SensorChannel::AirTemperature => &self.air_temperature,
            SensorChannel::AirHumidity => &self.air_humidity,
            SensorChannel::WaterTemperature => &self.water_temperature,
            SensorChannel::Tds => &self.tds,
            SensorChannel::Ph => &self.ph,
        }
    }

    pub fn channel_mut(&mut self, channel: SensorChannel) -> &mut Vec<DataPoint> {
        match channel {
            SensorChannel::AirTemperature => &mut self.air_temperature,
            SensorChannel::AirHumidity => &mut self.air_humidity,
            SensorChannel::WaterTemperature => &mut self.water_temperature,
            SensorChannel::Tds => &mut self.tds,
            SensorChannel::Ph => &mut self.ph,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn reading() -> SensorReading {
        SensorReading {
            air_temperature: 23.5,
            air_humidity: 68.0,
            water_temperature: 21.3,
            tds: 780.0,
            ph: 6.2,
            timestamp: datetime!(2024-05-01 12:00 UTC),
        }
    }

    fn lettuce(active: bool) -> CropProfile {
        CropProfile {
            id: "1".into(),
            name: "Lettuce".into(),
            min_air_temp: 18.0,
            max_air_temp: 24.0,
            min_air_humidity: 60.0,
            max_air_humidity: 80.0,
            min_water_temp: 18.0,
            max_water_temp: 23.0,
            min_tds: 560.0,
            max_tds: 840.0,
            min_ph: 5.8,
            max_ph: 6.5,
            is_active: active,
        }
    }

    // -- Wire format --------------------------------------------------------

    #[test]
    fn sensor_reading_uses_camel_case() {
        let json = serde_json::to_value(reading()).unwrap();
        assert_eq!(json["airTemperature"], 23.5);
        assert_eq!(json["waterTemperature"], 21.3);
        assert_eq!(json["timestamp"], "2024-05-01T12:00:00Z");
    }

    #[test]
    fn sensor_reading_parses_backend_payload() {
        let json = r#"{"airTemperature":22.0,"airHumidity":61,"waterTemperature":20.5,
                      "tds":812,"ph":6.1,"timestamp":"2024-05-01T12:00:00.000Z"}"#;
        let r: SensorReading = serde_json::from_str(json).unwrap();
        assert_eq!(r.tds, 812.0);
        assert_eq!(r.timestamp, datetime!(2024-05-01 12:00 UTC));
    }

    #[test]
    fn relay_states_round_trip_camel_case() {
        let json = r#"{"tdsRelay":false,"humidityRelay":true,"airCirculationRelay":false}"#;
        let r: RelayStates = serde_json::from_str(json).unwrap();
        assert!(r.humidity_relay);
        assert!(!r.tds_relay);
    }

    #[test]
    fn system_status_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&SystemStatus::Warning).unwrap(),
            "\"warning\""
        );
        assert_eq!(
            serde_json::from_str::<SystemStatus>("\"offline\"").unwrap(),
            SystemStatus::Offline
        );
    }

    #[test]
    fn historical_data_missing_channels_default_empty() {
        let h: HistoricalData = serde_json::from_str(r#"{"tds":[]}"#).unwrap();
        assert!(h.air_temperature.is_empty());
        assert!(h.ph.is_empty());
    }

    // -- Relay keys ---------------------------------------------------------

    #[test]
    fn relay_key_parses_both_spellings() {
        assert_eq!("tdsRelay".parse::<RelayKey>(), Ok(RelayKey::TdsRelay));
        assert_eq!(
            "air_circulation_relay".parse::<RelayKey>(),
            Ok(RelayKey::AirCirculationRelay)
        );
        assert!("pumpRelay".parse::<RelayKey>().is_err());
    }

    #[test]
    fn relay_with_only_touches_one_key() {
        let before = RelayStates {
            tds_relay: false,
            humidity_relay: true,
            air_circulation_relay: false,
        };
        let after = before.with(RelayKey::TdsRelay, true);
        assert!(after.tds_relay);
        assert!(after.humidity_relay);
        assert!(!after.air_circulation_relay);
        // original is untouched
        assert!(!before.tds_relay);
    }

    // -- Profiles -----------------------------------------------------------

    #[test]
    fn with_active_profile_flips_exactly_one() {
        let mut basil = lettuce(false);
        basil.id = "2".into();
        basil.name = "Basil".into();
        let list = vec![lettuce(true), basil];

        let next = with_active_profile(&list, "2").unwrap();
        assert!(!next[0].is_active);
        assert!(next[1].is_active);
        assert_eq!(next.iter().filter(|p| p.is_active).count(), 1);
    }

    #[test]
    fn with_active_profile_unknown_id_is_none() {
        assert!(with_active_profile(&[lettuce(true)], "9").is_none());
    }

    #[test]
    fn range_check_classifies_channels() {
        let mut r = reading();
        r.ph = 7.0;
        r.tds = 500.0;
        let ranges = lettuce(true).check(&r);
        let state = |c| ranges.iter().find(|x| x.channel == c).unwrap().state;
        assert_eq!(state(SensorChannel::Ph), RangeState::Above);
        assert_eq!(state(SensorChannel::Tds), RangeState::Below);
        assert_eq!(state(SensorChannel::AirTemperature), RangeState::InRange);
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let mut r = reading();
        r.air_temperature = 24.0;
        let ranges = lettuce(true).check(&r);
        assert_eq!(ranges[0].state, RangeState::InRange);
    }

    #[test]
    fn sensor_channel_parses() {
        assert_eq!(
            "waterTemperature".parse::<SensorChannel>(),
            Ok(SensorChannel::WaterTemperature)
        );
        assert!("co2".parse::<SensorChannel>().is_err());
    }
}
