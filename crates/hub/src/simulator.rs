//! Fallback data while no transport is connected.
//!
//! The simulator drifts the last known reading by small uniform deltas on a
//! fixed period and feeds it to the engine at [`Tier::Simulated`]. It idles
//! whenever a link is up and abandons a pending tick the moment one comes up.
//! It also generates a demo history for an empty store.

use std::f64::consts::PI;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::engine::EngineHandle;
use crate::model::{DataPoint, HistoricalData, SensorChannel, SensorReading};
use crate::reconciler::{InboundEvent, InboundKind, Tier};

/// Default tick period.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Maximum per-tick change per channel, in channel units.
const MAX_DELTA: [(SensorChannel, f64); 5] = [
    (SensorChannel::AirTemperature, 0.1),
    (SensorChannel::AirHumidity, 0.5),
    (SensorChannel::WaterTemperature, 0.1),
    (SensorChannel::Tds, 5.0),
    (SensorChannel::Ph, 0.02),
];

fn delta(rng: &mut fastrand::Rng, max: f64) -> f64 {
    (rng.f64() * 2.0 - 1.0) * max
}

/// One drift step. Only physical domains are enforced: humidity stays in
/// 0..=100, TDS non-negative, pH in 0..=14.
pub fn drift(prev: &SensorReading, rng: &mut fastrand::Rng, at: OffsetDateTime) -> SensorReading {
    let mut next = *prev;
    for (channel, max) in MAX_DELTA {
        let d = delta(rng, max);
        match channel {
            SensorChannel::AirTemperature => next.air_temperature += d,
            SensorChannel::AirHumidity => {
                next.air_humidity = (next.air_humidity + d).clamp(0.0, 100.0)
            }
            SensorChannel::WaterTemperature => next.water_temperature += d,
            SensorChannel::Tds => next.tds = (next.tds + d).max(0.0),
            SensorChannel::Ph => next.ph = (next.ph + d).clamp(0.0, 14.0),
        }
    }
    next.timestamp = at;
    next
}

/// 24 hourly points per channel ending at `now`, a daily sine around
/// `base` plus jitter.
pub fn demo_history(base: &SensorReading, now: OffsetDateTime, rng: &mut fastrand::Rng) -> HistoricalData {
    // (amplitude, jitter) per channel
    let shape = |channel| match channel {
        SensorChannel::AirTemperature => (2.0, 0.5),
        SensorChannel::AirHumidity => (5.0, 2.0),
        SensorChannel::WaterTemperature => (1.0, 0.3),
        SensorChannel::Tds => (50.0, 20.0),
        SensorChannel::Ph => (0.2, 0.1),
    };

    let mut data = HistoricalData::default();
    for channel in SensorChannel::ALL {
        let (amplitude, jitter) = shape(channel);
        let series = data.channel_mut(channel);
        for hour in (0..24i64).rev() {
            let phase = (hour as f64 / 24.0) * 2.0 * PI;
            let mut value = base.value(channel) + phase.sin() * amplitude + delta(rng, jitter);
            value = match channel {
                SensorChannel::AirHumidity => value.clamp(0.0, 100.0),
                SensorChannel::Tds => value.max(0.0),
                SensorChannel::Ph => value.clamp(0.0, 14.0),
                _ => value,
            };
            series.push(DataPoint {
                timestamp: now - time::Duration::hours(hour),
                value,
            });
        }
    }
    data
}

/// Run until the engine stops. Ticks only while disconnected.
pub async fn run(engine: EngineHandle, every: Duration, mut rng: fastrand::Rng) {
    let mut snapshots = engine.subscribe();
    info!(interval_ms = every.as_millis() as u64, "simulator started");

    loop {
        if snapshots.wait_for(|s| !s.connected).await.is_err() {
            break;
        }
        debug!("no link; simulating readings");

        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let last = engine.snapshot();
                    if last.connected {
                        break;
                    }
                    let now = OffsetDateTime::now_utc();
                    let next = drift(&last.reading, &mut rng, now);
                    let event = InboundEvent::new(Tier::Simulated, now, InboundKind::Reading(next));
                    if engine.apply_inbound(event).await.is_err() {
                        return;
                    }
                }
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if snapshots.borrow_and_update().connected {
                        debug!("link up; simulator idle");
                        break;
                    }
                }
            }
        }
    }
    info!("simulator stopped");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine;
    use crate::model::{RelayStates, SystemStatus};
    use crate::reconciler::{Reconciler, Seed};

    fn base() -> SensorReading {
        SensorReading {
            air_temperature: 23.5,
            air_humidity: 68.0,
            water_temperature: 21.3,
            tds: 780.0,
            ph: 6.2,
            timestamp: OffsetDateTime::from_unix_timestamp(1_714_564_800).unwrap(),
        }
    }

    // -- drift --------------------------------------------------------------

    #[test]
    fn drift_stays_within_bounds_per_tick() {
        let mut rng = fastrand::Rng::with_seed(7);
        let mut prev = base();
        for _ in 0..1000 {
            let next = drift(&prev, &mut rng, prev.timestamp);
            assert!((next.air_temperature - prev.air_temperature).abs() <= 0.1 + 1e-9);
            assert!((next.air_humidity - prev.air_humidity).abs() <= 0.5 + 1e-9);
            assert!((next.water_temperature - prev.water_temperature).abs() <= 0.1 + 1e-9);
            assert!((next.tds - prev.tds).abs() <= 5.0 + 1e-9);
            assert!((next.ph - prev.ph).abs() <= 0.02 + 1e-9);
            prev = next;
        }
    }

    #[test]
    fn drift_respects_physical_domains() {
        let mut rng = fastrand::Rng::with_seed(11);
        let mut r = SensorReading {
            air_humidity: 100.0,
            tds: 0.0,
            ph: 14.0,
            ..base()
        };
        for _ in 0..500 {
            r = drift(&r, &mut rng, r.timestamp);
            assert!((0.0..=100.0).contains(&r.air_humidity));
            assert!(r.tds >= 0.0);
            assert!((0.0..=14.0).contains(&r.ph));
        }
    }

    #[test]
    fn drift_stamps_the_tick_time() {
        let mut rng = fastrand::Rng::with_seed(1);
        let at = base().timestamp + time::Duration::seconds(10);
        assert_eq!(drift(&base(), &mut rng, at).timestamp, at);
    }

    // -- demo_history -------------------------------------------------------

    #[test]
    fn demo_history_is_24_ascending_hourly_points() {
        let mut rng = fastrand::Rng::with_seed(3);
        let now = base().timestamp;
        let h = demo_history(&base(), now, &mut rng);
        for channel in SensorChannel::ALL {
            let series = h.channel(channel);
            assert_eq!(series.len(), 24);
            assert!(series.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
            assert_eq!(series[23].timestamp, now);
        }
    }

    // -- run loop -----------------------------------------------------------

    fn seed() -> Seed {
        Seed {
            reading: base(),
            relays: RelayStates::default(),
            auto_mode: true,
            status: SystemStatus::Online,
            profiles: Vec::new(),
            history: HistoricalData::default(),
            at: base().timestamp,
        }
    }

    #[tokio::test]
    async fn simulates_while_offline_and_stops_on_connect() {
        let (engine, _task) = engine::spawn(Reconciler::new("dev", seed(), 50), None);
        let sim = tokio::spawn(run(
            engine.clone(),
            Duration::from_millis(10),
            fastrand::Rng::with_seed(5),
        ));

        let mut rx = engine.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.reading_source == Tier::Simulated),
        )
        .await
        .unwrap()
        .unwrap();
        // simulated readings never reach the history
        assert!(engine.snapshot().history.tds.is_empty());

        engine.set_link(Tier::Poll, true).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.connected))
            .await
            .unwrap()
            .unwrap();
        let frozen = engine.snapshot().reading;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.snapshot().reading, frozen);
        assert_eq!(engine.snapshot().status, SystemStatus::Online);

        sim.abort();
    }

    #[tokio::test]
    async fn takes_over_after_confirmed_data_and_link_loss() {
        let (engine, _task) = engine::spawn(Reconciler::new("dev", seed(), 50), None);
        engine.set_link(Tier::Poll, true).await.unwrap();
        let polled = SensorReading {
            tds: 812.0,
            timestamp: OffsetDateTime::now_utc(),
            ..base()
        };
        engine
            .apply_inbound(InboundEvent::new(Tier::Poll, polled.timestamp, InboundKind::Reading(polled)))
            .await
            .unwrap();
        engine.set_link(Tier::Poll, false).await.unwrap();

        let sim = tokio::spawn(run(
            engine.clone(),
            Duration::from_millis(10),
            fastrand::Rng::with_seed(13),
        ));
        let mut rx = engine.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.reading_source == Tier::Simulated),
        )
        .await
        .unwrap()
        .unwrap();
        let s = engine.snapshot();
        assert!(!s.connected);
        assert!((s.reading.tds - 812.0).abs() <= 5.0 * 50.0);
        sim.abort();
    }

    #[tokio::test]
    async fn resumes_after_link_loss() {
        let (engine, _task) = engine::spawn(Reconciler::new("dev", seed(), 50), None);
        engine.set_link(Tier::Push, true).await.unwrap();
        let sim = tokio::spawn(run(
            engine.clone(),
            Duration::from_millis(10),
            fastrand::Rng::with_seed(9),
        ));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.snapshot().reading_source, Tier::Seed);

        engine.set_link(Tier::Push, false).await.unwrap();
        let mut rx = engine.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.reading_source == Tier::Simulated),
        )
        .await
        .unwrap()
        .unwrap();
        sim.abort();
    }
}
