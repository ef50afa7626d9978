//! Stateful hydroponic tank simulator for local development.
//!
//! Models the five channels the hub expects:
//! - Temporal coherence via random walk with mean reversion
//! - Slow nutrient depletion (TDS falls, pH creeps up)
//! - Per-reading probe noise
//! - Occasional spikes on the TDS and pH probes
//! - Closed-loop relay response (dosing raises TDS, the humidifier raises
//!   humidity, air circulation cools the air)

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal(rng: &mut fastrand::Rng) -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += rng.f64();
    }
    sum - 6.0
}

fn gaussian(rng: &mut fastrand::Rng, mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal(rng)
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Hovers near the set points with low noise.
    Stable,
    /// Nutrients deplete noticeably; auto mode has to dose.
    Depleting,
    /// Noisy probes with frequent spikes.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "depleting" => Self::Depleting,
            "flaky" => Self::Flaky,
            _ => Self::Stable,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Depleting => write!(f, "depleting"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub air_temperature: f64,
    pub air_humidity: f64,
    pub water_temperature: f64,
    pub tds: f64,
    pub ph: f64,
}

/// Which actuators are running this tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Actuators {
    pub dosing: bool,
    pub humidifier: bool,
    pub circulation: bool,
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct TankSim {
    rng: fastrand::Rng,
    state: Sample,
    center: Sample,
    mean_reversion: f64,
    walk_scale: f64,
    tds_depletion: f64,
    spike_prob: f64,
}

impl TankSim {
    /// Start at `start`, which also serves as the mean-reversion centre.
    pub fn new(scenario: Scenario, start: Sample, rng: fastrand::Rng) -> Self {
        let (mean_reversion, walk_scale, tds_depletion, spike_prob) = match scenario {
            Scenario::Stable => (0.05, 1.0, 0.5, 0.005),
            Scenario::Depleting => (0.01, 1.0, 4.0, 0.01),
            Scenario::Flaky => (0.05, 3.0, 0.5, 0.10),
        };
        Self {
            rng,
            state: start,
            center: start,
            mean_reversion,
            walk_scale,
            tds_depletion,
            spike_prob,
        }
    }

    /// Advance one tick and return the probe readings.
    pub fn step(&mut self, act: Actuators) -> Sample {
        let r = self.mean_reversion;
        let w = self.walk_scale;
        let c = self.center;

        // -- Evolve the underlying state ----------------------------------

        let s = &mut self.state;
        s.air_temperature += r * (c.air_temperature - s.air_temperature)
            + gaussian(&mut self.rng, 0.0, 0.05 * w)
            - if act.circulation { 0.15 } else { 0.0 };
        s.air_humidity += r * (c.air_humidity - s.air_humidity)
            + gaussian(&mut self.rng, 0.0, 0.2 * w)
            + if act.humidifier { 0.8 } else { -0.1 };
        s.water_temperature += r * (c.water_temperature - s.water_temperature)
            + gaussian(&mut self.rng, 0.0, 0.03 * w);
        s.tds += gaussian(&mut self.rng, 0.0, 1.5 * w)
            + if act.dosing { 12.0 } else { -self.tds_depletion };
        s.ph += r * (c.ph - s.ph)
            + gaussian(&mut self.rng, 0.0, 0.005 * w)
            + if act.dosing { -0.01 } else { 0.002 };

        s.air_humidity = s.air_humidity.clamp(0.0, 100.0);
        s.tds = s.tds.max(0.0);
        s.ph = s.ph.clamp(0.0, 14.0);

        // -- Probe readings -------------------------------------------------

        let mut out = *s;
        if self.rng.f64() < self.spike_prob {
            out.tds = (out.tds + gaussian(&mut self.rng, 0.0, 80.0)).max(0.0);
        }
        if self.rng.f64() < self.spike_prob {
            out.ph = (out.ph + gaussian(&mut self.rng, 0.0, 0.3)).clamp(0.0, 14.0);
        }
        round(out)
    }
}

/// Round to the precision the probes report.
fn round(s: Sample) -> Sample {
    let r = |v: f64, places: i32| {
        let f = 10f64.powi(places);
        (v * f).round() / f
    };
    Sample {
        air_temperature: r(s.air_temperature, 1),
        air_humidity: r(s.air_humidity, 1),
        water_temperature: r(s.water_temperature, 1),
        tds: r(s.tds, 0),
        ph: r(s.ph, 2),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
