//! Stateful household telemetry simulator for local development.
//!
//! Models the devices the kiosk listens to:
//! - Mains power meter with a wandering house load
//! - Battery bank that charges on mains and drains during outages
//! - Indoor and outdoor weather stations (slow random walks)
//! - Front door contact that opens and closes now and then
//!
//! Scenarios pick how hostile the run is: steady state, mains outages, or
//! devices dropping off the bus.

use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mains always up, every device online. Good for layout work.
    Normal,
    /// Mains drops out and comes back at random (~5% per sample). Exercises
    /// the power-fail icon and the discharging battery colours.
    Outage,
    /// Devices go offline and come back (~5% per device per sample).
    /// Exercises availability handling and greyed-out widgets.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "outage" => Self::Outage,
            "flaky" => Self::Flaky,
            _ => Self::Normal, // default
        }
    }

    fn outage_prob(self) -> f64 {
        match self {
            Self::Outage => 0.05,
            _ => 0.0,
        }
    }

    fn flap_prob(self) -> f64 {
        match self {
            Self::Flaky => 0.05,
            _ => 0.0,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Outage => write!(f, "outage"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    PowerMeter,
    Battery,
    Indoor,
    Outdoor,
    Door,
}

impl Device {
    pub const ALL: [Device; 5] = [
        Device::PowerMeter,
        Device::Battery,
        Device::Indoor,
        Device::Outdoor,
        Device::Door,
    ];

    /// Topic segment the real device publishes under.
    pub fn slug(self) -> &'static str {
        match self {
            Device::PowerMeter => "main-power",
            Device::Battery => "main_battery",
            Device::Indoor => "indoor",
            Device::Outdoor => "outdoor",
            Device::Door => "front_door",
        }
    }

    pub fn sensor_topic(self) -> String {
        format!("tele/{}/SENSOR", self.slug())
    }

    pub fn lwt_topic(self) -> String {
        format!("tele/{}/LWT", self.slug())
    }

    fn index(self) -> usize {
        self as usize
    }
}

// ---------------------------------------------------------------------------
// Random walk
// ---------------------------------------------------------------------------

/// Mean-reverting random walk clamped to a physical range.
#[derive(Debug, Clone)]
pub struct RandomWalk {
    value: f64,
    center: f64,
    sigma: f64,
    reversion: f64,
    min: f64,
    max: f64,
}

impl RandomWalk {
    pub fn new(center: f64, sigma: f64, reversion: f64, min: f64, max: f64) -> Self {
        Self {
            value: center,
            center,
            sigma,
            reversion,
            min,
            max,
        }
    }

    pub fn step(&mut self) -> f64 {
        let pull = self.reversion * (self.center - self.value);
        self.value = (self.value + pull + gaussian(0.0, self.sigma)).clamp(self.min, self.max);
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct BatterySample {
    pub soc: f64,
    pub current: f64,
    pub voltage: f64,
    pub temp: f64,
    pub capacity: f64,
}

/// One sampling tick's worth of readings.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub power: f64,
    pub voltage: f64,
    pub battery: BatterySample,
    pub indoor_temp: f64,
    pub indoor_humidity: f64,
    pub outdoor_temp: f64,
    /// `true` when the contact is made, i.e. the door is closed.
    pub door_closed: bool,
    /// Availability changes that happened this tick.
    pub flapped: Vec<(Device, bool)>,
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

/// Nominal battery bank size (Ah).
const CAPACITY_AH: f64 = 150.0;

pub struct HouseSim {
    scenario: Scenario,
    mains: bool,
    load: RandomWalk,
    line_voltage: RandomWalk,
    soc: f64,
    tube_temp: RandomWalk,
    indoor_temp: RandomWalk,
    indoor_humidity: RandomWalk,
    outdoor_temp: RandomWalk,
    door_closed: bool,
    online: [bool; 5],
}

impl HouseSim {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            mains: true,
            load: RandomWalk::new(600.0, 150.0, 0.05, 80.0, 6000.0),
            line_voltage: RandomWalk::new(235.0, 1.5, 0.2, 215.0, 250.0),
            soc: 80.0,
            tube_temp: RandomWalk::new(28.0, 0.3, 0.05, 15.0, 60.0),
            indoor_temp: RandomWalk::new(21.0, 0.1, 0.05, 10.0, 35.0),
            indoor_humidity: RandomWalk::new(45.0, 0.8, 0.05, 15.0, 95.0),
            outdoor_temp: RandomWalk::new(4.0, 0.3, 0.02, -30.0, 40.0),
            door_closed: true,
            online: [true; 5],
        }
    }

    pub fn scenario(&self) -> Scenario {
        self.scenario
    }

    pub fn is_online(&self, device: Device) -> bool {
        self.online[device.index()]
    }

    /// Advance every device by `dt` and return the new readings.
    pub fn tick(&mut self, dt: Duration) -> Snapshot {
        if fastrand::f64() < self.scenario.outage_prob() {
            self.mains = !self.mains;
        }

        let load = self.load.step();
        let line_voltage = self.line_voltage.step();
        let (power, voltage) = if self.mains {
            (load, line_voltage)
        } else {
            (0.0, 0.0)
        };

        // Charge on mains until full; carry the house load otherwise.
        let current = match (self.mains, self.soc < 100.0) {
            (true, true) => gaussian(5.0, 0.5).max(0.1),
            (true, false) => gaussian(0.0, 0.02),
            (false, _) => -(load / 24.0).max(0.5),
        };
        let hours = dt.as_secs_f64() / 3600.0;
        self.soc = (self.soc + current * hours / CAPACITY_AH * 100.0).clamp(0.0, 100.0);
        let battery = BatterySample {
            soc: self.soc,
            current,
            voltage: 24.0 + 2.4 * self.soc / 100.0 + current * 0.02,
            temp: self.tube_temp.step(),
            capacity: CAPACITY_AH,
        };

        if fastrand::f64() < 0.02 {
            self.door_closed = !self.door_closed;
        }

        let mut flapped = Vec::new();
        for device in Device::ALL {
            if fastrand::f64() < self.scenario.flap_prob() {
                let online = &mut self.online[device.index()];
                *online = !*online;
                flapped.push((device, *online));
            }
        }

        Snapshot {
            power,
            voltage,
            battery,
            indoor_temp: self.indoor_temp.step(),
            indoor_humidity: self.indoor_humidity.step(),
            outdoor_temp: self.outdoor_temp.step(),
            door_closed: self.door_closed,
            flapped,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
