//! In-memory mirror of the remote devices the kiosk watches.
//!
//! Each monitored entity owns one [`Record`]: the latest decoded reading, the
//! entity's availability, and a `changed` flag. Writers are the dispatch
//! handlers running inside the bus loop; readers are the widgets running in
//! the render tick. Every record sits behind its own lock so the fields of one
//! inbound message become visible together with the flag.

use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedStore = Arc<TelemetryStore>;

// ---------------------------------------------------------------------------
// Field merging
// ---------------------------------------------------------------------------

/// Per-field merge of a freshly decoded reading into the stored one.
///
/// Returns `true` when at least one field was different and got overwritten.
pub trait Merge {
    fn merge(&mut self, incoming: &Self) -> bool;
}

/// Two numeric readings are the same when they are equal or both unknown.
/// NaN compares unequal to itself, which would make every redelivered
/// payload with a missing field look like a change.
pub fn same_value(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

fn merge_f64(slot: &mut f64, value: f64) -> bool {
    if same_value(*slot, value) {
        false
    } else {
        *slot = value;
        true
    }
}

fn merge_opt<T: PartialEq + Copy>(slot: &mut Option<T>, value: Option<T>) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerReading {
    /// Active power in watts.
    pub power: f64,
    /// Line voltage in volts.
    pub voltage: f64,
}

impl Default for PowerReading {
    fn default() -> Self {
        Self {
            power: f64::NAN,
            voltage: f64::NAN,
        }
    }
}

impl Merge for PowerReading {
    fn merge(&mut self, incoming: &Self) -> bool {
        // Non-short-circuiting `|` so every field is merged.
        merge_f64(&mut self.power, incoming.power) | merge_f64(&mut self.voltage, incoming.voltage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryReading {
    /// State of charge, percent.
    pub soc: f64,
    /// Amps; negative while discharging.
    pub current: f64,
    pub voltage: f64,
    /// Cell temperature (`temp_tube`), Celsius.
    pub temp: f64,
    /// Rated capacity, Ah.
    pub capacity: f64,
}

impl Default for BatteryReading {
    fn default() -> Self {
        Self {
            soc: f64::NAN,
            current: f64::NAN,
            voltage: f64::NAN,
            temp: f64::NAN,
            capacity: f64::NAN,
        }
    }
}

impl Merge for BatteryReading {
    fn merge(&mut self, incoming: &Self) -> bool {
        merge_f64(&mut self.soc, incoming.soc)
            | merge_f64(&mut self.current, incoming.current)
            | merge_f64(&mut self.voltage, incoming.voltage)
            | merge_f64(&mut self.temp, incoming.temp)
            | merge_f64(&mut self.capacity, incoming.capacity)
    }
}

/// Currents within this band around zero count as idle.
const IDLE_CURRENT_A: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeState {
    Charging,
    Discharging,
    Idle,
}

impl BatteryReading {
    pub fn charge_state(&self) -> ChargeState {
        if self.current > IDLE_CURRENT_A {
            ChargeState::Charging
        } else if self.current < -IDLE_CURRENT_A {
            ChargeState::Discharging
        } else {
            // Also covers an unknown (NaN) current.
            ChargeState::Idle
        }
    }
}

impl fmt::Display for ChargeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Charging => write!(f, "charging"),
            Self::Discharging => write!(f, "discharging"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeatherReading {
    pub temperature: f64,
    pub humidity: f64,
}

impl Default for WeatherReading {
    fn default() -> Self {
        Self {
            temperature: f64::NAN,
            humidity: f64::NAN,
        }
    }
}

impl Merge for WeatherReading {
    fn merge(&mut self, incoming: &Self) -> bool {
        merge_f64(&mut self.temperature, incoming.temperature)
            | merge_f64(&mut self.humidity, incoming.humidity)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoorReading {
    /// `Some(true)` when the contact reports closed; `None` until known.
    pub contact: Option<bool>,
}

impl DoorReading {
    pub fn is_open(&self) -> Option<bool> {
        self.contact.map(|closed| !closed)
    }
}

impl Merge for DoorReading {
    fn merge(&mut self, incoming: &Self) -> bool {
        merge_opt(&mut self.contact, incoming.contact)
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One remote entity: latest reading, availability, and the dirty flag.
#[derive(Debug)]
pub struct Record<T> {
    pub reading: T,
    pub online: bool,
    changed: bool,
}

impl<T: Merge + Default> Record<T> {
    /// Starts with sentinel values and `changed` set so the first render
    /// shows the placeholder state.
    pub fn new() -> Self {
        Self {
            reading: T::default(),
            online: false,
            changed: true,
        }
    }

    /// Merge a decoded reading. Identical values leave the record untouched.
    pub fn apply(&mut self, incoming: &T) -> bool {
        let changed = self.reading.merge(incoming);
        if changed {
            self.changed = true;
        }
        changed
    }

    /// Availability updates always mark the record, even when the value
    /// is unchanged.
    pub fn set_online(&mut self, online: bool) {
        self.online = online;
        self.changed = true;
    }

    /// Consume the dirty flag. Only the record's consuming widget calls this.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }
}

impl<T: Merge + Default> Default for Record<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Identifies a record in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Power,
    Battery,
    Indoor,
    Outdoor,
    Door,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Power => write!(f, "power"),
            Self::Battery => write!(f, "battery"),
            Self::Indoor => write!(f, "indoor"),
            Self::Outdoor => write!(f, "outdoor"),
            Self::Door => write!(f, "door"),
        }
    }
}

#[derive(Debug, Default)]
pub struct TelemetryStore {
    pub power: Mutex<Record<PowerReading>>,
    pub battery: Mutex<Record<BatteryReading>>,
    pub indoor: Mutex<Record<WeatherReading>>,
    pub outdoor: Mutex<Record<WeatherReading>>,
    pub door: Mutex<Record<DoorReading>>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStore {
        Arc::new(Self::new())
    }

    /// Set the availability flag of `entity`.
    pub async fn set_online(&self, entity: Entity, online: bool) {
        match entity {
            Entity::Power => self.power.lock().await.set_online(online),
            Entity::Battery => self.battery.lock().await.set_online(online),
            Entity::Indoor => self.indoor.lock().await.set_online(online),
            Entity::Outdoor => self.outdoor.lock().await.set_online(online),
            Entity::Door => self.door.lock().await.set_online(online),
        }
    }

    pub async fn is_online(&self, entity: Entity) -> bool {
        match entity {
            Entity::Power => self.power.lock().await.online,
            Entity::Battery => self.battery.lock().await.online,
            Entity::Indoor => self.indoor.lock().await.online,
            Entity::Outdoor => self.outdoor.lock().await.online,
            Entity::Door => self.door.lock().await.online,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
