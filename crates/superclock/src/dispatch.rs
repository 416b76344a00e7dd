//! Topic → handler routing for inbound telemetry.
//!
//! The table is filled once at startup and read-only afterwards. Lookup is a
//! case-insensitive exact match in registration order; the first match wins.
//! Registering the same topic twice is allowed but logged, since the later
//! entry can never fire.

use tracing::{debug, info, warn};

use crate::mqtt::{
    decode_battery, decode_door, decode_power, decode_weather, parse_availability, parse_document,
};
use crate::store::{Entity, TelemetryStore};

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// What to do with a payload that arrived on a registered topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handler {
    /// Power meter SENSOR document; values nested under the device model key.
    Power { model: String },
    Battery,
    Weather(Site),
    Door,
    /// "Online"/"Offline" availability of one entity.
    Availability(Entity),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Site {
    Indoor,
    Outdoor,
}

impl Handler {
    /// Decode `payload` and apply it to the matching record.
    pub async fn apply(&self, store: &TelemetryStore, topic: &str, payload: &[u8]) {
        match self {
            Self::Power { model } => {
                let reading = decode_power(&parse_document(topic, payload), model);
                let changed = store.power.lock().await.apply(&reading);
                debug!(power = reading.power, voltage = reading.voltage, changed, "power");
            }
            Self::Battery => {
                let reading = decode_battery(&parse_document(topic, payload));
                let changed = store.battery.lock().await.apply(&reading);
                debug!(
                    soc = reading.soc,
                    current = reading.current,
                    voltage = reading.voltage,
                    watts = reading.current * reading.voltage,
                    temp = reading.temp,
                    state = %reading.charge_state(),
                    changed,
                    "battery"
                );
            }
            Self::Weather(site) => {
                let reading = decode_weather(&parse_document(topic, payload));
                let record = match site {
                    Site::Indoor => &store.indoor,
                    Site::Outdoor => &store.outdoor,
                };
                let changed = record.lock().await.apply(&reading);
                debug!(
                    ?site,
                    temperature = reading.temperature,
                    humidity = reading.humidity,
                    changed,
                    "weather"
                );
            }
            Self::Door => {
                let reading = decode_door(&parse_document(topic, payload));
                let changed = store.door.lock().await.apply(&reading);
                debug!(open = ?reading.is_open(), changed, "door");
            }
            Self::Availability(entity) => {
                let online = match parse_availability(payload) {
                    Ok(v) => v,
                    Err(msg) => {
                        warn!(%topic, "{msg}, treating as offline");
                        false
                    }
                };
                store.set_online(*entity, online).await;
                info!(%entity, online, "availability");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic: String,
    pub handler: Handler,
}

#[derive(Debug, Default)]
pub struct DispatchTable {
    entries: Vec<Subscription>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscription. Returns `false` when `topic` was already
    /// registered; the new entry is kept but shadowed by the earlier one.
    pub fn register(&mut self, topic: impl Into<String>, handler: Handler) -> bool {
        let topic = topic.into();
        let fresh = self.find(&topic).is_none();
        if !fresh {
            warn!(%topic, ?handler, "duplicate subscription, earlier handler wins");
        }
        self.entries.push(Subscription { topic, handler });
        fresh
    }

    /// Every registered topic in registration order.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|s| s.topic.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, topic: &str) -> Option<&Subscription> {
        self.entries
            .iter()
            .find(|s| s.topic.eq_ignore_ascii_case(topic))
    }

    /// Route one inbound message. Returns `false` when no handler matched,
    /// which is not an error.
    pub async fn dispatch(&self, store: &TelemetryStore, topic: &str, payload: &[u8]) -> bool {
        match self.find(topic) {
            Some(sub) => {
                sub.handler.apply(store, topic, payload).await;
                true
            }
            None => {
                debug!(%topic, "unhandled topic");
                false
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const BATTERY: &str = "tele/main_battery/SENSOR";
    const BATTERY_LWT: &str = "tele/main_battery/LWT";
    const POWER: &str = "tele/main-power/SENSOR";

    fn table() -> DispatchTable {
        let mut t = DispatchTable::new();
        t.register(BATTERY, Handler::Battery);
        t.register(BATTERY_LWT, Handler::Availability(Entity::Battery));
        t.register(
            POWER,
            Handler::Power {
                model: "PZEM004T".into(),
            },
        );
        t.register("zigbee2mqtt/front_door", Handler::Door);
        t.register("rtl_433/outdoor", Handler::Weather(Site::Outdoor));
        t
    }

    /// Store with every initial dirty flag consumed.
    async fn quiet_store() -> TelemetryStore {
        let store = TelemetryStore::new();
        store.power.lock().await.take_changed();
        store.battery.lock().await.take_changed();
        store.indoor.lock().await.take_changed();
        store.outdoor.lock().await.take_changed();
        store.door.lock().await.take_changed();
        store
    }

    // -- register -------------------------------------------------------------

    #[test]
    fn register_keeps_order() {
        let t = table();
        let topics: Vec<&str> = t.topics().collect();
        assert_eq!(topics[0], BATTERY);
        assert_eq!(topics[2], POWER);
        assert_eq!(t.len(), 5);
    }

    #[test]
    fn register_duplicate_is_flagged() {
        let mut t = DispatchTable::new();
        assert!(t.register(BATTERY, Handler::Battery));
        assert!(!t.register(BATTERY.to_lowercase(), Handler::Door));
        assert_eq!(t.len(), 2);
    }

    // -- dispatch -------------------------------------------------------------

    #[tokio::test]
    async fn dispatch_unknown_topic_is_not_an_error() {
        let store = quiet_store().await;
        assert!(!table().dispatch(&store, "tele/other/SENSOR", b"{}").await);
    }

    #[tokio::test]
    async fn dispatch_matches_case_insensitively() {
        let store = quiet_store().await;
        let hit = table()
            .dispatch(&store, "TELE/MAIN_BATTERY/sensor", br#"{"soc":70}"#)
            .await;
        assert!(hit);
        assert_eq!(store.battery.lock().await.reading.soc, 70.0);
    }

    #[tokio::test]
    async fn dispatch_first_registration_wins() {
        let mut t = DispatchTable::new();
        t.register(BATTERY, Handler::Battery);
        t.register(BATTERY, Handler::Door);
        let store = quiet_store().await;

        t.dispatch(&store, BATTERY, br#"{"soc":33,"contact":true}"#).await;

        assert_eq!(store.battery.lock().await.reading.soc, 33.0);
        assert!(!store.door.lock().await.is_changed());
    }

    #[tokio::test]
    async fn battery_scenario_marks_changed_and_discharging() {
        let store = quiet_store().await;
        let t = table();
        t.dispatch(&store, BATTERY, br#"{"soc":50}"#).await;
        store.battery.lock().await.take_changed();

        t.dispatch(
            &store,
            BATTERY,
            br#"{"soc":45,"current":-1.0,"voltage":26,"temp_tube":30,"capacity":150}"#,
        )
        .await;

        let rec = store.battery.lock().await;
        assert!(rec.is_changed());
        assert_eq!(rec.reading.soc, 45.0);
        assert_eq!(
            rec.reading.charge_state(),
            crate::store::ChargeState::Discharging
        );
    }

    #[tokio::test]
    async fn replaying_same_payload_sets_changed_once() {
        let store = quiet_store().await;
        let t = table();
        let payload = br#"{"PZEM004T":{"Power":540,"Voltage":235}}"#;

        t.dispatch(&store, POWER, payload).await;
        assert!(store.power.lock().await.take_changed());

        t.dispatch(&store, POWER, payload).await;
        assert!(!store.power.lock().await.is_changed());
    }

    #[tokio::test]
    async fn availability_flips_set_changed_each_time() {
        let store = quiet_store().await;
        let t = table();

        t.dispatch(&store, BATTERY_LWT, b"Offline").await;
        {
            let mut rec = store.battery.lock().await;
            assert!(!rec.online);
            assert!(rec.take_changed());
        }

        t.dispatch(&store, BATTERY_LWT, b"Online").await;
        let mut rec = store.battery.lock().await;
        assert!(rec.online);
        assert!(rec.take_changed());
    }

    #[tokio::test]
    async fn garbage_availability_counts_as_offline() {
        let store = quiet_store().await;
        store.set_online(Entity::Battery, true).await;
        table().dispatch(&store, BATTERY_LWT, b"???").await;
        assert!(!store.is_online(Entity::Battery).await);
    }

    #[tokio::test]
    async fn door_and_weather_handlers_update_their_records() {
        let store = quiet_store().await;
        let t = table();
        t.dispatch(&store, "zigbee2mqtt/front_door", br#"{"contact":false}"#)
            .await;
        t.dispatch(&store, "rtl_433/outdoor", br#"{"temperature_C":4.5}"#)
            .await;

        assert_eq!(store.door.lock().await.reading.is_open(), Some(true));
        assert_eq!(store.outdoor.lock().await.reading.temperature, 4.5);
        assert!(!store.indoor.lock().await.is_changed());
    }
}
