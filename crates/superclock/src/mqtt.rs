use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::store::{BatteryReading, DoorReading, PowerReading, WeatherReading};

pub(crate) const ONLINE: &str = "Online";
pub(crate) const OFFLINE: &str = "Offline";

// ---------------------------------------------------------------------------
// Own topics
// ---------------------------------------------------------------------------

/// Retained liveness topic, also used as the last will.
pub(crate) fn lwt_topic(node: &str) -> String {
    format!("tele/{node}/LWT")
}

pub(crate) fn state_topic(node: &str) -> String {
    format!("tele/{node}/STATE")
}

pub(crate) fn sensor_topic(node: &str) -> String {
    format!("tele/{node}/SENSOR")
}

/// Broker client id: `<program>@<host>`. `None` when the result would be
/// rejected by the client library.
pub(crate) fn client_identity(program: &str, host: &str) -> Option<String> {
    let id = format!("{}@{}", program.trim(), host.trim());
    if program.trim().is_empty() || host.trim().is_empty() {
        None
    } else {
        Some(id)
    }
}

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub(crate) struct StatePayload {
    #[serde(rename = "Time")]
    pub(crate) time: String,
    /// Whole hours since boot.
    #[serde(rename = "Uptime")]
    pub(crate) uptime: u64,
    #[serde(rename = "LoadAverage")]
    pub(crate) load_average: f64,
    #[serde(rename = "CPUTemp")]
    pub(crate) cpu_temp: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct SensorPayload {
    #[serde(rename = "Time")]
    pub(crate) time: String,
    #[serde(flatten)]
    pub(crate) fields: serde_json::Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Inbound payloads
// ---------------------------------------------------------------------------

/// Parse a JSON document, falling back to an empty object so every field
/// decodes to its neutral value.
pub(crate) fn parse_document(topic: &str, payload: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(payload) {
        Ok(v) => v,
        Err(e) => {
            warn!(%topic, "bad telemetry json: {e}");
            Value::Object(serde_json::Map::new())
        }
    }
}

/// Numeric field or NaN when missing or not a number.
fn number(doc: &Value, key: &str) -> f64 {
    doc.get(key).and_then(Value::as_f64).unwrap_or(f64::NAN)
}

/// `{"<model>":{"Power":540,"Voltage":235,...}}`
pub(crate) fn decode_power(doc: &Value, model: &str) -> PowerReading {
    let meter = doc.get(model).unwrap_or(&Value::Null);
    PowerReading {
        power: number(meter, "Power"),
        voltage: number(meter, "Voltage"),
    }
}

/// `{"soc":45,"current":-1.0,"voltage":26,"temp_tube":30,"capacity":150}`
pub(crate) fn decode_battery(doc: &Value) -> BatteryReading {
    BatteryReading {
        soc: number(doc, "soc"),
        current: number(doc, "current"),
        voltage: number(doc, "voltage"),
        temp: number(doc, "temp_tube"),
        capacity: number(doc, "capacity"),
    }
}

/// Weather stations report either `temperature` or `temperature_C`.
pub(crate) fn decode_weather(doc: &Value) -> WeatherReading {
    let temperature = match number(doc, "temperature") {
        t if t.is_nan() => number(doc, "temperature_C"),
        t => t,
    };
    WeatherReading {
        temperature,
        humidity: number(doc, "humidity"),
    }
}

/// `{"contact":true}` where `true` means the door is closed.
pub(crate) fn decode_door(doc: &Value) -> DoorReading {
    DoorReading {
        contact: doc.get("contact").and_then(Value::as_bool),
    }
}

/// Parse an "Online"/"Offline" availability payload (case-insensitive,
/// trims whitespace).
pub(crate) fn parse_availability(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload).trim().to_string();
    if s.eq_ignore_ascii_case(ONLINE) {
        Ok(true)
    } else if s.eq_ignore_ascii_case(OFFLINE) {
        Ok(false)
    } else {
        Err(format!("unknown availability '{s}'"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
