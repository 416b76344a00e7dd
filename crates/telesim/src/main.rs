mod sim;

use std::{collections::HashMap, env, time::Duration};

use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Outgoing, Packet, QoS};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{Device, HouseSim, Scenario, Snapshot};

const ONLINE: &str = "Online";
const OFFLINE: &str = "Offline";

/// JSON key the power meter nests its readings under.
const POWER_MODEL: &str = "PZEM004T";

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct Meter {
    #[serde(rename = "Power")]
    power: f64,
    #[serde(rename = "Voltage")]
    voltage: f64,
}

#[derive(Debug, Serialize)]
struct BatteryDoc {
    soc: f64,
    current: f64,
    voltage: f64,
    temp_tube: f64,
    capacity: f64,
}

#[derive(Debug, Serialize)]
struct IndoorDoc {
    temperature: f64,
    humidity: f64,
}

/// The outdoor station reports with a unit suffix.
#[derive(Debug, Serialize)]
struct OutdoorDoc {
    #[serde(rename = "temperature_C")]
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct DoorDoc {
    contact: bool,
}

fn round_to(v: f64, places: i32) -> f64 {
    let scale = 10_f64.powi(places);
    (v * scale).round() / scale
}

/// Encode the SENSOR document `device` would publish for `snap`.
fn document(device: Device, snap: &Snapshot) -> serde_json::Result<Vec<u8>> {
    match device {
        Device::PowerMeter => {
            let meter = Meter {
                power: snap.power.round(),
                voltage: snap.voltage.round(),
            };
            serde_json::to_vec(&HashMap::from([(POWER_MODEL, meter)]))
        }
        Device::Battery => serde_json::to_vec(&BatteryDoc {
            soc: snap.battery.soc.round(),
            current: round_to(snap.battery.current, 2),
            voltage: round_to(snap.battery.voltage, 2),
            temp_tube: round_to(snap.battery.temp, 1),
            capacity: snap.battery.capacity,
        }),
        Device::Indoor => serde_json::to_vec(&IndoorDoc {
            temperature: round_to(snap.indoor_temp, 1),
            humidity: snap.indoor_humidity.round(),
        }),
        Device::Outdoor => serde_json::to_vec(&OutdoorDoc {
            temperature: round_to(snap.outdoor_temp, 1),
        }),
        Device::Door => serde_json::to_vec(&DoorDoc {
            contact: snap.door_closed,
        }),
    }
}

// ---------------------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------------------

/// One broker connection per simulated device, so each gets its own last
/// will. Announces `Online` (retained) on every connect.
fn connect(device: Device, host: &str, port: u16) -> AsyncClient {
    let lwt = device.lwt_topic();
    let mut opts = MqttOptions::new(format!("telesim-{}", device.slug()), host, port);
    opts.set_keep_alive(Duration::from_secs(30));
    opts.set_last_will(LastWill::new(&lwt, OFFLINE, QoS::AtLeastOnce, true));

    let (client, mut eventloop) = AsyncClient::new(opts, 16);

    let announcer = client.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(device = device.slug(), "connected to mqtt");
                    if let Err(e) = announcer.try_publish(&lwt, QoS::AtLeastOnce, true, ONLINE) {
                        warn!(device = device.slug(), "can't announce: {e}");
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(device = device.slug(), "mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    client
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let host = env::var("MQTT_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let mut sim = HouseSim::new(scenario);
    let every = Duration::from_secs(sample_every_s.max(1));
    info!(%host, port, scenario = %sim.scenario(), every_s = every.as_secs(), "telesim starting");

    let links: Vec<(Device, AsyncClient)> = Device::ALL
        .into_iter()
        .map(|d| (d, connect(d, &host, port)))
        .collect();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sleep(every) => {}
        }

        let snap = sim.tick(every);

        for &(device, online) in &snap.flapped {
            info!(device = device.slug(), online, "availability flap");
            if let Some((_, client)) = links.iter().find(|(d, _)| *d == device) {
                let payload = if online { ONLINE } else { OFFLINE };
                if let Err(e) = client.try_publish(device.lwt_topic(), QoS::AtLeastOnce, true, payload) {
                    warn!(device = device.slug(), "availability publish error: {e}");
                }
            }
        }

        for (device, client) in &links {
            if !sim.is_online(*device) {
                continue;
            }
            let payload = match document(*device, &snap) {
                Ok(p) => p,
                Err(e) => {
                    error!(device = device.slug(), "can't encode reading: {e}");
                    continue;
                }
            };
            match client.try_publish(device.sensor_topic(), QoS::AtMostOnce, false, payload) {
                Ok(()) => debug!(device = device.slug(), "published reading"),
                Err(e) => warn!(device = device.slug(), "publish error: {e}"),
            }
        }
    }

    info!("shutting down");
    for (device, client) in &links {
        if let Err(e) = client.try_publish(device.lwt_topic(), QoS::AtLeastOnce, true, OFFLINE) {
            warn!(device = device.slug(), "can't announce offline: {e}");
        }
        if let Err(e) = client.try_disconnect() {
            warn!(device = device.slug(), "disconnect error: {e}");
        }
    }
    // Give the event loops a moment to flush.
    sleep(Duration::from_millis(500)).await;
}

// ===========================================================================
// Tests
// ===========================================================================
