//! TOML config file loading, environment overrides, and validation.
//!
//! Every key has a default, so a missing file yields a working kiosk that
//! talks to a broker on localhost.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::dispatch::{DispatchTable, Handler, Site};
use crate::store::Entity;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttSettings,
    pub topics: TopicSettings,
    pub heartbeat: HeartbeatSettings,
    pub display: DisplaySettings,
    pub backlight: BacklightSettings,
    pub power_off: PowerOffSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// Node name used in this kiosk's own topics. Defaults to the host name.
    pub node: Option<String>,
    pub program: String,
    /// Cooldown after a transport error on a live connection.
    pub retry_secs: u64,
    /// Cooldown after a failed connection attempt.
    pub connect_retry_secs: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            username: None,
            password: None,
            keep_alive_secs: 60,
            node: None,
            program: "superclock".into(),
            retry_secs: 10,
            connect_retry_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicSettings {
    pub power: String,
    pub power_lwt: String,
    /// JSON key the power meter nests its readings under.
    pub power_model: String,
    pub battery: String,
    pub battery_lwt: String,
    pub indoor: String,
    pub indoor_lwt: String,
    pub outdoor: String,
    pub outdoor_lwt: String,
    pub door: String,
    pub door_lwt: String,
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            power: "tele/main-power/SENSOR".into(),
            power_lwt: "tele/main-power/LWT".into(),
            power_model: "PZEM004T".into(),
            battery: "tele/main_battery/SENSOR".into(),
            battery_lwt: "tele/main_battery/LWT".into(),
            indoor: "tele/indoor/SENSOR".into(),
            indoor_lwt: "tele/indoor/LWT".into(),
            outdoor: "tele/outdoor/SENSOR".into(),
            outdoor_lwt: "tele/outdoor/LWT".into(),
            door: "tele/front_door/SENSOR".into(),
            door_lwt: "tele/front_door/LWT".into(),
        }
    }
}

impl TopicSettings {
    fn all(&self) -> [(&'static str, &str); 10] {
        [
            ("power", self.power.as_str()),
            ("power_lwt", self.power_lwt.as_str()),
            ("battery", self.battery.as_str()),
            ("battery_lwt", self.battery_lwt.as_str()),
            ("indoor", self.indoor.as_str()),
            ("indoor_lwt", self.indoor_lwt.as_str()),
            ("outdoor", self.outdoor.as_str()),
            ("outdoor_lwt", self.outdoor_lwt.as_str()),
            ("door", self.door.as_str()),
            ("door_lwt", self.door_lwt.as_str()),
        ]
    }

    /// Build the dispatch table for every configured inbound topic.
    pub fn dispatch_table(&self) -> DispatchTable {
        let mut table = DispatchTable::new();
        table.register(&self.battery, Handler::Battery);
        table.register(
            &self.power,
            Handler::Power {
                model: self.power_model.clone(),
            },
        );
        table.register(&self.power_lwt, Handler::Availability(Entity::Power));
        table.register(&self.battery_lwt, Handler::Availability(Entity::Battery));
        table.register(&self.indoor, Handler::Weather(Site::Indoor));
        table.register(&self.indoor_lwt, Handler::Availability(Entity::Indoor));
        table.register(&self.outdoor, Handler::Weather(Site::Outdoor));
        table.register(&self.outdoor_lwt, Handler::Availability(Entity::Outdoor));
        table.register(&self.door, Handler::Door);
        table.register(&self.door_lwt, Handler::Availability(Entity::Door));
        table
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub state_interval_secs: u64,
    pub sensor_interval_secs: u64,
    /// Index into `/sys/class/thermal/thermal_zone<N>/temp`.
    pub thermal_zone: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            state_interval_secs: 60,
            sensor_interval_secs: 5,
            thermal_zone: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    pub backend: String,
    pub width: u32,
    pub height: u32,
    pub tick_ms: u64,
    /// Seconds without input or repaint before the backlight dims.
    pub idle_secs: u64,
    /// Directory holding the icon artwork; checked at startup when set.
    pub assets_dir: Option<String>,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            backend: "headless".into(),
            width: 640,
            height: 480,
            tick_ms: 1000,
            idle_secs: 5,
            assets_dir: None,
        }
    }
}

impl DisplaySettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BacklightSettings {
    /// Hardware PWM channel (0 = GPIO 18).
    pub channel: u8,
    /// Full-scale PWM value; duties are fractions of this.
    pub range: u32,
    /// Duty while the kiosk is in use. Lower is brighter on this panel.
    pub active_duty: u32,
    pub idle_duty: u32,
    pub fade_steps: u32,
    pub step_ms: u64,
}

impl Default for BacklightSettings {
    fn default() -> Self {
        Self {
            channel: 0,
            range: 1024,
            active_duty: 0,
            idle_duty: 600,
            fade_steps: 10,
            step_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PowerOffSettings {
    pub topic: String,
    pub payload: String,
    /// Confirmation progress added per render tick while armed.
    pub increment: f64,
}

impl Default for PowerOffSettings {
    fn default() -> Self {
        Self {
            topic: "cmnd/main-power/POWER".into(),
            payload: "OFF".into(),
            increment: 0.1,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_topics(&mut errors);
        self.validate_timing(&mut errors);

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

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if m.program.trim().is_empty() {
            errors.push("mqtt.program is empty".into());
        }
        if let Some(node) = &m.node {
            if node.trim().is_empty() {
                errors.push("mqtt.node is empty".into());
            } else if has_wildcard(node) || node.contains('/') {
                errors.push(format!("mqtt.node '{node}' must be a single topic level"));
            }
        }
        if m.password.is_some() && m.username.is_none() {
            errors.push("mqtt.password is set without mqtt.username".into());
        }
        if m.keep_alive_secs < 5 {
            errors.push(format!(
                "mqtt.keep_alive_secs must be at least 5, got {}",
                m.keep_alive_secs
            ));
        }
    }

    fn validate_topics(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<String> = HashSet::new();
        for (name, topic) in self.topics.all() {
            if topic.trim().is_empty() {
                errors.push(format!("topics.{name} is empty"));
            } else if has_wildcard(topic) {
                errors.push(format!("topics.{name} '{topic}' contains a wildcard"));
            } else if !seen.insert(topic.to_ascii_lowercase()) {
                errors.push(format!("topics.{name} '{topic}' is already used"));
            }
        }
        if self.topics.power_model.trim().is_empty() {
            errors.push("topics.power_model is empty".into());
        }
        if self.power_off.topic.trim().is_empty() || has_wildcard(&self.power_off.topic) {
            errors.push(format!(
                "power_off.topic '{}' is not a publishable topic",
                self.power_off.topic
            ));
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let positive = [
            ("mqtt.retry_secs", self.mqtt.retry_secs),
            ("mqtt.connect_retry_secs", self.mqtt.connect_retry_secs),
            ("heartbeat.state_interval_secs", self.heartbeat.state_interval_secs),
            ("heartbeat.sensor_interval_secs", self.heartbeat.sensor_interval_secs),
            ("display.tick_ms", self.display.tick_ms),
            ("display.idle_secs", self.display.idle_secs),
            ("display.width", u64::from(self.display.width)),
            ("display.height", u64::from(self.display.height)),
            ("backlight.range", u64::from(self.backlight.range)),
            ("backlight.fade_steps", u64::from(self.backlight.fade_steps)),
        ];
        for (name, value) in positive {
            if value == 0 {
                errors.push(format!("{name} must be positive, got 0"));
            }
        }

        let b = &self.backlight;
        for (name, duty) in [("active_duty", b.active_duty), ("idle_duty", b.idle_duty)] {
            if duty > b.range {
                errors.push(format!(
                    "backlight.{name} ({duty}) exceeds backlight.range ({})",
                    b.range
                ));
            }
        }

        let inc = self.power_off.increment;
        if !(inc > 0.0 && inc <= 1.0) {
            errors.push(format!("power_off.increment {inc} out of range (0.0, 1.0]"));
        }
    }
}

fn has_wildcard(topic: &str) -> bool {
    topic.contains('#') || topic.contains('+')
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// defaults; broker environment overrides are applied before validation.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(%path, "no config file, using defaults");
        Config::default()
    };

    config.apply_env();
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

impl Config {
    /// `MQTT_HOST`, `MQTT_PORT`, `MQTT_USERNAME` and `MQTT_PASSWORD` take
    /// precedence over the file.
    fn apply_env(&mut self) {
        if let Ok(host) = env::var("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Ok(user) = env::var("MQTT_USERNAME") {
            self.mqtt.username = Some(user);
        }
        if let Ok(pass) = env::var("MQTT_PASSWORD") {
            self.mqtt.password = Some(pass);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
