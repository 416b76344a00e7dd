//! Periodic self-reporting: a STATE document (uptime, load, CPU temperature)
//! and a SENSOR document (backlight duty) on this kiosk's own topics.
//!
//! Both timers are level-triggered against the current instant. The first
//! check always fires, and a stall longer than an interval produces one
//! publish rather than a burst.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use sysinfo::System;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::Publisher;
use crate::clock::LocalClock;
use crate::config::HeartbeatSettings;
use crate::mqtt::{sensor_topic, state_topic, SensorPayload, StatePayload};

// ---------------------------------------------------------------------------
// Deadline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Deadline {
    interval: Duration,
    next: Option<Instant>,
}

impl Deadline {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: None,
        }
    }

    /// `true` when `now` has reached the deadline; the next one is then
    /// scheduled one interval after `now`.
    pub fn due(&mut self, now: Instant) -> bool {
        match self.next {
            Some(next) if now < next => false,
            _ => {
                self.next = Some(now + self.interval);
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// System probe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SystemProbe {
    thermal_path: PathBuf,
}

impl SystemProbe {
    pub fn new(thermal_zone: u32) -> Self {
        Self {
            thermal_path: PathBuf::from(format!(
                "/sys/class/thermal/thermal_zone{thermal_zone}/temp"
            )),
        }
    }

    /// CPU temperature in whole °C, or 0 when the zone can't be read.
    pub fn cpu_temp(&self) -> i64 {
        match std::fs::read_to_string(&self.thermal_path) {
            Ok(raw) => parse_millidegrees(&raw),
            Err(e) => {
                debug!(path = %self.thermal_path.display(), "can't read cpu temperature: {e}");
                0
            }
        }
    }

    pub fn state(&self, clock: &LocalClock) -> StatePayload {
        StatePayload {
            time: clock.timestamp(),
            uptime: System::uptime() / 3600,
            load_average: round2(System::load_average().one),
            cpu_temp: self.cpu_temp(),
        }
    }
}

fn parse_millidegrees(raw: &str) -> i64 {
    raw.trim().parse::<i64>().map(|m| m / 1000).unwrap_or(0)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Announcer
// ---------------------------------------------------------------------------

/// Which documents a tick published.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Fired {
    pub state: bool,
    pub sensor: bool,
}

pub struct Announcer {
    publisher: Publisher,
    probe: SystemProbe,
    clock: LocalClock,
    state: Deadline,
    sensor: Deadline,
    backlight: Arc<AtomicU32>,
}

impl Announcer {
    pub fn new(
        publisher: Publisher,
        settings: &HeartbeatSettings,
        clock: LocalClock,
        backlight: Arc<AtomicU32>,
    ) -> Self {
        Self {
            publisher,
            probe: SystemProbe::new(settings.thermal_zone),
            clock,
            state: Deadline::new(Duration::from_secs(settings.state_interval_secs)),
            sensor: Deadline::new(Duration::from_secs(settings.sensor_interval_secs)),
            backlight,
        }
    }

    /// Publish whichever documents are due. Publish failures are logged by
    /// the publisher and retried at the next interval.
    pub fn tick(&mut self, now: Instant) -> Fired {
        let mut fired = Fired::default();
        let node = self.publisher.node().to_string();

        if self.state.due(now) {
            let payload = self.probe.state(&self.clock);
            let _ = self.publisher.publish_json(&state_topic(&node), &payload);
            fired.state = true;
        }

        if self.sensor.due(now) {
            let mut fields = Map::new();
            fields.insert(
                "Backlight".into(),
                Value::from(self.backlight.load(Ordering::Relaxed)),
            );
            let payload = SensorPayload {
                time: self.clock.timestamp(),
                fields,
            };
            let _ = self.publisher.publish_json(&sensor_topic(&node), &payload);
            fired.sensor = true;
        }

        fired
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("heartbeat started");
        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(Instant::now());
                }
            }
        }
        warn!("heartbeat stopped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
