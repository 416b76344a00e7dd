//! Panel backlight. The `backlight` feature gates the real rppal PWM driver;
//! without it, a mock implementation logs duty changes.
//!
//! Brightness changes are faded by [`Dimmer`], which runs at most one ramp
//! task at a time. Retargeting cancels the running ramp, waits for it to
//! stop, and starts a fresh one from wherever the level got to.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::BacklightSettings;

#[cfg(feature = "backlight")]
use rppal::pwm::{Channel, Polarity, Pwm};

pub trait Backlight: Send {
    fn set_duty(&mut self, duty: u32) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Hardware PWM (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "backlight")]
pub struct PwmBacklight {
    pwm: Pwm,
    range: u32,
}

#[cfg(feature = "backlight")]
impl PwmBacklight {
    const FREQUENCY_HZ: f64 = 1000.0;

    pub fn new(settings: &BacklightSettings) -> Result<Self> {
        let channel = match settings.channel {
            0 => Channel::Pwm0,
            1 => Channel::Pwm1,
            n => anyhow::bail!("no hardware pwm channel {n}"),
        };
        let pwm = Pwm::with_frequency(channel, Self::FREQUENCY_HZ, 0.0, Polarity::Normal, true)?;
        info!(channel = settings.channel, range = settings.range, "pwm backlight ready");
        Ok(Self {
            pwm,
            range: settings.range,
        })
    }
}

#[cfg(feature = "backlight")]
impl Backlight for PwmBacklight {
    fn set_duty(&mut self, duty: u32) -> Result<()> {
        let cycle = f64::from(duty.min(self.range)) / f64::from(self.range);
        self.pwm.set_duty_cycle(cycle)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock backlight (development, no hardware, logs duty changes)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "backlight"))]
pub struct MockBacklight {
    pub(crate) duty: Option<u32>,
}

#[cfg(not(feature = "backlight"))]
impl MockBacklight {
    pub fn new(settings: &BacklightSettings) -> Self {
        info!(
            channel = settings.channel,
            "[mock-pwm] backlight initialised (no hardware)"
        );
        Self { duty: None }
    }
}

#[cfg(not(feature = "backlight"))]
impl Backlight for MockBacklight {
    fn set_duty(&mut self, duty: u32) -> Result<()> {
        if self.duty != Some(duty) {
            debug!(duty, "[mock-pwm] backlight duty");
        }
        self.duty = Some(duty);
        Ok(())
    }
}

/// Placeholder when the PWM hardware can't be opened; brightness stays put.
#[cfg(feature = "backlight")]
struct Unavailable;

#[cfg(feature = "backlight")]
impl Backlight for Unavailable {
    fn set_duty(&mut self, _duty: u32) -> Result<()> {
        Ok(())
    }
}

/// Open the panel backlight for this build. Hardware failures are logged
/// and leave the brightness where it is; they never stop the kiosk.
pub fn open(settings: &BacklightSettings) -> Box<dyn Backlight> {
    #[cfg(feature = "backlight")]
    {
        match PwmBacklight::new(settings) {
            Ok(pwm) => Box::new(pwm),
            Err(e) => {
                error!("backlight unavailable: {e:#}");
                Box::new(Unavailable)
            }
        }
    }
    #[cfg(not(feature = "backlight"))]
    {
        Box::new(MockBacklight::new(settings))
    }
}

// ---------------------------------------------------------------------------
// Dimmer
// ---------------------------------------------------------------------------

type Panel = Arc<Mutex<Box<dyn Backlight>>>;

struct Ramp {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Dimmer {
    panel: Panel,
    level: Arc<AtomicU32>,
    target: Option<u32>,
    ramp: Option<Ramp>,
    active: u32,
    idle: u32,
    steps: u32,
    step: Duration,
}

impl Dimmer {
    /// Take over the panel and drive it to the active duty immediately.
    pub fn new(panel: Box<dyn Backlight>, settings: &BacklightSettings) -> Self {
        let panel: Panel = Arc::new(Mutex::new(panel));
        let level = Arc::new(AtomicU32::new(settings.active_duty));
        apply(&panel, &level, settings.active_duty);
        Self {
            panel,
            level,
            target: Some(settings.active_duty),
            ramp: None,
            active: settings.active_duty,
            idle: settings.idle_duty,
            steps: settings.fade_steps.max(1),
            step: Duration::from_millis(settings.step_ms),
        }
    }

    /// Shared view of the current duty, for reporting.
    pub fn level_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.level)
    }

    pub fn level(&self) -> u32 {
        self.level.load(Ordering::Relaxed)
    }

    pub fn target(&self) -> Option<u32> {
        self.target
    }

    pub fn is_ramping(&self) -> bool {
        self.ramp.as_ref().is_some_and(|r| !r.task.is_finished())
    }

    pub async fn wake(&mut self) -> bool {
        self.fade_to(self.active).await
    }

    pub async fn dim(&mut self) -> bool {
        self.fade_to(self.idle).await
    }

    /// Start a ramp towards `target`. Returns `false` when `target` is
    /// already the goal, in which case any running ramp is left alone.
    pub async fn fade_to(&mut self, target: u32) -> bool {
        if self.target == Some(target) {
            return false;
        }
        self.target = Some(target);

        if let Some(prev) = self.ramp.take() {
            debug!("cancelling backlight fade");
            prev.cancel.cancel();
            if let Err(e) = prev.task.await {
                error!("backlight fade ended abnormally: {e}");
            }
        }

        let from = self.level();
        debug!(from, to = target, steps = self.steps, "backlight fade");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(ramp(
            Arc::clone(&self.panel),
            Arc::clone(&self.level),
            from,
            target,
            self.steps,
            self.step,
            cancel.clone(),
        ));
        self.ramp = Some(Ramp { cancel, task });
        true
    }

    /// Wait for the running ramp, if any, to reach its target.
    pub async fn settle(&mut self) {
        if let Some(ramp) = self.ramp.take() {
            if let Err(e) = ramp.task.await {
                error!("backlight fade ended abnormally: {e}");
            }
        }
    }
}

async fn ramp(
    panel: Panel,
    level: Arc<AtomicU32>,
    from: u32,
    to: u32,
    steps: u32,
    step: Duration,
    cancel: CancellationToken,
) {
    for i in 1..=steps {
        if cancel.is_cancelled() {
            return;
        }
        apply(&panel, &level, interpolate(from, to, i, steps));
        if i < steps {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(step) => {}
            }
        }
    }
}

fn apply(panel: &Panel, level: &AtomicU32, duty: u32) {
    let result = match panel.lock() {
        Ok(mut p) => p.set_duty(duty),
        Err(_) => Err(anyhow::anyhow!("backlight lock poisoned")),
    };
    match result {
        Ok(()) => level.store(duty, Ordering::Relaxed),
        Err(e) => error!(duty, "can't set backlight: {e:#}"),
    }
}

fn interpolate(from: u32, to: u32, i: u32, steps: u32) -> u32 {
    let (from, to) = (i64::from(from), i64::from(to));
    let v = from + (to - from) * i64::from(i) / i64::from(steps);
    v as u32
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Panel that shares its duty history with the test.
    #[derive(Clone, Default)]
    struct RecordingPanel {
        duties: Arc<Mutex<Vec<u32>>>,
    }

    impl Backlight for RecordingPanel {
        fn set_duty(&mut self, duty: u32) -> Result<()> {
            self.duties.lock().unwrap().push(duty);
            Ok(())
        }
    }

    fn dimmer() -> (Dimmer, Arc<Mutex<Vec<u32>>>) {
        let panel = RecordingPanel::default();
        let duties = panel.duties.clone();
        (
            Dimmer::new(Box::new(panel), &BacklightSettings::default()),
            duties,
        )
    }

    // -- interpolate ------------------------------------------------------------

    #[test]
    fn interpolate_reaches_both_directions() {
        assert_eq!(interpolate(0, 600, 1, 10), 60);
        assert_eq!(interpolate(0, 600, 10, 10), 600);
        assert_eq!(interpolate(600, 0, 5, 10), 300);
        assert_eq!(interpolate(600, 0, 10, 10), 0);
    }

    // -- Mock -------------------------------------------------------------------

    #[cfg(not(feature = "backlight"))]
    #[test]
    fn mock_backlight_records_duty() {
        let mut b = MockBacklight::new(&BacklightSettings::default());
        assert_eq!(b.duty, None);
        b.set_duty(600).unwrap();
        assert_eq!(b.duty, Some(600));
    }

    // -- Dimmer -----------------------------------------------------------------

    #[tokio::test]
    async fn new_applies_active_duty() {
        let (d, duties) = dimmer();
        assert_eq!(*duties.lock().unwrap(), vec![0]);
        assert_eq!(d.level(), 0);
        assert_eq!(d.target(), Some(0));
    }

    #[tokio::test]
    async fn fade_to_current_target_is_a_no_op() {
        let (mut d, _) = dimmer();
        assert!(!d.wake().await);
        assert!(!d.is_ramping());
    }

    #[tokio::test(start_paused = true)]
    async fn dim_ramps_in_fixed_steps() {
        let (mut d, duties) = dimmer();
        assert!(d.dim().await);
        d.settle().await;

        let duties = duties.lock().unwrap().clone();
        assert_eq!(duties.len(), 11);
        assert_eq!(duties[1], 60);
        assert_eq!(*duties.last().unwrap(), 600);
        assert!(duties.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(d.level(), 600);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_dim_starts_one_ramp() {
        let (mut d, _) = dimmer();
        assert!(d.dim().await);
        assert!(!d.dim().await);
        assert!(!d.dim().await);
        d.settle().await;
        assert_eq!(d.level(), 600);
    }

    #[tokio::test(start_paused = true)]
    async fn wake_cancels_running_dim() {
        let (mut d, duties) = dimmer();
        d.dim().await;
        // Let the ramp take a few steps.
        tokio::time::sleep(Duration::from_millis(25)).await;
        let partial = d.level();
        assert!(partial > 0 && partial < 600, "level {partial}");

        assert!(d.wake().await);
        d.settle().await;
        assert_eq!(d.level(), 0);

        // No step above the partial level after the cancel point.
        let duties = duties.lock().unwrap().clone();
        let peak = duties.iter().copied().max().unwrap();
        assert_eq!(peak, partial);
    }

    #[tokio::test(start_paused = true)]
    async fn level_handle_tracks_panel() {
        let (mut d, _) = dimmer();
        let handle = d.level_handle();
        d.dim().await;
        d.settle().await;
        assert_eq!(handle.load(Ordering::Relaxed), 600);
    }
}
