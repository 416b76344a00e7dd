//! Render scheduler: one pass over the widget list per tick, one full
//! repaint when anything changed, and the idle backlight policy otherwise.
//!
//! ## Per-tick decision
//!
//! ```text
//! update every widget ──[any new visual | first frame]──▶ repaint ─▶ wake backlight
//!         │
//!         └──[nothing changed]──▶ idle longer than threshold? ──▶ dim backlight
//! ```
//!
//! Input events count as activity: they wake the backlight and restart the
//! idle countdown without forcing a repaint.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backlight::Dimmer;
use crate::bus::Publisher;
use crate::clock::LocalClock;
use crate::render::{Color, InputEvent, Rect, RenderBackend};
use crate::store::{SharedStore, TelemetryStore};
use crate::widget::{Command, RenderContext, Widget};

/// Panel inset inside the outer background, in pixels.
const PANEL_INSET: u32 = 4;

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub changed: usize,
    pub repainted: bool,
}

pub struct RenderScheduler {
    /// Draw order; also the order clicks are hit-tested in.
    widgets: Vec<Widget>,
    first_frame: bool,
    dimmer: Dimmer,
    idle_after: Duration,
    last_active: Instant,
    clock: LocalClock,
    commands: Vec<Command>,
}

impl RenderScheduler {
    pub fn new(widgets: Vec<Widget>, dimmer: Dimmer, idle_after: Duration, clock: LocalClock) -> Self {
        Self {
            widgets,
            first_frame: true,
            dimmer,
            idle_after,
            last_active: Instant::now(),
            clock,
            commands: Vec::new(),
        }
    }

    pub fn dimmer(&self) -> &Dimmer {
        &self.dimmer
    }

    pub async fn tick(
        &mut self,
        store: &TelemetryStore,
        backend: &mut dyn RenderBackend,
        now: Instant,
    ) -> Tick {
        let mut ctx = RenderContext {
            store,
            now: self.clock.now(),
            commands: &mut self.commands,
        };

        let mut changed = 0;
        for widget in &mut self.widgets {
            if let Some(visual) = widget.update(&mut ctx, backend).await {
                widget.replace_visual(visual, backend);
                changed += 1;
            }
        }

        let repainted = changed > 0 || self.first_frame;
        if repainted {
            debug!(changed, first = self.first_frame, "repaint");
            self.first_frame = false;
            self.paint(backend);
            self.last_active = now;
            self.dimmer.wake().await;
        } else if now.duration_since(self.last_active) > self.idle_after {
            if self.dimmer.dim().await {
                debug!(idle_secs = self.idle_after.as_secs(), "idle, dimming");
            }
        }

        Tick { changed, repainted }
    }

    /// Full repaint: clear, background, panel, then every visual in order.
    fn paint(&self, backend: &mut dyn RenderBackend) {
        let (width, height) = backend.output_size();
        let screen = Rect::new(0, 0, width, height);

        backend.clear(Color::BLACK);
        backend.fill_rect(screen, Color::BACKGROUND);
        backend.fill_rect(screen.inset(PANEL_INSET), Color::PANEL);

        for widget in &self.widgets {
            if let (Some(visual), Some(rect)) = (widget.visual(), widget.rect()) {
                backend.draw(visual, rect.x, rect.y);
            }
        }
        backend.present();
    }

    /// Hit-test a pointer press; the first widget containing the point gets
    /// it. Returns the widget's name when it handled the click.
    pub fn click(&mut self, x: i32, y: i32) -> Option<&'static str> {
        let widget = self
            .widgets
            .iter_mut()
            .find(|w| w.rect().is_some_and(|r| r.contains(x, y)))?;
        if widget.click() {
            info!(widget = widget.name(), x, y, "click");
            Some(widget.name())
        } else {
            None
        }
    }

    /// Returns `false` when the event asks the kiosk to quit.
    pub async fn handle_event(&mut self, event: InputEvent, now: Instant) -> bool {
        match event {
            InputEvent::Quit => return false,
            InputEvent::PointerDown { x, y } => {
                self.click(x, y);
            }
            InputEvent::PointerMove { .. } | InputEvent::Key => {}
        }
        self.last_active = now;
        self.dimmer.wake().await;
        true
    }

    /// Commands queued by widgets since the last call.
    pub fn drain_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    /// Hand every visual back to the backend and let the backlight settle.
    pub async fn teardown(&mut self, backend: &mut dyn RenderBackend) {
        for widget in &mut self.widgets {
            widget.release(backend);
        }
        self.dimmer.settle().await;
    }

    /// The render loop. Ends on Quit or when `shutdown` is cancelled.
    pub async fn run(
        mut self,
        store: SharedStore,
        backend: &mut dyn RenderBackend,
        publisher: Publisher,
        tick: Duration,
        shutdown: CancellationToken,
    ) {
        info!(
            widgets = self.widgets.len(),
            tick_ms = tick.as_millis() as u64,
            "render loop started"
        );

        'run: loop {
            for event in backend.poll_events() {
                if !self.handle_event(event, Instant::now()).await {
                    info!("quit requested");
                    break 'run;
                }
            }

            self.tick(&store, backend, Instant::now()).await;

            for command in self.drain_commands() {
                execute(&publisher, command);
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(tick) => {}
            }
        }

        self.teardown(backend).await;
        info!("render loop stopped");
    }
}

fn execute(publisher: &Publisher, command: Command) {
    match command {
        Command::Publish { topic, payload } => {
            if let Err(e) = publisher.publish(&topic, payload, false) {
                warn!(%topic, "command not sent: {e}");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
