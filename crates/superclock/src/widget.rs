//! Widgets: positioned views over one slice of the telemetry store.
//!
//! Text widgets are the single consumer of their record's `changed` flag.
//! Icons read the same records without consuming anything; they recompute
//! every tick and rely on last-content suppression instead. Either way a
//! widget only hands back a new [`Visual`] when what it would show differs
//! from what it shows now.

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::clock::format_hhmm;
use crate::config::PowerOffSettings;
use crate::dispatch::Site;
use crate::render::{Asset, Color, Content, Rect, RenderBackend, Visual};
use crate::store::{
    BatteryReading, ChargeState, DoorReading, PowerReading, Record, TelemetryStore,
    WeatherReading,
};

const CLOCK_SIZE: u32 = 55;
const TEXT_SIZE: u32 = 25;

// ---------------------------------------------------------------------------
// Alignment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    /// Leading edge at the anchor.
    Start,
    Center,
    /// Offset one full extent past the anchor.
    End,
}

pub fn align(pos: i32, size: u32, a: Align) -> i32 {
    let size = size as i32;
    match a {
        Align::Start => pos,
        Align::Center => pos - size / 2,
        Align::End => pos + size,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub x: i32,
    pub y: i32,
    pub h: Align,
    pub v: Align,
}

impl Anchor {
    pub fn new(x: i32, y: i32, h: Align, v: Align) -> Self {
        Self { x, y, h, v }
    }

    pub fn centered(x: i32, y: i32) -> Self {
        Self::new(x, y, Align::Center, Align::Center)
    }

    pub fn top_left(x: i32, y: i32) -> Self {
        Self::new(x, y, Align::Start, Align::Start)
    }

    pub fn place(&self, width: u32, height: u32) -> Rect {
        Rect::new(
            align(self.x, width, self.h),
            align(self.y, height, self.v),
            width,
            height,
        )
    }
}

// ---------------------------------------------------------------------------
// Render context & commands
// ---------------------------------------------------------------------------

/// Side effect requested by a widget, carried out by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Publish { topic: String, payload: String },
}

pub struct RenderContext<'a> {
    pub store: &'a TelemetryStore,
    pub now: OffsetDateTime,
    pub commands: &'a mut Vec<Command>,
}

// ---------------------------------------------------------------------------
// Colour bands & text
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Severity {
    Normal,
    Warning,
    Alarm,
}

impl Severity {
    fn color(self) -> Color {
        match self {
            Severity::Normal => Color::GREEN,
            Severity::Warning => Color::YELLOW,
            Severity::Alarm => Color::RED,
        }
    }
}

pub fn power_color(watts: f64) -> Color {
    if watts > 4000.0 {
        Color::RED
    } else if watts > 1000.0 {
        Color::YELLOW
    } else {
        Color::GREEN
    }
}

fn soc_severity(soc: f64) -> Severity {
    if soc < 20.0 {
        Severity::Alarm
    } else if soc < 50.0 {
        Severity::Warning
    } else {
        Severity::Normal
    }
}

fn temp_severity(temp: f64) -> Severity {
    if temp > 50.0 {
        Severity::Alarm
    } else if temp > 40.0 {
        Severity::Warning
    } else {
        Severity::Normal
    }
}

/// The worse of the charge band and the temperature band. Neither band
/// overrides the other: a hot battery is red at any charge, and a critically
/// low charge is red at any temperature.
pub fn battery_color(b: &BatteryReading) -> Color {
    soc_severity(b.soc).max(temp_severity(b.temp)).color()
}

/// Icon colour by charge band alone; grey while the charge is unknown.
pub fn battery_icon_color(soc: f64) -> Color {
    if soc.is_nan() {
        Color::GREY
    } else {
        soc_severity(soc).color()
    }
}

/// `v` with `decimals` places, `--` when unknown.
fn fixed(v: f64, decimals: usize) -> String {
    if v.is_nan() {
        "--".into()
    } else {
        format!("{v:.decimals$}")
    }
}

fn text(text: String, color: Color) -> Content {
    Content::Text {
        text,
        color,
        size: TEXT_SIZE,
    }
}

pub fn power_content(rec: &Record<PowerReading>) -> Content {
    let r = &rec.reading;
    let line = format!("{}W {}V", fixed(r.power, 0), fixed(r.voltage, 0));
    let color = if rec.online && !r.power.is_nan() {
        power_color(r.power)
    } else {
        Color::GREY
    };
    text(line, color)
}

pub fn battery_content(rec: &Record<BatteryReading>) -> Content {
    let r = &rec.reading;
    let line = format!(
        "{}% {}A {}V {}C",
        fixed(r.soc, 0),
        fixed(r.current, 2),
        fixed(r.voltage, 2),
        fixed(r.temp, 0)
    );
    let color = if rec.online && !r.soc.is_nan() {
        battery_color(r)
    } else {
        Color::GREY
    };
    text(line, color)
}

pub fn weather_content(site: Site, rec: &Record<WeatherReading>) -> Content {
    let r = &rec.reading;
    let label = match site {
        Site::Indoor => "In",
        Site::Outdoor => "Out",
    };
    let mut line = format!("{label} {}C", fixed(r.temperature, 1));
    if !r.humidity.is_nan() {
        line.push_str(&format!(" {}%", fixed(r.humidity, 0)));
    }
    let color = if rec.online && !r.temperature.is_nan() {
        Color::WHITE
    } else {
        Color::GREY
    };
    text(line, color)
}

pub fn door_content(rec: &Record<DoorReading>) -> Content {
    let (line, color) = match rec.reading.is_open() {
        Some(true) => ("Door open", Color::YELLOW),
        Some(false) => ("Door closed", Color::GREEN),
        None => ("Door ?", Color::GREY),
    };
    let color = if rec.online { color } else { Color::GREY };
    text(line.into(), color)
}

// ---------------------------------------------------------------------------
// Hold to confirm
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmState {
    Idle,
    Armed,
    Confirming { step: u32 },
    Committed,
}

/// Click to arm, then every tick advances progress by a fixed increment.
/// Reaching full progress commits, exactly once. A click before that
/// cancels back to idle.
#[derive(Debug, Clone)]
pub struct HoldToConfirm {
    state: ConfirmState,
    /// Ticks from armed to committed.
    total: u32,
    fired: bool,
}

impl HoldToConfirm {
    pub fn new(increment: f64) -> Self {
        // Small slack so 1/0.1 lands on 10, not 11.
        let total = ((1.0 / increment) - 1e-9).ceil().max(1.0) as u32;
        Self {
            state: ConfirmState::Idle,
            total,
            fired: false,
        }
    }

    pub fn state(&self) -> ConfirmState {
        self.state
    }

    pub fn total_ticks(&self) -> u32 {
        self.total
    }

    pub fn progress(&self) -> f64 {
        match self.state {
            ConfirmState::Idle | ConfirmState::Armed => 0.0,
            ConfirmState::Confirming { step } => f64::from(step) / f64::from(self.total),
            ConfirmState::Committed => 1.0,
        }
    }

    pub fn click(&mut self) {
        self.state = match self.state {
            ConfirmState::Idle => {
                info!("power-off armed");
                ConfirmState::Armed
            }
            ConfirmState::Armed | ConfirmState::Confirming { .. } => {
                info!("power-off cancelled");
                ConfirmState::Idle
            }
            ConfirmState::Committed => ConfirmState::Committed,
        };
    }

    /// Advance one tick. Returns `true` on the tick that commits.
    pub fn advance(&mut self) -> bool {
        let step = match self.state {
            ConfirmState::Armed => 1,
            ConfirmState::Confirming { step } => step + 1,
            ConfirmState::Idle | ConfirmState::Committed => return false,
        };
        if step < self.total {
            self.state = ConfirmState::Confirming { step };
            return false;
        }
        self.state = ConfirmState::Committed;
        let first = !self.fired;
        self.fired = true;
        first
    }

    /// What the control shows; `None` once committed.
    pub fn content(&self) -> Option<Content> {
        let color = match self.state {
            ConfirmState::Idle => Color::WHITE,
            ConfirmState::Armed => Color::YELLOW,
            ConfirmState::Confirming { .. } => Color::YELLOW.lerp(Color::RED, self.progress()),
            ConfirmState::Committed => return None,
        };
        Some(Content::Icon {
            asset: Asset::PowerButton,
            color,
        })
    }
}

// ---------------------------------------------------------------------------
// Widgets
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum WidgetKind {
    Clock { minute: Option<i64> },
    PowerText,
    BatteryText,
    WeatherText(Site),
    DoorText,
    PowerIcon,
    PowerFailIcon,
    BatteryIcon,
    PowerOff {
        control: HoldToConfirm,
        command: Command,
    },
}

impl WidgetKind {
    /// Content to show, or `None` when there is nothing to reconsider.
    async fn compute(&mut self, ctx: &mut RenderContext<'_>) -> Option<Content> {
        match self {
            Self::Clock { minute } => {
                let now_minute = ctx.now.unix_timestamp().div_euclid(60);
                if *minute == Some(now_minute) {
                    return None;
                }
                *minute = Some(now_minute);
                Some(Content::Text {
                    text: format_hhmm(ctx.now),
                    color: Color::WHITE,
                    size: CLOCK_SIZE,
                })
            }
            Self::PowerText => {
                let mut rec = ctx.store.power.lock().await;
                rec.take_changed().then(|| power_content(&rec))
            }
            Self::BatteryText => {
                let mut rec = ctx.store.battery.lock().await;
                rec.take_changed().then(|| battery_content(&rec))
            }
            Self::WeatherText(site) => {
                let record = match site {
                    Site::Indoor => &ctx.store.indoor,
                    Site::Outdoor => &ctx.store.outdoor,
                };
                let mut rec = record.lock().await;
                rec.take_changed().then(|| weather_content(*site, &rec))
            }
            Self::DoorText => {
                let mut rec = ctx.store.door.lock().await;
                rec.take_changed().then(|| door_content(&rec))
            }
            Self::PowerIcon => {
                let online = ctx.store.power.lock().await.online;
                Some(Content::Icon {
                    asset: Asset::PowerOn,
                    color: if online { Color::GREEN } else { Color::BACKGROUND },
                })
            }
            Self::PowerFailIcon => {
                let online = ctx.store.power.lock().await.online;
                Some(Content::Icon {
                    asset: Asset::PowerOff,
                    color: if online { Color::BACKGROUND } else { Color::RED },
                })
            }
            Self::BatteryIcon => {
                let rec = ctx.store.battery.lock().await;
                let asset = match rec.reading.charge_state() {
                    ChargeState::Charging => Asset::BatteryCharging,
                    ChargeState::Discharging | ChargeState::Idle => Asset::Battery,
                };
                Some(Content::Icon {
                    asset,
                    color: battery_icon_color(rec.reading.soc),
                })
            }
            Self::PowerOff { control, command } => {
                if control.advance() {
                    warn!(?command, "power-off confirmed");
                    ctx.commands.push(command.clone());
                }
                control.content()
            }
        }
    }
}

#[derive(Debug)]
pub struct Widget {
    name: &'static str,
    anchor: Anchor,
    kind: WidgetKind,
    shown: Option<Content>,
    /// Content the backend failed to realize, retried on the next update.
    pending: Option<Content>,
    visual: Option<Visual>,
}

impl Widget {
    pub fn new(name: &'static str, anchor: Anchor, kind: WidgetKind) -> Self {
        Self {
            name,
            anchor,
            kind,
            shown: None,
            pending: None,
            visual: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> &WidgetKind {
        &self.kind
    }

    pub fn visual(&self) -> Option<&Visual> {
        self.visual.as_ref()
    }

    /// Where the current visual is drawn, if there is one.
    pub fn rect(&self) -> Option<Rect> {
        self.visual
            .as_ref()
            .map(|v| self.anchor.place(v.width, v.height))
    }

    /// Recompute and realize. `None` when the shown content stays as is.
    pub async fn update(
        &mut self,
        ctx: &mut RenderContext<'_>,
        backend: &mut dyn RenderBackend,
    ) -> Option<Visual> {
        // A failed realize has already consumed the record's flag, so the
        // content is kept until the backend takes it.
        let content = match self.kind.compute(ctx).await {
            Some(content) => {
                self.pending = None;
                content
            }
            None => self.pending.take()?,
        };
        if self.shown.as_ref() == Some(&content) {
            return None;
        }
        let Some(visual) = backend.realize(&content) else {
            warn!(widget = self.name, "can't realize content, retrying next tick");
            self.pending = Some(content);
            return None;
        };
        debug!(widget = self.name, ?content, "new visual");
        self.shown = Some(content);
        Some(visual)
    }

    /// Install `visual`, handing the previous one back to the backend.
    pub fn replace_visual(&mut self, visual: Visual, backend: &mut dyn RenderBackend) {
        if let Some(old) = self.visual.replace(visual) {
            backend.release(old);
        }
    }

    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        if let Some(old) = self.visual.take() {
            backend.release(old);
        }
    }

    /// Returns `true` when the widget has a click handler.
    pub fn click(&mut self) -> bool {
        match &mut self.kind {
            WidgetKind::PowerOff { control, .. } => {
                control.click();
                true
            }
            _ => false,
        }
    }
}

/// The kiosk screen, in draw order.
pub fn layout(width: u32, height: u32, power_off: &PowerOffSettings) -> Vec<Widget> {
    let (w, h) = (width as i32, height as i32);
    let icon = 48;
    let gap = 20;
    let bottom = h - 40;

    vec![
        Widget::new(
            "clock",
            Anchor::centered(w / 2, h / 2),
            WidgetKind::Clock { minute: None },
        ),
        Widget::new(
            "battery",
            Anchor::centered(w / 2, h / 3),
            WidgetKind::BatteryText,
        ),
        Widget::new(
            "power",
            Anchor::centered(w / 2, h * 3 / 4),
            WidgetKind::PowerText,
        ),
        Widget::new(
            "indoor",
            Anchor::new(gap, bottom, Align::Start, Align::Center),
            WidgetKind::WeatherText(Site::Indoor),
        ),
        Widget::new(
            "outdoor",
            Anchor::new(w / 3 + gap, bottom, Align::Start, Align::Center),
            WidgetKind::WeatherText(Site::Outdoor),
        ),
        Widget::new(
            "door",
            Anchor::new(w * 2 / 3 + gap, bottom, Align::Start, Align::Center),
            WidgetKind::DoorText,
        ),
        Widget::new(
            "power-icon",
            Anchor::top_left(gap, gap),
            WidgetKind::PowerIcon,
        ),
        Widget::new(
            "power-fail-icon",
            Anchor::top_left(gap + icon + gap, gap),
            WidgetKind::PowerFailIcon,
        ),
        Widget::new(
            "battery-icon",
            Anchor::top_left(gap + 2 * (icon + gap), gap),
            WidgetKind::BatteryIcon,
        ),
        Widget::new(
            "power-off",
            Anchor::top_left(w - gap - icon, gap),
            WidgetKind::PowerOff {
                control: HoldToConfirm::new(power_off.increment),
                command: Command::Publish {
                    topic: power_off.topic.clone(),
                    payload: power_off.payload.clone(),
                },
            },
        ),
    ]
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{HeadlessBackend, InputEvent};
    use time::macros::datetime;

    const NOON: OffsetDateTime = datetime!(2024-05-01 12:00:00 UTC);

    fn quiet_store() -> TelemetryStore {
        let store = TelemetryStore::new();
        store.power.try_lock().unwrap().take_changed();
        store.battery.try_lock().unwrap().take_changed();
        store.indoor.try_lock().unwrap().take_changed();
        store.outdoor.try_lock().unwrap().take_changed();
        store.door.try_lock().unwrap().take_changed();
        store
    }

    async fn update_at(
        w: &mut Widget,
        store: &TelemetryStore,
        backend: &mut HeadlessBackend,
        now: OffsetDateTime,
        commands: &mut Vec<Command>,
    ) -> Option<Visual> {
        let mut ctx = RenderContext {
            store,
            now,
            commands,
        };
        w.update(&mut ctx, backend).await
    }

    async fn update(
        w: &mut Widget,
        store: &TelemetryStore,
        backend: &mut HeadlessBackend,
    ) -> Option<Visual> {
        update_at(w, store, backend, NOON, &mut Vec::new()).await
    }

    fn text_of(w: &Widget) -> Option<(&str, Color)> {
        match &w.shown {
            Some(Content::Text { text, color, .. }) => Some((text.as_str(), *color)),
            _ => None,
        }
    }

    fn icon_of(w: &Widget) -> Option<(Asset, Color)> {
        match &w.shown {
            Some(Content::Icon { asset, color }) => Some((*asset, *color)),
            _ => None,
        }
    }

    fn power_off(increment: f64) -> Widget {
        Widget::new(
            "power-off",
            Anchor::top_left(0, 0),
            WidgetKind::PowerOff {
                control: HoldToConfirm::new(increment),
                command: Command::Publish {
                    topic: "cmnd/main-power/POWER".into(),
                    payload: "OFF".into(),
                },
            },
        )
    }

    // -- Alignment --------------------------------------------------------------

    #[test]
    fn align_start_center_end() {
        assert_eq!(align(100, 40, Align::Start), 100);
        assert_eq!(align(100, 40, Align::Center), 80);
        assert_eq!(align(100, 40, Align::End), 140);
    }

    #[test]
    fn anchor_places_rect() {
        let a = Anchor::centered(320, 240);
        assert_eq!(a.place(100, 50), Rect::new(270, 215, 100, 50));
    }

    // -- Colour bands -----------------------------------------------------------

    #[test]
    fn power_bands() {
        assert_eq!(power_color(540.0), Color::GREEN);
        assert_eq!(power_color(1500.0), Color::YELLOW);
        assert_eq!(power_color(4500.0), Color::RED);
    }

    #[test]
    fn battery_bands_take_the_worse() {
        let mut b = BatteryReading {
            soc: 80.0,
            temp: 30.0,
            ..BatteryReading::default()
        };
        assert_eq!(battery_color(&b), Color::GREEN);
        b.soc = 45.0;
        assert_eq!(battery_color(&b), Color::YELLOW);
        b.soc = 10.0;
        assert_eq!(battery_color(&b), Color::RED);
        b.soc = 80.0;
        b.temp = 45.0;
        assert_eq!(battery_color(&b), Color::YELLOW);
        b.temp = 55.0;
        assert_eq!(battery_color(&b), Color::RED);
        // Hot battery wins over a merely low charge.
        b.soc = 45.0;
        assert_eq!(battery_color(&b), Color::RED);
    }

    #[test]
    fn battery_icon_grey_when_unknown() {
        assert_eq!(battery_icon_color(f64::NAN), Color::GREY);
        assert_eq!(battery_icon_color(15.0), Color::RED);
    }

    // -- Text widgets -----------------------------------------------------------

    #[tokio::test]
    async fn battery_scenario_shows_percentage_in_yellow() {
        let store = quiet_store();
        let mut backend = HeadlessBackend::new(640, 480);
        let mut w = Widget::new("battery", Anchor::centered(0, 0), WidgetKind::BatteryText);
        {
            let mut rec = store.battery.lock().await;
            rec.set_online(true);
            rec.apply(&BatteryReading {
                soc: 45.0,
                current: -1.0,
                voltage: 26.0,
                temp: 30.0,
                capacity: 150.0,
            });
        }

        assert!(update(&mut w, &store, &mut backend).await.is_some());
        let (text, color) = text_of(&w).unwrap();
        assert!(text.starts_with("45%"), "{text}");
        assert_eq!(text, "45% -1.00A 26.00V 30C");
        assert_eq!(color, Color::YELLOW);
        assert!(!store.battery.lock().await.is_changed());
    }

    /// Headless backend that refuses to realize while `refuse` is set.
    struct Refusing {
        inner: HeadlessBackend,
        refuse: bool,
    }

    impl RenderBackend for Refusing {
        fn output_size(&self) -> (u32, u32) {
            self.inner.output_size()
        }
        fn realize(&mut self, content: &Content) -> Option<Visual> {
            if self.refuse {
                None
            } else {
                self.inner.realize(content)
            }
        }
        fn release(&mut self, visual: Visual) {
            self.inner.release(visual)
        }
        fn clear(&mut self, color: Color) {
            self.inner.clear(color)
        }
        fn fill_rect(&mut self, rect: Rect, color: Color) {
            self.inner.fill_rect(rect, color)
        }
        fn draw(&mut self, visual: &Visual, x: i32, y: i32) {
            self.inner.draw(visual, x, y)
        }
        fn present(&mut self) {
            self.inner.present()
        }
        fn poll_events(&mut self) -> Vec<InputEvent> {
            self.inner.poll_events()
        }
    }

    #[tokio::test]
    async fn failed_realize_is_retried_next_update() {
        let store = quiet_store();
        let mut backend = Refusing {
            inner: HeadlessBackend::new(640, 480),
            refuse: true,
        };
        let mut w = Widget::new("power", Anchor::centered(0, 0), WidgetKind::PowerText);
        {
            let mut rec = store.power.lock().await;
            rec.set_online(true);
            rec.apply(&PowerReading {
                power: 540.0,
                voltage: 235.0,
            });
        }

        let mut commands = Vec::new();
        let mut ctx = RenderContext {
            store: &store,
            now: NOON,
            commands: &mut commands,
        };
        assert!(w.update(&mut ctx, &mut backend).await.is_none());
        assert!(!store.power.lock().await.is_changed());
        assert_eq!(text_of(&w), None);

        backend.refuse = false;
        assert!(w.update(&mut ctx, &mut backend).await.is_some());
        assert_eq!(text_of(&w), Some(("540W 235V", Color::GREEN)));
        assert!(w.update(&mut ctx, &mut backend).await.is_none());
    }

    #[tokio::test]
    async fn text_widget_without_change_does_nothing() {
        let store = quiet_store();
        let mut backend = HeadlessBackend::new(640, 480);
        let mut w = Widget::new("power", Anchor::centered(0, 0), WidgetKind::PowerText);
        assert!(update(&mut w, &store, &mut backend).await.is_none());
        assert_eq!(backend.live_visuals(), 0);
    }

    #[tokio::test]
    async fn consumed_flag_with_same_content_yields_no_visual() {
        let store = quiet_store();
        let mut backend = HeadlessBackend::new(640, 480);
        let mut w = Widget::new("power", Anchor::centered(0, 0), WidgetKind::PowerText);

        {
            let mut rec = store.power.lock().await;
            rec.set_online(true);
            rec.apply(&PowerReading {
                power: 540.0,
                voltage: 235.0,
            });
        }
        assert!(update(&mut w, &store, &mut backend).await.is_some());
        assert_eq!(text_of(&w), Some(("540W 235V", Color::GREEN)));

        // Repeated "Online" sets the flag but the text stays the same.
        store.set_online(crate::store::Entity::Power, true).await;
        assert!(update(&mut w, &store, &mut backend).await.is_none());
        assert!(!store.power.lock().await.is_changed());
    }

    #[tokio::test]
    async fn offline_power_is_grey() {
        let store = quiet_store();
        let mut backend = HeadlessBackend::new(640, 480);
        let mut w = Widget::new("power", Anchor::centered(0, 0), WidgetKind::PowerText);
        store.power.lock().await.apply(&PowerReading {
            power: 540.0,
            voltage: 235.0,
        });
        update(&mut w, &store, &mut backend).await;
        assert_eq!(text_of(&w), Some(("540W 235V", Color::GREY)));
    }

    #[tokio::test]
    async fn weather_and_door_text() {
        let store = quiet_store();
        let mut backend = HeadlessBackend::new(640, 480);
        let mut out = Widget::new(
            "outdoor",
            Anchor::centered(0, 0),
            WidgetKind::WeatherText(Site::Outdoor),
        );
        let mut door = Widget::new("door", Anchor::centered(0, 0), WidgetKind::DoorText);
        {
            let mut rec = store.outdoor.lock().await;
            rec.set_online(true);
            rec.apply(&WeatherReading {
                temperature: -3.2,
                humidity: f64::NAN,
            });
        }
        {
            let mut rec = store.door.lock().await;
            rec.set_online(true);
            rec.apply(&DoorReading {
                contact: Some(false),
            });
        }

        update(&mut out, &store, &mut backend).await;
        update(&mut door, &store, &mut backend).await;
        assert_eq!(text_of(&out), Some(("Out -3.2C", Color::WHITE)));
        assert_eq!(text_of(&door), Some(("Door open", Color::YELLOW)));
    }

    // -- Clock ------------------------------------------------------------------

    #[tokio::test]
    async fn clock_regenerates_once_per_minute() {
        let store = quiet_store();
        let mut backend = HeadlessBackend::new(640, 480);
        let mut w = Widget::new(
            "clock",
            Anchor::centered(0, 0),
            WidgetKind::Clock { minute: None },
        );
        let mut cmds = Vec::new();

        assert!(update_at(&mut w, &store, &mut backend, NOON, &mut cmds)
            .await
            .is_some());
        assert_eq!(text_of(&w), Some(("12:00", Color::WHITE)));

        let later = datetime!(2024-05-01 12:00:59 UTC);
        assert!(update_at(&mut w, &store, &mut backend, later, &mut cmds)
            .await
            .is_none());

        let next = datetime!(2024-05-01 12:01:00 UTC);
        assert!(update_at(&mut w, &store, &mut backend, next, &mut cmds)
            .await
            .is_some());
        assert_eq!(text_of(&w), Some(("12:01", Color::WHITE)));
    }

    // -- Icons ------------------------------------------------------------------

    #[tokio::test]
    async fn icons_do_not_consume_changed() {
        let store = quiet_store();
        let mut backend = HeadlessBackend::new(640, 480);
        let mut icon = Widget::new("power-icon", Anchor::top_left(0, 0), WidgetKind::PowerIcon);
        let mut fail = Widget::new(
            "power-fail-icon",
            Anchor::top_left(0, 0),
            WidgetKind::PowerFailIcon,
        );

        store.set_online(crate::store::Entity::Power, true).await;
        assert!(update(&mut icon, &store, &mut backend).await.is_some());
        assert!(update(&mut fail, &store, &mut backend).await.is_some());
        assert!(store.power.lock().await.is_changed());

        assert_eq!(icon_of(&icon), Some((Asset::PowerOn, Color::GREEN)));
        assert_eq!(icon_of(&fail), Some((Asset::PowerOff, Color::BACKGROUND)));

        // Nothing moved: no new visuals.
        assert!(update(&mut icon, &store, &mut backend).await.is_none());

        store.set_online(crate::store::Entity::Power, false).await;
        assert!(update(&mut fail, &store, &mut backend).await.is_some());
        assert_eq!(icon_of(&fail), Some((Asset::PowerOff, Color::RED)));
    }

    #[tokio::test]
    async fn battery_icon_switches_artwork_when_charging() {
        let store = quiet_store();
        let mut backend = HeadlessBackend::new(640, 480);
        let mut w = Widget::new("battery-icon", Anchor::top_left(0, 0), WidgetKind::BatteryIcon);

        update(&mut w, &store, &mut backend).await;
        assert_eq!(icon_of(&w), Some((Asset::Battery, Color::GREY)));

        store.battery.lock().await.apply(&BatteryReading {
            soc: 75.0,
            current: 2.0,
            ..BatteryReading::default()
        });
        assert!(update(&mut w, &store, &mut backend).await.is_some());
        assert_eq!(icon_of(&w), Some((Asset::BatteryCharging, Color::GREEN)));
    }

    // -- HoldToConfirm ----------------------------------------------------------

    #[test]
    fn total_ticks_is_ceiling_of_reciprocal() {
        assert_eq!(HoldToConfirm::new(0.1).total_ticks(), 10);
        assert_eq!(HoldToConfirm::new(0.3).total_ticks(), 4);
        assert_eq!(HoldToConfirm::new(1.0).total_ticks(), 1);
    }

    #[test]
    fn click_arms_and_second_click_cancels() {
        let mut c = HoldToConfirm::new(0.1);
        c.click();
        assert_eq!(c.state(), ConfirmState::Armed);
        c.advance();
        c.advance();
        assert!(c.progress() > 0.0);
        c.click();
        assert_eq!(c.state(), ConfirmState::Idle);
        assert_eq!(c.progress(), 0.0);
    }

    #[test]
    fn idle_control_does_not_advance() {
        let mut c = HoldToConfirm::new(0.5);
        assert!(!c.advance());
        assert_eq!(c.state(), ConfirmState::Idle);
    }

    #[tokio::test]
    async fn commit_fires_exactly_once_after_n_ticks() {
        let store = quiet_store();
        let mut backend = HeadlessBackend::new(640, 480);
        let mut w = power_off(0.1);
        let mut cmds = Vec::new();

        update_at(&mut w, &store, &mut backend, NOON, &mut cmds).await;
        assert!(w.click());

        for _ in 0..9 {
            update_at(&mut w, &store, &mut backend, NOON, &mut cmds).await;
        }
        assert!(cmds.is_empty());

        // Tenth tick commits; later ticks do nothing.
        assert!(update_at(&mut w, &store, &mut backend, NOON, &mut cmds)
            .await
            .is_none());
        for _ in 0..5 {
            assert!(update_at(&mut w, &store, &mut backend, NOON, &mut cmds)
                .await
                .is_none());
        }
        assert_eq!(
            cmds,
            vec![Command::Publish {
                topic: "cmnd/main-power/POWER".into(),
                payload: "OFF".into(),
            }]
        );

        // Committed ignores clicks.
        w.click();
        update_at(&mut w, &store, &mut backend, NOON, &mut cmds).await;
        assert_eq!(cmds.len(), 1);
    }

    #[tokio::test]
    async fn confirming_colour_moves_towards_red() {
        let store = quiet_store();
        let mut backend = HeadlessBackend::new(640, 480);
        let mut w = power_off(0.25);

        update(&mut w, &store, &mut backend).await;
        assert_eq!(icon_of(&w), Some((Asset::PowerButton, Color::WHITE)));
        w.click();
        update(&mut w, &store, &mut backend).await;
        let (_, first) = icon_of(&w).unwrap();
        update(&mut w, &store, &mut backend).await;
        let (_, second) = icon_of(&w).unwrap();
        assert!(second.g < first.g);
        assert_eq!(first.r, 255);
    }

    // -- Layout -----------------------------------------------------------------

    #[test]
    fn layout_has_one_consumer_per_record() {
        let widgets = layout(640, 480, &PowerOffSettings::default());
        let consumers = widgets
            .iter()
            .filter(|w| {
                matches!(
                    w.kind(),
                    WidgetKind::PowerText
                        | WidgetKind::BatteryText
                        | WidgetKind::WeatherText(_)
                        | WidgetKind::DoorText
                )
            })
            .count();
        assert_eq!(consumers, 5);
        assert_eq!(widgets[0].name(), "clock");
    }

    #[test]
    fn widget_without_visual_has_no_rect() {
        let w = Widget::new("clock", Anchor::centered(0, 0), WidgetKind::Clock { minute: None });
        assert!(w.rect().is_none());
        assert!(w.visual().is_none());
    }
}
