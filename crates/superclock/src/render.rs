//! Render backend seam. Widgets describe *what* to show as [`Content`]; a
//! backend turns that into a realized [`Visual`] and composites frames.
//!
//! Only a headless backend ships in this crate. It measures text with a
//! fixed advance per glyph and records every drawing operation, which is
//! enough to drive the kiosk off-screen and to assert on frames in tests.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::config::DisplaySettings;

/// Largest surface edge the renderer accepts.
const MAX_SURFACE_EDGE: u32 = 8192;

/// Icon artwork is 24dp, rendered at 2x.
const ICON_SIZE: u32 = 48;

// ---------------------------------------------------------------------------
// Colours & assets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub const GREEN: Color = Color::rgb(0, 255, 0);
    pub const YELLOW: Color = Color::rgb(255, 255, 0);
    pub const RED: Color = Color::rgb(255, 0, 0);
    pub const WHITE: Color = Color::rgb(255, 255, 255);
    pub const GREY: Color = Color::rgb(112, 112, 112);
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const BACKGROUND: Color = Color::rgb(24, 90, 147);
    pub const PANEL: Color = Color::rgb(28, 81, 128);

    /// Linear blend, `t` clamped to [0, 1].
    pub fn lerp(self, to: Color, t: f64) -> Color {
        let t = t.clamp(0.0, 1.0);
        let mix = |a: u8, b: u8| (f64::from(a) + (f64::from(b) - f64::from(a)) * t).round() as u8;
        Color::rgb(mix(self.r, to.r), mix(self.g, to.g), mix(self.b, to.b))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Asset {
    PowerOn,
    PowerOff,
    Battery,
    BatteryCharging,
    PowerButton,
}

impl Asset {
    pub const ALL: [Asset; 5] = [
        Asset::PowerOn,
        Asset::PowerOff,
        Asset::Battery,
        Asset::BatteryCharging,
        Asset::PowerButton,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Asset::PowerOn => "outline_power_black_24dp.png",
            Asset::PowerOff => "outline_power_off_black_24dp.png",
            Asset::Battery => "outline_battery_full_black_24dp.png",
            Asset::BatteryCharging => "outline_battery_charging_full_black_24dp.png",
            Asset::PowerButton => "outline_power_settings_new_black_24dp.png",
        }
    }
}

// ---------------------------------------------------------------------------
// Content & visuals
// ---------------------------------------------------------------------------

/// Backend-independent description of what a widget shows.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Text {
        text: String,
        color: Color,
        size: u32,
    },
    Icon {
        asset: Asset,
        color: Color,
    },
}

/// A realized, backend-owned drawable. Must be handed back through
/// [`RenderBackend::release`] when replaced.
#[derive(Debug, PartialEq, Eq)]
pub struct Visual {
    pub id: u64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn contains(&self, px: i32, py: i32) -> bool {
        px >= self.x
            && py >= self.y
            && i64::from(px) < i64::from(self.x) + i64::from(self.width)
            && i64::from(py) < i64::from(self.y) + i64::from(self.height)
    }

    /// Shrink by `by` pixels on every side.
    pub fn inset(&self, by: u32) -> Rect {
        Rect {
            x: self.x + by as i32,
            y: self.y + by as i32,
            width: self.width.saturating_sub(2 * by),
            height: self.height.saturating_sub(2 * by),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Quit,
    PointerDown { x: i32, y: i32 },
    PointerMove { x: i32, y: i32 },
    Key,
}

// ---------------------------------------------------------------------------
// Setup errors
// ---------------------------------------------------------------------------

/// Fatal setup failures; each maps to a distinct process exit code.
#[derive(Debug)]
pub enum SetupError {
    Backend(String),
    Assets(PathBuf),
    Window { width: u32, height: u32 },
    Renderer(String),
    Config(anyhow::Error),
}

impl SetupError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Backend(_) => 1,
            Self::Assets(_) => 2,
            Self::Window { .. } => 3,
            Self::Renderer(_) => 4,
            Self::Config(_) => 5,
        }
    }
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(name) => write!(f, "unknown render backend '{name}'"),
            Self::Assets(path) => write!(f, "missing asset {}", path.display()),
            Self::Window { width, height } => {
                write!(f, "can't create {width}x{height} window")
            }
            Self::Renderer(e) => write!(f, "renderer: {e}"),
            Self::Config(e) => write!(f, "config: {e:#}"),
        }
    }
}

impl std::error::Error for SetupError {}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

pub trait RenderBackend {
    fn output_size(&self) -> (u32, u32);
    /// Realize `content`. `None` means the backend could not produce it;
    /// the widget keeps showing its previous visual.
    fn realize(&mut self, content: &Content) -> Option<Visual>;
    fn release(&mut self, visual: Visual);
    fn clear(&mut self, color: Color);
    fn fill_rect(&mut self, rect: Rect, color: Color);
    fn draw(&mut self, visual: &Visual, x: i32, y: i32);
    fn present(&mut self);
    /// Drain pending input.
    fn poll_events(&mut self) -> Vec<InputEvent>;
}

// ---------------------------------------------------------------------------
// Headless backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Clear(Color),
    Fill(Rect, Color),
    Draw { id: u64, x: i32, y: i32 },
    Present,
}

#[derive(Debug, Default)]
pub struct HeadlessBackend {
    width: u32,
    height: u32,
    next_id: u64,
    live: HashSet<u64>,
    /// Operations of the frame in progress (or the last presented one).
    ops: Vec<Op>,
    frames: u64,
    pending: Vec<InputEvent>,
}

impl HeadlessBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    /// Build the backend named in the display settings, checking assets
    /// first so a broken install fails before a window would be opened.
    pub fn open(settings: &DisplaySettings) -> Result<Self, SetupError> {
        if settings.backend != "headless" {
            return Err(SetupError::Backend(settings.backend.clone()));
        }

        if let Some(dir) = &settings.assets_dir {
            for asset in Asset::ALL {
                let path = PathBuf::from(dir).join(asset.file_name());
                if !path.is_file() {
                    return Err(SetupError::Assets(path));
                }
            }
        }

        let (width, height) = (settings.width, settings.height);
        if width == 0 || height == 0 {
            return Err(SetupError::Window { width, height });
        }
        if width > MAX_SURFACE_EDGE || height > MAX_SURFACE_EDGE {
            return Err(SetupError::Renderer(format!(
                "{width}x{height} exceeds {MAX_SURFACE_EDGE}px surface limit"
            )));
        }

        info!(width, height, "headless display ready");
        Ok(Self::new(width, height))
    }

    #[cfg(test)]
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn live_visuals(&self) -> usize {
        self.live.len()
    }

    #[cfg(test)]
    pub fn push_event(&mut self, event: InputEvent) {
        self.pending.push(event);
    }

    fn measure(content: &Content) -> (u32, u32) {
        match content {
            Content::Text { text, size, .. } => {
                let glyphs = text.chars().count() as u32;
                (glyphs * size * 3 / 5, *size)
            }
            Content::Icon { .. } => (ICON_SIZE, ICON_SIZE),
        }
    }
}

impl RenderBackend for HeadlessBackend {
    fn output_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn realize(&mut self, content: &Content) -> Option<Visual> {
        let (width, height) = Self::measure(content);
        self.next_id += 1;
        self.live.insert(self.next_id);
        Some(Visual {
            id: self.next_id,
            width,
            height,
        })
    }

    fn release(&mut self, visual: Visual) {
        if !self.live.remove(&visual.id) {
            debug!(id = visual.id, "release of unknown visual");
        }
    }

    fn clear(&mut self, color: Color) {
        self.ops.clear();
        self.ops.push(Op::Clear(color));
    }

    fn fill_rect(&mut self, rect: Rect, color: Color) {
        self.ops.push(Op::Fill(rect, color));
    }

    fn draw(&mut self, visual: &Visual, x: i32, y: i32) {
        self.ops.push(Op::Draw {
            id: visual.id,
            x,
            y,
        });
    }

    fn present(&mut self) {
        self.ops.push(Op::Present);
        self.frames += 1;
    }

    fn poll_events(&mut self) -> Vec<InputEvent> {
        std::mem::take(&mut self.pending)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
