//! Rasterizes the replica onto an RGBA surface.
//!
//! The output is a pure function of the replica contents and the surface size:
//! clear to white, then one filled disc per live pixel in apply order.

use image::{Rgba, RgbaImage};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

use crate::model::{Color, CoordinateKey, Pixel};
use crate::replica::ReplicaStore;
use crate::telemetry::{self, PerfGuard};

pub const DISC_RADIUS: i64 = 5;
/// Disc centres sit this far right and down from the pixel coordinate.
pub const DISC_OFFSET: i64 = 5;
pub const BACKGROUND: Color = Color::WHITE;

/// Above this many dirty cells a full redraw is cheaper than patching.
const DAMAGE_LIMIT: usize = 64;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to write frame to {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: image::ImageError,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceSize {
    pub width: u32,
    pub height: u32,
}

impl SurfaceSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for SurfaceSize {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

/// Inclusive pixel rectangle on the surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Rect {
    x0: i64,
    y0: i64,
    x1: i64,
    y1: i64,
}

impl Rect {
    /// `None` when the disc bounds leave the `i64` range; such a disc can never
    /// reach the surface.
    fn around(key: CoordinateKey) -> Option<Self> {
        let cx = key.x.checked_add(DISC_OFFSET)?;
        let cy = key.y.checked_add(DISC_OFFSET)?;
        Some(Self {
            x0: cx.checked_sub(DISC_RADIUS)?,
            y0: cy.checked_sub(DISC_RADIUS)?,
            x1: cx.checked_add(DISC_RADIUS)?,
            y1: cy.checked_add(DISC_RADIUS)?,
        })
    }

    fn intersects(&self, other: &Rect) -> bool {
        self.x0 <= other.x1 && other.x0 <= self.x1 && self.y0 <= other.y1 && other.y0 <= self.y1
    }

    fn clip(&self, size: SurfaceSize) -> Option<Rect> {
        let clipped = Rect {
            x0: self.x0.max(0),
            y0: self.y0.max(0),
            x1: self.x1.min(size.width as i64 - 1),
            y1: self.y1.min(size.height as i64 - 1),
        };
        (clipped.x0 <= clipped.x1 && clipped.y0 <= clipped.y1).then_some(clipped)
    }
}

fn rgba(color: Color) -> Rgba<u8> {
    Rgba(color.to_rgba())
}

/// Whether surface pixel `(px, py)` lies inside the disc drawn for `pixel`.
/// Tested at the pixel centre, in half-pixel units to stay integral. Only called
/// for discs already clipped to the surface, so the arithmetic stays small.
fn covers(pixel: &Pixel, px: i64, py: i64) -> bool {
    let dx = 2 * px + 1 - 2 * (pixel.x + DISC_OFFSET);
    let dy = 2 * py + 1 - 2 * (pixel.y + DISC_OFFSET);
    dx * dx + dy * dy <= 4 * DISC_RADIUS * DISC_RADIUS
}

fn fill_disc(frame: &mut RgbaImage, pixel: &Pixel, within: Rect) {
    let size = SurfaceSize::new(frame.width(), frame.height());
    let Some(bounds) = Rect::around(pixel.key()).and_then(|disc| disc.clip(size)) else {
        return;
    };
    let color = rgba(pixel.color);
    for py in bounds.y0.max(within.y0)..=bounds.y1.min(within.y1) {
        for px in bounds.x0.max(within.x0)..=bounds.x1.min(within.x1) {
            if covers(pixel, px, py) {
                frame.put_pixel(px as u32, py as u32, color);
            }
        }
    }
}

fn clear(frame: &mut RgbaImage, area: Rect) {
    let background = rgba(BACKGROUND);
    for py in area.y0..=area.y1 {
        for px in area.x0..=area.x1 {
            frame.put_pixel(px as u32, py as u32, background);
        }
    }
}

/// Full redraw of `pixels` (in apply order) onto a fresh surface.
pub fn render_full<'a>(pixels: impl IntoIterator<Item = &'a Pixel>, size: SurfaceSize) -> RgbaImage {
    let mut frame = RgbaImage::from_pixel(size.width, size.height, rgba(BACKGROUND));
    let Some(everything) = Rect {
        x0: 0,
        y0: 0,
        x1: size.width as i64 - 1,
        y1: size.height as i64 - 1,
    }
    .clip(size) else {
        return frame;
    };
    for pixel in pixels {
        fill_disc(&mut frame, pixel, everything);
    }
    frame
}

/// Repaints only the areas covered by `dirty` keys. The result is identical to
/// a full redraw of the same replica.
pub fn render_damage(frame: &mut RgbaImage, replica: &ReplicaStore, dirty: &[CoordinateKey]) {
    let size = SurfaceSize::new(frame.width(), frame.height());
    let areas: Vec<Rect> = dirty
        .iter()
        .filter_map(|key| Rect::around(*key)?.clip(size))
        .collect();
    for area in &areas {
        clear(frame, *area);
    }
    for pixel in replica.read() {
        let Some(disc) = Rect::around(pixel.key()) else {
            continue;
        };
        for area in areas.iter().filter(|area| area.intersects(&disc)) {
            fill_disc(frame, pixel, *area);
        }
    }
}

/// Writes `frame` as a PNG; the format follows the file extension.
pub fn write_png(frame: &RgbaImage, path: &Path) -> Result<(), RenderError> {
    frame.save(path).map_err(|source| RenderError::Write {
        path: path.display().to_string(),
        source,
    })
}

/// Redraws whenever the replica version moved since the last frame.
#[derive(Debug)]
pub struct RenderLoop {
    size: SurfaceSize,
    frame: Arc<RgbaImage>,
    rendered_version: Option<u64>,
    frames: u64,
}

impl RenderLoop {
    pub fn new(size: SurfaceSize) -> Self {
        Self {
            size,
            frame: Arc::new(render_full(std::iter::empty(), size)),
            rendered_version: None,
            frames: 0,
        }
    }

    pub fn frame(&self) -> Arc<RgbaImage> {
        self.frame.clone()
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames
    }

    /// Returns `true` when a new frame was produced.
    pub fn render(&mut self, replica: &mut ReplicaStore) -> bool {
        let version = replica.version();
        if self.rendered_version == Some(version) {
            return false;
        }
        let _guard = PerfGuard::new("render_frame");
        let dirty = replica.take_dirty();
        let damage = self.rendered_version.is_some() && dirty.len() <= DAMAGE_LIMIT;
        if damage {
            let frame = Arc::make_mut(&mut self.frame);
            render_damage(frame, replica, &dirty);
        } else {
            self.frame = Arc::new(render_full(replica.read(), self.size));
        }
        self.rendered_version = Some(version);
        self.frames += 1;
        telemetry::record_gauge("render_dirty_cells", dirty.len() as u64);
        trace!(target = "pixel_canvas::render", version, damage, dirty = dirty.len(), "frame rendered");
        true
    }
}
