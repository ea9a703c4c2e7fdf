//! Pan/zoom state and the data -> screen projection.

use crate::dataset::ScatterPoint;
use rayon::prelude::*;

/// Wheel delta to log-scale factor.
pub const ZOOM_SENSITIVITY: f64 = 0.0015;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewTransform {
    pub scale: f64,
    pub offset_x: f64,
    pub offset_y: f64,
}

impl ViewTransform {
    pub const IDENTITY: ViewTransform = ViewTransform {
        scale: 1.0,
        offset_x: 0.0,
        offset_y: 0.0,
    };
}

impl Default for ViewTransform {
    fn default() -> Self {
        ViewTransform::IDENTITY
    }
}

/// Data-space bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    /// Bounding box of the finite coordinates in `points`.
    pub fn from_points(points: &[ScatterPoint]) -> Option<Bounds> {
        points
            .iter()
            .filter(|p| p.x.is_finite() && p.y.is_finite())
            .fold(None, |acc: Option<Bounds>, p| {
                Some(match acc {
                    None => Bounds {
                        min_x: p.x,
                        min_y: p.y,
                        max_x: p.x,
                        max_y: p.y,
                    },
                    Some(b) => Bounds {
                        min_x: b.min_x.min(p.x),
                        min_y: b.min_y.min(p.y),
                        max_x: b.max_x.max(p.x),
                        max_y: b.max_y.max(p.y),
                    },
                })
            })
    }

    fn span(min: f64, max: f64) -> f64 {
        let span = max - min;
        if span > 0.0 && span.is_finite() {
            span
        } else {
            1.0
        }
    }
}

impl std::str::FromStr for Bounds {
    type Err = String;

    /// `min_x,min_y,max_x,max_y`
    fn from_str(s: &str) -> Result<Self, String> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>().map_err(|e| format!("bad bound '{}': {}", p, e)))
            .collect::<Result<_, _>>()?;
        match parts.as_slice() {
            &[min_x, min_y, max_x, max_y] if min_x <= max_x && min_y <= max_y => Ok(Bounds {
                min_x,
                min_y,
                max_x,
                max_y,
            }),
            _ => Err(format!("expected min_x,min_y,max_x,max_y, got '{}'", s)),
        }
    }
}

/// A point after projection, in surface pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenPoint {
    pub id: usize,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PendingZoom {
    x: f64,
    y: f64,
    delta_y: f64,
}

#[derive(Debug, Clone)]
pub struct Viewport {
    width: u32,
    height: u32,
    padding: f64,
    transform: ViewTransform,
    pending_zoom: Option<PendingZoom>,
}

impl Viewport {
    pub fn new(width: u32, height: u32, padding: f64) -> Self {
        Viewport {
            width,
            height,
            padding,
            transform: ViewTransform::IDENTITY,
            pending_zoom: None,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn transform(&self) -> ViewTransform {
        self.transform
    }

    fn center(&self) -> (f64, f64) {
        (self.width as f64 / 2.0, self.height as f64 / 2.0)
    }

    pub fn pan(&mut self, dx: f64, dy: f64) {
        self.transform.offset_x += dx;
        self.transform.offset_y += dy;
    }

    /// Zoom about the cursor: the data point under (`x`, `y`) stays put.
    pub fn zoom(&mut self, x: f64, y: f64, delta_y: f64) {
        let old = self.transform.scale;
        let new = old * (-delta_y * ZOOM_SENSITIVITY).exp();
        let ratio = new / old;
        let (cx, cy) = self.center();
        self.transform = ViewTransform {
            scale: new,
            offset_x: x - cx - (x - cx - self.transform.offset_x) * ratio,
            offset_y: y - cy - (y - cy - self.transform.offset_y) * ratio,
        };
    }

    /// Record a wheel event for the next frame. Deltas within one frame add
    /// up; the latest cursor position is used.
    pub fn queue_zoom(&mut self, x: f64, y: f64, delta_y: f64) {
        let delta_y = delta_y + self.pending_zoom.map_or(0.0, |p| p.delta_y);
        self.pending_zoom = Some(PendingZoom { x, y, delta_y });
    }

    pub fn has_pending_zoom(&self) -> bool {
        self.pending_zoom.is_some()
    }

    /// Apply the accumulated zoom, if any. Returns whether anything changed.
    pub fn apply_pending_zoom(&mut self) -> bool {
        match self.pending_zoom.take() {
            Some(PendingZoom { x, y, delta_y }) => {
                self.zoom(x, y, delta_y);
                true
            }
            None => false,
        }
    }

    pub fn reset(&mut self) {
        self.transform = ViewTransform::IDENTITY;
        self.pending_zoom = None;
    }

    /// Map a data-space coordinate to surface pixels. Screen y grows
    /// downward, so data y is flipped.
    pub fn project(&self, bounds: &Bounds, x: f64, y: f64) -> (f64, f64) {
        let plot_w = (self.width as f64 - 2.0 * self.padding).max(1.0);
        let plot_h = (self.height as f64 - 2.0 * self.padding).max(1.0);
        let norm_x = (x - bounds.min_x) / Bounds::span(bounds.min_x, bounds.max_x);
        let norm_y = (y - bounds.min_y) / Bounds::span(bounds.min_y, bounds.max_y);
        let base_x = self.padding + norm_x * plot_w;
        let base_y = self.padding + (1.0 - norm_y) * plot_h;

        let (cx, cy) = self.center();
        let t = &self.transform;
        (
            (base_x - cx) * t.scale + cx + t.offset_x,
            (base_y - cy) * t.scale + cy + t.offset_y,
        )
    }

    pub fn project_all(&self, bounds: &Bounds, points: &[ScatterPoint]) -> Vec<ScreenPoint> {
        points
            .par_iter()
            .map(|p| {
                let (x, y) = self.project(bounds, p.x, p.y);
                ScreenPoint { id: p.id, x, y }
            })
            .collect()
    }
}
