//! Point rasterization, draw order, legends, tooltips and hit-testing.

use crate::color::{gradient_color, legend_max, ColorScale, Rgb, ZERO_COLOR};
use crate::dataset::ScatterPoint;
use crate::expression::ExpressionVector;
use crate::font::{draw_text, glyph_width};
use crate::viewport::ScreenPoint;
use image::{Rgba, RgbaImage};

/// Opacity of zero-color points, drawn first as a background layer.
pub const BACKGROUND_ALPHA: f32 = 0.15;
/// Constant opacity when no expression channel drives alpha.
pub const BASE_ALPHA: f32 = 0.8;
/// Constant opacity while a highlight overlay is active elsewhere.
pub const SUBORDINATE_ALPHA: f32 = 0.35;
/// Floor for expression-driven opacity.
pub const MIN_ALPHA: f32 = 0.1;
/// Hover acceptance radius in pixels.
pub const HOVER_RADIUS: f64 = 8.0;
/// Genes listed in a tooltip before it is marked truncated.
pub const TOOLTIP_GENES: usize = 5;

pub const BACKGROUND: Rgb = Rgb(255, 255, 255);
const INK: Rgb = Rgb(33, 33, 33);
const PANEL: Rgb = Rgb(250, 250, 250);
const PANEL_BORDER: Rgb = Rgb(120, 120, 120);
const TEXT_SCALE: u32 = 1;
const LINE_HEIGHT: i64 = 11;
const LABEL_CHARS: usize = 24;

#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    pub width: u32,
    pub height: u32,
    pub padding: f64,
    pub point_radius: f64,
    pub hover_radius: f64,
    pub show_legend: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        RenderOptions {
            width: 800,
            height: 600,
            padding: 20.0,
            point_radius: 2.5,
            hover_radius: HOVER_RADIUS,
            show_legend: true,
        }
    }
}

/// One point in paint order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawItem {
    pub index: usize,
    pub color: Rgb,
    pub alpha: f32,
}

fn value_at(values: Option<&[f32]>, i: usize) -> f32 {
    values
        .and_then(|v| v.get(i).copied())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// Resolve paint order and opacity for every cell.
///
/// Zero-color cells come first at `BACKGROUND_ALPHA`. The rest follow in
/// ascending order of `driving` (ties keep index order), so strong values
/// land on top. With `alpha_values` the opacity is
/// `max(MIN_ALPHA, min(v / alpha_max, 1))`; otherwise it is constant and
/// lower while `overlay_active`.
pub fn draw_order(
    colors: &[Rgb],
    driving: Option<&[f32]>,
    alpha_values: Option<&[f32]>,
    overlay_active: bool,
) -> Vec<DrawItem> {
    let (background, mut foreground): (Vec<usize>, Vec<usize>) =
        (0..colors.len()).partition(|&i| colors[i] == ZERO_COLOR);
    foreground.sort_by(|&a, &b| value_at(driving, a).total_cmp(&value_at(driving, b)));

    let alpha_max = alpha_values.map(legend_max);
    let constant = if overlay_active {
        SUBORDINATE_ALPHA
    } else {
        BASE_ALPHA
    };

    let mut items = Vec::with_capacity(colors.len());
    items.extend(background.into_iter().map(|index| DrawItem {
        index,
        color: ZERO_COLOR,
        alpha: BACKGROUND_ALPHA,
    }));
    items.extend(foreground.into_iter().map(|index| {
        let alpha = match alpha_max {
            Some(max) => (value_at(alpha_values, index) / max).min(1.0).max(MIN_ALPHA),
            None => constant,
        };
        DrawItem {
            index,
            color: colors[index],
            alpha,
        }
    }));
    items
}

fn blend(img: &mut RgbaImage, x: i64, y: i64, color: Rgb, alpha: f32) {
    if x < 0 || y < 0 || x >= img.width() as i64 || y >= img.height() as i64 {
        return;
    }
    let px = img.get_pixel_mut(x as u32, y as u32);
    let a = alpha.clamp(0.0, 1.0);
    let mix = |src: u8, dst: u8| (src as f32 * a + dst as f32 * (1.0 - a)).round() as u8;
    *px = Rgba([mix(color.0, px[0]), mix(color.1, px[1]), mix(color.2, px[2]), 255]);
}

/// Alpha-blend a filled disc; pixels whose centers fall inside are covered.
pub fn fill_circle(img: &mut RgbaImage, cx: f64, cy: f64, radius: f64, color: Rgb, alpha: f32) {
    if !cx.is_finite() || !cy.is_finite() {
        return;
    }
    let r2 = radius * radius;
    let (x0, x1) = ((cx - radius).floor() as i64, (cx + radius).ceil() as i64);
    let (y0, y1) = ((cy - radius).floor() as i64, (cy + radius).ceil() as i64);
    if x1 < 0 || y1 < 0 || x0 >= img.width() as i64 || y0 >= img.height() as i64 {
        return;
    }
    for y in y0..=y1 {
        let dy = y as f64 + 0.5 - cy;
        for x in x0..=x1 {
            let dx = x as f64 + 0.5 - cx;
            if dx * dx + dy * dy <= r2 {
                blend(img, x, y, color, alpha);
            }
        }
    }
}

fn stroke_circle(img: &mut RgbaImage, cx: f64, cy: f64, radius: f64, color: Rgb) {
    let steps = ((radius * 8.0).ceil() as usize).max(16);
    for s in 0..steps {
        let theta = s as f64 / steps as f64 * std::f64::consts::TAU;
        blend(
            img,
            (cx + radius * theta.cos()).floor() as i64,
            (cy + radius * theta.sin()).floor() as i64,
            color,
            1.0,
        );
    }
}

fn fill_rect(img: &mut RgbaImage, x: i64, y: i64, w: i64, h: i64, color: Rgb) {
    for py in y..y + h {
        for px in x..x + w {
            blend(img, px, py, color, 1.0);
        }
    }
}

fn panel(img: &mut RgbaImage, x: i64, y: i64, w: i64, h: i64) {
    fill_rect(img, x, y, w, h, PANEL_BORDER);
    fill_rect(img, x + 1, y + 1, w - 2, h - 2, PANEL);
}

/// Paint `items` over `img` in order.
pub fn paint_points(img: &mut RgbaImage, screen: &[ScreenPoint], items: &[DrawItem], radius: f64) {
    for item in items {
        if let Some(p) = screen.get(item.index) {
            fill_circle(img, p.x, p.y, radius, item.color, item.alpha);
        }
    }
}

/// Outline the hovered point so it stands out from its neighbours.
pub fn paint_hover_ring(img: &mut RgbaImage, point: &ScreenPoint, radius: f64) {
    stroke_circle(img, point.x, point.y, radius + 2.0, INK);
}

/// Index into `screen` of the point nearest (`x`, `y`), if within `radius`.
pub fn nearest_point(screen: &[ScreenPoint], x: f64, y: f64, radius: f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, p) in screen.iter().enumerate() {
        let (dx, dy) = (p.x - x, p.y - y);
        let d2 = dx * dx + dy * dy;
        if best.map_or(true, |(_, b)| d2 < b) {
            best = Some((i, d2));
        }
    }
    best.filter(|&(_, d2)| d2 <= radius * radius).map(|(i, _)| i)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Legend {
    Categorical(Vec<(String, Rgb)>),
    Continuous { low: String, high: String },
}

impl Legend {
    /// `None` when disabled or when the scale has nothing to show.
    pub fn from_scale(scale: &ColorScale, show: bool) -> Option<Legend> {
        if !show {
            return None;
        }
        match scale {
            ColorScale::Categorical(c) if !c.entries().is_empty() => {
                Some(Legend::Categorical(c.entries().to_vec()))
            }
            ColorScale::Continuous { max } => Some(Legend::Continuous {
                low: "0".to_string(),
                high: format!("{:.2}", max),
            }),
            _ => None,
        }
    }
}

/// Paint `legend` in the top-right corner under `title`.
pub fn paint_legend(img: &mut RgbaImage, legend: &Legend, title: &str) {
    let char_w = glyph_width(TEXT_SCALE) as i64;
    let swatch = 8i64;
    let rows: i64 = match legend {
        Legend::Categorical(entries) => entries.len() as i64,
        Legend::Continuous { .. } => 2,
    };
    let title_chars = title.chars().count().min(LABEL_CHARS) as i64;
    let body_chars = match legend {
        Legend::Categorical(entries) => entries
            .iter()
            .map(|(l, _)| l.chars().count().min(LABEL_CHARS))
            .max()
            .unwrap_or(0) as i64,
        Legend::Continuous { low, high } => low.len().max(high.len()) as i64,
    };
    let w = (title_chars * char_w).max(swatch + 6 + body_chars * char_w) + 12;
    let h = (rows + 1) * LINE_HEIGHT + 10;
    let x = img.width() as i64 - w - 6;
    let y = 6;
    panel(img, x, y, w, h);
    draw_text(img, x + 6, y + 5, title, TEXT_SCALE, LABEL_CHARS, INK);

    let top = y + 5 + LINE_HEIGHT;
    match legend {
        Legend::Categorical(entries) => {
            for (row, (label, color)) in entries.iter().enumerate() {
                let ly = top + row as i64 * LINE_HEIGHT;
                fill_rect(img, x + 6, ly, swatch, swatch, *color);
                draw_text(img, x + 12 + swatch, ly, label, TEXT_SCALE, LABEL_CHARS, INK);
            }
        }
        Legend::Continuous { low, high } => {
            // Gradient bar from high (top) to low (bottom) beside the labels.
            let bar_h = 2 * LINE_HEIGHT - 3;
            for dy in 0..bar_h {
                let t = 1.0 - dy as f32 / (bar_h - 1).max(1) as f32;
                let color = gradient_color(t.max(f32::MIN_POSITIVE), 1.0);
                fill_rect(img, x + 6, top + dy, swatch, 1, color);
            }
            draw_text(img, x + 12 + swatch, top, high, TEXT_SCALE, LABEL_CHARS, INK);
            draw_text(img, x + 12 + swatch, top + LINE_HEIGHT, low, TEXT_SCALE, LABEL_CHARS, INK);
        }
    }
}

/// One loaded gene, for tooltip composition.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneRecord {
    pub symbol: String,
    pub values: ExpressionVector,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tooltip {
    pub tag: String,
    pub time: Option<String>,
    pub cell_type: Option<String>,
    pub genes: Vec<(String, f32)>,
    pub truncated: bool,
}

/// Build the tooltip for `point`: expressed genes by descending value, then
/// unexpressed genes by symbol, capped at `TOOLTIP_GENES`.
pub fn compose_tooltip(point: &ScatterPoint, records: &[GeneRecord]) -> Tooltip {
    let (mut expressed, mut unexpressed): (Vec<(String, f32)>, Vec<(String, f32)>) = records
        .iter()
        .map(|r| {
            let v = r.values.get(point.id).copied().unwrap_or(0.0);
            (r.symbol.clone(), v)
        })
        .partition(|(_, v)| *v > 0.0);
    expressed.sort_by(|a, b| b.1.total_cmp(&a.1));
    unexpressed.sort_by(|a, b| a.0.cmp(&b.0));

    let genes = expressed
        .into_iter()
        .chain(unexpressed)
        .take(TOOLTIP_GENES)
        .collect();
    Tooltip {
        tag: point.tag.clone(),
        time: point.time.clone(),
        cell_type: point.cell_type.clone(),
        genes,
        truncated: records.len() > TOOLTIP_GENES,
    }
}

impl Tooltip {
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![self.tag.clone()];
        if let Some(t) = &self.time {
            lines.push(format!("time: {}", t));
        }
        if let Some(t) = &self.cell_type {
            lines.push(format!("type: {}", t));
        }
        for (symbol, value) in &self.genes {
            lines.push(format!("{}: {:.2}", symbol, value));
        }
        if self.truncated {
            lines.push("...".to_string());
        }
        lines
    }
}

/// Paint `tooltip` next to (`x`, `y`), flipped to stay on the surface.
pub fn paint_tooltip(img: &mut RgbaImage, tooltip: &Tooltip, x: f64, y: f64) {
    let lines = tooltip.lines();
    let char_w = glyph_width(TEXT_SCALE) as i64;
    let widest = lines
        .iter()
        .map(|l| l.chars().count().min(LABEL_CHARS))
        .max()
        .unwrap_or(0) as i64;
    let w = widest * char_w + 10;
    let h = lines.len() as i64 * LINE_HEIGHT + 8;
    let (img_w, img_h) = (img.width() as i64, img.height() as i64);

    let mut left = x.round() as i64 + 12;
    if left + w > img_w {
        left = x.round() as i64 - 12 - w;
    }
    let mut top = y.round() as i64 + 12;
    if top + h > img_h {
        top = y.round() as i64 - 12 - h;
    }
    let (left, top) = (left.max(0), top.max(0));

    panel(img, left, top, w, h);
    for (row, line) in lines.iter().enumerate() {
        let line_y = top + 4 + row as i64 * LINE_HEIGHT;
        draw_text(img, left + 5, line_y, line, TEXT_SCALE, LABEL_CHARS, INK);
    }
}

/// A white surface of the given size.
pub fn blank_surface(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_pixel(width, height, BACKGROUND.opaque())
}
