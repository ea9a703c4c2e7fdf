//! Color encodings: categorical palettes, the continuous gradient and the
//! per-cell color cache.

use crate::dataset::ScatterPoint;
use image::Rgba;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }

    pub fn opaque(&self) -> Rgba<u8> {
        Rgba([self.0, self.1, self.2, 255])
    }

    fn lerp(a: Rgb, b: Rgb, t: f32) -> Rgb {
        let mix = |x: u8, y: u8| {
            (x as f32 + (y as f32 - x as f32) * t)
                .round()
                .clamp(0.0, 255.0) as u8
        };
        Rgb(mix(a.0, b.0), mix(a.1, b.1), mix(a.2, b.2))
    }
}

/// Cells with no signal (or no category).
pub const ZERO_COLOR: Rgb = Rgb(211, 211, 211);

/// Continuous gradient stops: low -> knee -> high.
pub const GRADIENT: [Rgb; 3] = [Rgb(254, 224, 139), Rgb(244, 109, 67), Rgb(158, 1, 66)];
pub const GRADIENT_KNEE: f32 = 0.8;

/// ColorBrewer Set1 followed by Dark2. Repeats when there are more
/// categories than colors.
pub const CATEGORY_PALETTE: [Rgb; 17] = [
    Rgb(228, 26, 28),
    Rgb(55, 126, 184),
    Rgb(77, 175, 74),
    Rgb(152, 78, 163),
    Rgb(255, 127, 0),
    Rgb(255, 255, 51),
    Rgb(166, 86, 40),
    Rgb(247, 129, 191),
    Rgb(153, 153, 153),
    Rgb(27, 158, 119),
    Rgb(217, 95, 2),
    Rgb(117, 112, 179),
    Rgb(231, 41, 138),
    Rgb(102, 166, 30),
    Rgb(230, 171, 2),
    Rgb(166, 118, 29),
    Rgb(102, 102, 102),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorMode {
    #[default]
    Time,
    CellType,
    Expression,
}

impl FromStr for ColorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "time" => Ok(ColorMode::Time),
            "cell-type" | "celltype" | "type" => Ok(ColorMode::CellType),
            "expression" => Ok(ColorMode::Expression),
            other => Err(format!("unknown color mode '{}' (time, cell-type, expression)", other)),
        }
    }
}

impl fmt::Display for ColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ColorMode::Time => "time",
            ColorMode::CellType => "cell-type",
            ColorMode::Expression => "expression",
        })
    }
}

/// Palette assignment for a categorical column.
///
/// Colors follow the sorted order of the distinct labels, so the mapping is
/// independent of row order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CategoryColors {
    entries: Vec<(String, Rgb)>,
}

impl CategoryColors {
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = Option<&'a str>>) -> Self {
        let distinct: BTreeSet<&str> = labels.into_iter().flatten().collect();
        let entries = distinct
            .into_iter()
            .enumerate()
            .map(|(rank, label)| {
                (
                    label.to_string(),
                    CATEGORY_PALETTE[rank % CATEGORY_PALETTE.len()],
                )
            })
            .collect();
        CategoryColors { entries }
    }

    pub fn color_of(&self, label: &str) -> Option<Rgb> {
        self.entries
            .binary_search_by(|(l, _)| l.as_str().cmp(label))
            .ok()
            .map(|i| self.entries[i].1)
    }

    pub fn entries(&self) -> &[(String, Rgb)] {
        &self.entries
    }
}

/// Largest finite value, or 1 when there is nothing positive to scale by.
pub fn legend_max(values: &[f32]) -> f32 {
    let max = values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if max > 0.0 {
        max
    } else {
        1.0
    }
}

/// Two-segment gradient color for `value` scaled by `max`.
pub fn gradient_color(value: f32, max: f32) -> Rgb {
    if !(value > 0.0) || !value.is_finite() {
        return ZERO_COLOR;
    }
    let t = (value / max).min(1.0);
    if t <= GRADIENT_KNEE {
        Rgb::lerp(GRADIENT[0], GRADIENT[1], t / GRADIENT_KNEE)
    } else {
        Rgb::lerp(GRADIENT[1], GRADIENT[2], (t - GRADIENT_KNEE) / (1.0 - GRADIENT_KNEE))
    }
}

fn category_label(point: &ScatterPoint, mode: ColorMode) -> Option<&str> {
    match mode {
        ColorMode::Time => point.time.as_deref(),
        _ => point.cell_type.as_deref(),
    }
}

/// What the colors of a cache encode; drives the legend.
#[derive(Debug, Clone, PartialEq)]
pub enum ColorScale {
    Categorical(CategoryColors),
    Continuous { max: f32 },
    /// Continuous mode without any values.
    Empty,
}

/// Per-cell colors for one color mode, rebuilt wholesale on change.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorCache {
    pub colors: Vec<Rgb>,
    pub scale: ColorScale,
}

impl ColorCache {
    pub fn build(points: &[ScatterPoint], mode: ColorMode, values: Option<&[f32]>) -> Self {
        match mode {
            ColorMode::Time | ColorMode::CellType => {
                let categories =
                    CategoryColors::from_labels(points.iter().map(|p| category_label(p, mode)));
                let colors = points
                    .par_iter()
                    .map(|p| {
                        category_label(p, mode)
                            .and_then(|l| categories.color_of(l))
                            .unwrap_or(ZERO_COLOR)
                    })
                    .collect();
                ColorCache {
                    colors,
                    scale: ColorScale::Categorical(categories),
                }
            }
            ColorMode::Expression => match values {
                Some(values) if !values.is_empty() => {
                    let max = legend_max(values);
                    let colors = points
                        .par_iter()
                        .map(|p| values.get(p.id).map_or(ZERO_COLOR, |&v| gradient_color(v, max)))
                        .collect();
                    ColorCache {
                        colors,
                        scale: ColorScale::Continuous { max },
                    }
                }
                _ => ColorCache {
                    colors: vec![ZERO_COLOR; points.len()],
                    scale: ColorScale::Empty,
                },
            },
        }
    }

    pub fn hex_colors(&self) -> Vec<String> {
        self.colors.iter().map(Rgb::to_hex).collect()
    }
}
