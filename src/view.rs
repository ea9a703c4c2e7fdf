//! The interactive scatter: owns the viewport, the color and screen caches
//! and the drawing surface, and drives them from pointer events.
//!
//! Pointer moves and wheel events only record intent; `on_frame` applies at
//! most one zoom and one hover scan per animation tick.

use crate::color::{ColorCache, ColorMode};
use crate::dataset::ScatterPoint;
use crate::expression::{AggregationMode, ExpressionVector, TransformMode};
use crate::render::{
    blank_surface, compose_tooltip, draw_order, nearest_point, paint_hover_ring, paint_legend,
    paint_points, paint_tooltip, DrawItem, GeneRecord, Legend, RenderOptions, Tooltip,
};
use crate::viewport::{Bounds, ScreenPoint, Viewport};
use image::{ImageResult, RgbaImage};
use log::debug;
use std::path::Path;

/// Everything the caller supplies to the renderer.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub points: Vec<ScatterPoint>,
    pub color_mode: ColorMode,
    /// Per-cell values behind the continuous color mode.
    pub color_values: Option<ExpressionVector>,
    /// Per-cell values driving opacity, independent of hue.
    pub alpha_values: Option<ExpressionVector>,
    /// A highlight overlay is active elsewhere in the view.
    pub overlay_active: bool,
    /// Fixed data bounds, shared across strains. Computed from the points
    /// when absent.
    pub bounds: Option<Bounds>,
    /// Loaded genes, for tooltips.
    pub gene_records: Vec<GeneRecord>,
    pub gene_count: usize,
    pub aggregation: AggregationMode,
    pub transform: TransformMode,
}

impl Scene {
    fn legend_title(&self) -> String {
        match self.color_mode {
            ColorMode::Time => "time".to_string(),
            ColorMode::CellType => "cell type".to_string(),
            ColorMode::Expression => {
                let noun = if self.gene_count == 1 { "gene" } else { "genes" };
                format!("{} {} ({}, {})", self.gene_count, noun, self.aggregation, self.transform)
            }
        }
    }

    fn driving_values(&self) -> Option<&[f32]> {
        match self.color_mode {
            ColorMode::Expression => self.color_values.as_deref(),
            _ => self.alpha_values.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Interaction {
    Idle,
    Dragging { last_x: f64, last_y: f64 },
}

pub struct ScatterView {
    options: RenderOptions,
    scene: Scene,
    viewport: Viewport,
    bounds: Option<Bounds>,
    colors: ColorCache,
    order: Vec<DrawItem>,
    screen: Vec<ScreenPoint>,
    surface: RgbaImage,
    interaction: Interaction,
    pending_hover: Option<(f64, f64)>,
    hovered: Option<usize>,
    frames: u64,
}

impl ScatterView {
    pub fn new(options: RenderOptions, scene: Scene) -> Self {
        let viewport = Viewport::new(options.width, options.height, options.padding);
        let surface = blank_surface(options.width, options.height);
        let mut view = ScatterView {
            options,
            scene: Scene::default(),
            viewport,
            bounds: None,
            colors: ColorCache::build(&[], ColorMode::default(), None),
            order: Vec::new(),
            screen: Vec::new(),
            surface,
            interaction: Interaction::Idle,
            pending_hover: None,
            hovered: None,
            frames: 0,
        };
        view.set_scene(scene);
        view
    }

    /// Replace the renderer inputs; color cache, order and projection are
    /// rebuilt wholesale.
    pub fn set_scene(&mut self, scene: Scene) {
        self.bounds = scene.bounds.or_else(|| Bounds::from_points(&scene.points));
        self.colors = ColorCache::build(
            &scene.points,
            scene.color_mode,
            scene.color_values.as_deref(),
        );
        self.order = draw_order(
            &self.colors.colors,
            scene.driving_values(),
            scene.alpha_values.as_deref(),
            scene.overlay_active,
        );
        self.scene = scene;
        // Points are replaced wholesale; an old index may name another cell.
        self.hovered = None;
        debug!(
            "scene: {} points, color by {}",
            self.scene.points.len(),
            self.scene.color_mode
        );
        self.reproject();
        self.redraw();
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn interaction(&self) -> Interaction {
        self.interaction
    }

    pub fn colors(&self) -> &ColorCache {
        &self.colors
    }

    pub fn screen_points(&self) -> &[ScreenPoint] {
        &self.screen
    }

    /// Number of repaints so far.
    pub fn frames_drawn(&self) -> u64 {
        self.frames
    }

    pub fn hovered(&self) -> Option<&ScatterPoint> {
        self.hovered.and_then(|i| self.scene.points.get(i))
    }

    pub fn tooltip(&self) -> Option<Tooltip> {
        self.hovered()
            .map(|p| compose_tooltip(p, &self.scene.gene_records))
    }

    pub fn legend(&self) -> Option<Legend> {
        let show = self.options.show_legend && !self.scene.points.is_empty();
        Legend::from_scale(&self.colors.scale, show)
    }

    pub fn pointer_down(&mut self, x: f64, y: f64) {
        self.pending_hover = None;
        self.interaction = Interaction::Dragging { last_x: x, last_y: y };
    }

    pub fn pointer_move(&mut self, x: f64, y: f64) {
        match self.interaction {
            Interaction::Dragging { last_x, last_y } => {
                self.viewport.pan(x - last_x, y - last_y);
                self.interaction = Interaction::Dragging { last_x: x, last_y: y };
                self.reproject();
                self.redraw();
            }
            Interaction::Idle => self.pending_hover = Some((x, y)),
        }
    }

    pub fn pointer_up(&mut self) {
        self.interaction = Interaction::Idle;
    }

    pub fn pointer_leave(&mut self) {
        self.interaction = Interaction::Idle;
    }

    pub fn wheel(&mut self, x: f64, y: f64, delta_y: f64) {
        self.viewport.queue_zoom(x, y, delta_y);
    }

    pub fn pan(&mut self, dx: f64, dy: f64) {
        self.viewport.pan(dx, dy);
        self.reproject();
        self.redraw();
    }

    /// Animation tick. Returns whether the surface was repainted.
    pub fn on_frame(&mut self) -> bool {
        let mut dirty = false;
        if self.viewport.apply_pending_zoom() {
            self.reproject();
            dirty = true;
        }
        if let Some((x, y)) = self.pending_hover.take() {
            let hit = nearest_point(&self.screen, x, y, self.options.hover_radius);
            if hit != self.hovered {
                self.hovered = hit;
                dirty = true;
            }
        }
        if dirty {
            self.redraw();
        }
        dirty
    }

    pub fn reset(&mut self) {
        self.viewport.reset();
        self.interaction = Interaction::Idle;
        self.pending_hover = None;
        self.reproject();
        self.redraw();
    }

    fn reproject(&mut self) {
        self.screen = match &self.bounds {
            Some(bounds) => self.viewport.project_all(bounds, &self.scene.points),
            None => Vec::new(),
        };
    }

    fn redraw(&mut self) {
        if self.surface.width() == 0 || self.surface.height() == 0 {
            return;
        }
        self.surface = blank_surface(self.options.width, self.options.height);
        paint_points(&mut self.surface, &self.screen, &self.order, self.options.point_radius);
        if let Some(legend) = self.legend() {
            paint_legend(&mut self.surface, &legend, &self.scene.legend_title());
        }
        if let Some(i) = self.hovered {
            if let (Some(sp), Some(tip)) = (self.screen.get(i).copied(), self.tooltip()) {
                paint_hover_ring(&mut self.surface, &sp, self.options.point_radius);
                paint_tooltip(&mut self.surface, &tip, sp.x, sp.y);
            }
        }
        self.frames += 1;
    }

    /// The current frame, or `None` when the surface has no pixels.
    pub fn draw_surface(&self) -> Option<&RgbaImage> {
        if self.surface.width() == 0 || self.surface.height() == 0 {
            None
        } else {
            Some(&self.surface)
        }
    }

    /// Static snapshot of the current frame.
    pub fn export_image(&self) -> RgbaImage {
        self.surface.clone()
    }

    pub fn export_png(&self, path: impl AsRef<Path>) -> ImageResult<()> {
        self.surface.save(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::{GRADIENT, ZERO_COLOR};
    use crate::viewport::ViewTransform;

    fn points() -> Vec<ScatterPoint> {
        [(0.0, 0.0), (10.0, 10.0), (5.0, 5.0)]
            .iter()
            .enumerate()
            .map(|(id, &(x, y))| ScatterPoint {
                id,
                x,
                y,
                tag: format!("cell{}", id),
                time: Some(format!("t{}", id % 2)),
                cell_type: None,
            })
            .collect()
    }

    fn view() -> ScatterView {
        let options = RenderOptions {
            width: 120,
            height: 120,
            padding: 10.0,
            ..RenderOptions::default()
        };
        ScatterView::new(
            options,
            Scene {
                points: points(),
                ..Scene::default()
            },
        )
    }

    #[test]
    fn hover_resolves_once_per_frame_and_redraws_on_change() {
        let mut v = view();
        let start = v.frames_drawn();
        // Cell 2 projects to the surface center.
        v.pointer_move(50.0, 50.0);
        v.pointer_move(62.0, 58.0);
        assert!(v.hovered().is_none());
        assert!(v.on_frame());
        assert_eq!(v.hovered().map(|p| p.id), Some(2));
        assert_eq!(v.frames_drawn(), start + 1);

        v.pointer_move(61.0, 59.0);
        assert!(!v.on_frame());
        assert_eq!(v.frames_drawn(), start + 1);

        v.pointer_move(90.0, 30.0);
        assert!(v.on_frame());
        assert!(v.hovered().is_none());
        assert!(v.tooltip().is_none());
    }

    #[test]
    fn drag_pans_and_cancels_pending_hover() {
        let mut v = view();
        v.pointer_move(60.0, 60.0);
        v.pointer_down(60.0, 60.0);
        assert_eq!(v.interaction(), Interaction::Dragging { last_x: 60.0, last_y: 60.0 });
        assert!(!v.on_frame());
        assert!(v.hovered().is_none());

        v.pointer_move(70.0, 65.0);
        v.pointer_move(75.0, 65.0);
        assert_eq!(v.viewport().transform().offset_x, 15.0);
        assert_eq!(v.viewport().transform().offset_y, 5.0);
        assert!((v.screen_points()[2].x - 75.0).abs() < 1e-9);

        v.pointer_leave();
        assert_eq!(v.interaction(), Interaction::Idle);
        v.pointer_move(75.0, 65.0);
        assert!(v.on_frame());
        assert_eq!(v.hovered().map(|p| p.id), Some(2));
    }

    #[test]
    fn wheel_zoom_applies_on_frame_and_reset_restores() {
        let mut v = view();
        v.wheel(60.0, 60.0, 50.0);
        v.wheel(60.0, 60.0, 50.0);
        assert_eq!(v.viewport().transform(), ViewTransform::IDENTITY);
        assert!(v.on_frame());
        assert!((v.viewport().transform().scale - (-0.15f64).exp()).abs() < 1e-12);

        v.pointer_down(0.0, 0.0);
        v.reset();
        assert_eq!(v.viewport().transform(), ViewTransform::IDENTITY);
        assert_eq!(v.interaction(), Interaction::Idle);
    }

    #[test]
    fn expression_scene_builds_legend_and_tooltip() {
        let mut v = view();
        let values: ExpressionVector = vec![0.0, 4.0, 2.0].into();
        v.set_scene(Scene {
            points: points(),
            color_mode: ColorMode::Expression,
            color_values: Some(values.clone()),
            gene_records: vec![GeneRecord {
                symbol: "Sox2".to_string(),
                values,
            }],
            gene_count: 1,
            ..Scene::default()
        });
        assert_eq!(v.colors().colors[0], ZERO_COLOR);
        assert_eq!(v.colors().colors[1], GRADIENT[2]);
        assert_eq!(v.scene().legend_title(), "1 gene (sum, linear)");
        assert_eq!(
            v.legend(),
            Some(Legend::Continuous {
                low: "0".to_string(),
                high: "4.00".to_string()
            })
        );

        v.pointer_move(110.0, 10.0);
        v.on_frame();
        let tip = v.tooltip().unwrap();
        assert_eq!(tip.tag, "cell1");
        assert_eq!(tip.genes, vec![("Sox2".to_string(), 4.0)]);
    }

    #[test]
    fn new_scene_drops_the_hovered_cell() {
        let mut v = view();
        v.pointer_move(60.0, 60.0);
        v.on_frame();
        assert_eq!(v.hovered().map(|p| p.id), Some(2));

        let mut replaced = points();
        for p in &mut replaced {
            p.tag = format!("other{}", p.id);
        }
        v.set_scene(Scene {
            points: replaced,
            ..Scene::default()
        });
        assert!(v.hovered().is_none());
        assert!(v.tooltip().is_none());

        v.pointer_move(60.0, 60.0);
        assert!(v.on_frame());
        assert_eq!(v.tooltip().map(|t| t.tag), Some("other2".to_string()));
    }

    #[test]
    fn zero_sized_surface_is_a_no_op() {
        let options = RenderOptions {
            width: 0,
            height: 0,
            ..RenderOptions::default()
        };
        let mut v = ScatterView::new(
            options,
            Scene {
                points: points(),
                ..Scene::default()
            },
        );
        assert!(v.draw_surface().is_none());
        v.pan(3.0, 3.0);
        assert_eq!(v.frames_drawn(), 0);
    }

    #[test]
    fn export_writes_a_png() {
        let v = view();
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("frame.png");
        v.export_png(&path).unwrap();
        let back = image::open(&path).unwrap().to_rgba8();
        assert_eq!(back.dimensions(), (120, 120));
        assert_eq!(back, v.export_image());
    }
}
