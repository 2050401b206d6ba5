use crate::error::{KsplatError, Result};
use crate::tree::SplatTree;
use glam::{Mat4, Vec3};
use log::warn;

pub const DEFAULT_MAX_SORT_DISTANCE: f32 = 125.0;
pub const DEFAULT_FOV_MARGIN: f32 = 0.4;

const FORWARD: Vec3 = Vec3::new(0.0, 0.0, -1.0);

#[derive(Debug, Clone, Copy)]
pub struct SelectorConfig {
    /// Leaves farther than this are rendered but left out of the sortable prefix.
    pub max_sort_distance: f32,
    /// Widening subtracted from the cosine of each half field of view.
    pub fov_margin: f32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        SelectorConfig {
            max_sort_distance: DEFAULT_MAX_SORT_DISTANCE,
            fov_margin: DEFAULT_FOV_MARGIN,
        }
    }
}

/// Camera inputs for one frame. `model_view` takes splat space to camera
/// space, with the camera looking down -Z.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewParams {
    pub model_view: Mat4,
    pub render_width: f32,
    pub render_height: f32,
    pub focal_length: f32,
}

impl ViewParams {
    fn validate(&self) -> Result<()> {
        if !self.model_view.is_finite() {
            return Err(KsplatError::UnsupportedCameraOrInputShape(
                "model-view matrix is not finite".to_string(),
            ));
        }
        let det = self.model_view.determinant();
        if det == 0.0 || !det.is_finite() {
            return Err(KsplatError::UnsupportedCameraOrInputShape(
                "model-view matrix is singular".to_string(),
            ));
        }
        for (name, value) in [
            ("render width", self.render_width),
            ("render height", self.render_height),
            ("focal length", self.focal_length),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(KsplatError::UnsupportedCameraOrInputShape(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Splat indices of the selected leaves, nearest leaf first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub indexes: Vec<u32>,
    /// Number of splats in `indexes` that should be rendered.
    pub visible_count: usize,
    /// Length of the prefix of `indexes` close enough to be depth sorted.
    pub sortable_count: usize,
    pub leaf_count: usize,
}

#[derive(Debug, Default)]
pub struct FrameSelector {
    config: SelectorConfig,
    candidates: Vec<(f32, usize)>,
    selection: Selection,
}

impl FrameSelector {
    pub fn new(config: SelectorConfig) -> Self {
        FrameSelector {
            config,
            candidates: Vec::new(),
            selection: Selection::default(),
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// The most recent successful selection.
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn try_select(
        &mut self,
        tree: &SplatTree,
        view: &ViewParams,
        gather_all: bool,
    ) -> Result<&Selection> {
        view.validate()?;

        let cos_fov_x_over_2 = (view.render_width / 2.0 / view.focal_length).atan().cos();
        let cos_fov_y_over_2 = (view.render_height / 2.0 / view.focal_length).atan().cos();
        let min_dot_x = cos_fov_x_over_2 - self.config.fov_margin;
        let min_dot_y = cos_fov_y_over_2 - self.config.fov_margin;

        self.candidates.clear();
        for &leaf_id in tree.leaf_ids() {
            let leaf = tree.node(leaf_id);
            let in_camera = view.model_view.transform_point3(leaf.center);
            let distance = in_camera.length();
            let direction = in_camera.normalize_or_zero();

            let xz = Vec3::new(direction.x, 0.0, direction.z).normalize_or_zero();
            let yz = Vec3::new(0.0, direction.y, direction.z).normalize_or_zero();
            let out_of_fov_x = FORWARD.dot(xz) < min_dot_x;
            let out_of_fov_y = FORWARD.dot(yz) < min_dot_y;

            // Leaves large enough to surround the camera are never culled.
            if !gather_all && (out_of_fov_x || out_of_fov_y) && distance > leaf.size() {
                continue;
            }
            self.candidates.push((distance, leaf_id));
        }

        // stable, so equidistant leaves keep tree order
        self.candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        let selection = &mut self.selection;
        selection.indexes.clear();
        selection.sortable_count = 0;
        selection.leaf_count = self.candidates.len();
        for &(distance, leaf_id) in &self.candidates {
            let indexes = &tree.node(leaf_id).indexes;
            if distance <= self.config.max_sort_distance {
                selection.sortable_count += indexes.len();
            }
            selection.indexes.extend_from_slice(indexes);
        }
        selection.visible_count = selection.indexes.len();

        Ok(&self.selection)
    }

    /// Like `try_select`, but keeps the previous selection when the view
    /// cannot be used.
    pub fn select(&mut self, tree: &SplatTree, view: &ViewParams, gather_all: bool) -> &Selection {
        if let Err(e) = self.try_select(tree, view, gather_all) {
            warn!("Keeping the previous selection: {}", e);
        }
        &self.selection
    }
}
