use glam::DVec3;
use serde::Serialize;
use tracing::debug;

use super::graph::Scene;

/// Azimuth applied after fitting, in degrees.
pub const ORBIT_OFFSET: f64 = -45.0;

/// Axis-aligned bounds grown one point at a time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingVolume {
    pub min: DVec3,
    pub max: DVec3,
    pub count: usize,
}

impl Default for BoundingVolume {
    fn default() -> Self {
        Self::new()
    }
}

impl BoundingVolume {
    /// Empty bounds, inverted so the first point sets both corners.
    pub fn new() -> Self {
        Self {
            min: DVec3::INFINITY,
            max: DVec3::NEG_INFINITY,
            count: 0,
        }
    }

    pub fn update(&mut self, point: DVec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
        self.count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    pub fn radius(&self) -> f64 {
        (self.max - self.min).length() * 0.5
    }
}

/// Fits the camera to every instance center (and merged mesh vertex), then
/// swings it to the default viewing angle. Returns the bounds used, `None`
/// when the scene holds no geometry.
pub fn frame_scene(scene: &mut Scene) -> Option<BoundingVolume> {
    let mut bounds = BoundingVolume::new();
    for point in scene.instance_positions() {
        bounds.update(point);
    }
    for point in scene.mesh_points() {
        bounds.update(point);
    }

    if bounds.is_empty() {
        debug!("No geometry to frame, keeping default camera");
        scene.camera.set_orbit(ORBIT_OFFSET, 0.0);
        return None;
    }

    scene.camera.zoom_extents(bounds.center(), bounds.radius());
    scene.camera.set_orbit(ORBIT_OFFSET, 0.0);
    debug!(
        points = bounds.count,
        center = ?bounds.center(),
        radius = bounds.radius(),
        "Camera framed"
    );
    Some(bounds)
}
