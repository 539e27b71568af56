//! In-memory voxel model, palette and material slots for one unique model
//! content.

use std::collections::BTreeMap;

use glam::{DMat4, DQuat, DVec3};

/// Number of material slots every model carries.
pub const MATERIAL_SLOTS: usize = 8;

/// Number of palette entries.
pub const PALETTE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Voxel {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    /// Material slot, 0..=7.
    pub material: u8,
    /// 1-based palette index; 0 means absent.
    pub color: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    colors: [Rgba; PALETTE_SIZE],
}

impl Palette {
    pub fn new(colors: [Rgba; PALETTE_SIZE]) -> Self {
        Self { colors }
    }

    /// Looks up a 1-based voxel color index.
    pub fn color(&self, index: u8) -> Rgba {
        self.colors[usize::from(index.max(1)) - 1]
    }
}

/// Normalised material properties of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Material {
    pub roughness: f32,
    pub metalness: f32,
    pub transmission: f32,
    pub emission: f32,
}

/// Voxels of one model, bucketed by `(material, color)`.
#[derive(Debug, Clone, Default)]
pub struct VoxelModel {
    name: String,
    buckets: BTreeMap<(u8, u8), Vec<Voxel>>,
}

impl VoxelModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buckets: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_voxel(&mut self, voxel: Voxel) {
        if voxel.color == 0 {
            return;
        }
        self.buckets
            .entry((voxel.material, voxel.color))
            .or_default()
            .push(voxel);
    }

    pub fn total_voxel_count(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    /// Used `(material, color)` pairs in ascending order.
    pub fn used_materials_and_colors(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.buckets.keys().copied()
    }

    pub fn voxels(&self, material: u8, color: u8) -> &[Voxel] {
        self.buckets
            .get(&(material, color))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Rotation, position and scale of a group or placement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: DVec3,
    pub rotation: DQuat,
    pub scale: DVec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: DVec3::ZERO,
            rotation: DQuat::IDENTITY,
            scale: DVec3::ONE,
        }
    }
}

impl Transform {
    /// Scale, then rotate, then translate.
    pub fn matrix(&self) -> DMat4 {
        DMat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voxel(x: i32, material: u8, color: u8) -> Voxel {
        Voxel {
            x,
            y: 0,
            z: 0,
            material,
            color,
        }
    }

    #[test]
    fn buckets_by_material_and_color() {
        let mut model = VoxelModel::new("contents1");
        model.add_voxel(voxel(0, 0, 3));
        model.add_voxel(voxel(1, 0, 3));
        model.add_voxel(voxel(2, 7, 3));
        model.add_voxel(voxel(3, 0, 0));

        assert_eq!(model.total_voxel_count(), 3);
        assert_eq!(
            model.used_materials_and_colors().collect::<Vec<_>>(),
            vec![(0, 3), (7, 3)]
        );
        assert_eq!(model.voxels(0, 3).len(), 2);
        assert!(model.voxels(1, 1).is_empty());
    }

    #[test]
    fn palette_indices_are_one_based() {
        let mut colors = [Rgba::default(); PALETTE_SIZE];
        colors[0] = Rgba {
            r: 255,
            g: 0,
            b: 0,
            a: 255,
        };
        let palette = Palette::new(colors);
        assert_eq!(palette.color(1).r, 255);
        assert_eq!(palette.color(2).r, 0);
    }

    #[test]
    fn transform_composes_scale_rotation_translation() {
        let transform = Transform {
            position: DVec3::new(10.0, 0.0, 0.0),
            rotation: DQuat::from_rotation_z(std::f64::consts::FRAC_PI_2),
            scale: DVec3::splat(2.0),
        };
        let moved = transform.matrix().transform_point3(DVec3::X);
        assert!((moved - DVec3::new(10.0, 2.0, 0.0)).length() < 1e-9);
    }
}
