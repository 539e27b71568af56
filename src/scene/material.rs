//! Material classification: one surface category per `(material, color)`.

use super::graph::{keys, NodeId, Property, Scene};
use crate::package::{Material, Rgba};

pub const GLASS_INDEX: u8 = 6;
pub const LIQUID_INDEX: u8 = 7;

const LIQUID_DEPTH: f64 = 300.0;
const LIQUID_IOR: f64 = 1.33;
const GLASS_DEPTH: f64 = 500.0;
const ROUGHNESS_SCALE: f64 = 100.0;
const EMITTER_GAIN: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Surface {
    Liquid,
    Glass { roughness: f64 },
    Metal { roughness: f64 },
    Dielectric { transmission: f64 },
    Emitter { energy: f64 },
    Diffuse,
    Plastic { roughness: f64 },
}

/// First matching rule wins.
pub fn classify(material_index: u8, alpha: u8, material: &Material) -> Surface {
    let roughness = f64::from(material.roughness) * ROUGHNESS_SCALE;
    if material_index == LIQUID_INDEX {
        Surface::Liquid
    } else if material_index == GLASS_INDEX || alpha < 255 {
        Surface::Glass { roughness }
    } else if material.metalness > 0.1 {
        Surface::Metal { roughness }
    } else if material.transmission > 0.0 {
        Surface::Dielectric {
            transmission: f64::from(material.transmission),
        }
    } else if material.emission > 0.0 {
        Surface::Emitter {
            energy: f64::from(material.emission) * EMITTER_GAIN,
        }
    } else if material.roughness > 0.8999 {
        Surface::Diffuse
    } else {
        Surface::Plastic { roughness }
    }
}

impl Surface {
    pub fn name(&self) -> &'static str {
        match self {
            Surface::Liquid => "liquid",
            Surface::Glass { .. } => "glass",
            Surface::Metal { .. } => "metal",
            Surface::Dielectric { .. } => "dielectric",
            Surface::Emitter { .. } => "emitter",
            Surface::Diffuse => "diffuse",
            Surface::Plastic { .. } => "plastic",
        }
    }

    /// Liquid needs one continuous surface rather than stacked boxes.
    pub fn requires_mesh(&self) -> bool {
        matches!(self, Surface::Liquid)
    }

    /// Writes the category's properties onto a material node.
    pub fn apply(&self, scene: &mut Scene, node: NodeId) {
        scene.set(node, keys::TYPE, Property::Text(self.name().into()));
        match *self {
            Surface::Liquid => {
                scene.set(node, "depth", Property::Float(LIQUID_DEPTH));
                scene.set(node, "ior", Property::Float(LIQUID_IOR));
            }
            Surface::Glass { roughness } => {
                scene.set(node, "roughness", Property::Float(roughness));
                scene.set(node, "depth", Property::Float(GLASS_DEPTH));
            }
            Surface::Metal { roughness } | Surface::Plastic { roughness } => {
                scene.set(node, "roughness", Property::Float(roughness));
            }
            Surface::Dielectric { transmission } => {
                scene.set(node, "transmission", Property::Float(transmission));
            }
            Surface::Emitter { energy } => {
                scene.set(node, "energy", Property::Float(energy));
                scene.set(node, "unit", Property::Text("radiance".into()));
            }
            Surface::Diffuse => {}
        }
    }
}

pub fn srgb_to_linear(value: f64) -> f64 {
    if value <= 0.04045 {
        value / 12.92
    } else {
        ((value + 0.055) / 1.055).powf(2.4)
    }
}

/// Palette color as linear RGB plus untouched normalised alpha.
pub fn linear_color(color: Rgba) -> [f64; 4] {
    let channel = |c: u8| srgb_to_linear(f64::from(c) / 255.0);
    [
        channel(color.r),
        channel(color.g),
        channel(color.b),
        f64::from(color.a) / 255.0,
    ]
}
