//! Turns a parsed package into a scene graph.
//!
//! Groups come first, then one canonical model per unique content, then one
//! instance per placement referencing its canonical model.

use std::collections::BTreeMap;

use glam::{DMat4, DVec3};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::graph::{keys, NodeId, NodeKind, Property, Scene};
use super::material::{classify, linear_color};
use super::mesh::greedy_mesh;
use crate::cancel::checkpoint;
use crate::error::JobError;
use crate::package::{ContentId, ModelContent, ParsedPackage};

/// Shared unit cube placed by every instancer.
pub const VOXEL_BOX: &str = "voxel_box";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum MeshMode {
    /// Instanced boxes, merged meshes only where the material needs them.
    #[default]
    Boxes,
    /// Merged meshes for every bucket.
    Mesh,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub groups: usize,
    pub canonical_models: usize,
    pub instances: usize,
    pub box_buckets: usize,
    pub mesh_buckets: usize,
}

/// Scene node name for a package id: `obj-1` becomes `_obj_1`.
pub fn node_name(id: &str) -> String {
    format!("_{}", id.replace('-', "_"))
}

pub fn build_scene(
    package: &ParsedPackage,
    mode: MeshMode,
    cancel: &CancellationToken,
) -> Result<(Scene, BuildReport), JobError> {
    let mut builder = SceneBuilder {
        scene: Scene::new(),
        report: BuildReport::default(),
        mode,
        cancel,
        voxel_box: None,
    };

    let groups = builder.add_groups(package);
    let canonical = builder.add_canonical_models(package)?;
    builder.add_instances(package, &groups, &canonical)?;

    info!(
        groups = builder.report.groups,
        models = builder.report.canonical_models,
        instances = builder.report.instances,
        "Scene built"
    );
    Ok((builder.scene, builder.report))
}

struct SceneBuilder<'a> {
    scene: Scene,
    report: BuildReport,
    mode: MeshMode,
    cancel: &'a CancellationToken,
    voxel_box: Option<NodeId>,
}

impl SceneBuilder<'_> {
    fn add_groups(&mut self, package: &ParsedPackage) -> BTreeMap<String, NodeId> {
        let mut groups = BTreeMap::new();
        for group in &package.groups {
            let node = self
                .scene
                .create_node(NodeKind::Transform, &node_name(&group.id));
            self.scene
                .set(node, keys::MATRIX, Property::Matrix(group.transform.matrix()));
            groups.insert(group.id.clone(), node);
        }

        // Parents may be listed after their children.
        let world = self.scene.world();
        for group in &package.groups {
            let node = groups[&group.id];
            let parent = match &group.parent_id {
                Some(pid) => groups.get(pid).copied().unwrap_or_else(|| {
                    warn!(group = %group.id, parent = %pid, "Unknown parent group, attaching to world");
                    world
                }),
                None => world,
            };
            self.scene.parent_to(node, parent);
        }

        self.report.groups = groups.len();
        groups
    }

    fn add_canonical_models(
        &mut self,
        package: &ParsedPackage,
    ) -> Result<BTreeMap<ContentId, NodeId>, JobError> {
        let mut canonical = BTreeMap::new();
        for (content_id, content) in &package.models {
            checkpoint(self.cancel)?;
            let node = self.add_model(content_id, content);
            canonical.insert(content_id.clone(), node);
            self.report.canonical_models += 1;
        }
        Ok(canonical)
    }

    fn add_model(&mut self, content_id: &str, content: &ModelContent) -> NodeId {
        let name = node_name(content_id);
        let model_node = self.scene.create_node(NodeKind::Transform, &name);

        for (material, color) in content.model.used_materials_and_colors() {
            let voxels = content.model.voxels(material, color);
            let rgba = content.palette.color(color);
            let surface = classify(material, rgba.a, &content.materials[usize::from(material)]);
            let bucket = format!("{name}_m{material}_c{color}");

            let material_node = self
                .scene
                .create_node(NodeKind::Material, &format!("{bucket}_material"));
            self.scene
                .set(material_node, keys::COLOR, Property::Color(linear_color(rgba)));
            surface.apply(&mut self.scene, material_node);

            if surface.requires_mesh() || self.mode == MeshMode::Mesh {
                let mesh = greedy_mesh(voxels);
                let mesh_node = self.scene.create_node(NodeKind::Mesh, &bucket);
                self.scene.set(mesh_node, keys::POINTS, Property::Points(mesh.points));
                self.scene.set(mesh_node, keys::FACES, Property::Faces(mesh.faces));
                self.scene
                    .set(mesh_node, keys::MATERIAL, Property::Node(material_node));
                self.scene.parent_to(mesh_node, model_node);
                self.report.mesh_buckets += 1;
            } else {
                let instances = voxels
                    .iter()
                    .map(|v| {
                        DMat4::from_translation(
                            DVec3::new(f64::from(v.x), f64::from(v.y), f64::from(v.z)) + 0.5,
                        )
                    })
                    .collect();
                let instancer = self.scene.create_node(NodeKind::Instancer, &bucket);
                self.scene
                    .set(instancer, keys::INSTANCES, Property::Matrices(instances));
                self.scene
                    .set(instancer, keys::MATERIAL, Property::Node(material_node));
                let voxel_box = self.voxel_box();
                self.scene.parent_to(voxel_box, instancer);
                self.scene.parent_to(instancer, model_node);
                self.report.box_buckets += 1;
            }

            debug!(
                model = %content_id,
                material,
                color,
                voxels = voxels.len(),
                surface = surface.name(),
                "Added bucket"
            );
        }
        model_node
    }

    fn add_instances(
        &mut self,
        package: &ParsedPackage,
        groups: &BTreeMap<String, NodeId>,
        canonical: &BTreeMap<ContentId, NodeId>,
    ) -> Result<(), JobError> {
        let world = self.scene.world();
        for (content_id, placements) in &package.placements {
            let Some(&model_node) = canonical.get(content_id) else {
                warn!(model = %content_id, "Placement without parsed content, skipping");
                continue;
            };
            for placement in placements {
                checkpoint(self.cancel)?;
                let node = self
                    .scene
                    .create_node(NodeKind::Transform, &node_name(&placement.id));
                self.scene
                    .set(node, keys::MATRIX, Property::Matrix(placement.transform.matrix()));

                let parent = match &placement.parent_id {
                    Some(pid) => groups.get(pid).copied().unwrap_or_else(|| {
                        warn!(instance = %placement.id, parent = %pid, "Unknown parent group, attaching to world");
                        world
                    }),
                    None => world,
                };
                self.scene.parent_to(node, parent);
                self.scene.parent_to(model_node, node);
                self.report.instances += 1;
            }
        }
        Ok(())
    }

    fn voxel_box(&mut self) -> NodeId {
        if let Some(node) = self.voxel_box {
            return node;
        }
        let cube = greedy_mesh(&[crate::package::Voxel {
            x: 0,
            y: 0,
            z: 0,
            material: 0,
            color: 1,
        }]);
        let node = self.scene.create_node(NodeKind::Mesh, VOXEL_BOX);
        // Centered on the origin; instance matrices carry the +0.5 offset.
        let points = cube.points.into_iter().map(|p| p - 0.5).collect();
        self.scene.set(node, keys::POINTS, Property::Points(points));
        self.scene.set(node, keys::FACES, Property::Faces(cube.faces));
        self.voxel_box = Some(node);
        node
    }
}
