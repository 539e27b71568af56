//! Scene package parsing.
//!
//! A package directory holds `scene.json` plus, per referenced model, a
//! palette image, its material settings and a content blob. Parsing either
//! yields every group, placement and unique model, or fails as a whole.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cancel::checkpoint;
use crate::error::{JobError, PackageError};

pub mod contents;
pub mod manifest;
pub mod materials;
pub mod model;
pub mod palette;

#[cfg(test)]
pub(crate) mod fixture;

pub use model::{Material, Palette, Rgba, Transform, Voxel, VoxelModel, MATERIAL_SLOTS};

pub const MANIFEST_FILE: &str = "scene.json";
const CONTENT_SUFFIX: &str = ".vmaxb";

/// Identity of a unique model content, e.g. `contents1`.
pub type ContentId = String;

#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub id: String,
    pub parent_id: Option<String>,
    pub transform: Transform,
}

/// One occurrence of a model in the scene.
#[derive(Debug, Clone)]
pub struct Placement {
    pub id: String,
    pub content_id: ContentId,
    pub parent_id: Option<String>,
    pub transform: Transform,
    pub data_file: String,
    pub palette_file: String,
}

#[derive(Debug, Clone)]
pub struct ModelContent {
    pub model: VoxelModel,
    pub palette: Palette,
    pub materials: [Material; MATERIAL_SLOTS],
}

#[derive(Debug, Clone, Default)]
pub struct ParsedPackage {
    pub groups: Vec<GroupInfo>,
    pub placements: BTreeMap<ContentId, Vec<Placement>>,
    pub models: BTreeMap<ContentId, ModelContent>,
}

impl ParsedPackage {
    pub fn placement_count(&self) -> usize {
        self.placements.values().map(Vec::len).sum()
    }
}

pub fn content_id(data_file: &str) -> ContentId {
    data_file
        .strip_suffix(CONTENT_SUFFIX)
        .unwrap_or(data_file)
        .to_string()
}

/// Parses a package directory. Checks `cancel` before each unique model.
pub fn parse_package(root: &Path, cancel: &CancellationToken) -> Result<ParsedPackage, JobError> {
    let manifest = manifest::read_manifest(&root.join(MANIFEST_FILE))?;

    let groups = manifest
        .groups
        .iter()
        .map(|group| GroupInfo {
            id: group.id.clone(),
            parent_id: manifest::parent_id(&group.pid),
            transform: Transform::from(&group.transform),
        })
        .collect();

    let mut placements: BTreeMap<ContentId, Vec<Placement>> = BTreeMap::new();
    for object in &manifest.objects {
        let content_id = content_id(&object.data);
        placements
            .entry(content_id.clone())
            .or_default()
            .push(Placement {
                id: object.id.clone(),
                content_id,
                parent_id: manifest::parent_id(&object.pid),
                transform: Transform::from(&object.transform),
                data_file: object.data.clone(),
                palette_file: object.pal.clone(),
            });
    }

    info!(unique_models = placements.len(), "Processing unique models");

    let mut models = BTreeMap::new();
    for (content_id, list) in &placements {
        checkpoint(cancel)?;

        let first = &list[0];
        let palette_path = resolve(root, &first.palette_file)?;
        let palette = palette::read_palette(&palette_path)?;
        let materials = materials::read_materials(&materials::settings_path(&palette_path))?;
        let model = contents::read_content(&resolve(root, &first.data_file)?, content_id)?;

        debug!(
            model = %content_id,
            voxels = model.total_voxel_count(),
            placements = list.len(),
            "Parsed model"
        );
        models.insert(
            content_id.clone(),
            ModelContent {
                model,
                palette,
                materials,
            },
        );
    }

    Ok(ParsedPackage {
        groups,
        placements,
        models,
    })
}

/// Joins a manifest-relative file name, refusing to leave the package.
fn resolve(root: &Path, name: &str) -> Result<PathBuf, PackageError> {
    let relative = Path::new(name);
    if !relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
    {
        return Err(PackageError::UnsafePath(name.to_string()));
    }
    Ok(root.join(relative))
}
