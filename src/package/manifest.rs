//! `scene.json`: the group hierarchy and model placements.

use std::fs;
use std::path::Path;

use glam::{DQuat, DVec3};
use serde::Deserialize;

use super::model::Transform;
use crate::error::PackageError;

#[derive(Debug, Deserialize)]
pub struct SceneManifest {
    #[serde(default)]
    pub groups: Vec<GroupEntry>,
    #[serde(default)]
    pub objects: Vec<ObjectEntry>,
}

#[derive(Debug, Deserialize)]
pub struct GroupEntry {
    pub id: String,
    #[serde(default)]
    pub pid: Option<String>,
    #[serde(flatten)]
    pub transform: TransformEntry,
}

#[derive(Debug, Deserialize)]
pub struct ObjectEntry {
    pub id: String,
    #[serde(default)]
    pub pid: Option<String>,
    /// Content blob file, e.g. `contents1.vmaxb`.
    pub data: String,
    /// Palette image, e.g. `palette1.png`.
    pub pal: String,
    #[serde(flatten)]
    pub transform: TransformEntry,
}

#[derive(Debug, Deserialize)]
pub struct TransformEntry {
    #[serde(rename = "t_p", default = "zero")]
    pub position: [f64; 3],
    /// Quaternion as `[x, y, z, w]`.
    #[serde(rename = "t_r", default = "identity")]
    pub rotation: [f64; 4],
    #[serde(rename = "t_s", default = "one")]
    pub scale: [f64; 3],
}

fn zero() -> [f64; 3] {
    [0.0; 3]
}

fn identity() -> [f64; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

fn one() -> [f64; 3] {
    [1.0; 3]
}

impl From<&TransformEntry> for Transform {
    fn from(entry: &TransformEntry) -> Self {
        let [x, y, z, w] = entry.rotation;
        let rotation = DQuat::from_xyzw(x, y, z, w);
        let rotation = if rotation.length_squared() > 0.0 {
            rotation.normalize()
        } else {
            DQuat::IDENTITY
        };
        Transform {
            position: DVec3::from_array(entry.position),
            rotation,
            scale: DVec3::from_array(entry.scale),
        }
    }
}

/// Treats an empty parent id as "no parent".
pub fn parent_id(pid: &Option<String>) -> Option<String> {
    pid.as_ref().filter(|pid| !pid.is_empty()).cloned()
}

pub fn read_manifest(path: &Path) -> Result<SceneManifest, PackageError> {
    if !path.is_file() {
        return Err(PackageError::MissingManifest(path.to_path_buf()));
    }
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
