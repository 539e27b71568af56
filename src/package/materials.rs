use std::path::{Path, PathBuf};

use plist::Value;

use super::model::{Material, MATERIAL_SLOTS};
use crate::error::PackageError;

/// Material settings live next to the palette: `paletteN.png` ->
/// `paletteN.settings.vmaxpsb`.
pub fn settings_path(palette: &Path) -> PathBuf {
    let name = palette
        .file_name()
        .map(|name| name.to_string_lossy().replace(".png", ".settings.vmaxpsb"))
        .unwrap_or_default();
    palette.with_file_name(name)
}

pub fn read_materials(path: &Path) -> Result<[Material; MATERIAL_SLOTS], PackageError> {
    if !path.is_file() {
        return Err(PackageError::MissingMaterials(path.to_path_buf()));
    }

    let invalid = |reason: String| PackageError::Materials {
        path: path.to_path_buf(),
        reason,
    };

    let root = Value::from_file(path).map_err(|e| invalid(e.to_string()))?;
    let entries = root
        .as_dictionary()
        .and_then(|dict| dict.get("materials"))
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("missing materials array".into()))?;

    let mut materials = [Material::default(); MATERIAL_SLOTS];
    for (slot, entry) in materials.iter_mut().zip(entries) {
        let Some(dict) = entry.as_dictionary() else {
            return Err(invalid("material entry is not a dictionary".into()));
        };
        let field = |key: &str| dict.get(key).and_then(number).unwrap_or(0.0) as f32;
        *slot = Material {
            roughness: field("rough"),
            metalness: field("metal"),
            transmission: field("tc"),
            emission: field("emission"),
        };
    }
    Ok(materials)
}

fn number(value: &Value) -> Option<f64> {
    value
        .as_real()
        .or_else(|| value.as_signed_integer().map(|i| i as f64))
}
