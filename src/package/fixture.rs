//! Writes small scene packages to disk for tests.

use std::fs;
use std::path::Path;

use plist::{Dictionary, Value};
use serde_json::json;

/// One model file set: content blob, palette and material settings.
pub(crate) struct ModelFiles {
    pub data: &'static str,
    pub pal: &'static str,
    /// `[material, color]` pairs starting at Morton code 0.
    pub run: Vec<u8>,
    /// `(rough, metal, tc, emission)` per slot.
    pub materials: Vec<(f64, f64, f64, f64)>,
    /// Alpha of every palette entry.
    pub alpha: u8,
}

pub(crate) struct PackageFixture {
    pub manifest: serde_json::Value,
    pub models: Vec<ModelFiles>,
}

impl PackageFixture {
    /// One group, and one model placed twice: inside the group at the
    /// origin, and at the root shifted along x.
    pub fn two_placements_of_one_model() -> Self {
        Self {
            manifest: json!({
                "groups": [{"id": "group-1", "t_p": [0, 0, 0]}],
                "objects": [
                    {"id": "obj-1", "pid": "group-1", "data": "contents1.vmaxb", "pal": "palette1.png"},
                    {"id": "obj-2", "data": "contents1.vmaxb", "pal": "palette1.png", "t_p": [10, 0, 0]},
                ]
            }),
            models: vec![ModelFiles::default_model("contents1.vmaxb", "palette1.png")],
        }
    }

    pub fn write(&self, root: &Path) {
        fs::create_dir_all(root).unwrap();
        fs::write(
            root.join(super::MANIFEST_FILE),
            serde_json::to_vec(&self.manifest).unwrap(),
        )
        .unwrap();
        for model in &self.models {
            model.write(root);
        }
    }
}

impl ModelFiles {
    /// Voxels at (0,0,0) and (1,0,0) in slot 0 color 1, and (0,1,0) in
    /// slot 6 color 2.
    pub fn default_model(data: &'static str, pal: &'static str) -> Self {
        Self {
            data,
            pal,
            run: vec![0, 1, 0, 1, 6, 2],
            materials: vec![(0.5, 0.0, 0.0, 0.0); super::MATERIAL_SLOTS],
            alpha: 255,
        }
    }

    fn write(&self, root: &Path) {
        let alpha = self.alpha;
        image::RgbaImage::from_fn(256, 1, |x, _| image::Rgba([x as u8, 128, 255, alpha]))
            .save(root.join(self.pal))
            .unwrap();

        let materials = self
            .materials
            .iter()
            .map(|&(rough, metal, tc, emission)| {
                let mut dict = Dictionary::new();
                dict.insert("rough".into(), Value::Real(rough));
                dict.insert("metal".into(), Value::Real(metal));
                dict.insert("tc".into(), Value::Real(tc));
                dict.insert("emission".into(), Value::Real(emission));
                Value::Dictionary(dict)
            })
            .collect();
        let mut settings = Dictionary::new();
        settings.insert("materials".into(), Value::Array(materials));
        let settings_file = self.pal.replace(".png", ".settings.vmaxpsb");
        Value::Dictionary(settings)
            .to_file_binary(root.join(settings_file))
            .unwrap();

        let mut id = Dictionary::new();
        id.insert("c".into(), Value::Integer(0_u64.into()));
        let mut body = Dictionary::new();
        body.insert("id".into(), Value::Dictionary(id));
        body.insert("lc".into(), Value::Integer(0_u64.into()));
        body.insert("ds".into(), Value::Data(self.run.clone()));
        let mut snapshot = Dictionary::new();
        snapshot.insert("s".into(), Value::Dictionary(body));
        let mut blob = Dictionary::new();
        blob.insert(
            "snapshots".into(),
            Value::Array(vec![Value::Dictionary(snapshot)]),
        );
        Value::Dictionary(blob)
            .to_file_binary(root.join(self.data))
            .unwrap();
    }
}
