//! Content blobs: snapshot lists of Morton-delta encoded voxel runs.
//!
//! A blob is a property list, LZFSE-compressed when it starts with a `bvx`
//! block magic. Each snapshot carries a chunk id, a locality code and a run
//! of `[material, color]` byte pairs; pair `k` is the voxel at Morton code
//! `locality + k`.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use plist::Value;
use tracing::trace;

use super::model::{Voxel, VoxelModel, MATERIAL_SLOTS};
use crate::error::PackageError;

const LZFSE_MAGIC: &[u8] = b"bvx";

#[derive(Debug)]
struct Snapshot<'a> {
    chunk_id: u64,
    locality: u64,
    data: &'a [u8],
}

pub fn read_content(path: &Path, name: &str) -> Result<VoxelModel, PackageError> {
    let invalid = |reason: String| PackageError::Content {
        path: path.to_path_buf(),
        reason,
    };

    let raw = fs::read(path).map_err(|e| invalid(e.to_string()))?;
    let bytes = if raw.starts_with(LZFSE_MAGIC) {
        let mut decoded = Vec::new();
        lzfse_rust::decode_bytes(&raw, &mut decoded).map_err(|e| invalid(e.to_string()))?;
        decoded
    } else {
        raw
    };

    let root = Value::from_reader(Cursor::new(bytes)).map_err(|e| invalid(e.to_string()))?;
    let snapshots = root
        .as_dictionary()
        .and_then(|dict| dict.get("snapshots"))
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("missing snapshots array".into()))?;

    let mut model = VoxelModel::new(name);
    for value in snapshots {
        let snapshot = snapshot(value).map_err(invalid)?;
        trace!(
            chunk = snapshot.chunk_id,
            locality = snapshot.locality,
            bytes = snapshot.data.len(),
            "Decoding snapshot"
        );
        for voxel in decode_run(snapshot.locality, snapshot.data).map_err(invalid)? {
            model.add_voxel(voxel);
        }
    }
    Ok(model)
}

fn snapshot(value: &Value) -> Result<Snapshot<'_>, String> {
    let body = value
        .as_dictionary()
        .and_then(|dict| dict.get("s"))
        .and_then(Value::as_dictionary)
        .ok_or("snapshot without body")?;

    let chunk_id = body
        .get("id")
        .and_then(Value::as_dictionary)
        .and_then(|id| id.get("c"))
        .and_then(Value::as_unsigned_integer)
        .ok_or("snapshot without chunk id")?;
    let locality = body
        .get("lc")
        .and_then(Value::as_unsigned_integer)
        .ok_or("snapshot without locality code")?;
    let data = body
        .get("ds")
        .and_then(Value::as_data)
        .ok_or("snapshot without voxel data")?;

    Ok(Snapshot {
        chunk_id,
        locality,
        data,
    })
}

/// Expands one voxel run. Color 0 records are gaps.
pub fn decode_run(locality: u64, data: &[u8]) -> Result<Vec<Voxel>, String> {
    if data.len() % 2 != 0 {
        return Err(format!("odd voxel run length {}", data.len()));
    }

    let mut voxels = Vec::new();
    for (offset, record) in data.chunks_exact(2).enumerate() {
        let (material, color) = (record[0], record[1]);
        if color == 0 {
            continue;
        }
        if usize::from(material) >= MATERIAL_SLOTS {
            return Err(format!("material index {material} out of range"));
        }
        let code = locality
            .checked_add(offset as u64)
            .ok_or_else(|| format!("locality {locality} + {offset} overflows"))?;
        let (x, y, z) = morton_decode(code);
        let coord = |c: u32| i32::try_from(c).map_err(|_| format!("coordinate {c} out of range"));
        voxels.push(Voxel {
            x: coord(x)?,
            y: coord(y)?,
            z: coord(z)?,
            material,
            color,
        });
    }
    Ok(voxels)
}

/// Splits a 3-D Morton code (x in bit 0 of each triple) into coordinates.
pub fn morton_decode(code: u64) -> (u32, u32, u32) {
    (compact(code), compact(code >> 1), compact(code >> 2))
}

pub fn morton_encode(x: u32, y: u32, z: u32) -> u64 {
    spread(x) | spread(y) << 1 | spread(z) << 2
}

fn compact(code: u64) -> u32 {
    let mut v = code & 0x1249_2492_4924_9249;
    v = (v ^ (v >> 2)) & 0x10c3_0c30_c30c_30c3;
    v = (v ^ (v >> 4)) & 0x100f_00f0_0f00_f00f;
    v = (v ^ (v >> 8)) & 0x001f_0000_ff00_00ff;
    v = (v ^ (v >> 16)) & 0x001f_0000_0000_ffff;
    v = (v ^ (v >> 32)) & 0x001f_ffff;
    v as u32
}

fn spread(value: u32) -> u64 {
    let mut v = u64::from(value) & 0x001f_ffff;
    v = (v | v << 32) & 0x001f_0000_0000_ffff;
    v = (v | v << 16) & 0x001f_0000_ff00_00ff;
    v = (v | v << 8) & 0x100f_00f0_0f00_f00f;
    v = (v | v << 4) & 0x10c3_0c30_c30c_30c3;
    v = (v | v << 2) & 0x1249_2492_4924_9249;
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use plist::Dictionary;

    fn snapshot_value(chunk: u64, locality: u64, data: Vec<u8>) -> Value {
        let mut id = Dictionary::new();
        id.insert("c".into(), Value::Integer(chunk.into()));
        let mut body = Dictionary::new();
        body.insert("id".into(), Value::Dictionary(id));
        body.insert("lc".into(), Value::Integer(locality.into()));
        body.insert("ds".into(), Value::Data(data));
        let mut snapshot = Dictionary::new();
        snapshot.insert("s".into(), Value::Dictionary(body));
        Value::Dictionary(snapshot)
    }

    fn write_blob(path: &Path, snapshots: Vec<Value>) {
        let mut root = Dictionary::new();
        root.insert("snapshots".into(), Value::Array(snapshots));
        Value::Dictionary(root).to_file_binary(path).unwrap();
    }

    #[test]
    fn morton_codes_interleave_x_first() {
        assert_eq!(morton_decode(0b001), (1, 0, 0));
        assert_eq!(morton_decode(0b010), (0, 1, 0));
        assert_eq!(morton_decode(0b100), (0, 0, 1));
        assert_eq!(morton_decode(morton_encode(200, 17, 255)), (200, 17, 255));
    }

    #[test]
    fn run_offsets_are_relative_to_locality() {
        let base = morton_encode(32, 0, 0);
        let voxels = decode_run(base, &[0, 5, 0, 0, 3, 9]).unwrap();
        assert_eq!(voxels.len(), 2);
        assert_eq!((voxels[0].x, voxels[0].y, voxels[0].z), (32, 0, 0));
        let (x, y, z) = morton_decode(base + 2);
        assert_eq!((voxels[1].x, voxels[1].y, voxels[1].z), (x as i32, y as i32, z as i32));
        assert_eq!((voxels[1].material, voxels[1].color), (3, 9));
    }

    #[test]
    fn rejects_bad_runs() {
        assert!(decode_run(0, &[1, 2, 3]).is_err());
        assert!(decode_run(0, &[8, 1]).is_err());
    }

    #[test]
    fn locality_overflow_is_rejected() {
        assert!(decode_run(u64::MAX, &[0, 1, 0, 1]).is_err());

        // A lone record at the top code still decodes.
        let voxels = decode_run(u64::MAX, &[0, 1]).unwrap();
        let top = (1 << 21) - 1;
        assert_eq!((voxels[0].x, voxels[0].y, voxels[0].z), (top, top, top));
    }

    #[test]
    fn reads_all_snapshots_of_a_blob() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contents1.vmaxb");
        write_blob(
            &path,
            vec![
                snapshot_value(0, 0, vec![0, 1, 0, 1]),
                snapshot_value(1, morton_encode(0, 0, 32), vec![6, 2]),
            ],
        );

        let model = read_content(&path, "contents1").unwrap();
        assert_eq!(model.name(), "contents1");
        assert_eq!(model.total_voxel_count(), 3);
        assert_eq!(model.voxels(6, 2)[0].z, 32);
    }

    #[test]
    fn garbage_blob_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contents1.vmaxb");
        fs::write(&path, b"not a property list").unwrap();
        assert!(matches!(
            read_content(&path, "contents1"),
            Err(PackageError::Content { .. })
        ));
    }
}
