//! Greedy surface extraction for one voxel bucket.
//!
//! Exposed voxel faces are collected per slice plane and orientation, and
//! coplanar faces with the same orientation are merged into maximal
//! rectangles. The result is a closed quad mesh in model coordinates, each
//! voxel spanning `[x, x + 1]` on every axis.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use glam::{DVec3, IVec3};

use crate::package::Voxel;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuadMesh {
    pub points: Vec<DVec3>,
    pub faces: Vec<[u32; 4]>,
}

/// Exposed face cells of one slice plane, as `(v, u)` so that iteration is
/// row-major.
type Slice = BTreeSet<(i32, i32)>;

pub fn greedy_mesh(voxels: &[Voxel]) -> QuadMesh {
    let filled: HashSet<IVec3> = voxels
        .iter()
        .map(|voxel| IVec3::new(voxel.x, voxel.y, voxel.z))
        .collect();
    let mut mesh = QuadMesh::default();

    for d in 0..3 {
        let u = (d + 1) % 3;
        let v = (d + 2) % 3;

        // Keyed by (plane, facing +d). Only occupied cells are visited, so
        // the cost follows the voxel count, not the bucket's extent.
        let mut slices: BTreeMap<(i32, bool), Slice> = BTreeMap::new();
        for &p in &filled {
            for (step, positive) in [(1, true), (-1, false)] {
                let mut neighbour = p;
                neighbour[d] += step;
                if filled.contains(&neighbour) {
                    continue;
                }
                let plane = if positive { p[d] + 1 } else { p[d] };
                slices
                    .entry((plane, positive))
                    .or_default()
                    .insert((p[v], p[u]));
            }
        }

        for ((plane, positive), cells) in slices {
            merge_slice(cells, |i, j, w, h| {
                let mut base = IVec3::ZERO;
                base[d] = plane;
                base[u] = i;
                base[v] = j;
                let mut du = IVec3::ZERO;
                du[u] = w;
                let mut dv = IVec3::ZERO;
                dv[v] = h;
                push_quad(&mut mesh, base, du, dv, positive);
            });
        }
    }
    mesh
}

/// Consumes a slice row by row, emitting maximal rectangles as
/// `(u, v, width, height)`.
fn merge_slice(mut cells: Slice, mut emit: impl FnMut(i32, i32, i32, i32)) {
    while let Some((j, i)) = cells.pop_first() {
        let mut w = 1;
        while cells.remove(&(j, i + w)) {
            w += 1;
        }
        let mut h = 1;
        while (0..w).all(|k| cells.contains(&(j + h, i + k))) {
            for k in 0..w {
                cells.remove(&(j + h, i + k));
            }
            h += 1;
        }
        emit(i, j, w, h);
    }
}

fn push_quad(mesh: &mut QuadMesh, base: IVec3, du: IVec3, dv: IVec3, facing_positive: bool) {
    let first = mesh.points.len() as u32;
    mesh.points.push(base.as_dvec3());
    mesh.points.push((base + du).as_dvec3());
    mesh.points.push((base + du + dv).as_dvec3());
    mesh.points.push((base + dv).as_dvec3());
    mesh.faces.push(if facing_positive {
        [first, first + 1, first + 2, first + 3]
    } else {
        [first, first + 3, first + 2, first + 1]
    });
}
