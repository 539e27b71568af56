//! Scene construction: node graph, material classification, meshing,
//! building from a parsed package and camera framing.

pub mod builder;
pub mod framing;
pub mod graph;
pub mod material;
pub mod mesh;

pub use builder::{build_scene, BuildReport, MeshMode};
pub use framing::{frame_scene, BoundingVolume};
pub use graph::{Camera, NodeId, NodeKind, OutputSettings, Property, Scene};
