//! Renderer-agnostic node graph.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. A node may
//! have several parents, which is how one canonical model is shared by every
//! instance that places it.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use glam::{DMat4, DVec3};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Transform,
    Instancer,
    Mesh,
    Material,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Property {
    Float(f64),
    Int(i64),
    Text(String),
    Color([f64; 4]),
    Matrix(DMat4),
    Matrices(Vec<DMat4>),
    Points(Vec<DVec3>),
    Faces(Vec<[u32; 4]>),
    Node(NodeId),
}

#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub kind: NodeKind,
    pub name: String,
    pub props: BTreeMap<String, Property>,
    pub children: Vec<NodeId>,
    pub parents: Vec<NodeId>,
}

impl Node {
    pub fn get(&self, key: &str) -> Option<&Property> {
        self.props.get(key)
    }

    /// The node's own transform, identity when unset.
    pub fn matrix(&self) -> DMat4 {
        match self.props.get(keys::MATRIX) {
            Some(Property::Matrix(matrix)) => *matrix,
            _ => DMat4::IDENTITY,
        }
    }
}

/// Property keys shared by the builder and renderers.
pub mod keys {
    pub const MATRIX: &str = "matrix";
    pub const INSTANCES: &str = "instances";
    pub const MATERIAL: &str = "material";
    pub const POINTS: &str = "points";
    pub const FACES: &str = "faces";
    pub const TYPE: &str = "type";
    pub const COLOR: &str = "color";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Camera {
    pub target: DVec3,
    pub distance: f64,
    /// Degrees around the vertical (z) axis, 0 looking along +y.
    pub azimuth: f64,
    pub elevation: f64,
    pub fov: f64,
    pub resolution: [u32; 2],
}

pub const DEFAULT_FOV: f64 = 35.0;
pub const DEFAULT_RESOLUTION: [u32; 2] = [1024, 1024];
const MIN_FRAMING_RADIUS: f64 = 0.5;

impl Default for Camera {
    fn default() -> Self {
        Self {
            target: DVec3::ZERO,
            distance: 10.0,
            azimuth: 0.0,
            elevation: 0.0,
            fov: DEFAULT_FOV,
            resolution: DEFAULT_RESOLUTION,
        }
    }
}

impl Camera {
    /// Aims at `center` from far enough away that a sphere of `radius`
    /// fills the vertical field of view.
    pub fn zoom_extents(&mut self, center: DVec3, radius: f64) {
        let radius = radius.max(MIN_FRAMING_RADIUS);
        self.target = center;
        self.distance = radius / (self.fov.to_radians() / 2.0).sin();
        self.azimuth = 0.0;
        self.elevation = 0.0;
    }

    pub fn set_orbit(&mut self, azimuth: f64, elevation: f64) {
        self.azimuth = azimuth;
        self.elevation = elevation;
    }

    pub fn eye(&self) -> DVec3 {
        let (azimuth, elevation) = (self.azimuth.to_radians(), self.elevation.to_radians());
        self.target
            + self.distance
                * DVec3::new(
                    elevation.cos() * azimuth.sin(),
                    -elevation.cos() * azimuth.cos(),
                    elevation.sin(),
                )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputSettings {
    pub directory: PathBuf,
    pub name: String,
    pub extension: String,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            name: "render".into(),
            extension: ".jpg".into(),
        }
    }
}

impl OutputSettings {
    pub fn path(&self) -> PathBuf {
        self.directory.join(format!("{}{}", self.name, self.extension))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Scene {
    nodes: Vec<Node>,
    #[serde(skip)]
    names: HashMap<String, NodeId>,
    world: NodeId,
    pub camera: Camera,
    pub output: OutputSettings,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    pub const WORLD: &'static str = "world";

    pub fn new() -> Self {
        let mut scene = Self {
            nodes: Vec::new(),
            names: HashMap::new(),
            world: NodeId(0),
            camera: Camera::default(),
            output: OutputSettings::default(),
        };
        scene.world = scene.create_node(NodeKind::Transform, Self::WORLD);
        scene
    }

    pub fn world(&self) -> NodeId {
        self.world
    }

    /// Adds a node. Names are unique; a clash gets a numeric suffix.
    pub fn create_node(&mut self, kind: NodeKind, name: &str) -> NodeId {
        let mut unique = name.to_string();
        let mut n = 1;
        while self.names.contains_key(&unique) {
            n += 1;
            unique = format!("{name}_{n}");
        }

        let id = NodeId(self.nodes.len());
        self.names.insert(unique.clone(), id);
        self.nodes.push(Node {
            kind,
            name: unique,
            props: BTreeMap::new(),
            children: Vec::new(),
            parents: Vec::new(),
        });
        id
    }

    pub fn set(&mut self, node: NodeId, key: &str, value: Property) {
        self.nodes[node.0].props.insert(key.to_string(), value);
    }

    pub fn parent_to(&mut self, child: NodeId, parent: NodeId) {
        if self.nodes[parent.0].children.contains(&child) {
            return;
        }
        self.nodes[parent.0].children.push(child);
        self.nodes[child.0].parents.push(parent);
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes_of_kind(&self, kind: NodeKind) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, node)| node.kind == kind)
            .map(|(index, _)| NodeId(index))
    }

    /// Walks every path from the world to each node, handing the node and
    /// its accumulated world matrix to `visit`. Shared nodes are visited
    /// once per path.
    pub fn walk(&self, mut visit: impl FnMut(NodeId, &Node, DMat4)) {
        let mut stack = vec![(self.world, DMat4::IDENTITY)];
        while let Some((id, parent_matrix)) = stack.pop() {
            let node = self.node(id);
            let matrix = parent_matrix * node.matrix();
            visit(id, node, matrix);
            for &child in node.children.iter().rev() {
                stack.push((child, matrix));
            }
        }
    }

    /// World-space translation of every instance of every instancer.
    pub fn instance_positions(&self) -> Vec<DVec3> {
        let mut positions = Vec::new();
        self.walk(|_, node, matrix| {
            if node.kind != NodeKind::Instancer {
                return;
            }
            if let Some(Property::Matrices(instances)) = node.get(keys::INSTANCES) {
                positions.extend(
                    instances
                        .iter()
                        .map(|instance| (matrix * *instance).w_axis.truncate()),
                );
            }
        });
        positions
    }

    /// World-space vertices of every merged mesh.
    pub fn mesh_points(&self) -> Vec<DVec3> {
        let mut points = Vec::new();
        self.walk(|_, node, matrix| {
            if node.kind != NodeKind::Mesh {
                return;
            }
            // Shared unit boxes hang under instancers and are framed there.
            if node
                .parents
                .iter()
                .any(|&parent| self.node(parent).kind == NodeKind::Instancer)
            {
                return;
            }
            if let Some(Property::Points(local)) = node.get(keys::POINTS) {
                points.extend(local.iter().map(|&point| matrix.transform_point3(point)));
            }
        });
        points
    }
}
