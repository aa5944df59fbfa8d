//! Quadtree spatial index for broad-phase proximity queries
//!
//! Rebuilt from scratch every tick. Entries sit in the deepest node whose
//! rectangle fully contains their bounding box; entries straddling a quadrant
//! boundary stay at the ancestor. Queries return a conservative superset:
//! every entry whose bounding box touches the query region, so callers must
//! run their own exact circle test.

use rand::Rng;
use smallvec::SmallVec;

use crate::config::SpatialConfig;
use crate::game::constants::collision::{COINCIDENT_EPSILON, COINCIDENT_NUDGE};
use crate::game::constants::mass_to_radius;
use crate::game::state::CellId;
use crate::util::vec2::Vec2;

/// Initial node capacity (root + a few levels of subdivision)
const NODE_INITIAL_CAPACITY: usize = 256;

/// Initial capacity for per-node object lists
const NODE_OBJECTS_INITIAL_CAPACITY: usize = 8;

/// Errors raised by the spatial index
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpatialError {
    #[error("Invalid entity {id}: {reason}")]
    InvalidEntity { id: CellId, reason: &'static str },
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec2,
    pub max: Vec2,
}

impl Aabb {
    #[inline]
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    /// Box enclosing a circle
    #[inline]
    pub fn from_circle(center: Vec2, radius: f32) -> Self {
        let r = Vec2::new(radius, radius);
        Self {
            min: center - r,
            max: center + r,
        }
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.max.x - self.min.x
    }

    #[inline]
    pub fn height(&self) -> f32 {
        self.max.y - self.min.y
    }

    #[inline]
    pub fn center(&self) -> Vec2 {
        Vec2::new(
            (self.min.x + self.max.x) * 0.5,
            (self.min.y + self.max.y) * 0.5,
        )
    }

    /// `other` lies entirely inside this box (edges inclusive)
    #[inline]
    pub fn contains(&self, other: &Aabb) -> bool {
        other.min.x >= self.min.x
            && other.min.y >= self.min.y
            && other.max.x <= self.max.x
            && other.max.y <= self.max.y
    }

    /// Boxes overlap or touch
    #[inline]
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }

    /// Four equal quadrants: top-left, top-right, bottom-left, bottom-right
    pub fn quadrants(&self) -> [Aabb; 4] {
        let c = self.center();
        [
            Aabb::new(self.min, c),
            Aabb::new(Vec2::new(c.x, self.min.y), Vec2::new(self.max.x, c.y)),
            Aabb::new(Vec2::new(self.min.x, c.y), Vec2::new(c.x, self.max.y)),
            Aabb::new(c, self.max),
        ]
    }
}

/// Entity data stored in the index
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialEntry {
    pub id: CellId,
    pub position: Vec2,
    pub radius: f32,
}

impl SpatialEntry {
    /// Build an entry from a position and mass, rejecting non-finite
    /// positions and non-positive masses.
    pub fn new(id: CellId, position: Vec2, mass: f32) -> Result<Self, SpatialError> {
        if !position.is_finite() {
            return Err(SpatialError::InvalidEntity {
                id,
                reason: "position is not finite",
            });
        }
        if !(mass.is_finite() && mass > 0.0) {
            return Err(SpatialError::InvalidEntity {
                id,
                reason: "mass must be finite and positive",
            });
        }
        Ok(Self {
            id,
            position,
            radius: mass_to_radius(mass),
        })
    }

    fn validate(&self) -> Result<(), SpatialError> {
        if !self.position.is_finite() {
            return Err(SpatialError::InvalidEntity {
                id: self.id,
                reason: "position is not finite",
            });
        }
        if !(self.radius.is_finite() && self.radius > 0.0) {
            return Err(SpatialError::InvalidEntity {
                id: self.id,
                reason: "radius must be finite and positive",
            });
        }
        Ok(())
    }

    #[inline]
    pub fn bounds(&self) -> Aabb {
        Aabb::from_circle(self.position, self.radius)
    }
}

#[derive(Debug, Clone)]
struct Node {
    bounds: Aabb,
    depth: u8,
    objects: Vec<SpatialEntry>,
    /// Index of the first of four consecutive child nodes
    children: Option<u32>,
}

impl Node {
    fn new(bounds: Aabb, depth: u8) -> Self {
        Self {
            bounds,
            depth,
            objects: Vec::with_capacity(NODE_OBJECTS_INITIAL_CAPACITY),
            children: None,
        }
    }
}

/// Quadtree over the arena rectangle.
///
/// Nodes live in a flat arena (`nodes[0]` is the root, children are stored
/// as four consecutive slots), so `clear()` only truncates the arena.
#[derive(Debug, Clone)]
pub struct QuadTree {
    nodes: Vec<Node>,
    max_objects: usize,
    max_depth: u8,
    len: usize,
}

impl QuadTree {
    /// Create an empty tree covering `bounds`
    pub fn new(bounds: Aabb, max_objects: usize, max_depth: u8) -> Self {
        let mut nodes = Vec::with_capacity(NODE_INITIAL_CAPACITY);
        nodes.push(Node::new(bounds, 0));
        Self {
            nodes,
            max_objects: max_objects.max(1),
            max_depth,
            len: 0,
        }
    }

    pub fn with_config(bounds: Aabb, config: &SpatialConfig) -> Self {
        Self::new(bounds, config.max_objects, config.max_depth)
    }

    pub fn bounds(&self) -> Aabb {
        self.nodes[0].bounds
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drop every entry and all subdivisions. Calling it twice is the same as once.
    pub fn clear(&mut self) {
        self.nodes.truncate(1);
        let root = &mut self.nodes[0];
        root.objects.clear();
        root.children = None;
        self.len = 0;
    }

    /// Insert an entry into the deepest node that fully contains it
    pub fn insert(&mut self, entry: SpatialEntry) -> Result<(), SpatialError> {
        entry.validate()?;
        self.insert_at(0, entry);
        self.len += 1;
        Ok(())
    }

    /// Clear and reinsert everything. Stops at the first invalid entry.
    pub fn rebuild(&mut self, entries: impl IntoIterator<Item = SpatialEntry>) -> Result<(), SpatialError> {
        self.clear();
        for entry in entries {
            self.insert(entry)?;
        }
        Ok(())
    }

    fn insert_at(&mut self, mut node_idx: usize, entry: SpatialEntry) {
        let bounds = entry.bounds();
        loop {
            if let Some(first) = self.nodes[node_idx].children {
                match self.child_containing(first, &bounds) {
                    Some(child) => {
                        node_idx = child;
                        continue;
                    }
                    None => {
                        self.nodes[node_idx].objects.push(entry);
                        return;
                    }
                }
            }

            let node = &mut self.nodes[node_idx];
            node.objects.push(entry);
            if node.objects.len() > self.max_objects && node.depth < self.max_depth {
                self.subdivide(node_idx);
            }
            return;
        }
    }

    fn child_containing(&self, first: u32, bounds: &Aabb) -> Option<usize> {
        let first = first as usize;
        (first..first + 4).find(|&child| self.nodes[child].bounds.contains(bounds))
    }

    /// Split a leaf into four quadrants and push down every object that fits
    /// a child exactly; the rest stay on this node.
    fn subdivide(&mut self, node_idx: usize) {
        let quadrants = self.nodes[node_idx].bounds.quadrants();
        let depth = self.nodes[node_idx].depth + 1;
        let first = self.nodes.len() as u32;
        for quadrant in quadrants {
            self.nodes.push(Node::new(quadrant, depth));
        }
        self.nodes[node_idx].children = Some(first);

        let objects = std::mem::take(&mut self.nodes[node_idx].objects);
        for entry in objects {
            match self.child_containing(first, &entry.bounds()) {
                Some(child) => self.insert_at(child, entry),
                None => self.nodes[node_idx].objects.push(entry),
            }
        }
    }

    /// Visit every entry whose bounding box touches `region`.
    ///
    /// The root's own list is always scanned, since entries outside the
    /// tree bounds are parked there.
    pub fn for_each_in_rect<F>(&self, region: &Aabb, mut f: F)
    where
        F: FnMut(&SpatialEntry),
    {
        let mut stack: SmallVec<[usize; 64]> = SmallVec::new();
        stack.push(0);

        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            for entry in &node.objects {
                if entry.bounds().intersects(region) {
                    f(entry);
                }
            }
            if let Some(first) = node.children {
                let first = first as usize;
                for child in first..first + 4 {
                    if self.nodes[child].bounds.intersects(region) {
                        stack.push(child);
                    }
                }
            }
        }
    }

    /// Collect candidates for a rectangular region into `out`
    pub fn query_rect(&self, region: &Aabb, out: &mut Vec<SpatialEntry>) {
        self.for_each_in_rect(region, |entry| out.push(*entry));
    }

    /// Collect candidates that may touch the given circle into `out`
    pub fn query_circle(&self, center: Vec2, radius: f32, out: &mut Vec<SpatialEntry>) {
        self.query_rect(&Aabb::from_circle(center, radius), out);
    }

    /// Collect candidates that may touch `entry`, excluding the entry itself
    pub fn query_entry(&self, entry: &SpatialEntry, out: &mut Vec<SpatialEntry>) {
        let id = entry.id;
        self.for_each_in_rect(&entry.bounds(), |candidate| {
            if candidate.id != id {
                out.push(*candidate);
            }
        });
    }

    /// Get statistics about the tree
    pub fn stats(&self) -> QuadTreeStats {
        QuadTreeStats {
            node_count: self.nodes.len(),
            total_entries: self.nodes.iter().map(|n| n.objects.len()).sum(),
            max_depth: self.nodes.iter().map(|n| n.depth).max().unwrap_or(0),
            max_per_node: self.nodes.iter().map(|n| n.objects.len()).max().unwrap_or(0),
        }
    }

    #[cfg(test)]
    fn depth_of(&self, id: CellId) -> Option<u8> {
        self.nodes
            .iter()
            .find(|n| n.objects.iter().any(|e| e.id == id))
            .map(|n| n.depth)
    }
}

/// Statistics about the quadtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuadTreeStats {
    pub node_count: usize,
    pub total_entries: usize,
    pub max_depth: u8,
    pub max_per_node: usize,
}

/// Centers too close to derive a separation normal from
#[inline]
pub fn is_coincident(a: Vec2, b: Vec2) -> bool {
    a.distance_sq_to(b) < COINCIDENT_EPSILON * COINCIDENT_EPSILON
}

/// Small random offset used to pull apart coincident centers
pub fn coincident_nudge<R: Rng + ?Sized>(rng: &mut R) -> Vec2 {
    Vec2::random_unit(rng) * COINCIDENT_NUDGE
}
