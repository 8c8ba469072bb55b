use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use tracing::debug;

/// Interleaved vertex layout for terrain tile meshes. Elevation is applied
/// in the vertex stage from the tile's heightfield texture, so the pooled
/// mesh itself is a flat unit grid.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, Pod, Zeroable)]
pub struct TerrainVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

/// A tile mesh shared by every resident tile with the same dimensions.
/// Reference counted; the pool keeps one strong reference for the life of
/// the process, tiles hold the rest.
pub struct SharedGeometry {
    pub size: u32,
    pub vertices: Vec<TerrainVertex>,
    pub indices: Vec<u32>,
    pub has_skirt: bool,
}

impl SharedGeometry {
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct GeometryKey {
    size: u32,
}

/// Produces and shares tile meshes keyed by vertex dimension. Sibling tiles
/// with identical shape reuse one vertex/index buffer. Entries are never
/// evicted; the set of distinct tile sizes is small and bounded.
pub struct GeometryPool {
    skirt_ratio: f32,
    cache: Mutex<HashMap<GeometryKey, Arc<SharedGeometry>>>,
}

impl GeometryPool {
    pub fn new(skirt_ratio: f32) -> Self {
        Self {
            skirt_ratio: skirt_ratio.max(0.0),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the shared mesh for the given tile dimension, building it on
    /// first use. The cache lock is held across construction so at most one
    /// mesh is ever built per distinct size.
    pub fn get_or_create(&self, tile_size: u32) -> Arc<SharedGeometry> {
        let size = tile_size.max(2);
        let key = GeometryKey { size };
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .entry(key)
            .or_insert_with(|| {
                debug!("building shared tile geometry for size {}", size);
                Arc::new(build_tile_mesh(size, self.skirt_ratio))
            })
            .clone()
    }

    /// Number of distinct meshes currently pooled.
    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds the unit-extent grid mesh for a tile of `size` vertices per side.
/// When `skirt_ratio` is positive, a ring of skirt vertices is extruded
/// downward by that fraction of the tile width to hide cracks between
/// neighboring levels of detail.
fn build_tile_mesh(size: u32, skirt_ratio: f32) -> SharedGeometry {
    let step = 1.0 / (size - 1) as f32;
    let mut vertices = Vec::with_capacity((size * size) as usize);

    for y in 0..size {
        for x in 0..size {
            let u = x as f32 * step;
            let v = y as f32 * step;
            vertices.push(TerrainVertex {
                position: [u, v, 0.0],
                normal: [0.0, 0.0, 1.0],
                uv: [u, v],
            });
        }
    }

    let quads = size - 1;
    let mut indices = Vec::with_capacity((quads * quads * 6) as usize);
    for y in 0..quads {
        for x in 0..quads {
            let i0 = y * size + x;
            let i1 = i0 + 1;
            let i2 = i0 + size;
            let i3 = i2 + 1;
            indices.extend_from_slice(&[i0, i2, i1, i1, i2, i3]);
        }
    }

    let has_skirt = skirt_ratio > 0.0;
    if has_skirt {
        append_skirt(&mut vertices, &mut indices, size, skirt_ratio);
    }

    SharedGeometry {
        size,
        vertices,
        indices,
        has_skirt,
    }
}

/// Walks the boundary ring counter-clockwise and drops a copy of each edge
/// vertex down by the skirt depth, stitching quads between the ring and its
/// lowered twin.
fn append_skirt(vertices: &mut Vec<TerrainVertex>, indices: &mut Vec<u32>, size: u32, ratio: f32) {
    let ring = boundary_ring(size);
    let depth = -ratio;
    let base = vertices.len() as u32;

    for &surface in &ring {
        let top = vertices[surface as usize];
        let position = Vec3::from(top.position) + Vec3::new(0.0, 0.0, depth);
        vertices.push(TerrainVertex {
            position: position.to_array(),
            normal: top.normal,
            uv: top.uv,
        });
    }

    let n = ring.len() as u32;
    for i in 0..n {
        let j = (i + 1) % n;
        let top_a = ring[i as usize];
        let top_b = ring[j as usize];
        let bot_a = base + i;
        let bot_b = base + j;
        indices.extend_from_slice(&[top_a, bot_a, top_b, top_b, bot_a, bot_b]);
    }
}

/// Boundary vertex indices in counter-clockwise order starting at the
/// southwest corner: south row, east column, north row, west column.
fn boundary_ring(size: u32) -> Vec<u32> {
    let last = size - 1;
    let mut ring = Vec::with_capacity((4 * last) as usize);
    for x in 0..last {
        ring.push(x);
    }
    for y in 0..last {
        ring.push(y * size + last);
    }
    for x in 0..last {
        ring.push(last * size + (last - x));
    }
    for y in 0..last {
        ring.push((last - y) * size);
    }
    ring
}
