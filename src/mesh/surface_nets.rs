//! Surface extraction over chunks of mixed LOD.
//!
//! Every cell straddling the surface gets one vertex at the mean of its edge
//! crossings; every sign-changing edge gets one polygon joining the cells
//! around it. An edge is emitted only by the finest chunk among those cells,
//! ties going to the smaller key, so neighbouring meshes never overlap and a
//! coarser neighbour's cell vertices are reproduced bit for bit on the finer
//! side of a seam.

use std::collections::HashMap;

use glam::{IVec3, Vec3};

use crate::mesh::neighborhood::Neighborhood;
use crate::mesh::types::{face, Mesh, MeshVertex};
use crate::voxel::chunk::{ChunkKey, ChunkSnapshot};
use crate::voxel::voxel::Voxel;

/// Cube corner `i` sits at offset `(i & 1, (i >> 1) & 1, (i >> 2) & 1)`.
const CORNERS: [IVec3; 8] = [
    IVec3::new(0, 0, 0),
    IVec3::new(1, 0, 0),
    IVec3::new(0, 1, 0),
    IVec3::new(1, 1, 0),
    IVec3::new(0, 0, 1),
    IVec3::new(1, 0, 1),
    IVec3::new(0, 1, 1),
    IVec3::new(1, 1, 1),
];

const EDGES: [(usize, usize); 12] = [
    (0, 1), (2, 3), (4, 5), (6, 7),
    (0, 2), (1, 3), (4, 6), (5, 7),
    (0, 4), (1, 5), (2, 6), (3, 7),
];

/// Quadrant signs around an edge, counter-clockwise seen from +axis.
const QUADRANTS: [(i32, i32); 4] = [(-1, -1), (1, -1), (1, 1), (-1, 1)];

/// Mesh the target chunk of `nb`.
pub fn mesh_chunk(nb: &Neighborhood) -> Mesh {
    let Some(target) = nb.target_chunk() else {
        return Mesh::empty(nb.target(), 0);
    };
    let mut builder = MeshBuilder::new(nb, target);
    builder.emit_edges();
    let transition_mask = transition_mask(nb, target);
    Mesh {
        key: target.key,
        generation: target.generation,
        vertices: builder.vertices,
        indices: builder.indices,
        transition_mask,
    }
}

/// Mesh one chunk with no neighbours; its boundary stays open.
pub fn mesh_isolated(snapshot: &ChunkSnapshot) -> Mesh {
    mesh_chunk(&Neighborhood::from_snapshots(snapshot.key, [snapshot.clone()]))
}

/// Faces whose neighbour (probed just outside the face centre) is coarser.
fn transition_mask(nb: &Neighborhood, target: &ChunkSnapshot) -> u8 {
    let extent = target.key.extent(target.size);
    let min2 = target.origin() * 2;
    let center2 = min2 + IVec3::splat(extent);
    let mut mask = 0;
    for (bit, axis, dir) in face::ALL {
        let mut probe = center2;
        probe[axis] = if dir < 0 { min2[axis] - 1 } else { min2[axis] + 2 * extent + 1 };
        if let Some(neighbor) = nb.chunk_at_doubled(probe) {
            if neighbor.key.lod > target.key.lod {
                mask |= bit;
            }
        }
    }
    mask
}

struct MeshBuilder<'a> {
    nb: &'a Neighborhood,
    target: &'a ChunkSnapshot,
    origin: Vec3,
    vertices: Vec<MeshVertex>,
    indices: Vec<u32>,
    /// (chunk, cell) -> vertex index
    cells: HashMap<(ChunkKey, IVec3), u32>,
}

impl<'a> MeshBuilder<'a> {
    fn new(nb: &'a Neighborhood, target: &'a ChunkSnapshot) -> Self {
        Self {
            nb,
            target,
            origin: target.origin().as_vec3(),
            vertices: Vec::new(),
            indices: Vec::new(),
            cells: HashMap::new(),
        }
    }

    /// Sample `idx` of `chunk`'s lattice, looked up in the neighbourhood
    /// once it leaves the chunk.
    fn corner(&self, chunk: &ChunkSnapshot, idx: IVec3) -> Voxel {
        let n = chunk.size as i32;
        if idx.cmpge(IVec3::ZERO).all() && idx.cmplt(IVec3::splat(n)).all() {
            return chunk.get(idx.x as u32, idx.y as u32, idx.z as u32);
        }
        let world = chunk.origin() + idx * chunk.key.spacing();
        self.nb.value_at(world).unwrap_or_else(|| {
            let c = idx.clamp(IVec3::ZERO, IVec3::splat(n - 1));
            chunk.get(c.x as u32, c.y as u32, c.z as u32)
        })
    }

    fn emit_edges(&mut self) {
        let target = self.target;
        let n = target.size as i32;
        for axis in 0..3 {
            let u = (axis + 1) % 3;
            let v = (axis + 2) % 3;
            let ea = IVec3::AXES[axis];
            let eu = IVec3::AXES[u];
            let ev = IVec3::AXES[v];
            for k in 0..=n {
                for j in 0..=n {
                    for i in 0..n {
                        let mut idx = IVec3::ZERO;
                        idx[axis] = i;
                        idx[u] = j;
                        idx[v] = k;
                        let inside = self.corner(target, idx).density > 0.0;
                        if inside == (self.corner(target, idx + ea).density > 0.0) {
                            continue;
                        }

                        let interior = j > 0 && j < n && k > 0 && k < n;
                        let quad = if interior {
                            let cells = [idx - eu - ev, idx - ev, idx, idx - eu];
                            cells.map(|cell| self.cell_vertex(target, cell))
                        } else {
                            match self.boundary_quad(idx, ea, eu, ev) {
                                Some(quad) => quad,
                                None => continue,
                            }
                        };
                        let quad = if inside { quad } else { [quad[0], quad[3], quad[2], quad[1]] };
                        self.push_polygon(quad);
                    }
                }
            }
        }
    }

    /// Cells around a boundary edge, or `None` if a neighbour is missing or
    /// another chunk owns the edge.
    fn boundary_quad(&mut self, idx: IVec3, ea: IVec3, eu: IVec3, ev: IVec3) -> Option<[u32; 4]> {
        let target = self.target;
        let nb = self.nb;
        let spacing = target.key.spacing();
        let mid2 = (target.origin() + idx * spacing) * 2 + ea * spacing;

        let mut found: [Option<(&ChunkSnapshot, IVec3)>; 4] = [None; 4];
        let mut owner = target.key;
        for (slot, (su, sv)) in found.iter_mut().zip(QUADRANTS) {
            let probe = mid2 + eu * su + ev * sv;
            let chunk = nb.chunk_at_doubled(probe)?;
            let cell = (probe - chunk.origin() * 2).div_euclid(IVec3::splat(2 * chunk.key.spacing()));
            owner = owner.min(chunk.key);
            *slot = Some((chunk, cell));
        }
        if owner != target.key {
            return None;
        }
        let mut quad = [0u32; 4];
        for (out, entry) in quad.iter_mut().zip(found) {
            let (chunk, cell) = entry?;
            *out = self.cell_vertex(chunk, cell);
        }
        Some(quad)
    }

    /// Emit a quad, collapsing cells shared across a LOD step.
    fn push_polygon(&mut self, quad: [u32; 4]) {
        let mut poly: Vec<u32> = Vec::with_capacity(4);
        for id in quad {
            if poly.last() != Some(&id) {
                poly.push(id);
            }
        }
        if poly.len() > 1 && poly.first() == poly.last() {
            poly.pop();
        }
        if poly.len() < 3 || (poly.len() == 4 && (poly[0] == poly[2] || poly[1] == poly[3])) {
            return;
        }
        for t in 1..poly.len() - 1 {
            self.indices.extend_from_slice(&[poly[0], poly[t], poly[t + 1]]);
        }
    }

    /// Vertex of `cell` in `chunk`, created on first use.
    fn cell_vertex(&mut self, chunk: &ChunkSnapshot, cell: IVec3) -> u32 {
        if let Some(&id) = self.cells.get(&(chunk.key, cell)) {
            return id;
        }
        let spacing = chunk.key.spacing();
        let base = chunk.origin() + cell * spacing;
        let values = CORNERS.map(|off| self.corner(chunk, cell + off));
        let positions = CORNERS.map(|off| (base + off * spacing).as_vec3());

        let mut sum = Vec3::ZERO;
        let mut count = 0u32;
        for (a, b) in EDGES {
            let (da, db) = (values[a].density, values[b].density);
            if (da > 0.0) != (db > 0.0) {
                let t = da / (da - db);
                sum += positions[a] + (positions[b] - positions[a]) * t;
                count += 1;
            }
        }
        let world = if count > 0 {
            sum / count as f32
        } else {
            base.as_vec3() + Vec3::splat(spacing as f32 * 0.5)
        };

        // Density grows inward, so the outward normal is the negated gradient.
        let mut gradient = Vec3::ZERO;
        for (i, off) in CORNERS.iter().enumerate() {
            let d = values[i].density;
            for axis in 0..3 {
                gradient[axis] += if off[axis] == 1 { d } else { -d };
            }
        }
        let normal = -gradient;
        let normal = if normal.length_squared() > 0.0 { normal.normalize() } else { Vec3::Y };

        let dominant = values
            .iter()
            .max_by(|a, b| a.density.total_cmp(&b.density))
            .map(|v| v.material)
            .unwrap_or_default();

        let id = self.vertices.len() as u32;
        self.vertices.push(MeshVertex {
            position: (world - self.origin).to_array(),
            normal: normal.to_array(),
            material: bytemuck::cast(dominant),
        });
        self.cells.insert((chunk.key, cell), id);
        id
    }
}
