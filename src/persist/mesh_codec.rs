//! Mesh compression.
//!
//! Layout: `VXMS` magic, mode byte, u32 CRC-32 of the payload, then an lz4
//! payload (size prepended). Lossless mode stores vertices verbatim.
//! Quantized mode stores positions on a `position_bits` grid spanning the
//! mesh bounds and normals octahedrally at `normal_bits` per component.
//! Indices are always delta + zigzag varint coded.

use glam::{IVec3, Vec2, Vec3};

use crate::core::config::MeshCompression;
use crate::core::error::Error;
use crate::core::types::Result;
use crate::mesh::{Mesh, MeshVertex};
use crate::voxel::chunk::ChunkKey;

const MAGIC: &[u8; 4] = b"VXMS";
const HEADER_LEN: usize = 4 + 1 + 4;
const MODE_LOSSLESS: u8 = 0;
const MODE_QUANTIZED: u8 = 1;

/// Mesh compression settings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshCodec {
    pub mode: MeshCompression,
    pub position_bits: u8,
    pub normal_bits: u8,
}

impl Default for MeshCodec {
    fn default() -> Self {
        Self { mode: MeshCompression::Quantized, position_bits: 14, normal_bits: 10 }
    }
}

fn corrupt(msg: impl Into<String>) -> Error {
    Error::CorruptRecord(msg.into())
}

impl MeshCodec {
    pub fn lossless() -> Self {
        Self { mode: MeshCompression::Lossless, ..Self::default() }
    }

    /// Encode `mesh` into a self-describing record.
    pub fn compress(&self, mesh: &Mesh) -> Vec<u8> {
        let mut body = Vec::with_capacity(32 + mesh.vertices.len() * 16 + mesh.indices.len() * 2);
        for c in mesh.key.coord.to_array() {
            body.extend_from_slice(&c.to_le_bytes());
        }
        body.push(mesh.key.lod);
        body.extend_from_slice(&mesh.generation.to_le_bytes());
        body.push(mesh.transition_mask);
        body.extend_from_slice(&(mesh.vertices.len() as u32).to_le_bytes());
        body.extend_from_slice(&(mesh.indices.len() as u32).to_le_bytes());

        let mode = match self.mode {
            MeshCompression::Lossless => {
                body.extend_from_slice(bytemuck::cast_slice(&mesh.vertices));
                MODE_LOSSLESS
            }
            MeshCompression::Quantized => {
                self.write_quantized(&mut body, &mesh.vertices);
                MODE_QUANTIZED
            }
        };

        let mut previous = 0i64;
        for &index in &mesh.indices {
            let delta = index as i64 - previous;
            write_varint(&mut body, zigzag(delta));
            previous = index as i64;
        }

        let payload = lz4_flex::compress_prepend_size(&body);
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(MAGIC);
        out.push(mode);
        out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        out.extend_from_slice(&payload);
        out
    }

    fn write_quantized(&self, body: &mut Vec<u8>, vertices: &[MeshVertex]) {
        let (min, max) = bounds(vertices);
        body.push(self.position_bits);
        body.push(self.normal_bits);
        for v in min.to_array().into_iter().chain(max.to_array()) {
            body.extend_from_slice(&v.to_le_bytes());
        }
        let steps = ((1u32 << self.position_bits) - 1) as f32;
        let range = (max - min).max(Vec3::splat(f32::MIN_POSITIVE));
        for vertex in vertices {
            let t = (Vec3::from_array(vertex.position) - min) / range;
            let q = (t * steps).round().clamp(Vec3::ZERO, Vec3::splat(steps));
            for c in q.to_array() {
                write_varint(body, c as u64);
            }
            let n = octahedral_encode(Vec3::from_array(vertex.normal));
            for c in [n.x, n.y] {
                write_varint(body, quantize_snorm(c, self.normal_bits) as u64);
            }
            body.extend_from_slice(&vertex.material.to_le_bytes());
        }
    }

    /// Decode a record written by [`MeshCodec::compress`] with any settings.
    pub fn decompress(bytes: &[u8]) -> Result<Mesh> {
        if bytes.len() < HEADER_LEN {
            return Err(corrupt("mesh record too short"));
        }
        if &bytes[0..4] != MAGIC {
            return Err(corrupt("bad mesh record magic"));
        }
        let mode = bytes[4];
        let crc = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        let payload = &bytes[HEADER_LEN..];
        if crc32fast::hash(payload) != crc {
            return Err(corrupt("mesh record checksum mismatch"));
        }
        let body = lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| corrupt(format!("LZ4 decompression failed: {}", e)))?;
        let mut r = Reader { bytes: &body, pos: 0 };

        let coord = IVec3::new(r.i32()?, r.i32()?, r.i32()?);
        let lod = r.u8()?;
        let generation = r.u64()?;
        let transition_mask = r.u8()?;
        let vertex_count = r.u32()? as usize;
        let index_count = r.u32()? as usize;

        let vertices = match mode {
            MODE_LOSSLESS => {
                let raw = r.take(vertex_count * std::mem::size_of::<MeshVertex>())?;
                raw.chunks_exact(std::mem::size_of::<MeshVertex>())
                    .map(bytemuck::pod_read_unaligned::<MeshVertex>)
                    .collect()
            }
            MODE_QUANTIZED => read_quantized(&mut r, vertex_count)?,
            other => return Err(corrupt(format!("unknown mesh mode {}", other))),
        };

        let mut indices = Vec::with_capacity(index_count.min(1 << 24));
        let mut previous = 0i64;
        for _ in 0..index_count {
            previous += unzigzag(r.varint()?);
            if previous < 0 || previous as usize >= vertex_count {
                return Err(corrupt(format!("index {} out of range", previous)));
            }
            indices.push(previous as u32);
        }

        Ok(Mesh {
            key: ChunkKey::new(coord, lod),
            generation,
            vertices,
            indices,
            transition_mask,
        })
    }
}

fn read_quantized(r: &mut Reader<'_>, count: usize) -> Result<Vec<MeshVertex>> {
    let position_bits = r.u8()?;
    let normal_bits = r.u8()?;
    if !(1..=24).contains(&position_bits) || !(2..=16).contains(&normal_bits) {
        return Err(corrupt("quantization bits out of range"));
    }
    let min = Vec3::new(r.f32()?, r.f32()?, r.f32()?);
    let max = Vec3::new(r.f32()?, r.f32()?, r.f32()?);
    let steps = ((1u32 << position_bits) - 1) as f32;
    let range = max - min;

    let mut vertices = Vec::with_capacity(count.min(1 << 22));
    for _ in 0..count {
        let q = Vec3::new(r.varint()? as f32, r.varint()? as f32, r.varint()? as f32);
        let position = min + q / steps * range;
        let ox = dequantize_snorm(r.varint()? as u32, normal_bits);
        let oy = dequantize_snorm(r.varint()? as u32, normal_bits);
        let normal = octahedral_decode(Vec2::new(ox, oy));
        let material = r.u32()?;
        vertices.push(MeshVertex {
            position: position.to_array(),
            normal: normal.to_array(),
            material,
        });
    }
    Ok(vertices)
}

fn bounds(vertices: &[MeshVertex]) -> (Vec3, Vec3) {
    if vertices.is_empty() {
        return (Vec3::ZERO, Vec3::ZERO);
    }
    vertices.iter().fold(
        (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
        |(lo, hi), v| {
            let p = Vec3::from_array(v.position);
            (lo.min(p), hi.max(p))
        },
    )
}

/// Map a unit vector onto the [-1, 1]² octahedron.
fn octahedral_encode(n: Vec3) -> Vec2 {
    let sum = n.x.abs() + n.y.abs() + n.z.abs();
    if sum <= f32::EPSILON {
        return Vec2::ZERO;
    }
    let p = n / sum;
    if p.z >= 0.0 {
        Vec2::new(p.x, p.y)
    } else {
        Vec2::new(
            (1.0 - p.y.abs()) * p.x.signum(),
            (1.0 - p.x.abs()) * p.y.signum(),
        )
    }
}

fn octahedral_decode(e: Vec2) -> Vec3 {
    let z = 1.0 - e.x.abs() - e.y.abs();
    let (x, y) = if z >= 0.0 {
        (e.x, e.y)
    } else {
        ((1.0 - e.y.abs()) * e.x.signum(), (1.0 - e.x.abs()) * e.y.signum())
    };
    Vec3::new(x, y, z).normalize_or_zero()
}

fn quantize_snorm(v: f32, bits: u8) -> u32 {
    let steps = ((1u32 << bits) - 1) as f32;
    ((v.clamp(-1.0, 1.0) * 0.5 + 0.5) * steps).round() as u32
}

fn dequantize_snorm(q: u32, bits: u8) -> f32 {
    let steps = ((1u32 << bits) - 1) as f32;
    (q as f32 / steps) * 2.0 - 1.0
}

#[inline]
fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.bytes.len());
        let Some(end) = end else {
            return Err(corrupt("mesh record truncated"));
        };
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32()?))
    }

    fn u64(&mut self) -> Result<u64> {
        let lo = self.u32()? as u64;
        let hi = self.u32()? as u64;
        Ok(lo | (hi << 32))
    }

    fn varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.u8()?;
            value |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(corrupt("varint overflow"))
    }
}
