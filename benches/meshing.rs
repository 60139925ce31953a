use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, black_box};
use glam::{IVec3, Vec3};

use voxterra::core::config::EngineConfig;
use voxterra::generation::{NoiseSurfaceGenerator, NoiseSurfaceParams, SphereGenerator, WorldGenerator};
use voxterra::mesh::{mesh_chunk, mesh_isolated, ActiveLayout, Neighborhood};
use voxterra::persist::Persistence;
use voxterra::voxel::{Chunk, ChunkKey, VoxelStore};

fn sphere_chunk(size: u32) -> Chunk {
    let key = ChunkKey::new(IVec3::ZERO, 0);
    let half = size as f32 * 0.5;
    let generator = SphereGenerator { center: Vec3::splat(half), radius: half * 0.8, material: 1 };
    let samples = generator.generate(key, size).unwrap_or_default();
    Chunk::new(key, size, samples)
}

fn bench_mesh_sphere(c: &mut Criterion) {
    for size in [16u32, 32, 64] {
        let snapshot = sphere_chunk(size).snapshot();
        c.bench_function(&format!("mesh_isolated_sphere_{}", size), |b| {
            b.iter(|| mesh_isolated(black_box(&snapshot)))
        });
    }
}

fn bench_mesh_neighborhood(c: &mut Criterion) {
    let config = EngineConfig {
        chunk_size: 32,
        max_depth: 1,
        lod_distances: vec![64.0],
        ..Default::default()
    };
    let generator = Arc::new(NoiseSurfaceGenerator::new(NoiseSurfaceParams::default()));
    let store = VoxelStore::new(&config, generator, Persistence::in_memory());
    let mut keys = Vec::new();
    for z in -1..=1 {
        for y in -1..=1 {
            for x in -1..=1 {
                keys.push(ChunkKey::new(IVec3::new(x, y, z), 0));
            }
        }
    }
    let layout = ActiveLayout::from_keys(keys);
    let target = ChunkKey::new(IVec3::ZERO, 0);
    let Ok(nb) = Neighborhood::gather(&store, &layout, target) else {
        return;
    };

    c.bench_function("mesh_chunk_noise_32", |b| b.iter(|| mesh_chunk(black_box(&nb))));
    c.bench_function("gather_neighborhood_32", |b| {
        b.iter(|| Neighborhood::gather(black_box(&store), &layout, target))
    });
}

fn bench_chunk_codec(c: &mut Criterion) {
    let persistence = Persistence::in_memory();
    let chunk = sphere_chunk(32);
    let Ok(bytes) = persistence.save(&chunk) else {
        return;
    };

    c.bench_function("chunk_save_32", |b| b.iter(|| persistence.save(black_box(&chunk))));
    c.bench_function("chunk_load_32", |b| b.iter(|| persistence.load(black_box(&bytes))));
}

fn bench_mesh_codec(c: &mut Criterion) {
    let persistence = Persistence::in_memory();
    let mesh = mesh_isolated(&sphere_chunk(32).snapshot());
    let Ok(bytes) = persistence.compress_mesh(&mesh) else {
        return;
    };

    c.bench_function("mesh_compress_sphere_32", |b| b.iter(|| persistence.compress_mesh(black_box(&mesh))));
    c.bench_function("mesh_decompress_sphere_32", |b| b.iter(|| persistence.decompress_mesh(black_box(&bytes))));
}

criterion_group!(
    benches,
    bench_mesh_sphere,
    bench_mesh_neighborhood,
    bench_chunk_codec,
    bench_mesh_codec,
);
criterion_main!(benches);
