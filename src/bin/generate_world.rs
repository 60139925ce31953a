//! World baking binary: generates, meshes and stores a block of LOD-0 chunks.
//!
//! Usage: cargo run --release --bin generate_world -- [OPTIONS]
//!
//! Options:
//!   --config <PATH>   Engine configuration JSON (default: built-in defaults)
//!   --name <NAME>     World name / output directory (default: "terrain")
//!   --radius <N>      Chunks around the origin on X and Z (default: 4)
//!   --ymin <Y>        Lowest chunk row (default: -1)
//!   --ymax <Y>        Highest chunk row (default: 1)
//!   --jobs <N>        Worker threads (default: scheduler.worker_threads)
//!
//! Output structure:
//!   worlds/<name>/
//!     manifest.json                 # Configuration + per-chunk stats
//!     chunks/chunk_x_y_z_lod.vxc    # Chunk records
//!     meshes/mesh_x_y_z_lod.vxm     # Compressed meshes

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use glam::IVec3;
use rayon::prelude::*;
use serde_json::json;

use voxterra::core::logging;
use voxterra::mesh::{mesh_chunk, ActiveLayout, Neighborhood};
use voxterra::persist::{DirKvStore, Persistence, RecordKey};
use voxterra::voxel::{ChunkKey, VoxelStore};
use voxterra::{EngineConfig, Error, Result};

struct Options {
    config: Option<PathBuf>,
    name: String,
    radius: i32,
    y_range: (i32, i32),
    jobs: Option<usize>,
}

struct Baked {
    key: ChunkKey,
    triangles: usize,
    record_bytes: usize,
    mesh_bytes: usize,
}

fn main() {
    logging::init();
    let args: Vec<String> = std::env::args().collect();
    let options = Options {
        config: parse_str_arg(&args, "--config").map(PathBuf::from),
        name: parse_str_arg(&args, "--name").unwrap_or_else(|| "terrain".to_string()),
        radius: parse_arg(&args, "--radius").unwrap_or(4),
        y_range: (parse_arg(&args, "--ymin").unwrap_or(-1), parse_arg(&args, "--ymax").unwrap_or(1)),
        jobs: parse_arg(&args, "--jobs"),
    };
    if let Err(e) = run(&options) {
        log::error!("World generation failed: {}", e);
        std::process::exit(1);
    }
}

fn run(options: &Options) -> Result<()> {
    let config = match &options.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    config.validate()?;
    let jobs = options.jobs.unwrap_or(config.scheduler.worker_threads).max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .thread_name(|i| format!("voxterra-bake-{}", i))
        .build()
        .map_err(|e| Error::Config(format!("worker pool: {}", e)))?;

    let output_dir = PathBuf::from(format!("worlds/{}", options.name));
    let mesh_dir = output_dir.join("meshes");
    std::fs::create_dir_all(&mesh_dir)?;
    let kv = Arc::new(DirKvStore::open(output_dir.join("chunks"))?);
    let persistence = Persistence::new(kv, &config.compression);
    let store = VoxelStore::new(&config, config.generator.build()?, persistence);

    let (ymin, ymax) = options.y_range;
    let r = options.radius.max(0);
    let mut keys = Vec::new();
    for y in ymin..=ymax {
        for z in -r..r {
            for x in -r..r {
                keys.push(ChunkKey::new(IVec3::new(x, y, z), 0));
            }
        }
    }
    let layout = ActiveLayout::from_keys(keys.iter().copied());
    log::info!(
        "Baking '{}': {} chunks of {}^3 on {} thread(s) into {}",
        options.name,
        keys.len(),
        config.chunk_size,
        jobs,
        output_dir.display()
    );

    let start = Instant::now();
    let done = AtomicUsize::new(0);
    let total = keys.len();
    let results: Vec<Result<Baked>> = pool.install(|| {
        keys.par_iter()
            .map(|&key| {
                let baked = bake(&store, &layout, &mesh_dir, key);
                let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                if n % 256 == 0 || n == total {
                    log::info!("  [{}/{}] {:.1}s", n, total, start.elapsed().as_secs_f64());
                }
                baked
            })
            .collect()
    });

    let mut baked = Vec::with_capacity(results.len());
    let mut failed = 0usize;
    for result in results {
        match result {
            Ok(b) => baked.push(b),
            Err(e) => {
                log::warn!("{}", e);
                failed += 1;
            }
        }
    }
    baked.sort_by_key(|b| b.key);

    let elapsed = start.elapsed();
    let triangles: usize = baked.iter().map(|b| b.triangles).sum();
    let record_bytes: usize = baked.iter().map(|b| b.record_bytes).sum();
    let mesh_bytes: usize = baked.iter().map(|b| b.mesh_bytes).sum();
    let with_geometry = baked.iter().filter(|b| b.triangles > 0).count();

    let manifest = json!({
        "name": options.name,
        "config": config,
        "chunk_count": baked.len(),
        "failed": failed,
        "triangles": triangles,
        "record_bytes": record_bytes,
        "mesh_bytes": mesh_bytes,
        "chunks": baked.iter().map(|b| json!({
            "x": b.key.coord.x,
            "y": b.key.coord.y,
            "z": b.key.coord.z,
            "triangles": b.triangles,
        })).collect::<Vec<_>>(),
    });
    std::fs::write(output_dir.join("manifest.json"), serde_json::to_string_pretty(&manifest)?)?;

    log::info!(
        "Baked {} chunks ({} with geometry, {} failed) in {:.1}s: {} triangles, {:.1} MB records, {:.1} MB meshes",
        baked.len(),
        with_geometry,
        failed,
        elapsed.as_secs_f64(),
        triangles,
        record_bytes as f64 / (1024.0 * 1024.0),
        mesh_bytes as f64 / (1024.0 * 1024.0)
    );
    Ok(())
}

fn bake(store: &VoxelStore, layout: &ActiveLayout, mesh_dir: &Path, key: ChunkKey) -> Result<Baked> {
    let neighborhood = Neighborhood::gather(store, layout, key)?;
    let mesh = mesh_chunk(&neighborhood);
    let persistence = store.persistence();
    let record = store.with_read(key, |chunk| persistence.save(chunk))??;
    let record_bytes = record.len();
    persistence.kv().put(RecordKey::chunk(key), record)?;
    let compressed = persistence.compress_mesh(&mesh)?;
    let path = mesh_dir.join(format!(
        "mesh_{}_{}_{}_{}.vxm",
        key.coord.x, key.coord.y, key.coord.z, key.lod
    ));
    std::fs::write(&path, &compressed)?;
    Ok(Baked {
        key,
        triangles: mesh.triangle_count(),
        record_bytes,
        mesh_bytes: compressed.len(),
    })
}

fn parse_arg<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
