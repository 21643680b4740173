//! Headless streaming run: generate and mesh every region, then report.
//!
//! Usage: cargo run --release --bin mesh_regions -- [OPTIONS]
//!
//! Options:
//!   --config <PATH>        JSON renderer config
//!   --regions <N>          Number of regions (default: 16)
//!   --slots <N>            Staging slots per batch (default: 8)
//!   --timeout-ms <MS>      Bound every GPU wait
//!   --backend <NAME>       `software` (default) or `gpu`
//!   --write-config <PATH>  Write the effective config as JSON and exit

use std::path::Path;
use std::time::Instant;

use voxmesh::config::{flag_value, RendererConfig};
use voxmesh::core::{Error, Result};
use voxmesh::gpu::{GpuBackend, ShaderSet, SoftwareBackend, WgpuBackend};
use voxmesh::streaming::{expected_batches, RegionStreamer, StreamerStats};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let config = match RendererConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
            log::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_filter.as_deref().unwrap_or("info")),
    )
    .format_timestamp_millis()
    .init();

    if let Some(path) = flag_value(&args, "--write-config") {
        match config.save(Path::new(path)) {
            Ok(()) => log::info!("Wrote config to {}", path),
            Err(e) => {
                log::error!("Writing config: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let backend_name = flag_value(&args, "--backend").unwrap_or("software");
    let result = match backend_name {
        "software" => run(&mut SoftwareBackend::new(), &config),
        "gpu" => ShaderSet::from_dir(config.shader_dir.as_deref())
            .and_then(|shaders| WgpuBackend::new_headless(&shaders))
            .and_then(|mut backend| run(&mut backend, &config)),
        other => Err(Error::Config(format!("unknown backend '{other}', expected software or gpu"))),
    };

    if let Err(e) = result {
        if e.is_streaming_failure() {
            log::error!("Streaming failed, region state is indeterminate: {}", e);
        } else {
            log::error!("Setup failed: {}", e);
        }
        std::process::exit(1);
    }
}

fn run<B: GpuBackend>(backend: &mut B, config: &RendererConfig) -> Result<StreamerStats> {
    let start = Instant::now();
    let mut streamer = RegionStreamer::new(backend, &config.world, &config.streaming)?;

    streamer.generate(backend)?;
    log::info!("Generation: {:.1}ms", start.elapsed().as_secs_f64() * 1000.0);

    while let Some(report) = streamer.step(backend)? {
        let slots: Vec<String> = report
            .regions
            .iter()
            .map(|r| format!("{}@{}={}", r.id, r.slot, r.vertex_count))
            .collect();
        log::info!(
            "Batch {}: {} regions, {} vertices [{}]",
            report.index,
            report.regions.len(),
            report.vertex_count(),
            slots.join(", ")
        );
    }

    let stats = streamer.stats();
    let expected = expected_batches(config.world.num_regions, config.streaming.staging_slots);
    if stats.batches != expected {
        log::warn!("Drained in {} batches, expected {}", stats.batches, expected);
    }

    log::info!("=== Streaming Complete ===");
    log::info!("Regions: {} ({} empty)", stats.regions_completed, stats.empty_regions);
    log::info!("Batches: {} of {} slots", stats.batches, config.streaming.staging_slots);
    log::info!(
        "Vertices: {} ({:.2} MB)",
        stats.total_vertices,
        stats.vertex_bytes as f64 / (1024.0 * 1024.0)
    );
    log::info!("Peak regions awaiting buffers: {}", stats.peak_in_flight);
    log::info!("Time: {:.1}ms", start.elapsed().as_secs_f64() * 1000.0);

    streamer.release(backend)?;
    Ok(stats)
}
