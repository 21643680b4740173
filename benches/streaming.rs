use criterion::{criterion_group, criterion_main, Criterion, black_box};

use voxmesh::config::{StreamingConfig, WorldConfig};
use voxmesh::gpu::SoftwareBackend;
use voxmesh::streaming::RegionStreamer;
use voxmesh::voxel::mesher::{count_vertices, mesh_region};
use voxmesh::voxel::terrain::generate_region;
use voxmesh::voxel::RegionId;

fn bench_generate_region(c: &mut Criterion) {
    c.bench_function("generate_region", |b| {
        b.iter(|| generate_region(black_box(RegionId(37).position(16)), black_box(7)));
    });
}

fn bench_mesh_region(c: &mut Criterion) {
    let voxels = generate_region(RegionId(3).position(16), 7);

    c.bench_function("mesh_region_terrain", |b| {
        b.iter(|| mesh_region(black_box(&voxels)));
    });
}

fn bench_count_vertices(c: &mut Criterion) {
    let voxels = generate_region(RegionId(3).position(16), 7);

    c.bench_function("count_vertices_terrain", |b| {
        b.iter(|| count_vertices(black_box(&voxels)));
    });
}

fn bench_stream_software(c: &mut Criterion) {
    let world = WorldConfig { num_regions: 16, grid_width: 4, seed: 7 };
    let streaming = StreamingConfig::default();

    let mut group = c.benchmark_group("stream_software");
    group.sample_size(10);
    group.bench_function("16_regions_8_slots", |b| {
        b.iter(|| {
            let mut backend = SoftwareBackend::new();
            let mut streamer = RegionStreamer::new(&mut backend, &world, &streaming).unwrap();
            let stats = streamer.run_to_completion(&mut backend).unwrap();
            black_box(stats);
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_generate_region,
    bench_mesh_region,
    bench_count_vertices,
    bench_stream_software,
);
criterion_main!(benches);
