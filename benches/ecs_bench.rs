//! Core storage benchmarks, with hecs as a baseline
//!
//! Run with: cargo bench --bench ecs_bench

use chunk_ecs::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use glam::Vec3;
use hecs::World as HecsWorld;

#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Position(Vec3);

#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Velocity(Vec3);

#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Health(u32);

const N: usize = 10_000;

fn movers(manager: &mut EntityManager) -> Vec<Entity> {
    (0..N)
        .map(|i| {
            manager
                .spawn((Position(Vec3::new(i as f32, 0.0, 0.0)), Velocity(Vec3::X)))
                .unwrap()
        })
        .collect()
}

fn bench_spawn(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn");

    group.bench_function("chunk_spawn_10k_two_components", |b| {
        b.iter(|| {
            let mut manager = EntityManager::new();
            black_box(movers(&mut manager));
        });
    });
    group.bench_function("chunk_create_entities_10k_batch", |b| {
        b.iter(|| {
            let mut manager = EntityManager::new();
            let archetype = manager.archetype_of::<(Position, Velocity)>().unwrap();
            black_box(manager.create_entities(archetype, N).unwrap());
        });
    });
    group.bench_function("hecs_spawn_10k_two_components", |b| {
        b.iter(|| {
            let mut world = HecsWorld::new();
            for i in 0..N {
                black_box(world.spawn((Position(Vec3::new(i as f32, 0.0, 0.0)), Velocity(Vec3::X))));
            }
        });
    });

    group.finish();
}

fn bench_iterate(c: &mut Criterion) {
    let mut group = c.benchmark_group("iterate");

    let mut manager = EntityManager::new();
    movers(&mut manager);
    let query = manager.query_of::<(Position, Velocity), ()>();
    group.bench_function("chunk_for_each_chunk_10k", |b| {
        b.iter(|| {
            manager
                .for_each_chunk(query, |mut view| {
                    if let Some((positions, velocities)) = view.column_pair_mut::<Position, Velocity>() {
                        for (p, v) in positions.iter_mut().zip(velocities) {
                            p.0 += v.0;
                        }
                    }
                })
                .unwrap();
        });
    });

    #[cfg(feature = "parallel")]
    group.bench_function("chunk_par_for_each_chunk_10k", |b| {
        b.iter(|| {
            manager
                .par_for_each_chunk(query, |mut view| {
                    if let Some((positions, velocities)) = view.column_pair_mut::<Position, Velocity>() {
                        for (p, v) in positions.iter_mut().zip(velocities) {
                            p.0 += v.0;
                        }
                    }
                })
                .unwrap();
        });
    });

    let mut world = HecsWorld::new();
    for i in 0..N {
        world.spawn((Position(Vec3::new(i as f32, 0.0, 0.0)), Velocity(Vec3::X)));
    }
    group.bench_function("hecs_query_mut_10k", |b| {
        b.iter(|| {
            for (_, (p, v)) in world.query_mut::<(&mut Position, &Velocity)>() {
                p.0 += v.0;
            }
        });
    });

    group.finish();
}

fn bench_add_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_remove");

    let mut manager = EntityManager::new();
    let entities = movers(&mut manager);
    group.bench_function("chunk_add_remove_batch_10k", |b| {
        b.iter(|| {
            manager.add_component_to(&entities, Health(10)).unwrap();
            manager.remove_component_from::<Health>(&entities).unwrap();
        });
    });
    group.bench_function("chunk_add_remove_single_10k", |b| {
        b.iter(|| {
            for &e in &entities {
                manager.add_component(e, Health(10)).unwrap();
            }
            for &e in &entities {
                manager.remove_component::<Health>(e).unwrap();
            }
        });
    });

    let mut world = HecsWorld::new();
    let handles: Vec<hecs::Entity> = (0..N)
        .map(|i| world.spawn((Position(Vec3::new(i as f32, 0.0, 0.0)), Velocity(Vec3::X))))
        .collect();
    group.bench_function("hecs_add_remove_single_10k", |b| {
        b.iter(|| {
            for &e in &handles {
                world.insert_one(e, Health(10)).unwrap();
            }
            for &e in &handles {
                world.remove_one::<Health>(e).unwrap();
            }
        });
    });

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut manager = EntityManager::new();
    let entities = movers(&mut manager);
    c.bench_function("chunk_get_10k", |b| {
        b.iter(|| {
            let mut sum = 0.0;
            for &e in &entities {
                sum += manager.get::<Position>(e).map_or(0.0, |p| p.0.x);
            }
            black_box(sum)
        });
    });
}

criterion_group!(benches, bench_spawn, bench_iterate, bench_add_remove, bench_lookup);
criterion_main!(benches);
