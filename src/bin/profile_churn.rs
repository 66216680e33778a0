#![allow(dead_code, unused_imports)]

use chunk_ecs::prelude::*;
use std::{fs::File, time::Instant};

#[cfg(feature = "profiling")]
use tracing_subscriber::{self, prelude::*};

#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Position(f32, f32, f32);

#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Velocity(f32, f32, f32);

#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Health(u32);

/// Create, mutate, defer and destroy in waves so every hot path shows up in the trace.
fn churn(manager: &mut EntityManager, waves: usize, per_wave: usize) -> Result<()> {
    let movers = manager.archetype_of::<(Position, Velocity)>()?;
    let query = manager.query_of::<(Position, Velocity), ()>();

    for wave in 0..waves {
        #[cfg(feature = "profiling")]
        let _span = tracing::info_span!("wave", wave).entered();

        let spawned = manager.create_entities(movers, per_wave)?;
        manager.set_component_for(&spawned, Velocity(1.0, 0.0, 0.0));
        manager.add_component_to(&spawned[..per_wave / 2], Health(100))?;

        manager.for_each_chunk(query, |mut view| {
            if let Some((positions, velocities)) = view.column_pair_mut::<Position, Velocity>() {
                for (p, v) in positions.iter_mut().zip(velocities) {
                    p.0 += v.0;
                }
            }
        })?;

        let mut commands = manager.command_buffer();
        commands.remove_component::<Health>(&spawned[..per_wave / 4])?;
        commands.destroy_entities(&spawned[per_wave / 2..])?;
        commands.playback(manager, true)?;

        #[cfg(feature = "profiling")]
        tracing::info!(wave, entities = manager.len(), "wave complete");
    }
    Ok(())
}

#[cfg(feature = "profiling")]
fn main() -> Result<()> {
    // Set up tracing subscriber to write to a file
    let file = File::create("trace.json").map_err(|e| EcsError::ConfigError(e.to_string()))?;
    let (non_blocking, _guard) = tracing_appender::non_blocking(file);
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_max_level(tracing::Level::TRACE)
        .init();

    let mut manager = EntityManager::new();

    println!("Warming up...");
    {
        let _span = tracing::info_span!("warmup").entered();
        churn(&mut manager, 2, 1_000)?;
    }

    println!("Profiling churn...");
    let start = Instant::now();
    churn(&mut manager, 20, 10_000)?;
    println!("20 waves of 10k entities in: {:?}", start.elapsed());
    println!("{:?}", manager.stats());
    Ok(())
}

#[cfg(not(feature = "profiling"))]
fn main() -> Result<()> {
    let mut manager = EntityManager::new();
    let start = Instant::now();
    churn(&mut manager, 20, 10_000)?;
    println!("20 waves of 10k entities in: {:?}", start.elapsed());
    println!("(build with --features profiling to write trace.json)");
    Ok(())
}
