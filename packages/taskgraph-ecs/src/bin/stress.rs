use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use taskgraph_ecs::{Read, Scheduler, SchedulerConfig, Store, Task, TypeRegistry, Write};

#[derive(Debug, Clone, Copy, Default)]
pub struct MyComponent(i32);

#[derive(Debug, Clone, Copy, Default)]
pub struct Accumulator(i64);

#[derive(Debug, Clone, Copy, Default)]
pub struct Totals {
    accumulated: i64,
    despawned: usize,
}

const ACCUMULATOR_LIMIT: i64 = 160;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let registry = Arc::new(TypeRegistry::new());
    registry.register::<MyComponent>("my-component")?;
    registry.register::<Accumulator>("accumulator")?;
    registry.register_resource::<Totals>("totals")?;
    registry.seal();

    let mut store = Store::new(registry.clone())?;
    store.insert_resource(Totals::default())?;
    let scheduler = Scheduler::new(registry, SchedulerConfig::default())?;

    for _ in 0..8 {
        let mut frame = scheduler.frame();

        let spawn = frame.submit(Task::new("spawn", |ctx| {
            let mut structure = ctx.structure()?;
            for idx in 0..512 {
                let entity_id = structure.create_entity();
                structure.add_component(entity_id, MyComponent(32 + idx % 12))?;
                structure.add_component(entity_id, Accumulator::default())?;
            }
            Ok(())
        }).structural())?;

        // Independent of each other, both ordered after the spawn.
        for n in 0..4 {
            frame.submit(Task::new(format!("count-{}", n), |ctx| {
                let count = ctx.query::<(Read<MyComponent>,)>()?.count();
                tracing::debug!(count, task = ctx.name(), "counted");
                Ok(())
            }).read::<MyComponent>().after(spawn))?;
        }

        frame.submit(Task::new("accumulate", |ctx| {
            ctx.query::<(Read<MyComponent>, Write<Accumulator>)>()?
                .for_each(|_, (value, acc)| acc.0 += value.0 as i64);

            // Entities past the limit are removed once the frame drains.
            ctx.extend(Task::new("expire", |ctx| {
                let expired: Vec<_> = ctx.read::<Accumulator>()?
                    .iter()
                    .filter(|(_, acc)| acc.0 > ACCUMULATOR_LIMIT)
                    .map(|(id, _)| id)
                    .collect();
                if expired.is_empty() {
                    return Ok(());
                }

                ctx.defer(Task::new("despawn", move |ctx| {
                    let mut structure = ctx.structure()?;
                    for id in &expired {
                        structure.destroy_entity(*id)?;
                    }
                    drop(structure);
                    ctx.resource_mut::<Totals>()?.despawned += expired.len();
                    Ok(())
                }).structural().write::<Totals>())?;
                Ok(())
            }).read::<Accumulator>())?;
            Ok(())
        }).read::<MyComponent>().write::<Accumulator>())?;

        frame.submit(Task::new("tally", |ctx| {
            let sum: i64 = ctx.read::<Accumulator>()?.iter().map(|(_, acc)| acc.0).sum();
            ctx.resource_mut::<Totals>()?.accumulated = sum;
            Ok(())
        }).read::<Accumulator>().write::<Totals>())?;

        scheduler.run(&mut store, frame)?.into_result()?;
    }

    println!("store: {:?}", store);
    println!("totals: {:?}", *store.resource::<Totals>()?);
    println!("frames: {}", scheduler.frame_count());
    Ok(())
}
