use criterion::*;
use std::hint::black_box;
use std::sync::Arc;

use taskgraph_ecs::{Read, Scheduler, SchedulerConfig, Store, Task, TypeRegistry, Write};

const ENTITIES: usize = 100_000;

#[derive(Clone, Copy, Default)]
struct Position(f32, f32);

#[derive(Clone, Copy, Default)]
struct Velocity(f32, f32);

#[derive(Clone, Copy, Default)]
struct Health(f32);

#[derive(Clone, Copy, Default)]
struct Age(u32);

fn make_store() -> (Arc<TypeRegistry>, Store) {
    let registry = Arc::new(TypeRegistry::new());
    registry.register::<Position>("position").unwrap();
    registry.register::<Velocity>("velocity").unwrap();
    registry.register::<Health>("health").unwrap();
    registry.register::<Age>("age").unwrap();
    registry.seal();

    let mut store = Store::new(registry.clone()).unwrap();
    for i in 0..ENTITIES {
        let e = store.create_entity();
        store.add_component(e, Position(i as f32, 0.0)).unwrap();
        store.add_component(e, Velocity(1.0, 0.5)).unwrap();
        store.add_component(e, Health(100.0)).unwrap();
        store.add_component(e, Age(0)).unwrap();
    }
    (registry, store)
}

fn config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_access_checks(false)
        .with_stall_warning(None)
}

fn frame_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame");

    group.bench_function("empty_frame", |b| {
        let (registry, mut store) = make_store();
        let scheduler = Scheduler::new(registry, config()).unwrap();
        b.iter(|| {
            let report = scheduler.run(&mut store, scheduler.frame()).unwrap();
            black_box(report);
        });
    });

    group.bench_function("three_disjoint_tasks_100k", |b| {
        let (registry, mut store) = make_store();
        let scheduler = Scheduler::new(registry, config()).unwrap();
        b.iter(|| {
            let mut frame = scheduler.frame();
            frame.submit(Task::new("move", |ctx| {
                ctx.query::<(Write<Position>, Read<Velocity>)>()?
                    .for_each(|_, (p, v)| {
                        p.0 += v.0;
                        p.1 += v.1;
                    });
                Ok(())
            }).read::<Velocity>().write::<Position>()).unwrap();
            frame.submit(Task::new("decay", |ctx| {
                ctx.write::<Health>()?.iter_mut().for_each(|(_, h)| h.0 *= 0.99);
                Ok(())
            }).write::<Health>()).unwrap();
            frame.submit(Task::new("age", |ctx| {
                ctx.write::<Age>()?.iter_mut().for_each(|(_, a)| a.0 += 1);
                Ok(())
            }).write::<Age>()).unwrap();

            let report = scheduler.run(&mut store, frame).unwrap();
            black_box(report);
        });
    });

    group.bench_function("chain_of_16_writers", |b| {
        b.iter_batched(
            || {
                let (registry, store) = make_store();
                let scheduler = Scheduler::new(registry, config()).unwrap();
                (scheduler, store)
            },
            |(scheduler, mut store)| {
                let mut frame = scheduler.frame();
                for n in 0..16 {
                    frame.submit(Task::new(format!("age-{}", n), |ctx| {
                        ctx.write::<Age>()?.iter_mut().for_each(|(_, a)| a.0 += 1);
                        Ok(())
                    }).write::<Age>()).unwrap();
                }
                let report = scheduler.run(&mut store, frame).unwrap();
                black_box(report);
                black_box(store);
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("build_graph_256_tasks", |b| {
        let (registry, _store) = make_store();
        let scheduler = Scheduler::new(registry, config()).unwrap();
        b.iter(|| {
            let mut frame = scheduler.frame();
            for n in 0..256 {
                let task = Task::new(format!("task-{}", n), |_| Ok(()));
                let task = match n % 4 {
                    0 => task.write::<Position>(),
                    1 => task.read::<Position>().write::<Velocity>(),
                    2 => task.read::<Velocity>(),
                    _ => task.write::<Health>(),
                };
                frame.submit(task).unwrap();
            }
            black_box(scheduler.build(frame).unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, frame_benchmark);
criterion_main!(benches);
