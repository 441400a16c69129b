use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;

use rayon::iter::ParallelIterator;
use tracing_subscriber::EnvFilter;

use taskgraph_ecs::{ComponentPool, Scheduler, SchedulerConfig, Store, Task, TypeRegistry};

const G: f32 = 10.0;
const TIME_STEP: f32 = 1.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct Position(f32, f32);

#[derive(Debug, Clone, Copy, Default)]
pub struct Velocity(f32, f32);

#[derive(Debug, Clone, Copy, Default)]
pub struct Mass(f32);

fn apply_acceleration<'a>() -> Task<'a> {
    Task::new("apply-acceleration", |ctx| {
        let positions = ctx.read::<Position>()?;
        let masses = ctx.read::<Mass>()?;
        let mut velocities = ctx.write::<Velocity>()?;

        let positions: &ComponentPool<Position> = &positions;
        let masses: &ComponentPool<Mass> = &masses;

        velocities.par_iter_mut().for_each(|(id_a, velocity)| {
            let (Position(x_a, y_a), Mass(m_a)) = match (positions.get(id_a), masses.get(id_a)) {
                (Some(p), Some(m)) => (*p, *m),
                _ => return,
            };
            if m_a <= 0.0 {
                return;
            }

            let Velocity(vx_a, vy_a) = velocity;
            *vx_a = 0.0;
            *vy_a = 0.0;

            for (id_b, &Position(x_b, y_b)) in positions.iter() {
                if id_b == id_a {
                    continue;
                }

                let m_b = masses.get(id_b).map_or(0.0, |m| m.0);
                if m_b < 0.00001 {
                    continue;
                }

                let dx = x_b - x_a;
                let dy = y_b - y_a;
                // Overlapping bodies would fling each other apart.
                let r2 = (dx * dx + dy * dy).max(0.0005);

                let a = (G * m_b) / r2;
                let r = r2.sqrt();
                *vx_a += TIME_STEP * ((dx * a) / r);
                *vy_a += TIME_STEP * ((dy * a) / r);
            }
        });
        Ok(())
    })
    .read::<Position>()
    .read::<Mass>()
    .write::<Velocity>()
}

fn apply_velocity<'a>() -> Task<'a> {
    Task::new("apply-velocity", |ctx| {
        let velocities = ctx.read::<Velocity>()?;
        let velocities: &ComponentPool<Velocity> = &velocities;
        let mut positions = ctx.write::<Position>()?;

        positions.par_iter_mut().for_each(|(id, Position(x, y))| {
            if let Some(Velocity(vx, vy)) = velocities.get(id) {
                *x += TIME_STEP * vx;
                *y += TIME_STEP * vy;
            }
        });
        Ok(())
    })
    .read::<Velocity>()
    .write::<Position>()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let registry = Arc::new(TypeRegistry::new());
    registry.register::<Position>("position")?;
    registry.register::<Velocity>("velocity")?;
    registry.register::<Mass>("mass")?;
    registry.seal();

    let mut store = Store::new(registry.clone())?;

    // Populate the store!
    {
        const SQRT_NUM_ENTITIES: usize = 2;
        const SCALE: f32 = 2.0 / ((SQRT_NUM_ENTITIES - 1) as f32);

        for x in 0..SQRT_NUM_ENTITIES {
            for y in 0..SQRT_NUM_ENTITIES {
                let x = ((x as f32) * SCALE) - 1.0;
                let y = ((y as f32) * SCALE) - 1.0;

                let vx = y * 0.003;
                let vy = -x * 0.003;

                let id = store.create_entity();
                store.add_component(id, Mass(0.00001))?;
                store.add_component(id, Position(x, y))?;
                store.add_component(id, Velocity(vx, vy))?;
            }
        }
    }

    let scheduler = Scheduler::new(registry, SchedulerConfig::default())?;

    const SIZE: (i32, i32) = (500, 500);
    const OFFSET: (f32, f32) = (250.0, 250.0);
    const SCALE: (f32, f32) = (200.0, 200.0);
    const NUM_ITER: usize = 100;

    let mut dest = std::io::stdout();
    let mut last_positions = HashMap::new();

    writeln!(&mut dest, "<?xml version=\"1.0\" standalone=\"no\"?>")?;
    writeln!(&mut dest, "<!DOCTYPE svg PUBLIC \"-//W3C//DTD SVG 1.0//EN\" \"http://www.w3.org/TR/2001/REC-SVG-20010904/DTD/svg10.dtd\">")?;
    write!(&mut dest, "<svg xmlns=\"http://www.w3.org/2000/svg\" height=\"{}\" width=\"{}\">", SIZE.0, SIZE.1)?;
    write!(&mut dest, "<rect width=\"100%\" height=\"100%\" fill=\"black\"/>")?;

    for _ in 0..NUM_ITER {
        for _ in 0..10usize {
            let mut frame = scheduler.frame();
            let accel = frame.submit(apply_acceleration())?;
            frame.then(accel, apply_velocity())?;
            scheduler.run(&mut store, frame)?.into_result()?;
        }

        // Render result!
        let positions = store.pool::<Position>()?;
        let velocities = store.pool::<Velocity>()?;
        for (id, &Position(x, y)) in positions.iter() {
            let Velocity(vx, vy) = velocities.get(id).copied().unwrap_or_default();
            let v2 = (vx * vx + vy * vy).sqrt();
            let a = 1.0 - (v2 / 0.03).clamp(0.0, 0.7);

            if let Some((lx, ly)) = last_positions.get(&id) {
                let x1 = lx * SCALE.0 + OFFSET.0;
                let y1 = ly * SCALE.1 + OFFSET.1;
                let x2 = x * SCALE.0 + OFFSET.0;
                let y2 = y * SCALE.1 + OFFSET.1;

                write!(&mut dest,
                       "<line x1=\"{}\" y1=\"{}\" x2=\"{}\" y2=\"{}\" style=\"stroke:rgba(255,0,0,{});stroke-width:1\" />",
                       x1, y1, x2, y2, a)?;
            }

            last_positions.insert(id, (x, y));
        }
    }

    write!(&mut dest, "</svg>")?;
    Ok(())
}
