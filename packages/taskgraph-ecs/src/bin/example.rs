use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use taskgraph_ecs::{Read, Scheduler, SchedulerConfig, Store, Task, TypeRegistry, Write};

#[derive(Debug, Clone, Copy, Default)]
pub struct MyComponent(i32);

#[derive(Debug, Clone, Copy, Default)]
pub struct Doubled(i32);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let registry = Arc::new(TypeRegistry::new());
    registry.register::<MyComponent>("my-component")?;
    registry.register::<Doubled>("doubled")?;
    registry.seal();

    let mut store = Store::new(registry.clone())?;
    let entity = store.create_entity();
    store.add_component(entity, MyComponent(3))?;
    store.add_component(entity, Doubled::default())?;

    let scheduler = Scheduler::new(registry.clone(), SchedulerConfig::default())?;
    let mut frame = scheduler.frame();
    frame.submit(Task::new("double", |ctx| {
        ctx.query::<(Read<MyComponent>, Write<Doubled>)>()?
            .for_each(|_, (value, doubled)| doubled.0 = value.0 * 2);
        Ok(())
    }).read::<MyComponent>().write::<Doubled>())?;
    frame.submit(Task::new("spawn", |ctx| {
        let mut structure = ctx.structure()?;
        let spawned = structure.create_entity();
        structure.add_component(spawned, MyComponent(10))?;
        Ok(())
    }).structural())?;

    let report = scheduler.run(&mut store, frame)?;

    println!("report: {:?}", report);
    println!("store: {:?}", store);
    println!("entity: {}", entity);
    println!("doubled: {:?}", store.get::<Doubled>(entity));

    for registration in registry.registrations() {
        println!("component: {:?}", registration);
    }

    Ok(())
}
