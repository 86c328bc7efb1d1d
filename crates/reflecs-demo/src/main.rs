//! Server/client replication walkthrough
//!
//! This binary:
//! 1. Builds a server bridge and loads the `sim` module into it
//! 2. Creates a handful of host objects and runs some frames
//! 3. Snapshots every object and applies the payloads to a client bridge
//!
//! Configuration comes from `REFLECS_*` variables (see `BridgeConfig`) plus
//! `DEMO_FRAMES` for the number of frames to run.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use reflecs_ecs::{ComponentValue, Entity, Reflect, TermList, TypeDescription};
use reflecs_host::{Bridge, BridgeConfig, EntityRecord, HostNotifier, Module, ModuleContext, ObjectId};
use reflecs_net::{NetRole, pod_hooks};
use reflecs_tick::{Phase, SystemBuilder};
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct Position {
    x: f32,
    y: f32,
}

impl Reflect for Position {
    fn describe() -> TypeDescription {
        TypeDescription::pod::<Self>("Sim.Position").replicated(pod_hooks::<Self>())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct Velocity {
    x: f32,
    y: f32,
}

impl Reflect for Velocity {
    fn describe() -> TypeDescription {
        TypeDescription::pod::<Self>("Sim.Velocity").replicated(pod_hooks::<Self>())
    }
}

/// Server-only bookkeeping, never replicated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct Ticks(u32);

impl Reflect for Ticks {
    fn describe() -> TypeDescription {
        TypeDescription::pod::<Self>("Sim.Ticks")
    }
}

struct Sim;

impl Module for Sim {
    fn name(&self) -> &str {
        "sim"
    }

    fn load(&mut self, ctx: &mut ModuleContext<'_>) -> reflecs_host::Result<()> {
        let pos = ctx.register::<Position>()?;
        let vel = ctx.register::<Velocity>()?;
        let ticks = ctx.register::<Ticks>()?;

        ctx.register_system(
            SystemBuilder::new("sim.integrate")
                .terms(TermList::new().write(pos).read(vel))
                .parallel_safe(true)
                .run(move |ctx| {
                    let delta = ctx.delta();
                    ctx.for_each(|row| {
                        let p: Position = row.get(pos)?;
                        let v: Velocity = row.get(vel)?;
                        row.set(pos, Position {
                            x: v.x.mul_add(delta, p.x),
                            y: v.y.mul_add(delta, p.y),
                        })
                    })
                }),
        )?;
        ctx.register_system(
            SystemBuilder::new("sim.count")
                .terms(TermList::new().write(ticks))
                .parallel_safe(true)
                .run(move |ctx| ctx.for_each(|row| row.set(ticks, Ticks(row.get::<Ticks>(ticks)?.0 + 1)))),
        )?;
        ctx.register_system(
            SystemBuilder::new("sim.report")
                .terms(TermList::new().read(pos))
                .phase(Phase::POST_UPDATE)
                .run(move |ctx| {
                    let moved = ctx.rows().count();
                    tracing::debug!(frame = ctx.frame(), moved, "integrated");
                    Ok(())
                }),
        )?;
        Ok(())
    }
}

struct LogNotifier(&'static str);

impl HostNotifier for LogNotifier {
    fn entity_deleted(&self, object: ObjectId, entity: Entity) {
        warn!(side = self.0, %object, %entity, "entity deleted under host object");
    }
}

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let frames: u32 = std::env::var("DEMO_FRAMES")
        .ok()
        .and_then(|f| f.parse().ok())
        .unwrap_or(10);

    let config = BridgeConfig::from_env();
    info!(?config, frames, "starting demo");

    let mut server = Bridge::with_notifier(
        BridgeConfig {
            role: NetRole::Server,
            ..config.clone()
        },
        Arc::new(LogNotifier("server")),
    )?;
    server.load_module(Sim)?;

    let pos = server.register::<Position>()?;
    let vel = server.register::<Velocity>()?;
    let ticks = server.register::<Ticks>()?;

    let mut objects = Vec::new();
    for i in 0..4u16 {
        let object = ObjectId(u64::from(i) + 1);
        let speed = f32::from(i) + 1.0;
        let record = EntityRecord::new()
            .with(pos)
            .with(ticks)
            .value(ComponentValue::from_typed(
                server.world().registry(),
                vel,
                Velocity { x: speed, y: -speed },
            )?)
            .name(format!("mover-{i}"));
        if let Some(entity) = server.create_object(object, &record)? {
            objects.push((object, entity));
        }
    }

    let delta = 1.0 / 60.0;
    for _ in 0..frames {
        let report = server.progress(delta)?;
        for phase in report.phases.iter().filter(|p| !p.is_clean()) {
            warn!(phase = %phase.phase, failures = phase.failures.len(), "phase had failures");
        }
    }

    let mut client = Bridge::with_notifier(
        BridgeConfig {
            role: NetRole::Client,
            world_name: format!("{}-client", config.world_name),
            ..config
        },
        Arc::new(LogNotifier("client")),
    )?;
    let client_pos = client.register::<Position>()?;
    client.register::<Velocity>()?;

    for &(object, entity) in &objects {
        let bytes = server.snapshot_all(entity)?;
        let replica = client.spawn_object(object)?;
        let report = client.apply_snapshot(replica, &bytes)?;
        let position = client.get::<Position>(replica, client_pos)?;
        info!(
            %object,
            bytes = bytes.len(),
            applied = ?report.applied,
            skipped = report.skipped.len(),
            ?position,
            "replicated"
        );
    }

    if let Some(&(object, _)) = objects.first() {
        server.destroy_object(object);
        client.destroy_object(object);
    }

    info!(
        server_entities = server.world().entity_count(),
        client_entities = client.world().entity_count(),
        "demo finished"
    );
    server.shutdown();
    client.shutdown();
    Ok(())
}
