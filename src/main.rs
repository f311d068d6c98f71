#![cfg(not(target_arch = "wasm32"))]

use std::backtrace::Backtrace;
use std::fs::File;
use std::io::Write;
use std::panic;

use anyhow::Context;
use log::{info, LevelFilter};
use slop_physics::prelude::*;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const FIXED_DT: f32 = 1.0 / 60.0;
const FRAME_TIME: f32 = 1.0 / 30.0;
const SIM_SECONDS: f32 = 10.0;

fn main() -> anyhow::Result<()> {
    setup_diagnostics();

    // Optional first argument: path to a JSON world configuration.
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path).with_context(|| format!("reading config {path}"))?;
            WorldConfig::from_json(&json).with_context(|| format!("parsing config {path}"))?
        }
        None => WorldConfig::default(),
    };
    let multithreaded = config.threads != 1;

    let mut world = World::new(config).context("creating physics world")?;
    build_scene(&mut world)?;

    world.events_mut().on_body_deactivated(|body| {
        log::debug!("body {:?} fell asleep at {:?}", body.id(), body.position());
    });

    info!("Simulating {} bodies for {SIM_SECONDS}s...", world.body_count());
    let frames = (SIM_SECONDS / FRAME_TIME) as usize;
    for frame in 0..frames {
        world.step_accumulated(FRAME_TIME, multithreaded, FIXED_DT, 4)?;
        if frame % 60 == 0 {
            let m = world.metrics();
            info!(
                "t={:>5.2}s active {}/{} arbiters {} contacts {} islands {} ({:.3} ms/step)",
                frame as f32 * FRAME_TIME,
                m.active_bodies_count,
                m.total_bodies_count,
                m.arbiter_count,
                m.contact_count,
                m.island_count,
                m.last_step_time_ms,
            );
        }
    }

    let m = world.metrics();
    info!(
        "Done: {} steps, average {:.3} ms/step, state hash {:016x}",
        m.step_count(),
        m.average_step_time_ms(),
        world.state_hash()
    );
    Ok(())
}

/// A ground plane, a five-box tower and a handful of spheres dropped beside it.
fn build_scene(world: &mut World) -> anyhow::Result<()> {
    world.add_shaped_body(RigidBody::static_body(), Shape::Plane)?;

    let half = Vec3::splat(0.5);
    for level in 0..5 {
        let body = RigidBody::dynamic()
            .with_position(Vec3::new(0.0, 0.5 + level as f32 * 1.0, 0.0))
            .with_mass_properties(MassProperties::solid_box(1.0, half))?;
        world.add_shaped_body(body, Shape::Box { half_extents: half })?;
    }

    for i in 0..6 {
        let angle = i as f32 * std::f32::consts::TAU / 6.0;
        let body = RigidBody::dynamic()
            .with_position(Vec3::new(3.0 * angle.cos(), 2.0 + i as f32 * 0.5, 3.0 * angle.sin()))
            .with_mass_properties(MassProperties::solid_sphere(0.5, 0.4))?
            .with_material(Material::bouncy());
        world.add_shaped_body(body, Shape::Sphere { radius: 0.4 })?;
    }
    Ok(())
}

/// Sets up logging and crash dumping.
fn setup_diagnostics() {
    env_logger::Builder::new()
        .filter_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .format_timestamp_millis()
        .format_target(false)
        .parse_default_env()
        .init();

    panic::set_hook(Box::new(|panic_info| {
        let backtrace = Backtrace::force_capture();

        let msg = match panic_info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };

        let location = panic_info
            .location()
            .map_or("Unknown location".to_string(), |loc| format!("{}:{}", loc.file(), loc.line()));

        let crash_msg = format!(
            "=== PHYSICS CRASH ===\nReason: {}\nLocation: {}\n\nStack Trace:\n{}",
            msg, location, backtrace
        );
        eprintln!("\x1b[31;1m{}\x1b[0m", crash_msg);

        if let Ok(mut file) = File::create("physics_crash.log") {
            let _ = file.write_all(crash_msg.as_bytes());
            eprintln!("Crash report saved to physics_crash.log");
        }
    }));
}
