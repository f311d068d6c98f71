// src/world.rs
//! The simulation world.
//!
//! `World` owns every body and constraint, receives narrow-phase results and
//! runs the fixed step pipeline:
//!
//! 1. pre-step callbacks
//! 2. update cached contacts, queue empty arbiters for removal
//! 3. integrate forces
//! 4. integrate motion (parallel per body)
//! 5. collision detection
//! 6. island maintenance
//! 7. mid-step hooks
//! 8. deactivation check
//! 9. velocity snapshot
//! 10. solve active islands (parallel per island)
//! 11. resolve velocity deltas into positions
//! 12. post-step callbacks

use crate::arbiter::{Arbiter, ArbiterHandle, BodyPair, ContactGeometry, ContactOutcome};
use crate::body::{BodyId, BodySet, BodyType, Damping, RigidBody};
use crate::collision::{CollisionCandidate, CollisionSystem, ContactSink, PrimitiveNarrowPhase, Shape};
use crate::config::WorldConfig;
use crate::constraint::Constraint;
use crate::contact::{Contact, TriangleId};
use crate::debug::{self, DebugDrawer};
use crate::error::{PhysicsError, PhysicsResult};
use crate::events::{BodyHooks, CollisionFilter, WorldEvents};
use crate::island::{Edge, IslandHandle, IslandManager};
use crate::math::{integrate_orientation, Real, Vec3};
use crate::pool::ResourcePool;
use crate::solver::build_island_tasks;
use crate::threading::ThreadManager;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use xxhash_rust::xxh3::Xxh3;

/// Runs a pipeline phase inside a trace span and records its duration in ms.
macro_rules! phase {
    ($name:literal, $slot:expr, $block:expr) => {{
        let _span = tracing::trace_span!($name).entered();
        let start = Instant::now();
        let result = $block;
        $slot = start.elapsed().as_secs_f32() * 1000.0;
        result
    }};
}

/* -------------------------------------------------------------------------- */
/*                                 Metrics                                    */
/* -------------------------------------------------------------------------- */

/// Wall time of each pipeline phase in the last step, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseTimings {
    pub callbacks: f32,
    pub update_contacts: f32,
    pub integrate_forces: f32,
    pub integrate: f32,
    pub detect: f32,
    pub islands: f32,
    pub deactivation: f32,
    pub solve: f32,
    pub resolve: f32,
}

#[derive(Debug, Clone, Default)]
pub struct WorldMetrics {
    pub last_step_time_ms: f32,
    pub total_bodies_count: usize,
    pub active_bodies_count: usize,
    pub constraint_count: usize,
    pub arbiter_count: usize,
    pub contact_count: usize,
    pub island_count: usize,
    pub solved_island_count: usize,
    /// Contacts dropped by `update_contacts` in the last step.
    pub broken_contacts: usize,
    /// Narrow-phase candidates discarded in the last step because a pool was full.
    pub dropped_candidates: usize,
    pub timings: PhaseTimings,
    accumulated_step_time_ms: f32,
    step_count: usize,
}

impl WorldMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn average_step_time_ms(&self) -> f32 {
        if self.step_count > 0 {
            self.accumulated_step_time_ms / self.step_count as f32
        } else {
            0.0
        }
    }
}

#[derive(Clone, Copy)]
enum HookPoint {
    Pre,
    Mid,
    Post,
}

/* -------------------------------------------------------------------------- */
/*                                  World                                     */
/* -------------------------------------------------------------------------- */

pub struct World<C: CollisionSystem = PrimitiveNarrowPhase> {
    config: WorldConfig,
    bodies: BodySet,
    constraints: BTreeMap<u64, Box<dyn Constraint>>,

    arbiters: ResourcePool<Arbiter>,
    arbiter_map: HashMap<BodyPair, ArbiterHandle>,
    added_arbiters: Vec<(ArbiterHandle, BodyPair)>,
    removed_arbiters: Vec<(ArbiterHandle, BodyPair)>,

    islands: IslandManager,
    events: WorldEvents,
    hooks: BTreeMap<BodyId, BodyHooks>,
    filter: Option<CollisionFilter>,

    collision: C,
    sink: ContactSink,
    threads: ThreadManager,

    accumulated_time: Real,
    metrics: WorldMetrics,
}

impl World<PrimitiveNarrowPhase> {
    /// World using the built-in primitive narrow phase.
    pub fn new(config: WorldConfig) -> PhysicsResult<Self> {
        let mut collision = PrimitiveNarrowPhase::new();
        collision.speculative = config.speculative_contacts;
        Self::with_collision_system(config, collision)
    }

    /// Adds a body and registers its collision shape.
    pub fn add_shaped_body(&mut self, mut body: RigidBody, shape: Shape) -> PhysicsResult<BodyId> {
        if self.bodies.contains_key(&body.id()) {
            return Err(PhysicsError::DuplicateBody(body.id()));
        }
        self.collision.attach(&mut body, shape);
        self.add_body(body)
    }
}

impl<C: CollisionSystem> World<C> {
    pub fn with_collision_system(config: WorldConfig, collision: C) -> PhysicsResult<Self> {
        config.validate()?;
        log::info!(
            "physics world: gravity {:?}, {} iterations ({} small)",
            config.gravity,
            config.iterations,
            config.small_iterations
        );
        Ok(Self {
            arbiters: ResourcePool::with_limit(config.max_arbiters),
            threads: ThreadManager::new(config.threads),
            config,
            bodies: BodySet::new(),
            constraints: BTreeMap::new(),
            arbiter_map: HashMap::new(),
            added_arbiters: Vec::new(),
            removed_arbiters: Vec::new(),
            islands: IslandManager::new(),
            events: WorldEvents::default(),
            hooks: BTreeMap::new(),
            filter: None,
            collision,
            sink: ContactSink::new(),
            accumulated_time: 0.0,
            metrics: WorldMetrics::new(),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn events(&self) -> &WorldEvents {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut WorldEvents {
        &mut self.events
    }

    pub fn collision_system(&self) -> &C {
        &self.collision
    }

    pub fn collision_system_mut(&mut self) -> &mut C {
        &mut self.collision
    }

    /// Thread-safe entry for narrow phases that run outside `step`.
    /// Queued candidates are consumed in the next step's detection phase.
    pub fn contact_sink(&self) -> &ContactSink {
        &self.sink
    }

    pub fn thread_manager(&self) -> &ThreadManager {
        &self.threads
    }

    pub fn body(&self, id: BodyId) -> Option<&RigidBody> {
        self.bodies.get(&id)
    }

    pub fn body_mut(&mut self, id: BodyId) -> Option<&mut RigidBody> {
        self.bodies.get_mut(&id)
    }

    /// Every body in id order.
    pub fn bodies(&self) -> &BodySet {
        &self.bodies
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    pub fn constraint(&self, id: u64) -> Option<&dyn Constraint> {
        self.constraints.get(&id).map(|c| c.as_ref())
    }

    pub fn constraint_count(&self) -> usize {
        self.constraints.len()
    }

    /// Live arbiters in pool order.
    pub fn arbiters(&self) -> impl Iterator<Item = &Arbiter> + '_ {
        self.arbiters.iter().map(|(_, a)| a)
    }

    pub fn arbiter_count(&self) -> usize {
        self.arbiter_map.len()
    }

    pub fn arbiter_for(&self, a: BodyId, b: BodyId) -> Option<&Arbiter> {
        self.arbiter_map
            .get(&BodyPair::new(a, b))
            .and_then(|h| self.arbiters.get(*h))
    }

    pub fn contact_count(&self) -> usize {
        self.arbiters().map(Arbiter::len).sum()
    }

    pub fn islands(&self) -> &IslandManager {
        &self.islands
    }

    pub fn metrics(&self) -> &WorldMetrics {
        &self.metrics
    }

    pub fn reset_metrics(&mut self) {
        self.metrics = WorldMetrics::new();
    }

    /// Time carried over by `step_accumulated`.
    pub fn accumulated_time(&self) -> Real {
        self.accumulated_time
    }

    // =========================================================================
    // Tuning
    // =========================================================================

    pub fn set_gravity(&mut self, gravity: Vec3) {
        self.config.gravity = gravity;
    }

    pub fn gravity(&self) -> Vec3 {
        self.config.gravity
    }

    /// Fraction of velocity kept after one second, per component.
    pub fn set_damping_factors(&mut self, angular: Real, linear: Real) -> PhysicsResult<()> {
        if !(0.0..=1.0).contains(&angular) {
            return Err(PhysicsError::invalid_parameter("angular_damping", "must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&linear) {
            return Err(PhysicsError::invalid_parameter("linear_damping", "must be in [0, 1]"));
        }
        self.config.angular_damping = angular;
        self.config.linear_damping = linear;
        Ok(())
    }

    /// Velocities below `angular`/`linear` for `time` seconds put an island to sleep.
    pub fn set_inactivity_threshold(&mut self, angular: Real, linear: Real, time: Real) -> PhysicsResult<()> {
        if !(angular >= 0.0 && linear >= 0.0) {
            return Err(PhysicsError::invalid_parameter("inactivity_threshold", "must be >= 0"));
        }
        if !(time >= 0.0) {
            return Err(PhysicsError::invalid_parameter("deactivation_time", "must be >= 0"));
        }
        self.config.angular_inactivity_threshold = angular * angular;
        self.config.linear_inactivity_threshold = linear * linear;
        self.config.deactivation_time = time;
        Ok(())
    }

    pub fn set_iterations(&mut self, iterations: usize, small_iterations: usize) -> PhysicsResult<()> {
        if iterations == 0 || small_iterations == 0 {
            return Err(PhysicsError::invalid_parameter("iterations", "must be >= 1"));
        }
        if small_iterations > iterations {
            return Err(PhysicsError::invalid_parameter(
                "small_iterations",
                "must not exceed iterations",
            ));
        }
        self.config.iterations = iterations;
        self.config.small_iterations = small_iterations;
        Ok(())
    }

    /// Pairs for which `filter` returns false never get an arbiter.
    pub fn set_collision_filter(
        &mut self,
        filter: impl Fn(&RigidBody, &RigidBody, Option<TriangleId>) -> bool + Send + Sync + 'static,
    ) {
        self.filter = Some(Box::new(filter));
    }

    pub fn clear_collision_filter(&mut self) {
        self.filter = None;
    }

    pub fn set_allow_deactivation(&mut self, allow: bool) {
        self.config.allow_deactivation = allow;
    }

    pub fn set_body_hooks(&mut self, id: BodyId, hooks: BodyHooks) -> PhysicsResult<()> {
        if !self.bodies.contains_key(&id) {
            return Err(PhysicsError::BodyNotFound(id));
        }
        if hooks.is_empty() {
            self.hooks.remove(&id);
        } else {
            self.hooks.insert(id, hooks);
        }
        Ok(())
    }

    pub fn clear_body_hooks(&mut self, id: BodyId) -> Option<BodyHooks> {
        self.hooks.remove(&id)
    }

    // =========================================================================
    // Bodies
    // =========================================================================

    pub fn add_body(&mut self, mut body: RigidBody) -> PhysicsResult<BodyId> {
        let id = body.id();
        if self.bodies.contains_key(&id) {
            return Err(PhysicsError::DuplicateBody(id));
        }
        body.arbiters.clear();
        body.constraints.clear();
        body.island = None;
        body.update();
        self.islands.add_body(&mut body)?;

        log::debug!("body {} added ({:?})", id, body.body_type());
        self.events.body_added(&body);
        self.bodies.insert(id, body);
        Ok(id)
    }

    pub fn add_bodies(&mut self, bodies: impl IntoIterator<Item = RigidBody>) -> PhysicsResult<Vec<BodyId>> {
        bodies.into_iter().map(|b| self.add_body(b)).collect()
    }

    /// Removes a body together with its arbiters and constraints. Each pair
    /// it was touching gets exactly one end-collide event.
    pub fn remove_body(&mut self, id: BodyId) -> PhysicsResult<RigidBody> {
        let Some(body) = self.bodies.get(&id) else {
            return Err(PhysicsError::BodyNotFound(id));
        };
        let connected: Vec<ArbiterHandle> = body.arbiters().collect();
        let constraint_ids: Vec<u64> = body.constraints().collect();

        let mut partners = Vec::new();

        for handle in connected {
            let Some(pair) = self.arbiters.get(handle).map(Arbiter::pair) else {
                continue;
            };
            if self.arbiter_map.get(&pair) == Some(&handle) {
                self.arbiter_map.remove(&pair);
            }
            self.removed_arbiters.retain(|(h, _)| *h != handle);
            self.islands.disconnect(&mut self.bodies, pair, Edge::Arbiter(handle))?;
            self.arbiters.give_back(handle);
            self.events.end_collide(pair);
            partners.extend(pair.other(id));
        }

        // Arbiters created since the last island update are not connected yet.
        let mut pending = Vec::new();
        self.added_arbiters.retain(|(h, pair)| {
            if pair.contains(id) {
                pending.push((*h, *pair));
                false
            } else {
                true
            }
        });
        for (handle, pair) in pending {
            self.arbiter_map.remove(&pair);
            self.arbiters.give_back(handle);
            self.events.end_collide(pair);
        }

        for constraint_id in constraint_ids {
            if let Some(constraint) = self.constraints.remove(&constraint_id) {
                let (a, b) = constraint.bodies();
                let pair = BodyPair::new(a, b);
                self.islands
                    .disconnect(&mut self.bodies, pair, Edge::Constraint(constraint_id))?;
                self.events.constraint_removed(constraint_id);
                partners.extend(pair.other(id));
            }
        }

        let Some(mut body) = self.bodies.remove(&id) else {
            return Err(PhysicsError::BodyNotFound(id));
        };
        body.arbiters.clear();
        body.constraints.clear();
        self.islands.remove_body(&mut body);
        self.hooks.remove(&id);
        self.collision.body_removed(id);

        // Whatever rested on the removed body has to react.
        for partner in partners {
            self.wake_body(partner);
        }

        log::debug!("body {} removed", id);
        self.events.body_removed(&body);
        Ok(body)
    }

    pub fn remove_bodies(&mut self, ids: impl IntoIterator<Item = BodyId>) -> PhysicsResult<Vec<RigidBody>> {
        ids.into_iter().map(|id| self.remove_body(id)).collect()
    }

    /// Changes the motion type, moving the body in or out of the island graph.
    pub fn set_body_type(&mut self, id: BodyId, body_type: BodyType) -> PhysicsResult<()> {
        let Some(body) = self.bodies.get(&id) else {
            return Err(PhysicsError::BodyNotFound(id));
        };
        if body.body_type() == body_type {
            return Ok(());
        }

        let mut edges: Vec<(Edge, BodyPair)> = Vec::new();
        for handle in body.arbiters() {
            if let Some(arbiter) = self.arbiters.get(handle) {
                edges.push((Edge::Arbiter(handle), arbiter.pair()));
            }
        }
        for constraint_id in body.constraints() {
            if let Some(constraint) = self.constraints.get(&constraint_id) {
                let (a, b) = constraint.bodies();
                edges.push((Edge::Constraint(constraint_id), BodyPair::new(a, b)));
            }
        }

        for (edge, pair) in &edges {
            self.islands.disconnect(&mut self.bodies, *pair, *edge)?;
        }
        if let Some(body) = self.bodies.get_mut(&id) {
            self.islands.remove_body(body);
            body.set_body_type(body_type);
            self.islands.add_body(body)?;
        }
        for (edge, pair) in edges {
            self.islands.connect(&mut self.bodies, pair, edge);
        }
        self.wake_body(id);
        Ok(())
    }

    /// Wakes or sleeps the whole island of a body.
    pub fn set_body_active(&mut self, id: BodyId, active: bool) -> PhysicsResult<()> {
        let Some(body) = self.bodies.get(&id) else {
            return Err(PhysicsError::BodyNotFound(id));
        };
        if let Some(island) = body.island() {
            self.set_island_active(island, active);
        }
        Ok(())
    }

    fn wake_body(&mut self, id: BodyId) {
        if let Some(island) = self.bodies.get(&id).and_then(RigidBody::island) {
            self.set_island_active(island, true);
        }
    }

    fn set_island_active(&mut self, handle: IslandHandle, active: bool) {
        let ids: Vec<BodyId> = match self.islands.get(handle) {
            Some(island) => island.bodies().collect(),
            None => return,
        };
        self.islands.set_active(handle, active);
        for id in ids {
            let Some(body) = self.bodies.get_mut(&id) else {
                continue;
            };
            if body.is_active() == active {
                continue;
            }
            body.set_active(active);
            if active {
                log::trace!("body {} activated", id);
                self.events.activated(body);
            } else {
                log::trace!("body {} deactivated", id);
                self.events.deactivated(body);
            }
        }
    }

    // =========================================================================
    // Constraints
    // =========================================================================

    pub fn add_constraint(&mut self, constraint: Box<dyn Constraint>) -> PhysicsResult<u64> {
        let id = constraint.id();
        if self.constraints.contains_key(&id) {
            return Err(PhysicsError::DuplicateConstraint(id));
        }
        let (a, b) = constraint.bodies();
        if a == b {
            return Err(PhysicsError::invalid_parameter("constraint", "bodies must differ"));
        }
        let (Some(body_a), Some(body_b)) = (self.bodies.get(&a), self.bodies.get(&b)) else {
            let missing = if self.bodies.contains_key(&a) { b } else { a };
            return Err(PhysicsError::BodyNotFound(missing));
        };
        if body_a.is_static() && body_b.is_static() {
            return Err(PhysicsError::StaticPair(a, b));
        }

        self.constraints.insert(id, constraint);
        self.islands
            .connect(&mut self.bodies, BodyPair::new(a, b), Edge::Constraint(id));
        self.wake_body(a);
        self.wake_body(b);
        self.events.constraint_added(id);
        Ok(id)
    }

    pub fn remove_constraint(&mut self, id: u64) -> PhysicsResult<Box<dyn Constraint>> {
        let Some(constraint) = self.constraints.remove(&id) else {
            return Err(PhysicsError::ConstraintNotFound(id));
        };
        let (a, b) = constraint.bodies();
        self.islands
            .disconnect(&mut self.bodies, BodyPair::new(a, b), Edge::Constraint(id))?;
        self.wake_body(a);
        self.wake_body(b);
        self.events.constraint_removed(id);
        Ok(constraint)
    }

    // =========================================================================
    // Collisions
    // =========================================================================

    /// Feeds one narrow-phase result into the pair's arbiter, creating the
    /// arbiter on first contact. Returns `None` when the pair was filtered.
    pub fn collision_detected(&mut self, candidate: CollisionCandidate) -> PhysicsResult<Option<ContactOutcome>> {
        let (a, b) = (candidate.body_a, candidate.body_b);
        if a == b {
            return Err(PhysicsError::invalid_parameter("candidate", "bodies must differ"));
        }
        let (Some(body_a), Some(body_b)) = (self.bodies.get(&a), self.bodies.get(&b)) else {
            let missing = if self.bodies.contains_key(&a) { b } else { a };
            return Err(PhysicsError::BodyNotFound(missing));
        };
        if body_a.is_static() && body_b.is_static() {
            return Ok(None);
        }
        if let Some(filter) = &self.filter {
            if !filter(body_a, body_b, candidate.triangle) {
                return Ok(None);
            }
        }

        let pair = BodyPair::new(a, b);
        let handle = self.arbiter_handle(pair)?;

        // Candidate normal points from B to A; arbiter normals point from body1 to body2.
        let geometry = if pair.body1 == a {
            ContactGeometry {
                point1: candidate.point_a,
                point2: candidate.point_b,
                normal: -candidate.normal,
                penetration: candidate.penetration,
                triangle: candidate.triangle,
            }
        } else {
            ContactGeometry {
                point1: candidate.point_b,
                point2: candidate.point_a,
                normal: candidate.normal,
                penetration: candidate.penetration,
                triangle: candidate.triangle,
            }
        };

        let (Some(body1), Some(body2)) = (self.bodies.get(&pair.body1), self.bodies.get(&pair.body2)) else {
            return Err(PhysicsError::BodyNotFound(pair.body1));
        };
        let Some(arbiter) = self.arbiters.get_mut(handle) else {
            return Ok(None);
        };
        let events = &mut self.events;
        let outcome = arbiter.add_contact(
            body1,
            body2,
            geometry,
            &self.config.contact,
            &mut |p: BodyPair, c: &Contact| events.contact_created(p, c),
        );

        if let ContactOutcome::Added(_) = outcome {
            let moving = |b: &RigidBody| b.is_active() && !b.is_static();
            if moving(body1) && !body2.is_active() {
                self.wake_body(pair.body2);
            } else if moving(body2) && !body1.is_active() {
                self.wake_body(pair.body1);
            }
        }
        Ok(Some(outcome))
    }

    fn arbiter_handle(&mut self, pair: BodyPair) -> PhysicsResult<ArbiterHandle> {
        if let Some(handle) = self.arbiter_map.get(&pair) {
            return Ok(*handle);
        }

        // Emptied at the start of this step but touching again: keep it.
        if let Some(i) = self.removed_arbiters.iter().position(|(_, p)| *p == pair) {
            let (handle, _) = self.removed_arbiters.swap_remove(i);
            self.arbiter_map.insert(pair, handle);
            return Ok(handle);
        }

        let handle = self.arbiters.get_new()?;
        if let Some(arbiter) = self.arbiters.get_mut(handle) {
            arbiter.bind(pair);
        }
        self.arbiter_map.insert(pair, handle);
        self.added_arbiters.push((handle, pair));
        log::trace!("arbiter created for {} / {}", pair.body1, pair.body2);
        self.events.begin_collide(pair);
        Ok(handle)
    }

    // =========================================================================
    // Stepping
    // =========================================================================

    /// Advances the simulation by `dt` seconds. `dt == 0` is a no-op.
    pub fn step(&mut self, dt: Real, multithreaded: bool) -> PhysicsResult<()> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(PhysicsError::InvalidTimestep(dt));
        }
        if dt == 0.0 {
            return Ok(());
        }
        let _span = tracing::debug_span!("physics_step", dt).entered();
        let start = Instant::now();

        phase!("pre_step", self.metrics.timings.callbacks, {
            self.events.pre_step(dt);
            self.run_body_hooks(HookPoint::Pre, dt);
        });

        phase!("update_contacts", self.metrics.timings.update_contacts, self.update_contacts());
        phase!("integrate_forces", self.metrics.timings.integrate_forces, self.integrate_forces(dt));
        phase!("integrate", self.metrics.timings.integrate, self.integrate(dt, multithreaded));
        phase!("detect", self.metrics.timings.detect, self.detect());
        phase!("islands", self.metrics.timings.islands, self.update_islands())?;

        self.run_body_hooks(HookPoint::Mid, dt);

        phase!("deactivation", self.metrics.timings.deactivation, self.check_deactivation(dt));
        self.snapshot_velocities();
        phase!("solve", self.metrics.timings.solve, self.solve(dt, multithreaded));
        phase!("resolve", self.metrics.timings.resolve, self.resolve(dt));

        self.run_body_hooks(HookPoint::Post, dt);
        self.events.post_step(dt);

        self.record_metrics(start.elapsed().as_secs_f32() * 1000.0);
        Ok(())
    }

    /// Runs fixed `dt` steps until the accumulated time is used up, at most
    /// `max_steps` of them. Leftover time beyond that is dropped.
    pub fn step_accumulated(
        &mut self,
        total: Real,
        multithreaded: bool,
        dt: Real,
        max_steps: usize,
    ) -> PhysicsResult<usize> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(PhysicsError::InvalidTimestep(dt));
        }
        if !total.is_finite() || total < 0.0 {
            return Err(PhysicsError::InvalidTimestep(total));
        }
        if max_steps == 0 {
            return Err(PhysicsError::invalid_parameter("max_steps", "must be >= 1"));
        }

        self.accumulated_time += total;
        let mut steps = 0;
        while self.accumulated_time >= dt && steps < max_steps {
            self.step(dt, multithreaded)?;
            self.accumulated_time -= dt;
            steps += 1;
        }
        if self.accumulated_time >= dt {
            log::warn!(
                "dropping {:.3}s of simulation time after {} steps",
                self.accumulated_time,
                steps
            );
            self.accumulated_time = 0.0;
        }
        Ok(steps)
    }

    fn run_body_hooks(&mut self, point: HookPoint, dt: Real) {
        for (id, hooks) in self.hooks.iter_mut() {
            let hook = match point {
                HookPoint::Pre => hooks.pre_step.as_mut(),
                HookPoint::Mid => hooks.mid_step.as_mut(),
                HookPoint::Post => hooks.post_step.as_mut(),
            };
            if let (Some(f), Some(body)) = (hook, self.bodies.get_mut(id)) {
                f(body, dt);
            }
        }
    }

    fn update_contacts(&mut self) {
        let break_threshold = self.config.contact.break_threshold;
        let mut emptied = Vec::new();
        let mut broken = 0;

        for (handle, arbiter) in self.arbiters.iter_mut() {
            if arbiter.is_empty() {
                emptied.push((handle, arbiter.pair()));
                continue;
            }
            let (Some(b1), Some(b2)) = (self.bodies.get(&arbiter.body1()), self.bodies.get(&arbiter.body2())) else {
                continue;
            };
            broken += arbiter.update(b1, b2, break_threshold);
        }

        for (handle, pair) in emptied {
            if self.arbiter_map.get(&pair) == Some(&handle) {
                self.arbiter_map.remove(&pair);
            }
            self.removed_arbiters.push((handle, pair));
        }
        self.metrics.broken_contacts = broken;
    }

    fn integrate_forces(&mut self, dt: Real) {
        let gravity = self.config.gravity;
        for body in self.bodies.values_mut() {
            if body.is_active() && !body.is_static() {
                let mut dv = body.force * body.inverse_mass() * dt;
                if body.is_affected_by_gravity() {
                    dv += gravity * dt;
                }
                body.linear_velocity += dv;
                if !body.angular_locked() {
                    body.angular_velocity += body.inv_inertia_world * body.torque * dt;
                }
            }
            body.clear_accumulators();
        }
    }

    fn integrate(&mut self, dt: Real, multithreaded: bool) {
        let linear_factor = self.config.linear_damping.powf(dt);
        let angular_factor = self.config.angular_damping.powf(dt);
        let speculative = self.config.speculative_contacts;

        let mut moving: Vec<&mut RigidBody> = self
            .bodies
            .values_mut()
            .filter(|b| b.is_active() && !b.is_static())
            .collect();

        self.threads.for_each(&mut moving, multithreaded, |body| {
            integrate_body(body, dt, linear_factor, angular_factor, speculative);
        });
    }

    fn detect(&mut self) {
        self.collision.detect(&self.bodies, &self.sink);

        let mut dropped = 0;
        for candidate in self.sink.drain() {
            match self.collision_detected(candidate) {
                Ok(_) => {}
                Err(e) if e.is_exhaustion() => dropped += 1,
                Err(e) => log::trace!("discarded collision candidate: {}", e),
            }
        }
        if dropped > 0 {
            log::warn!("arbiter pool full, {} contact candidate(s) dropped", dropped);
        }
        self.metrics.dropped_candidates = dropped;
    }

    fn update_islands(&mut self) -> PhysicsResult<()> {
        let removed = std::mem::take(&mut self.removed_arbiters);
        for (handle, pair) in removed {
            let pending = self.added_arbiters.iter().position(|(h, _)| *h == handle);
            match pending {
                Some(i) => {
                    self.added_arbiters.swap_remove(i);
                }
                None => self
                    .islands
                    .disconnect(&mut self.bodies, pair, Edge::Arbiter(handle))?,
            }
            self.arbiters.give_back(handle);
            log::trace!("arbiter removed for {} / {}", pair.body1, pair.body2);
            self.events.end_collide(pair);
        }

        let added = std::mem::take(&mut self.added_arbiters);
        for (handle, pair) in added {
            if self.arbiters.contains(handle) {
                self.islands.connect(&mut self.bodies, pair, Edge::Arbiter(handle));
            }
        }
        Ok(())
    }

    fn check_deactivation(&mut self, dt: Real) {
        let handles: Vec<IslandHandle> = self.islands.islands().map(|(h, _)| h).collect();
        let allow = self.config.allow_deactivation;
        let angular_threshold = self.config.angular_inactivity_threshold;
        let linear_threshold = self.config.linear_inactivity_threshold;
        let deactivation_time = self.config.deactivation_time;

        for handle in handles {
            let ids: Vec<BodyId> = match self.islands.get(handle) {
                Some(island) => island.bodies().collect(),
                None => continue,
            };

            let restless = |b: &RigidBody| {
                !b.allows_deactivation()
                    || b.angular_velocity().length_squared() > angular_threshold
                    || b.linear_velocity().length_squared() > linear_threshold
            };
            let stays_awake = !allow || ids.iter().any(|id| self.bodies.get(id).is_some_and(|b| restless(b)));

            let mut sleep = !stays_awake;
            for id in &ids {
                let Some(body) = self.bodies.get_mut(id) else {
                    continue;
                };
                if stays_awake {
                    body.inactive_time = 0.0;
                } else {
                    body.inactive_time += dt;
                    if body.inactive_time < deactivation_time {
                        sleep = false;
                    }
                }
            }

            let was_active = self.islands.get(handle).is_some_and(|i| i.is_active());
            if sleep && was_active {
                log::debug!("island {:?} falls asleep ({} bodies)", handle, ids.len());
            }
            self.set_island_active(handle, !sleep);
        }
    }

    fn snapshot_velocities(&mut self) {
        for body in self.bodies.values_mut() {
            body.stored_linear_velocity = body.linear_velocity;
            body.stored_angular_velocity = body.angular_velocity;
            body.needs_resolution = false;
        }
    }

    fn solve(&mut self, dt: Real, multithreaded: bool) {
        let settings = self.config.contact;
        let mut tasks = build_island_tasks(
            &self.bodies,
            &self.islands,
            &mut self.arbiters,
            &mut self.constraints,
            &self.config,
        );

        self.threads
            .for_each(&mut tasks, multithreaded, |task| task.solve(dt, &settings));

        let mut contacts = 0;
        for task in &tasks {
            contacts += task.contact_count();
            for solved in &task.bodies {
                if let Some(body) = self.bodies.get_mut(&solved.id) {
                    solved.write_back(body);
                }
            }
        }
        self.metrics.solved_island_count = tasks.len();
        self.metrics.contact_count = contacts;
    }

    fn resolve(&mut self, dt: Real) {
        for body in self.bodies.values_mut() {
            if !body.needs_resolution || body.is_static() {
                continue;
            }
            let dv = body.linear_velocity - body.stored_linear_velocity;
            let dw = body.angular_velocity - body.stored_angular_velocity;
            if !body.is_manually_controlled() {
                body.position += dv * dt;
            }
            if !body.angular_locked() {
                body.orientation = integrate_orientation(&body.orientation, dw, dt);
            }
            body.update();
            body.needs_resolution = false;
        }
    }

    fn record_metrics(&mut self, elapsed_ms: f32) {
        let m = &mut self.metrics;
        m.last_step_time_ms = elapsed_ms;
        m.accumulated_step_time_ms += elapsed_ms;
        m.step_count += 1;
        m.total_bodies_count = self.bodies.len();
        m.active_bodies_count = self
            .bodies
            .values()
            .filter(|b| b.is_active() && !b.is_static())
            .count();
        m.constraint_count = self.constraints.len();
        m.arbiter_count = self.arbiter_map.len();
        m.island_count = self.islands.len();
    }

    // =========================================================================
    // Utilities
    // =========================================================================

    /// Removes everything, firing the usual removal events.
    pub fn clear(&mut self) -> PhysicsResult<()> {
        let constraint_ids: Vec<u64> = self.constraints.keys().copied().collect();
        for id in constraint_ids {
            self.remove_constraint(id)?;
        }
        let body_ids: Vec<BodyId> = self.bodies.keys().copied().collect();
        for id in body_ids {
            self.remove_body(id)?;
        }

        self.arbiters.reset_resource_pool();
        self.arbiter_map.clear();
        self.added_arbiters.clear();
        self.removed_arbiters.clear();
        self.islands.clear();
        let _ = self.sink.drain();
        self.accumulated_time = 0.0;
        log::debug!("world cleared");
        Ok(())
    }

    /// Digest of every body's pose and velocity in creation order. Ids are
    /// not hashed, so identically built worlds compare equal.
    pub fn state_hash(&self) -> u64 {
        let mut hasher = Xxh3::new();
        for (index, body) in self.bodies.values().enumerate() {
            hasher.update(&(index as u64).to_le_bytes());
            let o = body.orientation();
            let vectors = [
                body.position(),
                o.x_axis,
                o.y_axis,
                o.z_axis,
                body.linear_velocity(),
                body.angular_velocity(),
            ];
            for v in vectors {
                for c in v.to_array() {
                    hasher.update(&c.to_le_bytes());
                }
            }
            hasher.update(&[body.is_active() as u8]);
        }
        hasher.digest()
    }

    /// Draws every body's bounds and every cached contact.
    pub fn debug_draw(&self, drawer: &mut dyn DebugDrawer) {
        for body in self.bodies.values() {
            debug::draw_body(body, drawer);
        }
        for arbiter in self.arbiters() {
            debug::draw_arbiter(arbiter, drawer);
        }
    }
}

/// Advances one body by its current velocity.
fn integrate_body(body: &mut RigidBody, dt: Real, linear_factor: Real, angular_factor: Real, speculative: bool) {
    if !body.is_manually_controlled() {
        body.position += body.linear_velocity * dt;
    }
    if !body.angular_locked() {
        body.orientation = integrate_orientation(&body.orientation, body.angular_velocity, dt);
    }

    let damping = body.damping();
    if damping.contains(Damping::LINEAR) {
        body.linear_velocity *= linear_factor;
    }
    if damping.contains(Damping::ANGULAR) {
        body.angular_velocity *= angular_factor;
    }

    body.update();
    if speculative || body.uses_speculative_contacts() {
        body.sweep_bounds(dt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::DistanceConstraint;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn zero_g() -> WorldConfig {
        WorldConfig {
            gravity: Vec3::ZERO,
            ..WorldConfig::default()
        }
    }

    fn candidate(a: BodyId, b: BodyId, normal: Vec3, penetration: Real) -> CollisionCandidate {
        CollisionCandidate {
            body_a: a,
            body_b: b,
            point_a: Vec3::ZERO,
            point_b: Vec3::ZERO,
            normal,
            penetration,
            triangle: None,
        }
    }

    #[test]
    fn test_invalid_timestep_rejected() {
        let mut world = World::new(WorldConfig::default()).unwrap();
        assert!(matches!(world.step(-0.1, false), Err(PhysicsError::InvalidTimestep(_))));
        assert!(world.step(Real::NAN, false).is_err());
        assert!(world.step(0.0, false).is_ok());
        assert_eq!(world.metrics().step_count(), 0);
    }

    #[test]
    fn test_free_fall_under_gravity() {
        let config = WorldConfig {
            linear_damping: 1.0,
            ..WorldConfig::default()
        };
        let mut world = World::new(config).unwrap();
        let id = world.add_body(RigidBody::dynamic()).unwrap();
        for _ in 0..60 {
            world.step(1.0 / 60.0, false).unwrap();
        }
        let v = world.body(id).unwrap().linear_velocity();
        assert!((v.y + 9.81).abs() < 1e-3);
    }

    #[test]
    fn test_forces_are_cleared_after_step() {
        let mut world = World::new(zero_g()).unwrap();
        let id = world.add_body(RigidBody::dynamic()).unwrap();
        world.body_mut(id).unwrap().add_force(Vec3::new(60.0, 0.0, 0.0));
        world.step(1.0 / 60.0, false).unwrap();
        let body = world.body(id).unwrap();
        assert_eq!(body.force(), Vec3::ZERO);
        assert!(body.linear_velocity().x > 0.9);
    }

    #[test]
    fn test_candidate_normal_oriented_body1_to_body2() {
        let mut world = World::new(zero_g()).unwrap();
        let first = world.add_body(RigidBody::dynamic()).unwrap();
        let second = world
            .add_body(RigidBody::dynamic().with_position(Vec3::new(0.0, 1.0, 0.0)))
            .unwrap();

        // A = second, B = first: B -> A is +Y, which is also body1 -> body2.
        world
            .collision_detected(candidate(second, first, Vec3::Y, 0.01))
            .unwrap();
        let arbiter = world.arbiter_for(first, second).unwrap();
        assert_eq!(arbiter.body1(), first);
        assert_eq!(arbiter.contacts()[0].normal(), Vec3::Y);

        world.clear().unwrap();
        let first = world.add_body(RigidBody::dynamic()).unwrap();
        let second = world.add_body(RigidBody::dynamic()).unwrap();
        // A = first, B = second with normal -Y means body1 -> body2 is +Y.
        world
            .collision_detected(candidate(first, second, -Vec3::Y, 0.01))
            .unwrap();
        assert_eq!(world.arbiter_for(first, second).unwrap().contacts()[0].normal(), Vec3::Y);
    }

    #[test]
    fn test_static_pairs_and_filtered_pairs_get_no_arbiter() {
        let mut world = World::new(zero_g()).unwrap();
        let s1 = world.add_body(RigidBody::static_body()).unwrap();
        let s2 = world.add_body(RigidBody::static_body()).unwrap();
        let d = world.add_body(RigidBody::dynamic()).unwrap();

        assert_eq!(world.collision_detected(candidate(s1, s2, Vec3::Y, 0.0)).unwrap(), None);
        world.set_collision_filter(|a, b, _| !(a.is_static() || b.is_static()));
        assert_eq!(world.collision_detected(candidate(s1, d, Vec3::Y, 0.0)).unwrap(), None);
        assert_eq!(world.arbiter_count(), 0);

        world.clear_collision_filter();
        assert!(world.collision_detected(candidate(s1, d, Vec3::Y, 0.0)).unwrap().is_some());
        assert_eq!(world.arbiter_count(), 1);
    }

    #[test]
    fn test_vetoed_contact_arbiter_removed_next_step() {
        let mut world = World::new(zero_g()).unwrap();
        let a = world.add_body(RigidBody::dynamic()).unwrap();
        let b = world.add_body(RigidBody::dynamic()).unwrap();
        let ended = Arc::new(Mutex::new(0));
        {
            let ended = Arc::clone(&ended);
            world.events_mut().on_end_collide(move |_, _| *ended.lock() += 1);
        }
        world.events_mut().set_contact_created(|_, _| false);

        let outcome = world.collision_detected(candidate(a, b, Vec3::Y, 0.01)).unwrap();
        assert_eq!(outcome, Some(ContactOutcome::Vetoed));
        assert_eq!(world.arbiter_count(), 1);

        world.step(1.0 / 60.0, false).unwrap();
        assert_eq!(world.arbiter_count(), 0);
        assert_eq!(*ended.lock(), 1);
    }

    #[test]
    fn test_constraint_validation() {
        let mut world = World::new(zero_g()).unwrap();
        let s1 = world.add_body(RigidBody::static_body()).unwrap();
        let s2 = world.add_body(RigidBody::static_body()).unwrap();
        let d = world.add_body(RigidBody::dynamic()).unwrap();

        let both_static = DistanceConstraint::new(s1, s2, Vec3::ZERO, Vec3::ZERO, 1.0);
        assert!(matches!(
            world.add_constraint(Box::new(both_static)),
            Err(PhysicsError::StaticPair(..))
        ));

        let ghost = RigidBody::dynamic().id();
        let dangling = DistanceConstraint::new(d, ghost, Vec3::ZERO, Vec3::ZERO, 1.0);
        assert!(matches!(
            world.add_constraint(Box::new(dangling)),
            Err(PhysicsError::BodyNotFound(id)) if id == ghost
        ));

        let ok = DistanceConstraint::new(s1, d, Vec3::ZERO, Vec3::ZERO, 1.0);
        let id = world.add_constraint(Box::new(ok.clone())).unwrap();
        assert!(matches!(
            world.add_constraint(Box::new(ok)),
            Err(PhysicsError::DuplicateConstraint(_))
        ));
        assert!(world.remove_constraint(id).is_ok());
        assert!(matches!(
            world.remove_constraint(id),
            Err(PhysicsError::ConstraintNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_and_missing_bodies() {
        let mut world = World::new(zero_g()).unwrap();
        let body = RigidBody::dynamic();
        let copy = body.clone();
        let id = world.add_body(body).unwrap();
        assert!(matches!(world.add_body(copy), Err(PhysicsError::DuplicateBody(_))));
        world.remove_body(id).unwrap();
        assert!(matches!(world.remove_body(id), Err(PhysicsError::BodyNotFound(_))));
    }

    #[test]
    fn test_step_accumulated_caps_steps() {
        let mut world = World::new(zero_g()).unwrap();
        world.add_body(RigidBody::dynamic()).unwrap();
        let dt = 1.0 / 60.0;
        assert_eq!(world.step_accumulated(dt * 2.5, false, dt, 10).unwrap(), 2);
        assert!((world.accumulated_time() - dt * 0.5).abs() < 1e-5);

        assert_eq!(world.step_accumulated(1.0, false, dt, 5).unwrap(), 5);
        assert_eq!(world.accumulated_time(), 0.0);
        assert!(world.step_accumulated(1.0, false, 0.0, 5).is_err());
    }

    #[test]
    fn test_tuning_validation() {
        let mut world = World::new(zero_g()).unwrap();
        assert!(world.set_damping_factors(1.2, 0.5).is_err());
        assert!(world.set_iterations(2, 4).is_err());
        assert!(world.set_iterations(0, 0).is_err());
        assert!(world.set_iterations(8, 2).is_ok());
        assert!(world.set_inactivity_threshold(-1.0, 0.1, 1.0).is_err());
        world.set_inactivity_threshold(0.2, 0.3, 1.0).unwrap();
        assert!((world.config().linear_inactivity_threshold - 0.09).abs() < 1e-6);
    }

    #[test]
    fn test_hooks_run_in_order() {
        let mut world = World::new(zero_g()).unwrap();
        let id = world.add_body(RigidBody::dynamic()).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let (l1, l2, l3, l4, l5) = (
            Arc::clone(&log),
            Arc::clone(&log),
            Arc::clone(&log),
            Arc::clone(&log),
            Arc::clone(&log),
        );
        world.events_mut().on_pre_step(move |_| l1.lock().push("world pre"));
        world.events_mut().on_post_step(move |_| l2.lock().push("world post"));
        world
            .set_body_hooks(
                id,
                BodyHooks::new()
                    .with_pre_step(move |_, _| l3.lock().push("body pre"))
                    .with_mid_step(move |_, _| l4.lock().push("body mid"))
                    .with_post_step(move |_, _| l5.lock().push("body post")),
            )
            .unwrap();

        world.step(1.0 / 60.0, false).unwrap();
        assert_eq!(
            *log.lock(),
            vec!["world pre", "body pre", "body mid", "body post", "world post"]
        );
    }

    #[test]
    fn test_set_body_type_moves_body_out_of_islands() {
        let mut world = World::new(zero_g()).unwrap();
        let a = world.add_body(RigidBody::dynamic()).unwrap();
        let b = world.add_body(RigidBody::dynamic()).unwrap();
        let c = world.add_body(RigidBody::dynamic()).unwrap();
        world
            .add_constraint(Box::new(DistanceConstraint::new(a, b, Vec3::ZERO, Vec3::ZERO, 1.0)))
            .unwrap();
        world
            .add_constraint(Box::new(DistanceConstraint::new(b, c, Vec3::ZERO, Vec3::ZERO, 1.0)))
            .unwrap();
        assert_eq!(world.islands().len(), 1);

        world.set_body_type(b, BodyType::Static).unwrap();
        assert!(world.body(b).unwrap().island().is_none());
        assert_eq!(world.islands().len(), 2);
        assert_eq!(world.body(b).unwrap().connection_count(), 2);

        world.set_body_type(b, BodyType::Dynamic).unwrap();
        assert_eq!(world.islands().len(), 1);
    }

    #[test]
    fn test_clear_fires_removal_events() {
        let mut world = World::new(zero_g()).unwrap();
        let removed = Arc::new(Mutex::new(0));
        {
            let removed = Arc::clone(&removed);
            world.events_mut().on_body_removed(move |_| *removed.lock() += 1);
        }
        world
            .add_bodies([RigidBody::dynamic(), RigidBody::dynamic(), RigidBody::static_body()])
            .unwrap();
        world.clear().unwrap();
        assert_eq!(*removed.lock(), 3);
        assert_eq!(world.body_count(), 0);
        assert!(world.islands().is_empty());
    }
}
