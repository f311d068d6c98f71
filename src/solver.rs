// src/solver.rs
//! Per-island sequential-impulse solving.
//!
//! Each active island becomes an `IslandTask` that owns value copies of its
//! bodies (`SolverBody`) plus exclusive borrows of its arbiters and
//! constraints. Tasks share no mutable state, so they can be solved on
//! separate threads and written back afterwards.

use crate::arbiter::Arbiter;
use crate::body::{BodyId, BodySet, BodyType, RigidBody};
use crate::config::{ContactSettings, WorldConfig};
use crate::constraint::Constraint;
use crate::island::{IslandHandle, IslandManager};
use crate::math::{Mat3, Real, Vec3};
use crate::pool::ResourcePool;
use std::collections::{BTreeMap, HashMap};

/// Velocity-level snapshot of a body used inside the solver.
#[derive(Debug, Clone, Copy)]
pub struct SolverBody {
    pub id: BodyId,
    pub body_type: BodyType,
    pub position: Vec3,
    pub orientation: Mat3,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub inv_mass: Real,
    pub inv_inertia_world: Mat3,
    /// Angular impulses have no effect.
    pub angular_locked: bool,
    /// Set once an impulse touched this body.
    pub needs_resolution: bool,
}

impl SolverBody {
    pub fn from_body(body: &RigidBody) -> Self {
        Self {
            id: body.id(),
            body_type: body.body_type(),
            position: body.position(),
            orientation: body.orientation(),
            linear_velocity: body.linear_velocity(),
            angular_velocity: body.angular_velocity(),
            inv_mass: body.inverse_mass(),
            inv_inertia_world: body.inverse_inertia_world(),
            angular_locked: body.angular_locked(),
            needs_resolution: false,
        }
    }

    #[inline(always)]
    pub fn apply_impulse_at(&mut self, impulse: Vec3, relative_position: Vec3) {
        self.linear_velocity += impulse * self.inv_mass;
        if !self.angular_locked {
            self.angular_velocity += self.inv_inertia_world * relative_position.cross(impulse);
        }
        self.needs_resolution = true;
    }

    /// Copies the solved velocities back. Static bodies are never written.
    pub fn write_back(&self, body: &mut RigidBody) {
        if body.is_static() {
            return;
        }
        body.linear_velocity = self.linear_velocity;
        body.angular_velocity = self.angular_velocity;
        body.needs_resolution |= self.needs_resolution;
    }
}

/// Two distinct elements of a slice, mutably.
#[inline]
pub(crate) fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> Option<(&mut T, &mut T)> {
    if a == b || a >= items.len() || b >= items.len() {
        return None;
    }
    if a < b {
        let (left, right) = items.split_at_mut(b);
        Some((&mut left[a], &mut right[0]))
    } else {
        let (left, right) = items.split_at_mut(a);
        Some((&mut right[0], &mut left[b]))
    }
}

/// Everything needed to solve one island in isolation.
pub(crate) struct IslandTask<'a> {
    island: IslandHandle,
    pub bodies: Vec<SolverBody>,
    index: HashMap<BodyId, usize>,
    arbiters: Vec<(usize, usize, &'a mut Arbiter)>,
    constraints: Vec<(usize, usize, &'a mut Box<dyn Constraint>)>,
    pub iterations: usize,
}

impl<'a> IslandTask<'a> {
    fn new(island: IslandHandle) -> Self {
        Self {
            island,
            bodies: Vec::new(),
            index: HashMap::new(),
            arbiters: Vec::new(),
            constraints: Vec::new(),
            iterations: 0,
        }
    }

    fn slot(&mut self, body: &RigidBody) -> usize {
        if let Some(i) = self.index.get(&body.id()) {
            return *i;
        }
        let i = self.bodies.len();
        self.bodies.push(SolverBody::from_body(body));
        self.index.insert(body.id(), i);
        i
    }

    pub fn contact_count(&self) -> usize {
        self.arbiters.iter().map(|(_, _, a)| a.len()).sum()
    }

    /// Prepare once, then iterate. Constraints go before contacts each pass.
    pub fn solve(&mut self, dt: Real, settings: &ContactSettings) {
        log::trace!(
            "solving island {:?}: {} bodies, {} contacts, {} iterations",
            self.island,
            self.bodies.len(),
            self.contact_count(),
            self.iterations
        );
        for (i1, i2, constraint) in self.constraints.iter_mut() {
            if let Some((b1, b2)) = pair_mut(&mut self.bodies, *i1, *i2) {
                constraint.prepare_for_iteration(b1, b2, dt);
            }
        }
        for (i1, i2, arbiter) in self.arbiters.iter_mut() {
            if let Some((b1, b2)) = pair_mut(&mut self.bodies, *i1, *i2) {
                for contact in arbiter.contacts_mut() {
                    contact.prepare_for_iteration(b1, b2, dt, settings);
                }
            }
        }

        for _ in 0..self.iterations {
            for (i1, i2, constraint) in self.constraints.iter_mut() {
                if let Some((b1, b2)) = pair_mut(&mut self.bodies, *i1, *i2) {
                    constraint.iterate(b1, b2);
                }
            }
            for (i1, i2, arbiter) in self.arbiters.iter_mut() {
                if let Some((b1, b2)) = pair_mut(&mut self.bodies, *i1, *i2) {
                    for contact in arbiter.contacts_mut() {
                        contact.iterate(b1, b2, settings);
                    }
                }
            }
        }
    }
}

/// Builds one task per active island. Static bodies touched by an island are
/// copied in read-only.
pub(crate) fn build_island_tasks<'a>(
    bodies: &BodySet,
    islands: &IslandManager,
    arbiters: &'a mut ResourcePool<Arbiter>,
    constraints: &'a mut BTreeMap<u64, Box<dyn Constraint>>,
    config: &WorldConfig,
) -> Vec<IslandTask<'a>> {
    let mut tasks = Vec::new();
    let mut task_of: HashMap<IslandHandle, usize> = HashMap::new();

    for (handle, island) in islands.islands() {
        if !island.is_active() {
            continue;
        }
        let mut task = IslandTask::new(handle);
        for id in island.bodies() {
            if let Some(body) = bodies.get(&id) {
                task.slot(body);
            }
        }
        task.iterations = if island.body_count() + island.constraint_count() > 3 {
            config.iterations
        } else {
            config.small_iterations
        };
        task_of.insert(handle, tasks.len());
        tasks.push(task);
    }

    for (_, arbiter) in arbiters.iter_mut() {
        if arbiter.is_empty() {
            continue;
        }
        let (Some(b1), Some(b2)) = (bodies.get(&arbiter.body1()), bodies.get(&arbiter.body2())) else {
            continue;
        };
        let island = b1.island().or(b2.island());
        let Some(t) = island.and_then(|i| task_of.get(&i)) else {
            continue;
        };
        let task = &mut tasks[*t];
        let i1 = task.slot(b1);
        let i2 = task.slot(b2);
        task.arbiters.push((i1, i2, arbiter));
    }

    for constraint in constraints.values_mut() {
        let (a, b) = constraint.bodies();
        let (Some(b1), Some(b2)) = (bodies.get(&a), bodies.get(&b)) else {
            continue;
        };
        let island = b1.island().or(b2.island());
        let Some(t) = island.and_then(|i| task_of.get(&i)) else {
            continue;
        };
        let task = &mut tasks[*t];
        let i1 = task.slot(b1);
        let i2 = task.slot(b2);
        task.constraints.push((i1, i2, constraint));
    }

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::BodyPair;
    use crate::island::Edge;

    #[test]
    fn test_pair_mut_order() {
        let mut v = vec![1, 2, 3, 4];
        {
            let (a, b) = pair_mut(&mut v, 3, 1).unwrap();
            assert_eq!((*a, *b), (4, 2));
            *a = 40;
            *b = 20;
        }
        assert_eq!(v, vec![1, 20, 3, 40]);
        assert!(pair_mut(&mut v, 2, 2).is_none());
        assert!(pair_mut(&mut v, 0, 9).is_none());
    }

    fn chained_island(body_count: usize, constraint_count: u64) -> (BodySet, IslandManager) {
        let mut bodies = BodySet::new();
        let mut islands = IslandManager::new();
        let mut ids = Vec::new();
        for _ in 0..body_count {
            let mut body = RigidBody::dynamic();
            islands.add_body(&mut body).unwrap();
            ids.push(body.id());
            bodies.insert(body.id(), body);
        }
        let mut arbiters = ResourcePool::<Arbiter>::new();
        for w in ids.windows(2) {
            let handle = arbiters.get_new().unwrap();
            islands.connect(&mut bodies, BodyPair::new(w[0], w[1]), Edge::Arbiter(handle));
        }
        for c in 0..constraint_count {
            islands.connect(&mut bodies, BodyPair::new(ids[0], ids[1]), Edge::Constraint(c));
        }
        assert_eq!(islands.len(), 1);
        (bodies, islands)
    }

    fn iterations_for(body_count: usize, constraint_count: u64) -> usize {
        let (bodies, islands) = chained_island(body_count, constraint_count);
        let mut arbiters = ResourcePool::<Arbiter>::new();
        let mut constraints = BTreeMap::new();
        let config = WorldConfig {
            iterations: 10,
            small_iterations: 4,
            ..WorldConfig::default()
        };
        let tasks = build_island_tasks(&bodies, &islands, &mut arbiters, &mut constraints, &config);
        assert_eq!(tasks.len(), 1);
        tasks[0].iterations
    }

    #[test]
    fn test_small_island_iteration_boundary() {
        // Arbiters do not count, constraints do.
        assert_eq!(iterations_for(3, 0), 4);
        assert_eq!(iterations_for(4, 0), 10);
        assert_eq!(iterations_for(2, 1), 4);
        assert_eq!(iterations_for(2, 2), 10);
    }

    #[test]
    fn test_write_back_skips_static() {
        let mut ground = RigidBody::static_body();
        let mut snapshot = SolverBody::from_body(&ground);
        snapshot.linear_velocity = Vec3::X;
        snapshot.write_back(&mut ground);
        assert_eq!(ground.linear_velocity(), Vec3::ZERO);

        let mut block = RigidBody::dynamic();
        let mut snapshot = SolverBody::from_body(&block);
        snapshot.apply_impulse_at(Vec3::Y, Vec3::X);
        snapshot.write_back(&mut block);
        assert_eq!(block.linear_velocity(), Vec3::Y);
        assert!(block.angular_velocity().length() > 0.0);
    }
}
