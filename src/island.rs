// src/island.rs
//! Islands: groups of non-static bodies transitively connected through live
//! arbiters or constraints.
//!
//! Islands are maintained incrementally. Connecting two bodies of different
//! islands merges the smaller island into the larger one; disconnecting two
//! bodies of the same island runs a breadth-first search and splits off the
//! part that is no longer reachable. Static bodies never belong to an island,
//! so they never glue islands together.

use crate::arbiter::{ArbiterHandle, BodyPair};
use crate::body::{BodyId, BodySet, RigidBody};
use crate::error::PhysicsResult;
use crate::pool::{Handle, PoolStats, Reset, ResourcePool};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

pub type IslandHandle = Handle<Island>;

/// A connection between two bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Edge {
    Arbiter(ArbiterHandle),
    Constraint(u64),
}

#[derive(Debug, Default)]
pub struct Island {
    bodies: BTreeSet<BodyId>,
    edges: BTreeMap<Edge, BodyPair>,
    active: bool,
}

impl Reset for Island {
    fn reset(&mut self) {
        self.bodies.clear();
        self.edges.clear();
        self.active = true;
    }
}

impl Island {
    pub fn bodies(&self) -> impl Iterator<Item = BodyId> + '_ {
        self.bodies.iter().copied()
    }

    pub fn arbiters(&self) -> impl Iterator<Item = ArbiterHandle> + '_ {
        self.edges.keys().filter_map(|e| match e {
            Edge::Arbiter(h) => Some(*h),
            Edge::Constraint(_) => None,
        })
    }

    pub fn constraints(&self) -> impl Iterator<Item = u64> + '_ {
        self.edges.keys().filter_map(|e| match e {
            Edge::Constraint(id) => Some(*id),
            Edge::Arbiter(_) => None,
        })
    }

    #[inline]
    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    pub fn constraint_count(&self) -> usize {
        self.constraints().count()
    }

    pub fn arbiter_count(&self) -> usize {
        self.arbiters().count()
    }

    #[inline]
    pub fn contains(&self, id: BodyId) -> bool {
        self.bodies.contains(&id)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }
}

#[derive(Default)]
pub struct IslandManager {
    pool: ResourcePool<Island>,
}

impl IslandManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn get(&self, handle: IslandHandle) -> Option<&Island> {
        self.pool.get(handle)
    }

    /// Islands in pool order.
    pub fn islands(&self) -> impl Iterator<Item = (IslandHandle, &Island)> + '_ {
        self.pool.iter()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub(crate) fn set_active(&mut self, handle: IslandHandle, active: bool) {
        if let Some(island) = self.pool.get_mut(handle) {
            island.active = active;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.pool.reset_resource_pool();
    }

    /// Puts a non-static body into its own island.
    pub fn add_body(&mut self, body: &mut RigidBody) -> PhysicsResult<()> {
        if body.is_static() || body.island.is_some() {
            return Ok(());
        }
        let handle = self.pool.get_new()?;
        if let Some(island) = self.pool.get_mut(handle) {
            island.bodies.insert(body.id());
            island.active = body.is_active();
        }
        body.island = Some(handle);
        Ok(())
    }

    /// Takes a body out of its island. All of its edges must already be disconnected.
    pub fn remove_body(&mut self, body: &mut RigidBody) {
        debug_assert_eq!(body.connection_count(), 0);
        let Some(handle) = body.island.take() else {
            return;
        };
        let now_empty = match self.pool.get_mut(handle) {
            Some(island) => {
                island.bodies.remove(&body.id());
                island.bodies.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.pool.give_back(handle);
        }
    }

    /// Records a new edge and merges the islands it joins.
    pub fn connect(&mut self, bodies: &mut BodySet, pair: BodyPair, edge: Edge) {
        for id in [pair.body1, pair.body2] {
            if let Some(body) = bodies.get_mut(&id) {
                match edge {
                    Edge::Arbiter(h) => body.arbiters.insert(h),
                    Edge::Constraint(c) => body.constraints.insert(c),
                };
            }
        }

        let island1 = bodies.get(&pair.body1).and_then(|b| b.island);
        let island2 = bodies.get(&pair.body2).and_then(|b| b.island);

        let target = match (island1, island2) {
            (Some(a), Some(b)) if a != b => Some(self.merge(bodies, a, b)),
            (Some(a), _) | (None, Some(a)) => Some(a),
            (None, None) => None,
        };

        if let Some(island) = target.and_then(|h| self.pool.get_mut(h)) {
            island.edges.insert(edge, pair);
        }
    }

    /// Removes an edge and splits its island if the two bodies lost their last path.
    pub fn disconnect(&mut self, bodies: &mut BodySet, pair: BodyPair, edge: Edge) -> PhysicsResult<()> {
        for id in [pair.body1, pair.body2] {
            if let Some(body) = bodies.get_mut(&id) {
                match edge {
                    Edge::Arbiter(h) => body.arbiters.remove(&h),
                    Edge::Constraint(c) => body.constraints.remove(&c),
                };
            }
        }

        let island1 = bodies.get(&pair.body1).and_then(|b| b.island);
        let island2 = bodies.get(&pair.body2).and_then(|b| b.island);

        for handle in [island1, island2].into_iter().flatten() {
            if let Some(island) = self.pool.get_mut(handle) {
                island.edges.remove(&edge);
            }
        }

        if let (Some(a), Some(b)) = (island1, island2) {
            if a == b {
                self.split(bodies, a, pair.body1, pair.body2)?;
            }
        }
        Ok(())
    }

    fn merge(&mut self, bodies: &mut BodySet, a: IslandHandle, b: IslandHandle) -> IslandHandle {
        let size = |h: IslandHandle| self.pool.get(h).map_or(0, Island::body_count);
        let (keep, absorb) = if size(a) >= size(b) { (a, b) } else { (b, a) };

        let (moved_bodies, moved_edges, absorbed_active) = match self.pool.get_mut(absorb) {
            Some(island) => (
                std::mem::take(&mut island.bodies),
                std::mem::take(&mut island.edges),
                island.active,
            ),
            None => return keep,
        };
        self.pool.give_back(absorb);

        for id in &moved_bodies {
            if let Some(body) = bodies.get_mut(id) {
                body.island = Some(keep);
            }
        }

        if let Some(island) = self.pool.get_mut(keep) {
            island.bodies.extend(moved_bodies);
            island.edges.extend(moved_edges);
            island.active |= absorbed_active;
        }
        log::trace!("merged island {:?} into {:?}", absorb, keep);
        keep
    }

    fn split(&mut self, bodies: &mut BodySet, handle: IslandHandle, start: BodyId, target: BodyId) -> PhysicsResult<()> {
        let reached = {
            let Some(island) = self.pool.get(handle) else {
                return Ok(());
            };
            let mut reached = BTreeSet::new();
            let mut queue = VecDeque::new();
            reached.insert(start);
            queue.push_back(start);

            while let Some(id) = queue.pop_front() {
                let Some(body) = bodies.get(&id) else { continue };
                let edges = body
                    .arbiters
                    .iter()
                    .map(|h| Edge::Arbiter(*h))
                    .chain(body.constraints.iter().map(|c| Edge::Constraint(*c)));
                for edge in edges {
                    let Some(next) = island.edges.get(&edge).and_then(|p| p.other(id)) else {
                        continue;
                    };
                    if !island.bodies.contains(&next) {
                        continue;
                    }
                    if next == target {
                        return Ok(());
                    }
                    if reached.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
            reached
        };

        let new_handle = self.pool.get_new()?;
        let (moved_edges, active) = match self.pool.get_mut(handle) {
            Some(island) => {
                island.bodies.retain(|id| !reached.contains(id));
                let moved: BTreeMap<Edge, BodyPair> = island
                    .edges
                    .iter()
                    .filter(|(_, p)| reached.contains(&p.body1) || reached.contains(&p.body2))
                    .map(|(e, p)| (*e, *p))
                    .collect();
                island.edges.retain(|e, _| !moved.contains_key(e));
                (moved, island.active)
            }
            None => (BTreeMap::new(), true),
        };

        for id in &reached {
            if let Some(body) = bodies.get_mut(id) {
                body.island = Some(new_handle);
            }
        }

        if let Some(island) = self.pool.get_mut(new_handle) {
            island.bodies = reached;
            island.edges = moved_edges;
            island.active = active;
        }
        log::trace!("split island {:?} off {:?}", new_handle, handle);
        Ok(())
    }
}
