//! Collision resolution
//!
//! Broad phase comes from the quadtree, narrow phase is an exact circle
//! overlap test against current positions. Each unordered pair is handled at
//! most once per tick.

use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::CollisionConfig;
use crate::game::constants::mass_to_radius;
use crate::game::spatial::{coincident_nudge, is_coincident, QuadTree, SpatialEntry};
use crate::game::state::{AgentId, Cell, CellId, CellPair, GameState};

/// Something that happened while resolving collisions
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CollisionEvent {
    PelletConsumed {
        cell: CellId,
        owner: AgentId,
        pellet: CellId,
        mass: f32,
    },
    Absorbed {
        absorber: CellId,
        absorber_owner: AgentId,
        target: CellId,
        target_owner: AgentId,
        mass: f32,
    },
}

impl CollisionEvent {
    /// Cell that gained mass
    pub fn gainer(&self) -> CellId {
        match *self {
            CollisionEvent::PelletConsumed { cell, .. } => cell,
            CollisionEvent::Absorbed { absorber, .. } => absorber,
        }
    }

    /// Mass gained by [`gainer`](Self::gainer)
    pub fn mass(&self) -> f32 {
        match *self {
            CollisionEvent::PelletConsumed { mass, .. } | CollisionEvent::Absorbed { mass, .. } => mass,
        }
    }
}

/// Result of examining one candidate pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairOutcome {
    /// Not touching (yet); may be examined again this pass
    Apart,
    /// Touching and resolved
    Resolved,
    /// Resolved, and the driving cell was absorbed
    DriverGone,
}

/// How a touching pair interacts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interaction {
    /// Two pellets, never interact
    None,
    /// `eater` consumes the pellet
    ConsumePellet { eater: CellId, pellet: CellId },
    /// Both cells belong to the same agent; recombine handles them
    SameOwner,
    /// `absorber` is strictly heavier than `target` by the absorption threshold
    Absorb { absorber: CellId, target: CellId },
    /// Push apart
    Separate,
}

/// Classify a touching pair of live cells
pub fn classify(a: &Cell, b: &Cell, absorption_threshold: f32) -> Interaction {
    match (a.owner, b.owner) {
        (None, None) => Interaction::None,
        (Some(_), None) => Interaction::ConsumePellet {
            eater: a.id,
            pellet: b.id,
        },
        (None, Some(_)) => Interaction::ConsumePellet {
            eater: b.id,
            pellet: a.id,
        },
        (Some(x), Some(y)) if x == y => Interaction::SameOwner,
        (Some(_), Some(_)) => {
            let (big, small) = if a.mass >= b.mass { (a, b) } else { (b, a) };
            if can_absorb(big.mass, small.mass, absorption_threshold) {
                Interaction::Absorb {
                    absorber: big.id,
                    target: small.id,
                }
            } else {
                Interaction::Separate
            }
        }
    }
}

/// Absorption requires `absorber > target * threshold` (strict)
#[inline]
pub fn can_absorb(absorber_mass: f32, target_mass: f32, threshold: f32) -> bool {
    absorber_mass > target_mass * threshold
}

/// Exact overlap test: strictly closer than the sum of radii
#[inline]
pub fn overlaps(a: &Cell, b: &Cell) -> bool {
    let reach = a.radius() + b.radius();
    a.position.distance_sq_to(b.position) < reach * reach
}

/// Reusable per-tick collision pass
#[derive(Debug, Default)]
pub struct CollisionResolver {
    processed: FxHashSet<CellPair>,
    candidates: Vec<SpatialEntry>,
    order: Vec<CellId>,
    /// Radius at index time of every cell that gained mass this pass
    indexed_radius: FxHashMap<CellId, f32>,
    /// Largest radius growth of any cell since the index was built
    growth: f32,
}

impl CollisionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pairs resolved during the last pass
    pub fn processed_pairs(&self) -> usize {
        self.processed.len()
    }

    /// Resolve every touching pair found through `index`.
    ///
    /// Agent cells drive the pass in id order; pellets only appear as
    /// candidates, so pellet-pellet pairs are never examined. The index holds
    /// radii from before the pass, so queries are widened by the largest
    /// growth seen so far, and a cell that grows is queried again until its
    /// reach stops growing.
    pub fn resolve<R: Rng + ?Sized>(
        &mut self,
        state: &mut GameState,
        index: &QuadTree,
        config: &CollisionConfig,
        rng: &mut R,
        events: &mut Vec<CollisionEvent>,
    ) {
        self.processed.clear();
        self.indexed_radius.clear();
        self.growth = 0.0;
        self.order.clear();
        self.order
            .extend(state.cells.values().filter(|c| c.alive && !c.is_pellet()).map(|c| c.id));
        self.order.sort_unstable();

        for i in 0..self.order.len() {
            let id = self.order[i];
            let mut reach = 0.0;

            loop {
                let Some(cell) = state.cells.get(&id).copied() else {
                    break;
                };
                if !cell.alive {
                    break;
                }
                let query_radius = cell.radius() + self.growth;
                if query_radius <= reach {
                    break;
                }
                reach = query_radius;

                self.candidates.clear();
                index.query_circle(cell.position, query_radius, &mut self.candidates);

                let mut driver_gone = false;
                for j in 0..self.candidates.len() {
                    let other = self.candidates[j].id;
                    let pair = CellPair::new(id, other);
                    if other == id || self.processed.contains(&pair) {
                        continue;
                    }
                    let first_event = events.len();
                    match resolve_pair(state, id, other, config, rng, events) {
                        PairOutcome::Apart => {}
                        PairOutcome::Resolved => {
                            self.processed.insert(pair);
                        }
                        PairOutcome::DriverGone => {
                            self.processed.insert(pair);
                            driver_gone = true;
                        }
                    }
                    self.track_growth(state, &events[first_event..]);
                    if driver_gone {
                        break;
                    }
                }
                if driver_gone {
                    break;
                }
            }
        }
    }

    fn track_growth(&mut self, state: &GameState, new_events: &[CollisionEvent]) {
        for event in new_events {
            let Some(cell) = state.cells.get(&event.gainer()) else {
                continue;
            };
            let now = cell.radius();
            let before = *self
                .indexed_radius
                .entry(cell.id)
                .or_insert_with(|| mass_to_radius(cell.mass - event.mass()));
            self.growth = self.growth.max(now - before);
        }
    }
}

/// Resolve one pair driven by cell `id`
fn resolve_pair<R: Rng + ?Sized>(
    state: &mut GameState,
    id: CellId,
    other: CellId,
    config: &CollisionConfig,
    rng: &mut R,
    events: &mut Vec<CollisionEvent>,
) -> PairOutcome {
    let (Some(mut a), Some(mut b)) = (state.cells.get(&id).copied(), state.cells.get(&other).copied()) else {
        return if state.cells.get(&id).map_or(false, |c| c.alive) {
            PairOutcome::Apart
        } else {
            PairOutcome::DriverGone
        };
    };
    if !a.alive {
        return PairOutcome::DriverGone;
    }
    if !b.alive || !overlaps(&a, &b) {
        return PairOutcome::Apart;
    }

    match classify(&a, &b, config.absorption_threshold) {
        Interaction::None | Interaction::SameOwner => {}
        Interaction::ConsumePellet { eater, .. } => {
            let (eater_cell, pellet_cell) = if eater == a.id { (&mut a, &mut b) } else { (&mut b, &mut a) };
            eater_cell.mass += pellet_cell.mass;
            pellet_cell.alive = false;
            events.push(CollisionEvent::PelletConsumed {
                cell: eater_cell.id,
                owner: eater_cell.owner.unwrap_or_default(),
                pellet: pellet_cell.id,
                mass: pellet_cell.mass,
            });
            store(state, a);
            store(state, b);
        }
        Interaction::Absorb { absorber, .. } => {
            let (big, small) = if absorber == a.id { (&mut a, &mut b) } else { (&mut b, &mut a) };
            big.mass += small.mass;
            small.alive = false;
            tracing::debug!(
                "Cell {} absorbed cell {} ({:.1} mass)",
                big.id,
                small.id,
                small.mass
            );
            events.push(CollisionEvent::Absorbed {
                absorber: big.id,
                absorber_owner: big.owner.unwrap_or_default(),
                target: small.id,
                target_owner: small.owner.unwrap_or_default(),
                mass: small.mass,
            });
            store(state, a);
            store(state, b);
        }
        Interaction::Separate => {
            separate(&mut a, &mut b, config, rng);
            store(state, a);
            store(state, b);
        }
    }

    if a.alive {
        PairOutcome::Resolved
    } else {
        PairOutcome::DriverGone
    }
}

#[inline]
fn store(state: &mut GameState, cell: Cell) {
    if let Some(slot) = state.cells.get_mut(&cell.id) {
        *slot = cell;
    }
}

/// Push two overlapping cells apart along the center normal, inversely
/// weighted by mass, and exchange a restitution impulse if they approach.
pub fn separate<R: Rng + ?Sized>(a: &mut Cell, b: &mut Cell, config: &CollisionConfig, rng: &mut R) {
    if is_coincident(a.position, b.position) {
        b.position += coincident_nudge(rng);
    }

    let (normal, distance) = (b.position - a.position).normalize_with_length();
    if distance <= 0.0 {
        return;
    }
    let overlap = a.radius() + b.radius() - distance;
    if overlap <= 0.0 {
        return;
    }

    let inv_a = 1.0 / a.mass;
    let inv_b = 1.0 / b.mass;
    let inv_total = inv_a + inv_b;

    let push = overlap * config.separation_stiffness;
    a.position -= normal * (push * inv_a / inv_total);
    b.position += normal * (push * inv_b / inv_total);

    let approach = (b.velocity - a.velocity).dot(normal);
    if approach < 0.0 {
        let impulse = -(1.0 + config.restitution) * approach / inv_total;
        a.velocity -= normal * (impulse * inv_a);
        b.velocity += normal * (impulse * inv_b);
    }
}
