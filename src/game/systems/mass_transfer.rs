//! Split / recombine state machine
//!
//! Every operation checks eligibility before touching any cell, so an
//! ineligible request leaves the state exactly as it was. Mass moves between
//! cells of one agent; only absorption and pellets change an agent's total.

use bitvec::prelude::*;
use rand::Rng;
use smallvec::SmallVec;

use crate::config::{RecombineConfig, SplitConfig};
use crate::game::constants::mass_to_radius;
use crate::game::state::{AgentId, Cell, CellId, ForcedRecombine, GameState};
use crate::util::vec2::Vec2;

/// A cell split off from a parent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitEvent {
    pub owner: AgentId,
    pub parent: CellId,
    pub child: CellId,
    pub child_mass: f32,
    /// Triggered by the mass ceiling rather than the agent
    pub overflow: bool,
}

/// Two cells of one agent consolidated into `survivor`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeEvent {
    pub owner: AgentId,
    pub survivor: CellId,
    pub consumed: CellId,
    /// Survivor mass after the merge
    pub mass: f32,
    pub forced: bool,
}

/// Per-agent split results; never more than the cell ceiling
pub type SplitEvents = SmallVec<[SplitEvent; 16]>;

/// Launch direction for a split.
///
/// Points at `target` unless it lies inside the dead zone, in which case a
/// random direction is used. A small random jitter is always added.
pub fn split_direction<R: Rng + ?Sized>(from: Vec2, target: Option<Vec2>, config: &SplitConfig, rng: &mut R) -> Vec2 {
    let base = match target {
        Some(target) => {
            let (direction, distance) = (target - from).normalize_with_length();
            if distance > config.pointer_dead_zone {
                direction
            } else {
                Vec2::random_unit(rng)
            }
        }
        None => Vec2::random_unit(rng),
    };
    let jitter = config.direction_jitter;
    if jitter > 0.0 && jitter.is_finite() {
        base.rotate(rng.gen_range(-jitter..=jitter))
    } else {
        base
    }
}

/// Live cells of `agent` in store order
fn live_cell_ids(state: &GameState, agent: AgentId) -> SmallVec<[CellId; 16]> {
    state.agent_cells(agent).map(|c| c.id).collect()
}

/// Split one cell along `direction`. The caller has already checked
/// eligibility and slot availability.
fn split_cell(
    state: &mut GameState,
    cell_id: CellId,
    direction: Vec2,
    config: &SplitConfig,
    eligible_at: u64,
    overflow: bool,
) -> Option<SplitEvent> {
    let mut parent = state.get_cell(cell_id).copied()?;
    let owner = parent.owner?;

    let split_mass = parent.mass * config.ratio;
    let child_mass = split_mass * (1.0 - config.loss_ratio);
    parent.mass -= split_mass;

    let offset = parent.radius() + mass_to_radius(child_mass) + config.margin;
    let child_position = parent.position + direction * offset;
    let child_velocity = direction * config.momentum;

    parent.velocity -= direction * (config.momentum * config.recoil);
    parent.recombine_eligible_at = eligible_at;
    if let Some(slot) = state.get_cell_mut(cell_id) {
        *slot = parent;
    }

    let child = state.spawn_cell(owner, child_position, child_velocity, child_mass, eligible_at)?;
    tracing::debug!(
        "Agent {} split cell {} -> {} ({:.1} / {:.1})",
        owner,
        cell_id,
        child,
        parent.mass,
        child_mass
    );

    Some(SplitEvent {
        owner,
        parent: cell_id,
        child,
        child_mass,
        overflow,
    })
}

/// Split every eligible cell of `agent`, largest first, bounded by free slots.
///
/// Eligible iff the agent is not force-recombining, has fewer than
/// `max_cells` live cells, and at least one cell has `min_split_mass`.
/// Returns no events (and mutates nothing) when ineligible.
pub fn split_agent<R: Rng + ?Sized>(
    state: &mut GameState,
    agent: AgentId,
    target: Option<Vec2>,
    config: &SplitConfig,
    recombine: &RecombineConfig,
    rng: &mut R,
) -> SplitEvents {
    let mut events = SplitEvents::new();

    match state.get_agent(agent) {
        Some(a) if !a.is_recombining() => {}
        _ => return events,
    }

    let ids = live_cell_ids(state, agent);
    let free_slots = config.max_cells.saturating_sub(ids.len());
    if free_slots == 0 {
        return events;
    }

    let mut eligible: SmallVec<[(CellId, f32, Vec2); 16]> = ids
        .iter()
        .filter_map(|id| state.get_cell(*id))
        .filter(|c| c.mass >= config.min_split_mass)
        .map(|c| (c.id, c.mass, c.position))
        .collect();
    if eligible.is_empty() {
        return events;
    }
    eligible.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    eligible.truncate(free_slots);

    let eligible_at = state.now_ms + recombine.delay_ms;
    for (cell_id, _, position) in eligible {
        let direction = split_direction(position, target, config, rng);
        if let Some(event) = split_cell(state, cell_id, direction, config, eligible_at, false) {
            events.push(event);
        }
    }
    events
}

/// Split `cell` in a random direction if it is above the mass ceiling and
/// its owner has a free slot.
pub fn overflow_split<R: Rng + ?Sized>(
    state: &mut GameState,
    cell: CellId,
    config: &SplitConfig,
    recombine: &RecombineConfig,
    rng: &mut R,
) -> Option<SplitEvent> {
    let (owner, mass) = match state.get_cell(cell) {
        Some(c) if c.alive => (c.owner?, c.mass),
        _ => return None,
    };
    if mass <= config.overflow_ceiling {
        return None;
    }
    if state.get_agent(owner)?.is_recombining() {
        return None;
    }
    if state.agent_cells(owner).count() >= config.max_cells {
        return None;
    }

    let direction = Vec2::random_unit(rng);
    let eligible_at = state.now_ms + recombine.delay_ms;
    split_cell(state, cell, direction, config, eligible_at, true)
}

/// Merge `consumed` into `survivor`: masses sum, position and velocity are
/// mass-weighted.
fn merge_into(survivor: &mut Cell, consumed: &mut Cell) {
    let total = survivor.mass + consumed.mass;
    let ws = survivor.mass / total;
    let wc = consumed.mass / total;
    survivor.position = survivor.position * ws + consumed.position * wc;
    survivor.velocity = survivor.velocity * ws + consumed.velocity * wc;
    survivor.mass = total;
    consumed.alive = false;
}

/// Larger mass survives; ties go to the lower id
fn survivor_first(a: &Cell, b: &Cell) -> bool {
    a.mass > b.mass || (a.mass == b.mass && a.id < b.id)
}

/// Merge every pair of the agent's cells that are past cooldown and closer
/// than `combined_radius * proximity_factor`.
///
/// Pairs are collected first and applied afterwards; a cell takes part in
/// at most one merge per call.
pub fn auto_recombine(state: &mut GameState, agent: AgentId, config: &RecombineConfig, events: &mut Vec<MergeEvent>) -> usize {
    match state.get_agent(agent) {
        Some(a) if !a.is_recombining() && a.cells.len() >= 2 => {}
        _ => return 0,
    }

    let now = state.now_ms;
    let cells: SmallVec<[Cell; 16]> = state
        .agent_cells(agent)
        .filter(|c| c.can_recombine(now))
        .copied()
        .collect();
    if cells.len() < 2 {
        return 0;
    }

    let mut pairs: SmallVec<[(usize, usize); 16]> = SmallVec::new();
    for i in 0..cells.len() {
        for j in (i + 1)..cells.len() {
            let reach = (cells[i].radius() + cells[j].radius()) * config.proximity_factor;
            if cells[i].position.distance_sq_to(cells[j].position) < reach * reach {
                pairs.push((i, j));
            }
        }
    }

    let mut merged = bitvec![0; cells.len()];
    let mut count = 0;
    for (i, j) in pairs {
        if merged[i] || merged[j] {
            continue;
        }
        merged.set(i, true);
        merged.set(j, true);

        let (s, c) = if survivor_first(&cells[i], &cells[j]) { (i, j) } else { (j, i) };
        let (Some(mut survivor), Some(mut consumed)) =
            (state.get_cell(cells[s].id).copied(), state.get_cell(cells[c].id).copied())
        else {
            continue;
        };
        merge_into(&mut survivor, &mut consumed);
        // Fresh consolidation keeps the later of the two deadlines
        survivor.recombine_eligible_at = survivor.recombine_eligible_at.max(consumed.recombine_eligible_at);

        tracing::debug!(
            "Agent {} merged cell {} into {} ({:.1} mass)",
            agent,
            consumed.id,
            survivor.id,
            survivor.mass
        );
        events.push(MergeEvent {
            owner: agent,
            survivor: survivor.id,
            consumed: consumed.id,
            mass: survivor.mass,
            forced: false,
        });

        if let Some(slot) = state.get_cell_mut(survivor.id) {
            *slot = survivor;
        }
        if let Some(slot) = state.get_cell_mut(consumed.id) {
            *slot = consumed;
        }
        count += 1;
    }
    count
}

/// Mass-weighted centroid and velocity of the agent's live cells
fn weighted_center(state: &GameState, agent: AgentId) -> Option<(Vec2, Vec2, f32)> {
    let mut total = 0.0;
    let mut position = Vec2::ZERO;
    let mut velocity = Vec2::ZERO;
    for cell in state.agent_cells(agent) {
        total += cell.mass;
        position += cell.position * cell.mass;
        velocity += cell.velocity * cell.mass;
    }
    if total > 0.0 {
        Some((position / total, velocity / total, total))
    } else {
        None
    }
}

/// Start a forced recombine for `agent`.
///
/// Eligible iff the agent has at least two live cells and no forced
/// recombine in progress. `target` becomes the agent's pointer.
pub fn try_force_recombine(state: &mut GameState, agent: AgentId, target: Option<Vec2>, config: &RecombineConfig) -> bool {
    match state.get_agent(agent) {
        Some(a) if !a.is_recombining() => {}
        _ => return false,
    }
    if state.agent_cells(agent).count() < 2 {
        return false;
    }
    let Some((_, average_velocity, _)) = weighted_center(state, agent) else {
        return false;
    };

    let now = state.now_ms;
    let Some(owner) = state.get_agent_mut(agent) else {
        return false;
    };
    owner.forced_recombine = Some(ForcedRecombine {
        started_at: now,
        ends_at: now + config.forced_duration_ms,
        average_velocity,
    });
    if target.is_some() {
        owner.pointer = target;
    }
    tracing::debug!("Agent {} started forced recombine", agent);
    true
}

/// Drive an in-progress forced recombine.
///
/// Before the deadline every cell heads for the mass-weighted centroid at
/// `forced_speed`. At the deadline (or once only one cell is left) all cells
/// consolidate into the largest, which keeps a fraction of the pre-merge
/// average velocity. Returns `true` when the recombine completed this call.
pub fn advance_forced_recombine(state: &mut GameState, agent: AgentId, config: &RecombineConfig, events: &mut Vec<MergeEvent>) -> bool {
    let Some(forced) = state.get_agent(agent).and_then(|a| a.forced_recombine) else {
        return false;
    };
    let now = state.now_ms;
    let ids = live_cell_ids(state, agent);

    if now < forced.ends_at && ids.len() > 1 {
        let Some((center, _, _)) = weighted_center(state, agent) else {
            return false;
        };
        for id in &ids {
            if let Some(cell) = state.get_cell_mut(*id) {
                let (direction, distance) = (center - cell.position).normalize_with_length();
                cell.velocity = if distance > f32::EPSILON {
                    direction * config.forced_speed
                } else {
                    Vec2::ZERO
                };
            }
        }
        return false;
    }

    complete_forced_recombine(state, agent, forced, &ids, config, events);
    true
}

fn complete_forced_recombine(
    state: &mut GameState,
    agent: AgentId,
    forced: ForcedRecombine,
    ids: &[CellId],
    config: &RecombineConfig,
    events: &mut Vec<MergeEvent>,
) {
    if let Some(owner) = state.get_agent_mut(agent) {
        owner.forced_recombine = None;
    }

    let mut cells: SmallVec<[Cell; 16]> = ids.iter().filter_map(|id| state.get_cell(*id)).copied().collect();
    if cells.is_empty() {
        return;
    }
    cells.sort_by(|a, b| b.mass.total_cmp(&a.mass).then(a.id.cmp(&b.id)));

    let mut survivor = cells[0];
    let mut mass = survivor.mass;
    let mut position = survivor.position * survivor.mass;
    for consumed in cells.iter_mut().skip(1) {
        mass += consumed.mass;
        position += consumed.position * consumed.mass;
        consumed.alive = false;
        events.push(MergeEvent {
            owner: agent,
            survivor: survivor.id,
            consumed: consumed.id,
            mass,
            forced: true,
        });
        if let Some(slot) = state.get_cell_mut(consumed.id) {
            *slot = *consumed;
        }
    }

    survivor.mass = mass;
    survivor.position = position / mass;
    survivor.velocity = forced.average_velocity * config.forced_velocity_retention;
    if let Some(slot) = state.get_cell_mut(survivor.id) {
        *slot = survivor;
    }

    tracing::debug!(
        "Agent {} completed forced recombine into cell {} ({:.1} mass)",
        agent,
        survivor.id,
        mass
    );
}
