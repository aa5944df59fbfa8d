//! Simulation state: the id-keyed cell store and the agents that own cells
//!
//! Pellets live in the same store as agent cells with `owner: None`, so the
//! spatial index and the collision pass treat every circle uniformly.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::game::constants::{mass_to_radius, spawn};
use crate::game::spatial::{SpatialEntry, SpatialError};
use crate::util::vec2::Vec2;

/// Cell identifier, allocated monotonically and never reused
pub type CellId = u32;

/// Agent identifier, allocated monotonically and never reused
pub type AgentId = u32;

/// Unordered pair of cell ids, stored with the smaller id first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellPair(CellId, CellId);

impl CellPair {
    #[inline]
    pub fn new(a: CellId, b: CellId) -> Self {
        if a <= b {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }
}

/// A circle in the arena: an agent's cell or an ownerless pellet
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Cell {
    pub position: Vec2,
    pub velocity: Vec2,
    pub mass: f32,
    pub alive: bool,
    /// Clock time (ms) from which this cell may merge with its siblings
    pub recombine_eligible_at: u64,
    /// `None` for pellets
    pub owner: Option<AgentId>,
    pub id: CellId,
}

impl Cell {
    pub fn new(id: CellId, owner: AgentId, position: Vec2, mass: f32) -> Self {
        Self {
            position,
            velocity: Vec2::ZERO,
            mass,
            alive: true,
            recombine_eligible_at: 0,
            owner: Some(owner),
            id,
        }
    }

    pub fn pellet(id: CellId, position: Vec2, mass: f32) -> Self {
        Self {
            position,
            velocity: Vec2::ZERO,
            mass,
            alive: true,
            recombine_eligible_at: 0,
            owner: None,
            id,
        }
    }

    #[inline]
    pub fn radius(&self) -> f32 {
        mass_to_radius(self.mass)
    }

    #[inline]
    pub fn is_pellet(&self) -> bool {
        self.owner.is_none()
    }

    /// Cooldown has elapsed at clock time `now_ms`
    #[inline]
    pub fn can_recombine(&self, now_ms: u64) -> bool {
        now_ms >= self.recombine_eligible_at
    }

    pub fn spatial_entry(&self) -> Result<SpatialEntry, SpatialError> {
        SpatialEntry::new(self.id, self.position, self.mass)
    }
}

/// In-progress forced recombine.
///
/// The convergence point is the owner's mass-weighted centroid, recomputed
/// every tick from live cells.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ForcedRecombine {
    pub started_at: u64,
    pub ends_at: u64,
    /// Mass-weighted average velocity of the cells when the recombine started
    pub average_velocity: Vec2,
}

/// A participant controlling one or more cells
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub cells: SmallVec<[CellId; 16]>,
    /// World-space point the agent's cells steer toward
    pub pointer: Option<Vec2>,
    pub forced_recombine: Option<ForcedRecombine>,
    /// Cleared on disconnect; its cells are retired before the next tick moves anything
    pub connected: bool,
    pub is_bot: bool,
    pub color_index: u8,
    pub joined_at: u64,
    pub id: AgentId,
    pub name: String,
}

impl Agent {
    pub fn new(id: AgentId, name: String, is_bot: bool, color_index: u8) -> Self {
        Self {
            cells: SmallVec::new(),
            pointer: None,
            forced_recombine: None,
            connected: true,
            is_bot,
            color_index,
            joined_at: 0,
            id,
            name,
        }
    }

    #[inline]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn is_recombining(&self) -> bool {
        self.forced_recombine.is_some()
    }
}

/// Structural invariant violations detected at the end of a step
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("agent {agent} is alive with no cells")]
    EmptyAgent { agent: AgentId },
    #[error("agent {agent} owns {count} cells (ceiling {max})")]
    TooManyCells { agent: AgentId, count: usize, max: usize },
    #[error("cell {cell} has non-positive mass {mass}")]
    NonPositiveMass { cell: CellId, mass: f32 },
    #[error("cell {cell} has a non-finite position or velocity")]
    NonFiniteState { cell: CellId },
    #[error("cell {cell} is owned by missing agent {agent}")]
    OrphanCell { cell: CellId, agent: AgentId },
    #[error("agent {agent} lists cell {cell} which it does not own")]
    DanglingCellRef { agent: AgentId, cell: CellId },
}

/// Renderer-facing view of one cell
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CellView {
    pub id: CellId,
    pub position: Vec2,
    pub radius: f32,
    pub mass: f32,
    pub color_index: u8,
    /// Empty for pellets
    pub name: String,
}

/// Cells and total mass of one agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSnapshot {
    pub agent_id: AgentId,
    pub cells: Vec<CellView>,
    pub total_mass: f32,
}

/// Result entry of a proximity query
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NearbyEntity {
    pub id: CellId,
    pub owner: Option<AgentId>,
    pub position: Vec2,
    pub radius: f32,
    pub mass: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardEntry {
    pub agent_id: AgentId,
    pub name: String,
    pub total_mass: f32,
    pub cell_count: usize,
}

/// Complete simulation state
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GameState {
    pub tick: u64,
    /// Monotonic clock in milliseconds, sampled once per step
    pub now_ms: u64,
    pub cells: HashMap<CellId, Cell>,
    pub agents: HashMap<AgentId, Agent>,
    next_cell_id: CellId,
    next_agent_id: AgentId,
}

impl GameState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a new unique cell ID
    pub fn next_cell_id(&mut self) -> CellId {
        let id = self.next_cell_id;
        self.next_cell_id += 1;
        id
    }

    /// The ID the next cell will receive
    pub fn peek_cell_id(&self) -> CellId {
        self.next_cell_id
    }

    /// Generate a new unique agent ID
    pub fn next_agent_id(&mut self) -> AgentId {
        let id = self.next_agent_id;
        self.next_agent_id += 1;
        id
    }

    pub fn get_cell(&self, id: CellId) -> Option<&Cell> {
        self.cells.get(&id)
    }

    pub fn get_cell_mut(&mut self, id: CellId) -> Option<&mut Cell> {
        self.cells.get_mut(&id)
    }

    pub fn get_agent(&self, id: AgentId) -> Option<&Agent> {
        self.agents.get(&id)
    }

    pub fn get_agent_mut(&mut self, id: AgentId) -> Option<&mut Agent> {
        self.agents.get_mut(&id)
    }

    /// Register an agent with no cells yet
    pub fn add_agent(&mut self, name: String, is_bot: bool) -> AgentId {
        let id = self.next_agent_id();
        let color_index = (id % spawn::COLOR_COUNT as u32) as u8;
        let mut agent = Agent::new(id, name, is_bot, color_index);
        agent.joined_at = self.now_ms;
        self.agents.insert(id, agent);
        id
    }

    /// Create a cell for `owner` and append it to the owner's cell list.
    /// Returns `None` if the owner does not exist.
    pub fn spawn_cell(&mut self, owner: AgentId, position: Vec2, velocity: Vec2, mass: f32, recombine_eligible_at: u64) -> Option<CellId> {
        if !self.agents.contains_key(&owner) {
            return None;
        }
        let id = self.next_cell_id();
        let mut cell = Cell::new(id, owner, position, mass);
        cell.velocity = velocity;
        cell.recombine_eligible_at = recombine_eligible_at;
        self.cells.insert(id, cell);
        if let Some(agent) = self.agents.get_mut(&owner) {
            agent.cells.push(id);
        }
        Some(id)
    }

    /// Add an ownerless pellet
    pub fn add_pellet(&mut self, position: Vec2, mass: f32) -> CellId {
        let id = self.next_cell_id();
        self.cells.insert(id, Cell::pellet(id, position, mass));
        id
    }

    /// Live cells and pellets
    pub fn live_cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values().filter(|c| c.alive)
    }

    /// Live cells belonging to `agent`, in the agent's order
    pub fn agent_cells(&self, agent: AgentId) -> impl Iterator<Item = &Cell> + '_ {
        self.agents
            .get(&agent)
            .into_iter()
            .flat_map(|a| a.cells.iter())
            .filter_map(|id| self.cells.get(id))
            .filter(|c| c.alive)
    }

    pub fn agent_total_mass(&self, agent: AgentId) -> f32 {
        self.agent_cells(agent).map(|c| c.mass).sum()
    }

    /// Sum of mass over every live cell and pellet
    pub fn total_mass(&self) -> f32 {
        self.live_cells().map(|c| c.mass).sum()
    }

    pub fn pellet_count(&self) -> usize {
        self.live_cells().filter(|c| c.is_pellet()).count()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Count of live cells owned by agents
    pub fn player_cell_count(&self) -> usize {
        self.live_cells().filter(|c| !c.is_pellet()).count()
    }

    /// Kill every cell owned by a disconnected agent so it takes no further
    /// part in motion, collisions or recombining. Returns the cells killed.
    pub fn retire_disconnected(&mut self) -> usize {
        let mut retired = 0;
        for agent in self.agents.values().filter(|a| !a.connected) {
            for cell_id in &agent.cells {
                if let Some(cell) = self.cells.get_mut(cell_id) {
                    if cell.alive {
                        cell.alive = false;
                        retired += 1;
                    }
                }
            }
        }
        retired
    }

    /// Remove dead cells, drop them from their owners' lists, and remove
    /// agents that are disconnected or have no cells left.
    /// Returns the removed agents.
    pub fn prune_dead(&mut self) -> Vec<AgentId> {
        self.retire_disconnected();

        self.cells.retain(|_, c| c.alive);

        let cells = &self.cells;
        for agent in self.agents.values_mut() {
            agent.cells.retain(|id| cells.contains_key(id));
        }

        let mut removed: Vec<AgentId> = self
            .agents
            .values()
            .filter(|a| a.cells.is_empty() || !a.connected)
            .map(|a| a.id)
            .collect();
        removed.sort_unstable();
        for id in &removed {
            self.agents.remove(id);
            tracing::info!("Agent {} removed", id);
        }
        removed
    }

    /// Verify the structural invariants of the store
    pub fn check_invariants(&self, max_cells: usize) -> Result<(), InvariantViolation> {
        for cell in self.cells.values() {
            if !cell.alive {
                continue;
            }
            if !(cell.mass > 0.0) {
                return Err(InvariantViolation::NonPositiveMass {
                    cell: cell.id,
                    mass: cell.mass,
                });
            }
            if !cell.position.is_finite() || !cell.velocity.is_finite() {
                return Err(InvariantViolation::NonFiniteState { cell: cell.id });
            }
            if let Some(owner) = cell.owner {
                match self.agents.get(&owner) {
                    None => {
                        return Err(InvariantViolation::OrphanCell {
                            cell: cell.id,
                            agent: owner,
                        })
                    }
                    Some(agent) if !agent.cells.contains(&cell.id) => {
                        return Err(InvariantViolation::OrphanCell {
                            cell: cell.id,
                            agent: owner,
                        })
                    }
                    Some(_) => {}
                }
            }
        }

        for agent in self.agents.values() {
            if agent.cells.is_empty() {
                return Err(InvariantViolation::EmptyAgent { agent: agent.id });
            }
            if agent.cells.len() > max_cells {
                return Err(InvariantViolation::TooManyCells {
                    agent: agent.id,
                    count: agent.cells.len(),
                    max: max_cells,
                });
            }
            for cell_id in &agent.cells {
                let owned = self
                    .cells
                    .get(cell_id)
                    .map_or(false, |c| c.owner == Some(agent.id));
                if !owned {
                    return Err(InvariantViolation::DanglingCellRef {
                        agent: agent.id,
                        cell: *cell_id,
                    });
                }
            }
        }

        Ok(())
    }

    pub fn cell_view(&self, cell: &Cell) -> CellView {
        let (color_index, name) = match cell.owner.and_then(|id| self.agents.get(&id)) {
            Some(agent) => (agent.color_index, agent.name.clone()),
            None => ((cell.id % spawn::COLOR_COUNT as u32) as u8, String::new()),
        };
        CellView {
            id: cell.id,
            position: cell.position,
            radius: cell.radius(),
            mass: cell.mass,
            color_index,
            name,
        }
    }

    pub fn snapshot(&self, agent: AgentId) -> Option<AgentSnapshot> {
        let owner = self.agents.get(&agent)?;
        let cells: Vec<CellView> = owner
            .cells
            .iter()
            .filter_map(|id| self.cells.get(id))
            .filter(|c| c.alive)
            .map(|c| self.cell_view(c))
            .collect();
        let total_mass = cells.iter().map(|c| c.mass).sum();
        Some(AgentSnapshot {
            agent_id: agent,
            cells,
            total_mass,
        })
    }

    /// Top `n` agents by total mass; ties go to the older agent
    pub fn leaderboard(&self, n: usize) -> Vec<LeaderboardEntry> {
        let mut entries: Vec<LeaderboardEntry> = self
            .agents
            .values()
            .map(|a| LeaderboardEntry {
                agent_id: a.id,
                name: a.name.clone(),
                total_mass: self.agent_total_mass(a.id),
                cell_count: a.cells.len(),
            })
            .collect();
        entries.sort_by(|a, b| {
            b.total_mass
                .total_cmp(&a.total_mass)
                .then(a.agent_id.cmp(&b.agent_id))
        });
        entries.truncate(n);
        entries
    }
}
