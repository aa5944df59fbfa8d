//! Simulation facade
//!
//! Owns the cell store, the quadtree, the RNG and the tick clock, and runs
//! one atomic step at a time. Observers read between steps only.

use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{ConfigError, SimConfig};
use crate::game::constants::{mass_to_radius, spawn};
use crate::game::input_buffer::{AgentIntent, InputBuffer, Intent, IntentSender};
use crate::game::spatial::{Aabb, QuadTree, QuadTreeStats, SpatialEntry, SpatialError};
use crate::game::state::{
    AgentId, AgentSnapshot, CellId, CellView, GameState, InvariantViolation, LeaderboardEntry, NearbyEntity,
};
use crate::game::systems::collision::{CollisionEvent, CollisionResolver};
use crate::game::systems::mass_transfer::{self, MergeEvent, SplitEvent};
use crate::game::systems::motion::{self, Bounds};
use crate::game::systems::pellets::{self, PelletSpawnState};
use crate::metrics::SimMetrics;
use crate::util::vec2::Vec2;

/// Errors surfaced by a step
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimError {
    #[error("spatial index rejected an entity: {0}")]
    Spatial(#[from] SpatialError),
    #[error("structural invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),
}

/// Callbacks for cosmetic effects, invoked synchronously during a step
pub trait EffectHook: Send {
    fn on_absorption(&mut self, _absorber: CellId, _target: CellId, _mass: f32) {}
    fn on_pellet_consumed(&mut self, _cell: CellId, _pellet: CellId, _mass: f32) {}
    fn on_merge(&mut self, _merge: &MergeEvent) {}
}

/// Hook that ignores every effect
#[derive(Debug, Default)]
pub struct NoEffects;

impl EffectHook for NoEffects {}

/// What happened during one step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub now_ms: u64,
    /// `CollisionEvent::Absorbed` entries only
    pub absorptions: Vec<CollisionEvent>,
    pub pellets_consumed: usize,
    pub splits: Vec<SplitEvent>,
    pub merges: Vec<MergeEvent>,
    pub forced_recombines_completed: usize,
    pub agents_died: Vec<AgentId>,
    /// Mass added by pellet replenishment
    pub mass_spawned: f32,
}

pub struct Simulation {
    config: SimConfig,
    state: GameState,
    index: QuadTree,
    /// Index no longer matches cell positions
    index_dirty: bool,
    rng: StdRng,
    input: InputBuffer,
    intents: Vec<AgentIntent>,
    collisions: CollisionResolver,
    collision_events: Vec<CollisionEvent>,
    pellet_spawner: PelletSpawnState,
    /// Splits requested between steps, reported with the next step
    pending_splits: Vec<SplitEvent>,
    candidates: Vec<SpatialEntry>,
    metrics: Arc<SimMetrics>,
    effects: Box<dyn EffectHook>,
}

impl Simulation {
    /// Create a simulation and seed the initial pellet field
    pub fn new(config: SimConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let bounds = Aabb::new(Vec2::ZERO, Vec2::new(config.arena_width, config.arena_height));
        let index = QuadTree::with_config(bounds, &config.spatial);

        let mut state = GameState::new();
        pellets::spawn_initial(&mut state, &config.pellets, config.arena_width, config.arena_height, &mut rng);

        tracing::info!(
            "Simulation created: arena {}x{}, {} pellets",
            config.arena_width,
            config.arena_height,
            state.pellet_count()
        );

        Ok(Self {
            config,
            state,
            index,
            index_dirty: true,
            rng,
            input: InputBuffer::default(),
            intents: Vec::new(),
            collisions: CollisionResolver::new(),
            collision_events: Vec::new(),
            pellet_spawner: PelletSpawnState::new(),
            pending_splits: Vec::new(),
            candidates: Vec::new(),
            metrics: Arc::new(SimMetrics::new()),
            effects: Box::new(NoEffects),
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    pub fn now_ms(&self) -> u64 {
        self.state.now_ms
    }

    pub fn tick(&self) -> u64 {
        self.state.tick
    }

    pub fn metrics(&self) -> Arc<SimMetrics> {
        self.metrics.clone()
    }

    /// Producer handle for the intent queue
    pub fn input_sender(&self) -> IntentSender {
        self.input.sender()
    }

    /// Intents queued since the last step
    pub fn pending_intents(&self) -> usize {
        self.input.pending_count()
    }

    /// Shape of the spatial index as of its last rebuild
    pub fn index_stats(&self) -> QuadTreeStats {
        self.index.stats()
    }

    pub fn set_effect_hook(&mut self, hook: Box<dyn EffectHook>) {
        self.effects = hook;
    }

    fn bounds(&self) -> Bounds {
        Bounds {
            width: self.config.arena_width,
            height: self.config.arena_height,
        }
    }

    /// Clear and reinsert every live cell at its current position
    fn rebuild_index(&mut self) -> Result<(), SpatialError> {
        self.index.clear();
        for cell in self.state.cells.values() {
            if cell.alive {
                self.index.insert(cell.spatial_entry()?)?;
            }
        }
        self.index_dirty = false;
        Ok(())
    }

    fn ensure_index(&mut self) -> Result<(), SpatialError> {
        if self.index_dirty {
            self.rebuild_index()?;
        }
        Ok(())
    }

    /// Advance the simulation by `delta_ms` milliseconds.
    ///
    /// Order: clock and intents, steering, motion, index rebuild, collisions,
    /// overflow splits, recombines, prune, pellet replenish, invariant check.
    pub fn step_simulation(&mut self, delta_ms: u64) -> Result<TickReport, SimError> {
        let started = Instant::now();

        self.state.tick += 1;
        self.state.now_ms += delta_ms;
        let dt = delta_ms as f32 / 1000.0;

        let mut report = TickReport {
            tick: self.state.tick,
            now_ms: self.state.now_ms,
            ..TickReport::default()
        };
        report.splits.append(&mut self.pending_splits);

        self.apply_intents(&mut report);
        self.state.retire_disconnected();

        let bounds = self.bounds();
        motion::steer(&mut self.state, &self.config.motion);
        motion::integrate(&mut self.state, &self.config.motion, bounds, dt);

        if let Err(e) = self.rebuild_index() {
            tracing::error!("Index rebuild failed on tick {}: {}", self.state.tick, e);
            self.index_dirty = true;
            return Err(e.into());
        }

        self.resolve_collisions(&mut report);
        self.overflow_splits(&mut report);
        self.recombine(&mut report);

        report.agents_died = self.state.prune_dead();

        report.mass_spawned = pellets::replenish(
            &mut self.state,
            &self.config.pellets,
            &mut self.pellet_spawner,
            self.config.arena_width,
            self.config.arena_height,
            dt,
            &mut self.rng,
        );

        self.index_dirty = true;

        if let Err(violation) = self.state.check_invariants(self.config.split.max_cells) {
            tracing::error!("Invariant violated on tick {}: {}", self.state.tick, violation);
            return Err(violation.into());
        }

        self.update_metrics(&report, started);
        Ok(report)
    }

    fn apply_intents(&mut self, report: &mut TickReport) {
        self.intents.clear();
        self.input.drain_into(&mut self.intents);

        for i in 0..self.intents.len() {
            let AgentIntent { agent, intent } = self.intents[i];
            match intent {
                Intent::Pointer(target) => {
                    self.set_pointer(agent, target.x, target.y);
                }
                Intent::Split(target) => {
                    report.splits.extend(self.split_now(agent, target));
                }
                Intent::ForceRecombine(target) => {
                    self.try_force_recombine(agent, target.x, target.y);
                }
            }
        }
    }

    fn resolve_collisions(&mut self, report: &mut TickReport) {
        self.collision_events.clear();
        self.collisions.resolve(
            &mut self.state,
            &self.index,
            &self.config.collision,
            &mut self.rng,
            &mut self.collision_events,
        );

        for event in &self.collision_events {
            match *event {
                CollisionEvent::PelletConsumed { cell, pellet, mass, .. } => {
                    report.pellets_consumed += 1;
                    self.effects.on_pellet_consumed(cell, pellet, mass);
                }
                CollisionEvent::Absorbed { absorber, target, mass, .. } => {
                    report.absorptions.push(*event);
                    self.effects.on_absorption(absorber, target, mass);
                }
            }
        }
    }

    /// Split cells that crossed the mass ceiling this tick
    fn overflow_splits(&mut self, report: &mut TickReport) {
        let mut gainers: Vec<CellId> = self.collision_events.iter().map(|e| e.gainer()).collect();
        gainers.sort_unstable();
        gainers.dedup();

        for cell in gainers {
            if let Some(event) = mass_transfer::overflow_split(
                &mut self.state,
                cell,
                &self.config.split,
                &self.config.recombine,
                &mut self.rng,
            ) {
                report.splits.push(event);
            }
        }
    }

    fn recombine(&mut self, report: &mut TickReport) {
        let mut agents: Vec<AgentId> = self.state.agents.keys().copied().collect();
        agents.sort_unstable();

        let first_merge = report.merges.len();
        for agent in agents {
            let forced = self
                .state
                .get_agent(agent)
                .map_or(false, |a| a.is_recombining());
            if forced {
                if mass_transfer::advance_forced_recombine(&mut self.state, agent, &self.config.recombine, &mut report.merges) {
                    report.forced_recombines_completed += 1;
                }
            } else {
                mass_transfer::auto_recombine(&mut self.state, agent, &self.config.recombine, &mut report.merges);
            }
        }

        for merge in &report.merges[first_merge..] {
            self.effects.on_merge(merge);
        }
    }

    fn update_metrics(&self, report: &TickReport, started: Instant) {
        let bots = self.state.agents.values().filter(|a| a.is_bot).count();
        self.metrics.set_population(
            self.state.agent_count(),
            bots,
            self.state.player_cell_count(),
            self.state.pellet_count(),
            self.state.total_mass(),
        );
        self.metrics.record_report(report);
        self.metrics.record_tick_time(started.elapsed());
    }

    /// Add an agent with one cell of `starting_mass`, placed clear of larger cells when possible
    pub fn join_agent(&mut self, name: impl Into<String>, is_bot: bool) -> AgentId {
        let name = name.into();
        let mass = self.config.starting_mass;
        let position = self.find_spawn_position(mass);

        let agent = self.state.add_agent(name, is_bot);
        let color_index = self.rng.gen_range(0..spawn::COLOR_COUNT);
        if let Some(owner) = self.state.get_agent_mut(agent) {
            owner.color_index = color_index;
        }
        self.state.spawn_cell(agent, position, Vec2::ZERO, mass, 0);
        self.index_dirty = true;

        tracing::info!(
            "Agent {} joined{} at ({:.0}, {:.0})",
            agent,
            if is_bot { " (bot)" } else { "" },
            position.x,
            position.y
        );
        agent
    }

    /// Random point whose surroundings hold no cell heavier than `mass`.
    /// Falls back to the last candidate after `MAX_ATTEMPTS`.
    fn find_spawn_position(&mut self, mass: f32) -> Vec2 {
        let (width, height) = (self.config.arena_width, self.config.arena_height);
        let radius = mass_to_radius(mass);
        let inset = radius.min(width * 0.5).min(height * 0.5);
        let mut candidate = pellets::random_position(width, height, inset, &mut self.rng);

        if self.ensure_index().is_err() {
            return candidate;
        }

        for _ in 0..spawn::MAX_ATTEMPTS {
            let clearance = radius + spawn::SAFE_DISTANCE;
            self.candidates.clear();
            self.index.query_circle(candidate, clearance, &mut self.candidates);

            let threatened = self.candidates.iter().any(|entry| {
                self.state
                    .get_cell(entry.id)
                    .map_or(false, |c| c.alive && !c.is_pellet() && c.mass > mass)
                    && entry.position.distance_to(candidate) < entry.radius + clearance
            });
            if !threatened {
                return candidate;
            }
            candidate = pellets::random_position(width, height, inset, &mut self.rng);
        }
        candidate
    }

    /// Disconnect an agent; its cells are removed at the end of the next step
    pub fn remove_agent(&mut self, agent: AgentId) -> bool {
        match self.state.get_agent_mut(agent) {
            Some(a) if a.connected => {
                a.connected = false;
            }
            _ => return false,
        }
        self.state.retire_disconnected();
        self.index_dirty = true;
        tracing::info!("Agent {} disconnected", agent);
        true
    }

    /// Set the world-space point the agent's cells steer toward
    pub fn set_pointer(&mut self, agent: AgentId, x: f32, y: f32) -> bool {
        let target = Vec2::new(x, y);
        if !target.is_finite() {
            return false;
        }
        match self.state.get_agent_mut(agent) {
            Some(a) if a.connected => {
                a.pointer = Some(target);
                true
            }
            _ => false,
        }
    }

    /// Add a pellet, validated like an index insert
    pub fn add_pellet(&mut self, x: f32, y: f32, mass: f32) -> Result<CellId, SpatialError> {
        let position = Vec2::new(x, y);
        SpatialEntry::new(self.state.peek_cell_id(), position, mass)?;
        self.index_dirty = true;
        Ok(self.state.add_pellet(position, mass))
    }

    fn split_now(&mut self, agent: AgentId, target: Vec2) -> Vec<SplitEvent> {
        if !self.state.get_agent(agent).map_or(false, |a| a.connected) {
            return Vec::new();
        }
        let target = target.is_finite().then_some(target);
        let events = mass_transfer::split_agent(
            &mut self.state,
            agent,
            target,
            &self.config.split,
            &self.config.recombine,
            &mut self.rng,
        );
        if !events.is_empty() {
            self.index_dirty = true;
        }
        events.into_vec()
    }

    /// Split every eligible cell of `agent` toward (tx, ty).
    /// Returns `false` and changes nothing when ineligible.
    pub fn try_split(&mut self, agent: AgentId, tx: f32, ty: f32) -> bool {
        let events = self.split_now(agent, Vec2::new(tx, ty));
        let split = !events.is_empty();
        self.pending_splits.extend(events);
        split
    }

    /// Start pulling all of the agent's cells together.
    /// Returns `false` and changes nothing when ineligible.
    pub fn try_force_recombine(&mut self, agent: AgentId, tx: f32, ty: f32) -> bool {
        if !self.state.get_agent(agent).map_or(false, |a| a.connected) {
            return false;
        }
        let target = Vec2::new(tx, ty);
        let target = target.is_finite().then_some(target);
        mass_transfer::try_force_recombine(&mut self.state, agent, target, &self.config.recombine)
    }

    /// Entities whose circles touch the query circle, ordered by id
    pub fn query_nearby(&mut self, x: f32, y: f32, radius: f32) -> Result<Vec<NearbyEntity>, SpatialError> {
        self.ensure_index()?;
        let center = Vec2::new(x, y);

        self.candidates.clear();
        self.index.query_circle(center, radius, &mut self.candidates);

        let mut found: Vec<NearbyEntity> = self
            .candidates
            .iter()
            .filter_map(|entry| self.state.get_cell(entry.id))
            .filter(|cell| cell.alive && cell.position.distance_to(center) < cell.radius() + radius)
            .map(|cell| NearbyEntity {
                id: cell.id,
                owner: cell.owner,
                position: cell.position,
                radius: cell.radius(),
                mass: cell.mass,
            })
            .collect();
        found.sort_unstable_by_key(|e| e.id);
        Ok(found)
    }

    /// Every live cell whose circle touches the rectangle `[min, max]`
    pub fn visible_cells(&mut self, min: Vec2, max: Vec2) -> Result<Vec<CellView>, SpatialError> {
        self.ensure_index()?;
        let region = Aabb::new(min, max);

        self.candidates.clear();
        self.index.query_rect(&region, &mut self.candidates);

        let mut views: Vec<CellView> = self
            .candidates
            .iter()
            .filter_map(|entry| self.state.get_cell(entry.id))
            .filter(|cell| {
                let nearest = Vec2::new(
                    cell.position.x.clamp(min.x, max.x),
                    cell.position.y.clamp(min.y, max.y),
                );
                cell.alive && nearest.distance_sq_to(cell.position) <= cell.radius() * cell.radius()
            })
            .map(|cell| self.state.cell_view(cell))
            .collect();
        views.sort_unstable_by_key(|v| v.id);
        Ok(views)
    }

    pub fn get_agent_snapshot(&self, agent: AgentId) -> Option<AgentSnapshot> {
        self.state.snapshot(agent)
    }

    /// Sum of mass over all live cells and pellets
    pub fn total_mass(&self) -> f32 {
        self.state.total_mass()
    }

    pub fn leaderboard(&self, n: usize) -> Vec<LeaderboardEntry> {
        self.state.leaderboard(n)
    }

    #[cfg(test)]
    fn state_mut(&mut self) -> &mut GameState {
        self.index_dirty = true;
        &mut self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PelletConfig;
    use crate::game::systems::collision::CollisionEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TICK_MS: u64 = 33;

    fn config() -> SimConfig {
        SimConfig {
            seed: Some(7),
            pellets: PelletConfig {
                target_count: 0,
                ..PelletConfig::default()
            },
            ..SimConfig::default()
        }
    }

    fn sim() -> Simulation {
        Simulation::new(config()).unwrap()
    }

    /// Agent with a single cell of `mass` at (x, y)
    fn place_agent(sim: &mut Simulation, x: f32, y: f32, mass: f32) -> (AgentId, CellId) {
        let state = sim.state_mut();
        let agent = state.add_agent("Test".to_string(), false);
        let cell = state
            .spawn_cell(agent, Vec2::new(x, y), Vec2::ZERO, mass, 0)
            .unwrap();
        (agent, cell)
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = config();
        config.collision.absorption_threshold = 0.9;
        assert!(Simulation::new(config).is_err());
    }

    #[test]
    fn test_new_rejects_nan_split_jitter() {
        let mut config = config();
        config.split.direction_jitter = f32::NAN;
        assert!(Simulation::new(config).is_err());
    }

    #[test]
    fn test_initial_pellet_field() {
        let config = SimConfig {
            seed: Some(1),
            pellets: PelletConfig {
                target_count: 300,
                ..PelletConfig::default()
            },
            ..SimConfig::default()
        };
        let sim = Simulation::new(config).unwrap();
        assert_eq!(sim.state().pellet_count(), 300);
    }

    #[test]
    fn test_pellet_consumed_in_one_step() {
        let mut sim = sim();
        let (agent, _) = place_agent(&mut sim, 2000.0, 2000.0, 20.0);
        let pellet = sim.add_pellet(2001.0, 2000.0, 3.0).unwrap();

        let report = sim.step_simulation(TICK_MS).unwrap();

        assert_eq!(report.pellets_consumed, 1);
        let snapshot = sim.get_agent_snapshot(agent).unwrap();
        assert!((snapshot.total_mass - 23.0).abs() < 1e-4);
        assert!(sim.state().get_cell(pellet).is_none());
    }

    #[test]
    fn test_split_scenario() {
        let mut sim = sim();
        let (agent, _) = place_agent(&mut sim, 2000.0, 2000.0, 40.0);
        sim.step_simulation(1_000).unwrap();
        let now = sim.now_ms();

        assert!(sim.try_split(agent, 3000.0, 2000.0));

        let snapshot = sim.get_agent_snapshot(agent).unwrap();
        assert_eq!(snapshot.cells.len(), 2);
        assert!(snapshot.cells.iter().all(|c| (c.mass - 20.0).abs() < 1e-5));
        assert!((snapshot.total_mass - 40.0).abs() < 1e-4);
        for cell in sim.state().agent_cells(agent) {
            assert_eq!(cell.recombine_eligible_at, now + 15_000);
        }

        let report = sim.step_simulation(TICK_MS).unwrap();
        assert_eq!(report.splits.len(), 1);
    }

    #[test]
    fn test_ineligible_split_changes_nothing() {
        let mut sim = sim();
        let (agent, cell) = place_agent(&mut sim, 2000.0, 2000.0, 20.0);

        assert!(!sim.try_split(agent, 3000.0, 2000.0));
        assert!(!sim.try_split(999, 3000.0, 2000.0));

        let c = sim.state().get_cell(cell).unwrap();
        assert_eq!(c.mass, 20.0);
        assert_eq!(c.velocity, Vec2::ZERO);
        assert_eq!(sim.state().get_agent(agent).unwrap().cell_count(), 1);
    }

    #[test]
    fn test_recombine_scenario() {
        let mut sim = sim();
        let state = sim.state_mut();
        let agent = state.add_agent("Test".to_string(), false);
        state.spawn_cell(agent, Vec2::new(2000.0, 2000.0), Vec2::ZERO, 20.0, 0).unwrap();
        state.spawn_cell(agent, Vec2::new(2002.0, 2000.0), Vec2::ZERO, 20.0, 0).unwrap();

        let report = sim.step_simulation(TICK_MS).unwrap();

        assert_eq!(report.merges.len(), 1);
        let snapshot = sim.get_agent_snapshot(agent).unwrap();
        assert_eq!(snapshot.cells.len(), 1);
        assert!((snapshot.cells[0].mass - 40.0).abs() < 1e-4);
        assert!(snapshot.cells[0].position.approx_eq(Vec2::new(2001.0, 2000.0), 1e-3));
    }

    #[test]
    fn test_split_siblings_wait_for_cooldown() {
        let mut sim = sim();
        let (agent, _) = place_agent(&mut sim, 2000.0, 2000.0, 40.0);
        assert!(sim.try_split(agent, 3000.0, 2000.0));

        let pin_together = |sim: &mut Simulation| {
            let ids: Vec<CellId> = sim.state().agent_cells(agent).map(|c| c.id).collect();
            let state = sim.state_mut();
            for (i, id) in ids.iter().enumerate() {
                let cell = state.get_cell_mut(*id).unwrap();
                cell.position = Vec2::new(2000.0 + i as f32, 2000.0);
                cell.velocity = Vec2::ZERO;
            }
        };

        for _ in 0..14 {
            pin_together(&mut sim);
            let report = sim.step_simulation(1_000).unwrap();
            assert!(report.merges.is_empty(), "merged at {}", sim.now_ms());
        }
        assert_eq!(sim.get_agent_snapshot(agent).unwrap().cells.len(), 2);

        pin_together(&mut sim);
        let report = sim.step_simulation(1_000).unwrap();
        assert_eq!(report.merges.len(), 1);
        assert_eq!(sim.get_agent_snapshot(agent).unwrap().cells.len(), 1);
    }

    #[test]
    fn test_absorption_and_death() {
        let mut sim = sim();
        let (big_agent, big) = place_agent(&mut sim, 2000.0, 2000.0, 100.0);
        let (small_agent, _) = place_agent(&mut sim, 2003.0, 2000.0, 20.0);

        let report = sim.step_simulation(TICK_MS).unwrap();

        assert_eq!(report.absorptions.len(), 1);
        assert!(matches!(report.absorptions[0], CollisionEvent::Absorbed { absorber, .. } if absorber == big));
        assert_eq!(report.agents_died, vec![small_agent]);
        assert!(sim.get_agent_snapshot(small_agent).is_none());
        assert!((sim.get_agent_snapshot(big_agent).unwrap().total_mass - 120.0).abs() < 1e-3);
    }

    #[test]
    fn test_overflow_split_after_absorption() {
        let mut sim = sim();
        let (agent, _) = place_agent(&mut sim, 2000.0, 2000.0, 4_990.0);
        place_agent(&mut sim, 2010.0, 2000.0, 50.0);

        let report = sim.step_simulation(TICK_MS).unwrap();

        assert_eq!(report.absorptions.len(), 1);
        assert_eq!(report.splits.len(), 1);
        assert!(report.splits[0].overflow);
        let snapshot = sim.get_agent_snapshot(agent).unwrap();
        assert_eq!(snapshot.cells.len(), 2);
        assert!((snapshot.total_mass - 5_040.0).abs() < 1e-1);
    }

    #[test]
    fn test_forced_recombine_over_steps() {
        let mut sim = sim();
        let state = sim.state_mut();
        let agent = state.add_agent("Test".to_string(), false);
        state.spawn_cell(agent, Vec2::new(1800.0, 2000.0), Vec2::ZERO, 60.0, 1_000_000).unwrap();
        state.spawn_cell(agent, Vec2::new(2200.0, 2000.0), Vec2::ZERO, 60.0, 1_000_000).unwrap();

        assert!(sim.try_force_recombine(agent, 2000.0, 2500.0));
        assert!(!sim.try_force_recombine(agent, 2000.0, 2500.0));
        assert!(!sim.try_split(agent, 0.0, 0.0));

        let mut completed = 0;
        for _ in 0..25 {
            completed += sim.step_simulation(100).unwrap().forced_recombines_completed;
        }

        assert_eq!(completed, 1);
        let snapshot = sim.get_agent_snapshot(agent).unwrap();
        assert_eq!(snapshot.cells.len(), 1);
        assert!((snapshot.total_mass - 120.0).abs() < 1e-3);
        assert_eq!(sim.state().get_agent(agent).unwrap().pointer, Some(Vec2::new(2000.0, 2500.0)));
    }

    #[test]
    fn test_intents_through_input_buffer() {
        let mut sim = sim();
        let (agent, _) = place_agent(&mut sim, 2000.0, 2000.0, 80.0);
        let sender = sim.input_sender();

        sender.send(agent, Intent::Pointer(Vec2::new(2500.0, 2000.0))).unwrap();
        sender.send(agent, Intent::Split(Vec2::new(2500.0, 2000.0))).unwrap();
        assert_eq!(sim.pending_intents(), 2);

        let report = sim.step_simulation(TICK_MS).unwrap();

        assert_eq!(sim.pending_intents(), 0);
        assert_eq!(report.splits.len(), 1);
        assert_eq!(sim.state().get_agent(agent).unwrap().pointer, Some(Vec2::new(2500.0, 2000.0)));
        assert_eq!(sim.get_agent_snapshot(agent).unwrap().cells.len(), 2);
    }

    #[test]
    fn test_index_stats_cover_live_cells() {
        let mut sim = sim();
        place_agent(&mut sim, 1000.0, 1000.0, 50.0);
        place_agent(&mut sim, 3000.0, 3000.0, 50.0);
        sim.add_pellet(2000.0, 2000.0, 2.0).unwrap();

        sim.step_simulation(TICK_MS).unwrap();

        let stats = sim.index_stats();
        assert_eq!(stats.total_entries, sim.state().live_cells().count());
        assert!(stats.node_count >= 1);
    }

    #[test]
    fn test_remove_agent() {
        let mut sim = sim();
        let agent = sim.join_agent("Leaver", false);
        assert!(sim.remove_agent(agent));
        assert!(!sim.remove_agent(agent));
        assert!(!sim.set_pointer(agent, 1.0, 1.0));

        let report = sim.step_simulation(TICK_MS).unwrap();
        assert_eq!(report.agents_died, vec![agent]);
        assert_eq!(sim.state().player_cell_count(), 0);
    }

    #[test]
    fn test_departed_agent_cannot_absorb() {
        let mut sim = sim();
        let (leaver, _) = place_agent(&mut sim, 2000.0, 2000.0, 100.0);
        assert!(sim.remove_agent(leaver));
        let (stayer, _) = place_agent(&mut sim, 2003.0, 2000.0, 20.0);

        assert!(sim.query_nearby(2000.0, 2000.0, 1.0).unwrap().is_empty());

        let report = sim.step_simulation(TICK_MS).unwrap();

        assert!(report.absorptions.is_empty());
        assert_eq!(report.agents_died, vec![leaver]);
        let snapshot = sim.get_agent_snapshot(stayer).unwrap();
        assert!((snapshot.total_mass - 20.0).abs() < 1e-5);
        assert!((sim.total_mass() - 20.0).abs() < 1e-4);
    }

    #[test]
    fn test_disconnected_flag_retired_before_motion() {
        let mut sim = sim();
        let (leaver, cell) = place_agent(&mut sim, 1000.0, 1000.0, 100.0);
        sim.set_pointer(leaver, 3000.0, 1000.0);
        let (stayer, _) = place_agent(&mut sim, 1003.0, 1000.0, 20.0);
        sim.state_mut().get_agent_mut(leaver).unwrap().connected = false;

        let report = sim.step_simulation(TICK_MS).unwrap();

        assert!(report.absorptions.is_empty());
        assert!(sim.state().get_cell(cell).is_none());
        assert!(sim.get_agent_snapshot(stayer).is_some());
    }

    #[test]
    fn test_join_agent() {
        let mut sim = sim();
        let agent = sim.join_agent("Newcomer", true);

        let snapshot = sim.get_agent_snapshot(agent).unwrap();
        assert_eq!(snapshot.cells.len(), 1);
        assert_eq!(snapshot.total_mass, sim.config().starting_mass);
        assert_eq!(snapshot.cells[0].name, "Newcomer");
        let p = snapshot.cells[0].position;
        assert!(p.x > 0.0 && p.x < 4000.0 && p.y > 0.0 && p.y < 4000.0);
        assert!(sim.state().get_agent(agent).unwrap().is_bot);
    }

    #[test]
    fn test_add_pellet_rejects_invalid() {
        let mut sim = sim();
        assert!(matches!(
            sim.add_pellet(f32::NAN, 10.0, 2.0),
            Err(SpatialError::InvalidEntity { .. })
        ));
        assert!(sim.add_pellet(10.0, 10.0, 0.0).is_err());
        assert_eq!(sim.state().pellet_count(), 0);
        assert!(sim.add_pellet(10.0, 10.0, 2.0).is_ok());
    }

    #[test]
    fn test_query_nearby_exact() {
        let mut sim = sim();
        let near = sim.add_pellet(100.0, 100.0, 3.0).unwrap();
        let edge = sim.add_pellet(120.0, 100.0, 3.0).unwrap();
        sim.add_pellet(300.0, 300.0, 3.0).unwrap();

        let found = sim.query_nearby(100.0, 100.0, 5.0).unwrap();
        assert_eq!(found.iter().map(|e| e.id).collect::<Vec<_>>(), vec![near]);

        let found = sim.query_nearby(100.0, 100.0, 20.0).unwrap();
        assert_eq!(found.iter().map(|e| e.id).collect::<Vec<_>>(), vec![near, edge]);
        assert!(found.iter().all(|e| e.owner.is_none()));
    }

    #[test]
    fn test_visible_cells() {
        let mut sim = sim();
        let inside = sim.add_pellet(500.0, 500.0, 2.0).unwrap();
        let straddling = sim.add_pellet(601.0, 500.0, 5.0).unwrap();
        sim.add_pellet(900.0, 900.0, 2.0).unwrap();

        let views = sim
            .visible_cells(Vec2::new(400.0, 400.0), Vec2::new(600.0, 600.0))
            .unwrap();
        assert_eq!(views.iter().map(|v| v.id).collect::<Vec<_>>(), vec![inside, straddling]);
    }

    #[test]
    fn test_leaderboard() {
        let mut sim = sim();
        let (small, _) = place_agent(&mut sim, 500.0, 500.0, 30.0);
        let (big, _) = place_agent(&mut sim, 3000.0, 3000.0, 90.0);

        let board = sim.leaderboard(10);
        assert_eq!(board.iter().map(|e| e.agent_id).collect::<Vec<_>>(), vec![big, small]);
    }

    #[test]
    fn test_invariant_violation_surfaces() {
        let mut config = config();
        config.split.max_cells = 2;
        let mut sim = Simulation::new(config).unwrap();
        let state = sim.state_mut();
        let agent = state.add_agent("Crowded".to_string(), false);
        for i in 0..3 {
            state
                .spawn_cell(agent, Vec2::new(500.0 + i as f32 * 300.0, 500.0), Vec2::ZERO, 20.0, u64::MAX)
                .unwrap();
        }

        assert!(matches!(
            sim.step_simulation(TICK_MS),
            Err(SimError::Invariant(InvariantViolation::TooManyCells { count: 3, max: 2, .. }))
        ));
    }

    #[test]
    fn test_non_finite_cell_rejected_by_index() {
        let mut sim = sim();
        let (_, cell) = place_agent(&mut sim, 500.0, 500.0, 20.0);
        sim.state_mut().get_cell_mut(cell).unwrap().position = Vec2::new(f32::NAN, 500.0);

        assert!(matches!(
            sim.step_simulation(TICK_MS),
            Err(SimError::Spatial(SpatialError::InvalidEntity { id, .. })) if id == cell
        ));
        assert!(sim.query_nearby(0.0, 0.0, 10.0).is_err());
    }

    #[test]
    fn test_total_mass_conserved_without_spawning() {
        let mut sim = sim();
        for i in 0..12 {
            let x = 1500.0 + (i % 4) as f32 * 200.0;
            let y = 1500.0 + (i / 4) as f32 * 200.0;
            place_agent(&mut sim, x, y, 20.0 + i as f32 * 15.0);
        }
        for i in 0..200 {
            sim.add_pellet(1400.0 + (i % 20) as f32 * 50.0, 1400.0 + (i / 20) as f32 * 50.0, 3.0)
                .unwrap();
        }
        let initial = sim.total_mass();

        let agents: Vec<AgentId> = sim.state().agents.keys().copied().collect();
        for tick in 0..300u32 {
            for (n, agent) in agents.iter().enumerate() {
                let angle = (tick as f32 * 0.05) + n as f32;
                let target = Vec2::new(2000.0, 2000.0) + Vec2::from_angle(angle) * 600.0;
                sim.set_pointer(*agent, target.x, target.y);
                if tick % 60 == n as u32 {
                    sim.try_split(*agent, target.x, target.y);
                }
                if tick % 97 == n as u32 {
                    sim.try_force_recombine(*agent, target.x, target.y);
                }
            }
            sim.step_simulation(TICK_MS).unwrap();
        }

        let after = sim.total_mass();
        assert!((after - initial).abs() < initial * 1e-4, "{} -> {}", initial, after);
    }

    struct CountingHook {
        absorptions: Arc<AtomicUsize>,
        pellets: Arc<AtomicUsize>,
        merges: Arc<AtomicUsize>,
    }

    impl EffectHook for CountingHook {
        fn on_absorption(&mut self, _absorber: CellId, _target: CellId, _mass: f32) {
            self.absorptions.fetch_add(1, Ordering::Relaxed);
        }

        fn on_pellet_consumed(&mut self, _cell: CellId, _pellet: CellId, _mass: f32) {
            self.pellets.fetch_add(1, Ordering::Relaxed);
        }

        fn on_merge(&mut self, _merge: &MergeEvent) {
            self.merges.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_effect_hook_invoked() {
        let mut sim = sim();
        let absorptions = Arc::new(AtomicUsize::new(0));
        let pellets = Arc::new(AtomicUsize::new(0));
        let merges = Arc::new(AtomicUsize::new(0));
        sim.set_effect_hook(Box::new(CountingHook {
            absorptions: absorptions.clone(),
            pellets: pellets.clone(),
            merges: merges.clone(),
        }));

        place_agent(&mut sim, 1000.0, 1000.0, 100.0);
        place_agent(&mut sim, 1003.0, 1000.0, 20.0);
        sim.add_pellet(3000.0, 3000.0, 2.0).unwrap();
        place_agent(&mut sim, 3000.5, 3000.0, 20.0);
        let state = sim.state_mut();
        let merger = state.add_agent("Merger".to_string(), false);
        state.spawn_cell(merger, Vec2::new(500.0, 3000.0), Vec2::ZERO, 20.0, 0).unwrap();
        state.spawn_cell(merger, Vec2::new(501.0, 3000.0), Vec2::ZERO, 20.0, 0).unwrap();

        sim.step_simulation(TICK_MS).unwrap();

        assert_eq!(absorptions.load(Ordering::Relaxed), 1);
        assert_eq!(pellets.load(Ordering::Relaxed), 1);
        assert_eq!(merges.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_metrics_updated_each_step() {
        let mut sim = sim();
        place_agent(&mut sim, 2000.0, 2000.0, 20.0);
        sim.add_pellet(2001.0, 2000.0, 3.0).unwrap();

        sim.step_simulation(TICK_MS).unwrap();
        sim.step_simulation(TICK_MS).unwrap();

        let metrics = sim.metrics();
        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.pellets_consumed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.agents.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.pellets.load(Ordering::Relaxed), 0);
    }
}
