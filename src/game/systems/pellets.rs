//! Pellet field
//! Keeps the arena stocked with small ownerless pellets. This is the only
//! place where mass enters the system.

use rand::Rng;

use crate::config::PelletConfig;
use crate::game::state::{CellId, GameState};
use crate::util::vec2::Vec2;

/// Edge inset so freshly spawned pellets sit fully inside the arena
const SPAWN_EDGE_INSET: f32 = 2.0;

/// Fractional spawn accumulator.
/// Handles spawn rates below one pellet per tick.
#[derive(Debug, Clone, Default)]
pub struct PelletSpawnState {
    accumulator: f32,
}

impl PelletSpawnState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Random pellet mass in [min_mass, max_mass]
fn random_mass<R: Rng + ?Sized>(config: &PelletConfig, rng: &mut R) -> f32 {
    if config.max_mass > config.min_mass {
        rng.gen_range(config.min_mass..=config.max_mass)
    } else {
        config.min_mass
    }
}

/// Uniformly random point inside the arena
pub fn random_position<R: Rng + ?Sized>(width: f32, height: f32, inset: f32, rng: &mut R) -> Vec2 {
    let x = random_coordinate(width, inset, rng);
    let y = random_coordinate(height, inset, rng);
    Vec2::new(x, y)
}

fn random_coordinate<R: Rng + ?Sized>(extent: f32, inset: f32, rng: &mut R) -> f32 {
    if extent > inset * 2.0 {
        rng.gen_range(inset..extent - inset)
    } else {
        extent * 0.5
    }
}

fn spawn_one<R: Rng + ?Sized>(state: &mut GameState, config: &PelletConfig, width: f32, height: f32, rng: &mut R) -> CellId {
    let position = random_position(width, height, SPAWN_EDGE_INSET, rng);
    let mass = random_mass(config, rng);
    state.add_pellet(position, mass)
}

/// Fill the arena up to the target count.
/// Called once when the simulation is created.
pub fn spawn_initial<R: Rng + ?Sized>(state: &mut GameState, config: &PelletConfig, width: f32, height: f32, rng: &mut R) {
    let missing = config.target_count.saturating_sub(state.pellet_count());
    for _ in 0..missing {
        spawn_one(state, config, width, height, rng);
    }

    tracing::debug!("Spawned initial pellets: {} total", state.pellet_count());
}

/// Accumulate the spawn rate and spawn whole pellets while below target.
/// Returns the total mass added.
pub fn replenish<R: Rng + ?Sized>(
    state: &mut GameState,
    config: &PelletConfig,
    spawn_state: &mut PelletSpawnState,
    width: f32,
    height: f32,
    dt: f32,
    rng: &mut R,
) -> f32 {
    let current = state.pellet_count();
    if current >= config.target_count {
        spawn_state.accumulator = 0.0;
        return 0.0;
    }

    spawn_state.accumulator += config.spawn_rate * dt;
    let due = spawn_state.accumulator.floor();
    spawn_state.accumulator -= due;

    let to_spawn = (due as usize).min(config.target_count - current);
    let mut added = 0.0;
    for _ in 0..to_spawn {
        let id = spawn_one(state, config, width, height, rng);
        added += state.get_cell(id).map_or(0.0, |c| c.mass);
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(target: usize) -> PelletConfig {
        PelletConfig {
            target_count: target,
            ..PelletConfig::default()
        }
    }

    #[test]
    fn test_spawn_initial_fills_to_target() {
        let mut state = GameState::new();
        let mut rng = StdRng::seed_from_u64(11);
        spawn_initial(&mut state, &config(200), 4000.0, 4000.0, &mut rng);

        assert_eq!(state.pellet_count(), 200);
        for pellet in state.live_cells() {
            assert!(pellet.is_pellet());
            assert!(pellet.mass >= 1.0 && pellet.mass <= 5.0);
            assert!(pellet.position.x > 0.0 && pellet.position.x < 4000.0);
            assert!(pellet.position.y > 0.0 && pellet.position.y < 4000.0);
        }
    }

    #[test]
    fn test_replenish_accumulates_fractional_rate() {
        let mut state = GameState::new();
        let mut rng = StdRng::seed_from_u64(12);
        let mut spawn_state = PelletSpawnState::new();
        let cfg = PelletConfig {
            spawn_rate: 10.0,
            ..config(100)
        };

        // 10/s at 30Hz = 1/3 pellet per tick
        let mut spawned = 0;
        for _ in 0..30 {
            let before = state.pellet_count();
            replenish(&mut state, &cfg, &mut spawn_state, 4000.0, 4000.0, 1.0 / 30.0, &mut rng);
            spawned += state.pellet_count() - before;
        }
        assert!((9..=10).contains(&spawned), "spawned {}", spawned);
    }

    #[test]
    fn test_replenish_stops_at_target() {
        let mut state = GameState::new();
        let mut rng = StdRng::seed_from_u64(13);
        let mut spawn_state = PelletSpawnState::new();
        let cfg = PelletConfig {
            spawn_rate: 10_000.0,
            ..config(5)
        };

        let added = replenish(&mut state, &cfg, &mut spawn_state, 4000.0, 4000.0, 1.0, &mut rng);
        assert_eq!(state.pellet_count(), 5);
        assert!(added >= 5.0 && added <= 25.0);

        let added = replenish(&mut state, &cfg, &mut spawn_state, 4000.0, 4000.0, 1.0, &mut rng);
        assert_eq!(added, 0.0);
        assert_eq!(state.pellet_count(), 5);
    }

    #[test]
    fn test_zero_target_disables_spawning() {
        let mut state = GameState::new();
        let mut rng = StdRng::seed_from_u64(14);
        let mut spawn_state = PelletSpawnState::new();
        spawn_initial(&mut state, &config(0), 4000.0, 4000.0, &mut rng);
        replenish(&mut state, &config(0), &mut spawn_state, 4000.0, 4000.0, 10.0, &mut rng);
        assert_eq!(state.pellet_count(), 0);
    }

    #[test]
    fn test_fixed_mass_range() {
        let mut rng = StdRng::seed_from_u64(15);
        let cfg = PelletConfig {
            min_mass: 2.0,
            max_mass: 2.0,
            ..PelletConfig::default()
        };
        assert_eq!(random_mass(&cfg, &mut rng), 2.0);
    }
}
