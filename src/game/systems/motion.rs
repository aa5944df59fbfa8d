//! Motion integration and steering
//!
//! Friction, speed cap, position step and edge reflection for every live
//! cell, plus steering toward each agent's pointer.

#[cfg(feature = "parallel_motion")]
use rayon::prelude::*;

use crate::config::MotionConfig;
use crate::game::constants::max_speed_for_mass;
use crate::game::state::{Cell, GameState};
use crate::util::vec2::Vec2;

/// Arena rectangle [0, width] x [0, height]
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub width: f32,
    pub height: f32,
}

/// Speed cap for a cell under the given motion config
#[inline]
pub fn speed_cap(config: &MotionConfig, mass: f32) -> f32 {
    max_speed_for_mass(mass, config.base_speed, config.speed_factor, config.min_speed)
}

/// Integrate motion for every live cell.
///
/// Friction scales velocity once per tick and is applied before the speed
/// cap. Runs on rayon when `parallel_motion` is enabled.
pub fn integrate(state: &mut GameState, config: &MotionConfig, bounds: Bounds, dt: f32) {
    #[cfg(feature = "parallel_motion")]
    state
        .cells
        .par_values_mut()
        .for_each(|cell| integrate_cell(cell, config, bounds, dt));

    #[cfg(not(feature = "parallel_motion"))]
    state
        .cells
        .values_mut()
        .for_each(|cell| integrate_cell(cell, config, bounds, dt));
}

fn integrate_cell(cell: &mut Cell, config: &MotionConfig, bounds: Bounds, dt: f32) {
    if !cell.alive {
        return;
    }
    // Resting pellets never move
    if cell.is_pellet() && cell.velocity == Vec2::ZERO {
        return;
    }

    cell.velocity *= config.friction;
    cell.velocity = cell.velocity.snap_to_zero(config.drift_threshold);
    cell.velocity = cell.velocity.clamp_length(speed_cap(config, cell.mass));

    cell.position += cell.velocity * dt;
    reflect_at_edges(cell, config.bounce_retention, bounds);
}

/// Keep the circle inside the arena, inverting and damping the offending axis
fn reflect_at_edges(cell: &mut Cell, retention: f32, bounds: Bounds) {
    let radius = cell.radius();

    let (min_x, max_x) = axis_limits(radius, bounds.width);
    if cell.position.x < min_x {
        cell.position.x = min_x;
        cell.velocity.x = cell.velocity.x.abs() * retention;
    } else if cell.position.x > max_x {
        cell.position.x = max_x;
        cell.velocity.x = -cell.velocity.x.abs() * retention;
    }

    let (min_y, max_y) = axis_limits(radius, bounds.height);
    if cell.position.y < min_y {
        cell.position.y = min_y;
        cell.velocity.y = cell.velocity.y.abs() * retention;
    } else if cell.position.y > max_y {
        cell.position.y = max_y;
        cell.velocity.y = -cell.velocity.y.abs() * retention;
    }
}

/// Valid center range along one axis; a circle wider than the arena is pinned to the middle
#[inline]
fn axis_limits(radius: f32, extent: f32) -> (f32, f32) {
    if radius * 2.0 >= extent {
        let mid = extent * 0.5;
        (mid, mid)
    } else {
        (radius, extent - radius)
    }
}

/// Blend each cell's velocity toward its owner's pointer target.
///
/// Desired speed is the cell's cap, eased down once the pointer is inside
/// the cell. Agents in a forced recombine are left alone.
pub fn steer(state: &mut GameState, config: &MotionConfig) {
    let agents = &state.agents;
    let response = config.steering_response;

    let steer_cell = |cell: &mut Cell| {
        if !cell.alive {
            return;
        }
        let Some(agent) = cell.owner.and_then(|id| agents.get(&id)) else {
            return;
        };
        if agent.is_recombining() || !agent.connected {
            return;
        }
        let Some(pointer) = agent.pointer else {
            return;
        };

        let (direction, distance) = (pointer - cell.position).normalize_with_length();
        let radius = cell.radius().max(f32::EPSILON);
        let desired = direction * speed_cap(config, cell.mass) * (distance / radius).min(1.0);
        cell.velocity += (desired - cell.velocity) * response;
    };

    #[cfg(feature = "parallel_motion")]
    state.cells.par_values_mut().for_each(steer_cell);

    #[cfg(not(feature = "parallel_motion"))]
    state.cells.values_mut().for_each(steer_cell);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::CellId;

    const DT: f32 = 1.0 / 30.0;

    fn bounds() -> Bounds {
        Bounds {
            width: 4000.0,
            height: 4000.0,
        }
    }

    fn create_test_state(velocity: Vec2) -> (GameState, CellId) {
        let mut state = GameState::new();
        let agent = state.add_agent("Test".to_string(), false);
        let id = state
            .spawn_cell(agent, Vec2::new(1000.0, 1000.0), velocity, 20.0, 0)
            .unwrap();
        (state, id)
    }

    #[test]
    fn test_friction_is_multiplicative() {
        let config = MotionConfig::default();
        let (mut state, id) = create_test_state(Vec2::new(50.0, 0.0));

        integrate(&mut state, &config, bounds(), DT);

        let velocity = state.get_cell(id).unwrap().velocity;
        assert!((velocity.x - 50.0 * config.friction).abs() < 1e-4);
    }

    #[test]
    fn test_position_integration() {
        let config = MotionConfig::default();
        let (mut state, id) = create_test_state(Vec2::new(30.0, -15.0));
        let before = state.get_cell(id).unwrap().position;

        integrate(&mut state, &config, bounds(), DT);

        let cell = state.get_cell(id).unwrap();
        let expected = before + cell.velocity * DT;
        assert!(cell.position.approx_eq(expected, 1e-4));
    }

    #[test]
    fn test_drift_snaps_to_zero() {
        let config = MotionConfig::default();
        let (mut state, id) = create_test_state(Vec2::new(0.005, 40.0));

        integrate(&mut state, &config, bounds(), DT);

        let velocity = state.get_cell(id).unwrap().velocity;
        assert_eq!(velocity.x, 0.0);
        assert!(velocity.y > 0.0);
    }

    #[test]
    fn test_velocity_capped_preserving_direction() {
        let config = MotionConfig::default();
        let (mut state, id) = create_test_state(Vec2::new(3000.0, 4000.0));

        integrate(&mut state, &config, bounds(), DT);

        let cell = state.get_cell(id).unwrap();
        let cap = speed_cap(&config, cell.mass);
        assert!(cell.velocity.length() <= cap + 1e-3);
        assert!((cell.velocity.x / cell.velocity.y - 0.75).abs() < 1e-4);
    }

    #[test]
    fn test_bounce_off_left_edge() {
        let config = MotionConfig::default();
        let (mut state, id) = create_test_state(Vec2::new(-100.0, 0.0));
        state.get_cell_mut(id).unwrap().position = Vec2::new(1.0, 500.0);

        integrate(&mut state, &config, bounds(), DT);

        let cell = state.get_cell(id).unwrap();
        assert!((cell.position.x - cell.radius()).abs() < 1e-4);
        assert!(cell.velocity.x > 0.0);
        assert!(cell.velocity.x < 100.0 * config.friction);
    }

    #[test]
    fn test_bounce_off_bottom_edge() {
        let config = MotionConfig::default();
        let (mut state, id) = create_test_state(Vec2::new(0.0, 100.0));
        state.get_cell_mut(id).unwrap().position = Vec2::new(500.0, 3999.5);

        integrate(&mut state, &config, bounds(), DT);

        let cell = state.get_cell(id).unwrap();
        assert!((cell.position.y - (4000.0 - cell.radius())).abs() < 1e-3);
        assert!(cell.velocity.y < 0.0);
    }

    #[test]
    fn test_oversized_cell_pinned_to_middle() {
        let config = MotionConfig::default();
        let small = Bounds {
            width: 10.0,
            height: 10.0,
        };
        let (mut state, id) = create_test_state(Vec2::new(5.0, 5.0));
        state.get_cell_mut(id).unwrap().mass = 1_000.0;

        integrate(&mut state, &config, small, DT);

        let cell = state.get_cell(id).unwrap();
        assert_eq!(cell.position, Vec2::new(5.0, 5.0));
    }

    #[test]
    fn test_resting_pellet_untouched() {
        let config = MotionConfig::default();
        let mut state = GameState::new();
        let pellet = state.add_pellet(Vec2::new(-5.0, 10.0), 2.0);

        integrate(&mut state, &config, bounds(), DT);

        assert_eq!(state.get_cell(pellet).unwrap().position, Vec2::new(-5.0, 10.0));
    }

    #[test]
    fn test_dead_cells_not_updated() {
        let config = MotionConfig::default();
        let (mut state, id) = create_test_state(Vec2::new(50.0, 0.0));
        state.get_cell_mut(id).unwrap().alive = false;
        let before = state.get_cell(id).unwrap().position;

        integrate(&mut state, &config, bounds(), DT);

        assert_eq!(state.get_cell(id).unwrap().position, before);
    }

    #[test]
    fn test_steer_toward_pointer() {
        let config = MotionConfig::default();
        let (mut state, id) = create_test_state(Vec2::ZERO);
        let owner = state.get_cell(id).unwrap().owner.unwrap();
        state.get_agent_mut(owner).unwrap().pointer = Some(Vec2::new(2000.0, 1000.0));

        steer(&mut state, &config);

        let velocity = state.get_cell(id).unwrap().velocity;
        assert!(velocity.x > 0.0);
        assert!(velocity.y.abs() < 1e-4);
        let expected = speed_cap(&config, 20.0) * config.steering_response;
        assert!((velocity.x - expected).abs() < 1e-3);
    }

    #[test]
    fn test_steer_without_pointer_is_noop() {
        let config = MotionConfig::default();
        let (mut state, id) = create_test_state(Vec2::new(3.0, 4.0));

        steer(&mut state, &config);

        assert_eq!(state.get_cell(id).unwrap().velocity, Vec2::new(3.0, 4.0));
    }

    #[test]
    fn test_steer_ignores_disconnected_agent() {
        let config = MotionConfig::default();
        let (mut state, id) = create_test_state(Vec2::ZERO);
        let owner = state.get_cell(id).unwrap().owner.unwrap();
        let agent = state.get_agent_mut(owner).unwrap();
        agent.pointer = Some(Vec2::new(2000.0, 1000.0));
        agent.connected = false;

        steer(&mut state, &config);

        assert_eq!(state.get_cell(id).unwrap().velocity, Vec2::ZERO);
    }
}
