/// Motion constants - friction is multiplicative per tick (velocity *= FRICTION)
pub mod motion {
    /// Per-tick velocity retention
    pub const FRICTION: f32 = 0.98;
    /// Velocity components below this are snapped to zero
    pub const DRIFT_THRESHOLD: f32 = 0.01;
    /// Speed cap for a massless cell (units/s)
    pub const BASE_SPEED: f32 = 120.0;
    /// Speed lost per unit of mass (linear cap: BASE_SPEED - mass * SPEED_FACTOR)
    pub const SPEED_FACTOR: f32 = 0.02;
    /// Speed cap never drops below this
    pub const MIN_SPEED: f32 = 20.0;
    /// Fraction of velocity kept (and inverted) on an arena-edge bounce
    pub const BOUNCE_RETENTION: f32 = 0.5;
    /// Fraction of the gap between current and desired velocity closed per tick
    pub const STEERING_RESPONSE: f32 = 0.2;
}

/// Clock constants
pub mod clock {
    /// Headless runner tick rate in Hz
    pub const TICK_RATE: u32 = 30;
    /// Tick duration in milliseconds
    pub const TICK_DURATION_MS: u64 = 1000 / TICK_RATE as u64;
}

/// Mass-related constants
pub mod mass {
    /// Mass of a freshly joined agent's only cell
    pub const STARTING: f32 = 20.0;
    /// Absorbing past this mass triggers an automatic split when slots are free
    pub const OVERFLOW_CEILING: f32 = 5_000.0;
}

/// Split constants
pub mod split {
    /// Maximum cells per agent
    pub const MAX_CELLS: usize = 16;
    /// A cell needs at least this mass to split
    pub const MIN_SPLIT_MASS: f32 = 35.0;
    /// Share of the parent's mass handed to the new cell
    pub const RATIO: f32 = 0.5;
    /// Share of the split-off mass destroyed on split (0 = fully conservative)
    pub const LOSS_RATIO: f32 = 0.0;
    /// Launch speed of the new cell (units/s)
    pub const MOMENTUM: f32 = 100.0;
    /// Gap left between parent and child edges on spawn
    pub const MARGIN: f32 = 1.0;
    /// Fraction of the launch speed applied to the parent in the opposite direction
    pub const RECOIL: f32 = 0.4;
    /// Pointer closer than this to the cell splits in a random direction
    pub const POINTER_DEAD_ZONE: f32 = 10.0;
    /// Maximum random deviation added to a pointer-directed split (radians)
    pub const DIRECTION_JITTER: f32 = 0.05;
}

/// Recombine constants
pub mod recombine {
    /// Cooldown after a split before either cell may merge
    pub const DELAY_MS: u64 = 15_000;
    /// Merge requires distance < combined radius * PROXIMITY_FACTOR
    pub const PROXIMITY_FACTOR: f32 = 0.6;
    /// Length of the forced convergence animation
    pub const FORCED_DURATION_MS: u64 = 2_000;
    /// Speed at which cells converge during a forced recombine (units/s)
    pub const FORCED_SPEED: f32 = 80.0;
    /// Fraction of pre-merge average velocity kept by the merged cell
    pub const FORCED_VELOCITY_RETENTION: f32 = 0.3;
}

/// Collision resolution constants
pub mod collision {
    /// Absorber must be strictly heavier than target * ABSORPTION_THRESHOLD
    pub const ABSORPTION_THRESHOLD: f32 = 1.1;
    /// Coefficient of restitution for the separation impulse
    pub const RESTITUTION: f32 = 0.8;
    /// Fraction of overlap resolved per tick when pushing cells apart
    pub const SEPARATION_STIFFNESS: f32 = 1.0;
    /// Centers closer than this are treated as coincident
    pub const COINCIDENT_EPSILON: f32 = 1e-4;
    /// Size of the random offset applied to coincident centers
    pub const COINCIDENT_NUDGE: f32 = 0.01;
}

/// Arena constants
pub mod arena {
    pub const WIDTH: f32 = 4_000.0;
    pub const HEIGHT: f32 = 4_000.0;
}

/// Pellet field constants
pub mod pellet {
    pub const MIN_MASS: f32 = 1.0;
    pub const MAX_MASS: f32 = 5.0;
    /// Pellet count the field is replenished toward
    pub const TARGET_COUNT: usize = 1_000;
    /// Pellets spawned per second while below target
    pub const SPAWN_RATE: f32 = 50.0;
}

/// Quadtree constants
pub mod spatial {
    /// A node subdivides once it holds more than this many objects
    pub const MAX_OBJECTS: usize = 8;
    /// Nodes at this depth never subdivide
    pub const MAX_DEPTH: u8 = 8;
}

/// Spawn constants
pub mod spawn {
    /// Attempts to find a position clear of larger cells
    pub const MAX_ATTEMPTS: u32 = 30;
    /// Extra clearance from other cells when choosing a spawn point
    pub const SAFE_DISTANCE: f32 = 20.0;
    /// Number of palette entries handed out to agents
    pub const COLOR_COUNT: u8 = 8;
}

/// Radius of a circle whose area equals `mass`
#[inline]
pub fn mass_to_radius(mass: f32) -> f32 {
    (mass.max(0.0) / std::f32::consts::PI).sqrt()
}

/// Speed cap for a cell of the given mass.
///
/// Linear in mass with a floor: `max(min_speed, base_speed - mass * speed_factor)`.
#[inline]
pub fn max_speed_for_mass(mass: f32, base_speed: f32, speed_factor: f32, min_speed: f32) -> f32 {
    (base_speed - mass.max(0.0) * speed_factor).max(min_speed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mass_to_radius_area_matches_mass() {
        for mass in [1.0_f32, 3.0, 20.0, 40.0, 1234.5] {
            let r = mass_to_radius(mass);
            let area = std::f32::consts::PI * r * r;
            assert!((area - mass).abs() < mass * 1e-5, "mass {} area {}", mass, area);
        }
    }

    #[test]
    fn test_mass_to_radius_non_positive() {
        assert_eq!(mass_to_radius(0.0), 0.0);
        assert_eq!(mass_to_radius(-5.0), 0.0);
    }

    #[test]
    fn test_speed_cap_linear_then_floor() {
        let cap = |m| max_speed_for_mass(m, motion::BASE_SPEED, motion::SPEED_FACTOR, motion::MIN_SPEED);
        assert!((cap(0.0) - motion::BASE_SPEED).abs() < 1e-4);
        assert!((cap(100.0) - (motion::BASE_SPEED - 2.0)).abs() < 1e-4);
        assert_eq!(cap(1_000_000.0), motion::MIN_SPEED);
    }

    #[test]
    fn test_speed_cap_monotonic() {
        let mut previous = f32::MAX;
        for step in 0..200 {
            let m = step as f32 * 50.0;
            let cap = max_speed_for_mass(m, motion::BASE_SPEED, motion::SPEED_FACTOR, motion::MIN_SPEED);
            assert!(cap <= previous);
            assert!(cap >= motion::MIN_SPEED);
            previous = cap;
        }
    }

    #[test]
    fn test_tunables_are_consistent() {
        assert!(collision::ABSORPTION_THRESHOLD > 1.0);
        assert!(recombine::PROXIMITY_FACTOR < 1.0);
        assert!(motion::BOUNCE_RETENTION < 1.0);
        assert!(split::RATIO > 0.0 && split::RATIO < 1.0);
        assert!(pellet::MIN_MASS <= pellet::MAX_MASS);
        assert!(mass::STARTING < split::MIN_SPLIT_MASS);
    }
}
