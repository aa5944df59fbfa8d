use crate::game::constants::{arena, clock, collision, mass, motion, pellet, recombine, spatial, split};

/// Configuration errors reported by [`SimConfig::validate`] and [`RunnerConfig::validate`]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be positive (got {value})")]
    NotPositive { field: &'static str, value: f32 },
    #[error("{field} must lie in {range} (got {value})")]
    OutOfRange {
        field: &'static str,
        range: &'static str,
        value: f32,
    },
    #[error("{0}")]
    Inconsistent(&'static str),
}

/// Motion integrator tunables
#[derive(Debug, Clone)]
pub struct MotionConfig {
    pub friction: f32,
    pub drift_threshold: f32,
    pub base_speed: f32,
    pub speed_factor: f32,
    pub min_speed: f32,
    pub bounce_retention: f32,
    pub steering_response: f32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            friction: motion::FRICTION,
            drift_threshold: motion::DRIFT_THRESHOLD,
            base_speed: motion::BASE_SPEED,
            speed_factor: motion::SPEED_FACTOR,
            min_speed: motion::MIN_SPEED,
            bounce_retention: motion::BOUNCE_RETENTION,
            steering_response: motion::STEERING_RESPONSE,
        }
    }
}

/// Split tunables
#[derive(Debug, Clone)]
pub struct SplitConfig {
    pub max_cells: usize,
    pub min_split_mass: f32,
    pub ratio: f32,
    pub loss_ratio: f32,
    pub momentum: f32,
    pub margin: f32,
    pub recoil: f32,
    pub pointer_dead_zone: f32,
    pub direction_jitter: f32,
    /// Absorbing past this mass auto-splits the cell
    pub overflow_ceiling: f32,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            max_cells: split::MAX_CELLS,
            min_split_mass: split::MIN_SPLIT_MASS,
            ratio: split::RATIO,
            loss_ratio: split::LOSS_RATIO,
            momentum: split::MOMENTUM,
            margin: split::MARGIN,
            recoil: split::RECOIL,
            pointer_dead_zone: split::POINTER_DEAD_ZONE,
            direction_jitter: split::DIRECTION_JITTER,
            overflow_ceiling: mass::OVERFLOW_CEILING,
        }
    }
}

/// Recombine tunables
#[derive(Debug, Clone)]
pub struct RecombineConfig {
    pub delay_ms: u64,
    pub proximity_factor: f32,
    pub forced_duration_ms: u64,
    pub forced_speed: f32,
    pub forced_velocity_retention: f32,
}

impl Default for RecombineConfig {
    fn default() -> Self {
        Self {
            delay_ms: recombine::DELAY_MS,
            proximity_factor: recombine::PROXIMITY_FACTOR,
            forced_duration_ms: recombine::FORCED_DURATION_MS,
            forced_speed: recombine::FORCED_SPEED,
            forced_velocity_retention: recombine::FORCED_VELOCITY_RETENTION,
        }
    }
}

/// Collision resolver tunables
#[derive(Debug, Clone)]
pub struct CollisionConfig {
    pub absorption_threshold: f32,
    pub restitution: f32,
    pub separation_stiffness: f32,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            absorption_threshold: collision::ABSORPTION_THRESHOLD,
            restitution: collision::RESTITUTION,
            separation_stiffness: collision::SEPARATION_STIFFNESS,
        }
    }
}

/// Pellet field tunables
#[derive(Debug, Clone)]
pub struct PelletConfig {
    pub min_mass: f32,
    pub max_mass: f32,
    /// Set to 0 to disable spawning
    pub target_count: usize,
    pub spawn_rate: f32,
}

impl Default for PelletConfig {
    fn default() -> Self {
        Self {
            min_mass: pellet::MIN_MASS,
            max_mass: pellet::MAX_MASS,
            target_count: pellet::TARGET_COUNT,
            spawn_rate: pellet::SPAWN_RATE,
        }
    }
}

/// Quadtree tunables
#[derive(Debug, Clone)]
pub struct SpatialConfig {
    pub max_objects: usize,
    pub max_depth: u8,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            max_objects: spatial::MAX_OBJECTS,
            max_depth: spatial::MAX_DEPTH,
        }
    }
}

/// Simulation configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Arena spans [0, arena_width] x [0, arena_height]
    pub arena_width: f32,
    pub arena_height: f32,
    pub starting_mass: f32,
    /// Fixed RNG seed; `None` seeds from entropy
    pub seed: Option<u64>,
    pub motion: MotionConfig,
    pub split: SplitConfig,
    pub recombine: RecombineConfig,
    pub collision: CollisionConfig,
    pub pellets: PelletConfig,
    pub spatial: SpatialConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            arena_width: arena::WIDTH,
            arena_height: arena::HEIGHT,
            starting_mass: mass::STARTING,
            seed: None,
            motion: MotionConfig::default(),
            split: SplitConfig::default(),
            recombine: RecombineConfig::default(),
            collision: CollisionConfig::default(),
            pellets: PelletConfig::default(),
            spatial: SpatialConfig::default(),
        }
    }
}

/// Parse an env var, warning and returning `None` when it is set but invalid
fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

impl SimConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Some(width) = env_parse::<f32>("ARENA_WIDTH") {
            if width > 0.0 {
                config.arena_width = width;
            } else {
                tracing::warn!("ARENA_WIDTH must be > 0, using default");
            }
        }

        if let Some(height) = env_parse::<f32>("ARENA_HEIGHT") {
            if height > 0.0 {
                config.arena_height = height;
            } else {
                tracing::warn!("ARENA_HEIGHT must be > 0, using default");
            }
        }

        if let Some(max_cells) = env_parse::<usize>("MAX_CELLS") {
            if (1..=64).contains(&max_cells) {
                config.split.max_cells = max_cells;
            } else {
                tracing::warn!("MAX_CELLS must be 1-64, using default");
            }
        }

        if let Some(min_split) = env_parse::<f32>("MIN_SPLIT_MASS") {
            if min_split > 0.0 {
                config.split.min_split_mass = min_split;
            } else {
                tracing::warn!("MIN_SPLIT_MASS must be > 0, using default");
            }
        }

        if let Some(delay) = env_parse::<u64>("RECOMBINE_DELAY_MS") {
            config.recombine.delay_ms = delay;
        }

        if let Some(count) = env_parse::<usize>("PELLET_TARGET_COUNT") {
            config.pellets.target_count = count;
        }

        if let Some(seed) = env_parse::<u64>("SIM_SEED") {
            config.seed = Some(seed);
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("arena_width", self.arena_width)?;
        positive("arena_height", self.arena_height)?;
        positive("starting_mass", self.starting_mass)?;

        in_range("motion.friction", self.motion.friction, 0.0, 1.0, "(0, 1]")?;
        in_range_open("motion.bounce_retention", self.motion.bounce_retention, "[0, 1)")?;
        in_range("motion.steering_response", self.motion.steering_response, 0.0, 1.0, "(0, 1]")?;
        positive("motion.min_speed", self.motion.min_speed)?;
        if self.motion.base_speed < self.motion.min_speed {
            return Err(ConfigError::Inconsistent("motion.base_speed must be >= motion.min_speed"));
        }

        if self.split.max_cells == 0 {
            return Err(ConfigError::Inconsistent("split.max_cells must be at least 1"));
        }
        positive("split.min_split_mass", self.split.min_split_mass)?;
        if !(self.split.ratio > 0.0 && self.split.ratio < 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "split.ratio",
                range: "(0, 1)",
                value: self.split.ratio,
            });
        }
        in_range_open("split.loss_ratio", self.split.loss_ratio, "[0, 1)")?;
        in_range("split.recoil", self.split.recoil, -f32::EPSILON, 1.0, "[0, 1]")?;
        if !(self.split.direction_jitter.is_finite() && self.split.direction_jitter >= 0.0) {
            return Err(ConfigError::OutOfRange {
                field: "split.direction_jitter",
                range: "[0, inf)",
                value: self.split.direction_jitter,
            });
        }
        if self.split.overflow_ceiling <= self.split.min_split_mass {
            return Err(ConfigError::Inconsistent(
                "split.overflow_ceiling must exceed split.min_split_mass",
            ));
        }

        in_range("recombine.proximity_factor", self.recombine.proximity_factor, 0.0, 1.0 - f32::EPSILON, "(0, 1)")?;
        in_range("recombine.forced_velocity_retention", self.recombine.forced_velocity_retention, -f32::EPSILON, 1.0, "[0, 1]")?;
        positive("recombine.forced_speed", self.recombine.forced_speed)?;

        if self.collision.absorption_threshold <= 1.0 {
            return Err(ConfigError::OutOfRange {
                field: "collision.absorption_threshold",
                range: "(1, inf)",
                value: self.collision.absorption_threshold,
            });
        }
        in_range("collision.restitution", self.collision.restitution, -f32::EPSILON, 1.0, "[0, 1]")?;

        positive("pellets.min_mass", self.pellets.min_mass)?;
        if self.pellets.max_mass < self.pellets.min_mass {
            return Err(ConfigError::Inconsistent("pellets.max_mass must be >= pellets.min_mass"));
        }

        if self.spatial.max_objects == 0 {
            return Err(ConfigError::Inconsistent("spatial.max_objects must be at least 1"));
        }

        Ok(())
    }
}

fn positive(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

/// `value` in (low, high]
fn in_range(field: &'static str, value: f32, low: f32, high: f32, range: &'static str) -> Result<(), ConfigError> {
    if value > low && value <= high {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { field, range, value })
    }
}

/// `value` in [0, 1)
fn in_range_open(field: &'static str, value: f32, range: &'static str) -> Result<(), ConfigError> {
    if (0.0..1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { field, range, value })
    }
}

/// Headless runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub tick_rate: u32,
    pub bot_count: usize,
    /// Stop after this many seconds; `None` runs until Ctrl+C
    pub run_seconds: Option<u64>,
    /// Serve Prometheus metrics on this port when set
    pub metrics_port: Option<u16>,
    /// Seconds between leaderboard log lines
    pub report_interval_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_rate: clock::TICK_RATE,
            bot_count: 20,
            run_seconds: None,
            metrics_port: None,
            report_interval_secs: 5,
        }
    }
}

impl RunnerConfig {
    /// Load runner config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Some(rate) = env_parse::<u32>("TICK_RATE") {
            if (1..=240).contains(&rate) {
                config.tick_rate = rate;
            } else {
                tracing::warn!("TICK_RATE must be 1-240, using default");
            }
        }

        if let Some(bots) = env_parse::<usize>("BOT_COUNT") {
            config.bot_count = bots;
        }

        if let Some(secs) = env_parse::<u64>("RUN_SECONDS") {
            config.run_seconds = Some(secs);
        }

        if let Some(port) = env_parse::<u16>("METRICS_PORT") {
            if port > 0 {
                config.metrics_port = Some(port);
            } else {
                tracing::warn!("METRICS_PORT must be > 0, metrics disabled");
            }
        }

        config
    }

    pub fn tick_duration_ms(&self) -> u64 {
        1000 / self.tick_rate.max(1) as u64
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 {
            return Err(ConfigError::Inconsistent("tick_rate must be at least 1"));
        }
        if self.report_interval_secs == 0 {
            return Err(ConfigError::Inconsistent("report_interval_secs must be at least 1"));
        }
        Ok(())
    }
}
