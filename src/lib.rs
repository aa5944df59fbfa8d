//! Mass Arena Simulation Library
//!
//! Simulation core for an agar-style arena: agents steer circular cells
//! around a bounded field, eat pellets, absorb smaller rivals, split and
//! recombine. The core is transport-agnostic; callers drive it with
//! [`Simulation::step_simulation`] and read snapshots between steps.
//!
//! # Features
//!
//! - `parallel_motion` - Integrate cell motion with rayon (enabled by default)

pub mod config;
pub mod util;
pub mod game;
pub mod metrics;

pub use config::{ConfigError, RunnerConfig, SimConfig};
pub use game::input_buffer::{Intent, IntentSender};
pub use game::simulation::{EffectHook, SimError, Simulation, TickReport};
pub use game::state::{AgentId, CellId};
pub use util::vec2::Vec2;
