pub mod constants;
pub mod state;
pub mod systems;
pub mod simulation;
pub mod performance;
pub mod spatial;
pub mod input_buffer;
