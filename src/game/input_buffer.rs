//! Lock-free intent queue between input producers and the tick
//!
//! Producers (connection handlers, bot drivers) hold an [`IntentSender`] and
//! enqueue without blocking; the simulation drains everything at the start
//! of each step.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::game::state::AgentId;
use crate::util::vec2::Vec2;

/// Default queue capacity (~50 agents issuing a few intents per tick)
const DEFAULT_CAPACITY: usize = 1024;

/// What an agent asked for
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Intent {
    /// Per-tick pointer target in world space
    Pointer(Vec2),
    /// Edge-triggered split toward a world-space target
    Split(Vec2),
    /// Edge-triggered forced recombine toward a world-space target
    ForceRecombine(Vec2),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentIntent {
    pub agent: AgentId,
    pub intent: Intent,
}

/// Intent queue errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InputBufferError {
    /// Queue is full (backpressure)
    #[error("intent queue is full")]
    Full,
    /// Simulation dropped the queue
    #[error("intent queue is disconnected")]
    Disconnected,
}

impl<T> From<TrySendError<T>> for InputBufferError {
    fn from(e: TrySendError<T>) -> Self {
        match e {
            TrySendError::Full(_) => InputBufferError::Full,
            TrySendError::Disconnected(_) => InputBufferError::Disconnected,
        }
    }
}

/// Bounded multi-producer queue of agent intents
pub struct InputBuffer {
    sender: Sender<AgentIntent>,
    receiver: Receiver<AgentIntent>,
}

impl InputBuffer {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self { sender, receiver }
    }

    /// Clonable handle for a producer
    pub fn sender(&self) -> IntentSender {
        IntentSender {
            sender: self.sender.clone(),
        }
    }

    /// Move every pending intent into `out`, in submission order
    pub fn drain_into(&self, out: &mut Vec<AgentIntent>) {
        out.extend(self.receiver.try_iter());
    }

    /// Intents waiting for the next drain
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }
}

impl Default for InputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Producer handle; cheap to clone and `Send`
#[derive(Clone)]
pub struct IntentSender {
    sender: Sender<AgentIntent>,
}

impl IntentSender {
    /// Enqueue without blocking. `Full` signals backpressure.
    #[inline]
    pub fn send(&self, agent: AgentId, intent: Intent) -> Result<(), InputBufferError> {
        self.sender
            .try_send(AgentIntent { agent, intent })
            .map_err(InputBufferError::from)
    }
}
