//! Tick budget monitoring
//!
//! Classifies the rolling average step time against the tick budget. The
//! headless runner uses the status to decide whether to admit more bots.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Samples kept in the rolling window (~4 seconds at 30Hz)
const WINDOW: usize = 120;

/// Samples needed before the status moves off its initial value
const MIN_SAMPLES: usize = 10;

/// Budget fractions separating the status levels
const EXCELLENT_BELOW: f32 = 0.3;
const GOOD_BELOW: f32 = 0.7;
const WARNING_BELOW: f32 = 0.9;
const CRITICAL_BELOW: f32 = 1.5;

/// Performance status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PerformanceStatus {
    Excellent,
    Good,
    /// Over 70% of budget, stop admitting agents
    Warning,
    /// Close to or over budget
    Critical,
    /// Sustained overload, shed bots
    Catastrophic,
}

impl PerformanceStatus {
    fn from_budget_ratio(ratio: f32) -> Self {
        if ratio < EXCELLENT_BELOW {
            PerformanceStatus::Excellent
        } else if ratio < GOOD_BELOW {
            PerformanceStatus::Good
        } else if ratio < WARNING_BELOW {
            PerformanceStatus::Warning
        } else if ratio < CRITICAL_BELOW {
            PerformanceStatus::Critical
        } else {
            PerformanceStatus::Catastrophic
        }
    }

    pub fn can_add_agents(&self) -> bool {
        matches!(self, PerformanceStatus::Excellent | PerformanceStatus::Good)
    }

    pub fn should_shed_bots(&self) -> bool {
        matches!(self, PerformanceStatus::Catastrophic)
    }
}

/// Rolling tick-duration tracker
pub struct PerformanceMonitor {
    samples: VecDeque<Duration>,
    budget: Duration,
    status: PerformanceStatus,
    tick_start: Option<Instant>,
    last_entity_count: usize,
}

impl PerformanceMonitor {
    pub fn new(tick_rate: u32) -> Self {
        Self {
            samples: VecDeque::with_capacity(WINDOW),
            budget: Duration::from_secs_f32(1.0 / tick_rate.max(1) as f32),
            status: PerformanceStatus::Excellent,
            tick_start: None,
            last_entity_count: 0,
        }
    }

    pub fn tick_start(&mut self) {
        self.tick_start = Some(Instant::now());
    }

    /// Stop timing the current tick and record it
    pub fn tick_end(&mut self, entity_count: usize) {
        if let Some(start) = self.tick_start.take() {
            self.record(start.elapsed());
            self.last_entity_count = entity_count;
        }
    }

    pub fn record(&mut self, duration: Duration) {
        self.samples.push_back(duration);
        while self.samples.len() > WINDOW {
            self.samples.pop_front();
        }
        if self.samples.len() >= MIN_SAMPLES {
            self.status = PerformanceStatus::from_budget_ratio(self.budget_ratio());
        }
    }

    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = self.samples.iter().sum();
        sum / self.samples.len() as u32
    }

    /// 95th percentile tick duration
    pub fn p95(&self) -> Duration {
        let mut sorted: Vec<_> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = (sorted.len() as f32 * 0.95) as usize;
        sorted
            .get(idx.min(sorted.len().saturating_sub(1)))
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    fn budget_ratio(&self) -> f32 {
        self.average().as_secs_f32() / self.budget.as_secs_f32()
    }

    pub fn status(&self) -> PerformanceStatus {
        self.status
    }

    /// Average tick time as a percentage of the budget (may exceed 100)
    pub fn budget_usage_percent(&self) -> f32 {
        self.budget_ratio() * 100.0
    }

    pub fn last_entity_count(&self) -> usize {
        self.last_entity_count
    }

    pub fn status_message(&self) -> String {
        format!(
            "{:?} - {:.1}% budget, p95 {:.2}ms, {} entities",
            self.status,
            self.budget_usage_percent(),
            self.p95().as_secs_f64() * 1000.0,
            self.last_entity_count
        )
    }
}
