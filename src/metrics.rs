//! Prometheus-compatible simulation metrics
//!
//! The simulation updates the registry at the end of every step; the
//! headless runner can serve it over a tiny HTTP endpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::game::performance::PerformanceStatus;
use crate::game::simulation::TickReport;

/// Tick samples kept for percentile calculation
const TICK_HISTORY: usize = 1000;

/// Metrics registry for the simulation
#[derive(Debug)]
pub struct SimMetrics {
    // Population gauges
    pub agents: AtomicU64,
    pub bots: AtomicU64,
    pub cells: AtomicU64,
    pub pellets: AtomicU64,
    /// Total live mass, stored x100
    pub total_mass_centi: AtomicU64,

    // Event counters
    pub absorptions: AtomicU64,
    pub pellets_consumed: AtomicU64,
    pub splits: AtomicU64,
    pub merges: AtomicU64,
    pub forced_recombines: AtomicU64,
    pub agents_died: AtomicU64,

    // Tick timing (microseconds)
    pub tick_count: AtomicU64,
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,

    // 0=Excellent .. 4=Catastrophic
    pub performance_status: AtomicU64,
    pub budget_usage_percent: AtomicU64,

    start_time: Instant,
    tick_history: RwLock<VecDeque<u64>>,
}

fn status_name(code: u64) -> &'static str {
    match code {
        0 => "excellent",
        1 => "good",
        2 => "warning",
        3 => "critical",
        _ => "catastrophic",
    }
}

impl SimMetrics {
    pub fn new() -> Self {
        Self {
            agents: AtomicU64::new(0),
            bots: AtomicU64::new(0),
            cells: AtomicU64::new(0),
            pellets: AtomicU64::new(0),
            total_mass_centi: AtomicU64::new(0),
            absorptions: AtomicU64::new(0),
            pellets_consumed: AtomicU64::new(0),
            splits: AtomicU64::new(0),
            merges: AtomicU64::new(0),
            forced_recombines: AtomicU64::new(0),
            agents_died: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            performance_status: AtomicU64::new(0),
            budget_usage_percent: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    /// Record a step duration and refresh percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();
            let last = sorted.len() - 1;
            let p95 = ((sorted.len() as f32 * 0.95) as usize).min(last);
            let p99 = ((sorted.len() as f32 * 0.99) as usize).min(last);

            self.tick_time_p95_us.store(sorted[p95], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted[last], Ordering::Relaxed);
        }
    }

    /// Accumulate the events of one step
    pub fn record_report(&self, report: &TickReport) {
        self.absorptions
            .fetch_add(report.absorptions.len() as u64, Ordering::Relaxed);
        self.pellets_consumed
            .fetch_add(report.pellets_consumed as u64, Ordering::Relaxed);
        self.splits.fetch_add(report.splits.len() as u64, Ordering::Relaxed);
        self.merges.fetch_add(report.merges.len() as u64, Ordering::Relaxed);
        self.forced_recombines
            .fetch_add(report.forced_recombines_completed as u64, Ordering::Relaxed);
        self.agents_died
            .fetch_add(report.agents_died.len() as u64, Ordering::Relaxed);
    }

    pub fn set_population(&self, agents: usize, bots: usize, cells: usize, pellets: usize, total_mass: f32) {
        self.agents.store(agents as u64, Ordering::Relaxed);
        self.bots.store(bots as u64, Ordering::Relaxed);
        self.cells.store(cells as u64, Ordering::Relaxed);
        self.pellets.store(pellets as u64, Ordering::Relaxed);
        self.total_mass_centi
            .store((total_mass.max(0.0) * 100.0) as u64, Ordering::Relaxed);
    }

    pub fn set_performance(&self, status: PerformanceStatus, budget_usage_percent: f32) {
        self.performance_status.store(status as u64, Ordering::Relaxed);
        self.budget_usage_percent
            .store(budget_usage_percent.max(0.0) as u64, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Prometheus text exposition format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("mass_arena_agents", "Connected agents", "gauge",
            self.agents.load(Ordering::Relaxed));
        metric!("mass_arena_agents_bot", "Connected bot agents", "gauge",
            self.bots.load(Ordering::Relaxed));
        metric!("mass_arena_cells", "Live agent cells", "gauge",
            self.cells.load(Ordering::Relaxed));
        metric!("mass_arena_pellets", "Live pellets", "gauge",
            self.pellets.load(Ordering::Relaxed));
        metric!("mass_arena_total_mass", "Total live mass", "gauge",
            format!("{:.2}", self.total_mass_centi.load(Ordering::Relaxed) as f64 / 100.0));

        metric!("mass_arena_absorptions_total", "Cells absorbed by other agents", "counter",
            self.absorptions.load(Ordering::Relaxed));
        metric!("mass_arena_pellets_consumed_total", "Pellets consumed", "counter",
            self.pellets_consumed.load(Ordering::Relaxed));
        metric!("mass_arena_splits_total", "Cells created by splitting", "counter",
            self.splits.load(Ordering::Relaxed));
        metric!("mass_arena_merges_total", "Cell merges", "counter",
            self.merges.load(Ordering::Relaxed));
        metric!("mass_arena_forced_recombines_total", "Completed forced recombines", "counter",
            self.forced_recombines.load(Ordering::Relaxed));
        metric!("mass_arena_agents_died_total", "Agents that lost their last cell", "counter",
            self.agents_died.load(Ordering::Relaxed));

        metric!("mass_arena_tick_time_microseconds", "Last step time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("mass_arena_tick_time_p95_microseconds", "95th percentile step time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("mass_arena_tick_time_p99_microseconds", "99th percentile step time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("mass_arena_tick_time_max_microseconds", "Maximum step time in the window", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("mass_arena_tick_count", "Steps processed", "counter",
            self.tick_count.load(Ordering::Relaxed));

        metric!("mass_arena_performance_status", "Performance status (0=Excellent, 4=Catastrophic)", "gauge",
            self.performance_status.load(Ordering::Relaxed));
        metric!("mass_arena_budget_usage_percent", "Tick budget usage percentage", "gauge",
            self.budget_usage_percent.load(Ordering::Relaxed));
        output.push_str(&format!(
            "# HELP mass_arena_performance_state Human-readable performance state\n# TYPE mass_arena_performance_state gauge\nmass_arena_performance_state{{state=\"{}\"}} 1\n",
            status_name(self.performance_status.load(Ordering::Relaxed))
        ));

        metric!("mass_arena_uptime_seconds", "Runner uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// JSON view of the same values
    pub fn to_json(&self) -> String {
        let status = self.performance_status.load(Ordering::Relaxed);
        serde_json::json!({
            "population": {
                "agents": self.agents.load(Ordering::Relaxed),
                "bots": self.bots.load(Ordering::Relaxed),
                "cells": self.cells.load(Ordering::Relaxed),
                "pellets": self.pellets.load(Ordering::Relaxed),
                "total_mass": self.total_mass_centi.load(Ordering::Relaxed) as f64 / 100.0,
            },
            "events": {
                "absorptions": self.absorptions.load(Ordering::Relaxed),
                "pellets_consumed": self.pellets_consumed.load(Ordering::Relaxed),
                "splits": self.splits.load(Ordering::Relaxed),
                "merges": self.merges.load(Ordering::Relaxed),
                "forced_recombines": self.forced_recombines.load(Ordering::Relaxed),
                "agents_died": self.agents_died.load(Ordering::Relaxed),
            },
            "performance": {
                "tick_time_us": self.tick_time_us.load(Ordering::Relaxed),
                "tick_time_p95_us": self.tick_time_p95_us.load(Ordering::Relaxed),
                "tick_time_p99_us": self.tick_time_p99_us.load(Ordering::Relaxed),
                "tick_time_max_us": self.tick_time_max_us.load(Ordering::Relaxed),
                "tick_count": self.tick_count.load(Ordering::Relaxed),
                "status": status,
                "status_name": status_name(status),
                "budget_percent": self.budget_usage_percent.load(Ordering::Relaxed),
            },
            "uptime_seconds": self.uptime_seconds(),
        })
        .to_string()
    }
}

impl Default for SimMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn http_response(content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}

/// Serve `/metrics`, `/metrics/json` and `/health` until the listener fails
pub async fn start_metrics_server(metrics: Arc<SimMetrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);

                    let response = if request.starts_with("GET /metrics/json") {
                        http_response("application/json", &metrics.to_json())
                    } else if request.starts_with("GET /metrics") {
                        http_response("text/plain; version=0.0.4", &metrics.to_prometheus())
                    } else if request.starts_with("GET /health") {
                        http_response("text/plain", "OK")
                    } else {
                        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
                    };

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}
