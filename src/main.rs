use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use mass_arena::game::performance::PerformanceMonitor;
use mass_arena::metrics::{self, SimMetrics};
use mass_arena::{AgentId, Intent, IntentSender, RunnerConfig, SimConfig, Simulation, Vec2};

/// Chance per tick that a bot picks a new wander target
const RETARGET_CHANCE: f64 = 0.02;
/// Chance per tick that a bot tries to split
const SPLIT_CHANCE: f64 = 0.002;
/// Chance per tick that a bot tries to pull its cells together
const RECOMBINE_CHANCE: f64 = 0.001;

/// Random-walk bots driving the simulation through the intent queue
struct RandomWalkBots {
    sender: IntentSender,
    rng: StdRng,
    bots: Vec<(AgentId, Vec2)>,
    arena: Vec2,
}

impl RandomWalkBots {
    fn new(sender: IntentSender, arena: Vec2) -> Self {
        Self {
            sender,
            rng: StdRng::from_entropy(),
            bots: Vec::new(),
            arena,
        }
    }

    fn len(&self) -> usize {
        self.bots.len()
    }

    fn random_target(&mut self) -> Vec2 {
        Vec2::new(
            self.rng.gen_range(0.0..self.arena.x),
            self.rng.gen_range(0.0..self.arena.y),
        )
    }

    fn add(&mut self, agent: AgentId) {
        let target = self.random_target();
        self.bots.push((agent, target));
    }

    fn pop(&mut self) -> Option<AgentId> {
        self.bots.pop().map(|(id, _)| id)
    }

    fn forget(&mut self, died: &[AgentId]) {
        self.bots.retain(|(id, _)| !died.contains(id));
    }

    /// Queue this tick's intents for every bot
    fn drive(&mut self) {
        for i in 0..self.bots.len() {
            if self.rng.gen_bool(RETARGET_CHANCE) {
                self.bots[i].1 = self.random_target();
            }
            let (agent, target) = self.bots[i];

            let mut intents = vec![Intent::Pointer(target)];
            if self.rng.gen_bool(SPLIT_CHANCE) {
                intents.push(Intent::Split(target));
            }
            if self.rng.gen_bool(RECOMBINE_CHANCE) {
                intents.push(Intent::ForceRecombine(target));
            }

            for intent in intents {
                if let Err(e) = self.sender.send(agent, intent) {
                    debug!("Bot {} intent dropped: {}", agent, e);
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging (RUST_LOG overrides the default level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Mass Arena v{}", env!("CARGO_PKG_VERSION"));

    let sim_config = SimConfig::load_or_default();
    let runner = RunnerConfig::load_or_default();
    runner.validate()?;
    info!(
        "Configuration loaded: {} Hz, {} bots, arena {}x{}",
        runner.tick_rate, runner.bot_count, sim_config.arena_width, sim_config.arena_height
    );

    let arena = Vec2::new(sim_config.arena_width, sim_config.arena_height);
    let mut sim = Simulation::new(sim_config)?;
    let metrics: Arc<SimMetrics> = sim.metrics();

    if let Some(port) = runner.metrics_port {
        let metrics_clone = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(metrics_clone, port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let mut bots = RandomWalkBots::new(sim.input_sender(), arena);
    let mut bot_serial = 0usize;
    for _ in 0..runner.bot_count {
        bot_serial += 1;
        bots.add(sim.join_agent(format!("Bot {}", bot_serial), true));
    }

    let tick_ms = runner.tick_duration_ms();
    let mut ticker = interval(Duration::from_millis(tick_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let started = Instant::now();
    let deadline = runner.run_seconds.map(|secs| started + Duration::from_secs(secs));
    let report_every = runner.report_interval_secs * runner.tick_rate as u64;
    let mut performance = PerformanceMonitor::new(runner.tick_rate);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Tick loop started at {} Hz", runner.tick_rate);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Shutdown signal received");
                break;
            }
        }

        if deadline.map_or(false, |d| Instant::now() >= d) {
            info!("Run duration reached");
            break;
        }

        bots.drive();

        performance.tick_start();
        let report = match sim.step_simulation(tick_ms) {
            Ok(report) => report,
            Err(e) => {
                error!("Simulation halted on tick {}: {}", sim.tick(), e);
                return Err(e.into());
            }
        };
        performance.tick_end(sim.state().cells.len());
        metrics.set_performance(performance.status(), performance.budget_usage_percent());

        bots.forget(&report.agents_died);

        let status = performance.status();
        if status.should_shed_bots() {
            if let Some(agent) = bots.pop() {
                sim.remove_agent(agent);
                warn!("Shedding bot {}: {}", agent, performance.status_message());
            }
        } else if status.can_add_agents() && bots.len() < runner.bot_count {
            bot_serial += 1;
            bots.add(sim.join_agent(format!("Bot {}", bot_serial), true));
        }

        if report.tick % report_every == 0 {
            let leaders: Vec<String> = sim
                .leaderboard(5)
                .iter()
                .map(|e| format!("{} {:.0}", e.name, e.total_mass))
                .collect();
            info!(
                "Sim: {}s, tick {}, {} agents, {} pellets, mass {:.0} | Perf: {}",
                started.elapsed().as_secs(),
                report.tick,
                sim.state().agent_count(),
                sim.state().pellet_count(),
                sim.total_mass(),
                performance.status_message()
            );
            info!("Leaderboard: {}", leaders.join(", "));
            let index = sim.index_stats();
            debug!(
                "Index: {} nodes, {} entries, depth {}, max {} per node | {} intents pending",
                index.node_count,
                index.total_entries,
                index.max_depth,
                index.max_per_node,
                sim.pending_intents()
            );
        }
    }

    info!(
        "Stopped after {} ticks ({} agents, total mass {:.0})",
        sim.tick(),
        sim.state().agent_count(),
        sim.total_mass()
    );

    Ok(())
}
