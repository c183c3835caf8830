//! In-process cluster
//!
//! A simulation manager, one or more workers and an aggregator attached to
//! a [`LocalBus`] with the usual channel topology:
//!
//! ```text
//! client -> portfolio_requests -> manager -> simulations -> workers
//! workers -> defaults -> aggregator -> simulations, distributions
//! ```
//!
//! Every node may also publish on `errors`. A probe subscribed to
//! `defaults`, `distributions` and `errors` records what the cluster emits.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{timeout, Instant};

use collab_copula::SimulatorFactory;
use collab_core::{CollabError, Command, NodeName, Portfolio, RunParameters};
use collab_runtime::{
    AggregationManager, AggregatorConfig, Node, NodeConfig, NodeHandle, Role, SimulationManager,
    SimulationWorker, WorkerConfig,
};
use collab_sched::Scheduler;
use collab_transport::{Affiliation, LocalBus, MessageBus, NotificationStream};
use collab_wire::SimulationMessage;

pub const PORTFOLIO_REQUESTS: &str = "portfolio_requests";
pub const SIMULATIONS: &str = "simulations";
pub const DEFAULTS: &str = "defaults";
pub const DISTRIBUTIONS: &str = "distributions";
pub const ERRORS: &str = "errors";

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Nothing matched within {0:?}")]
    Timeout(Duration),

    #[error("Probe disconnected")]
    Disconnected,

    #[error(transparent)]
    Collab(#[from] CollabError),
}

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Configuration for a test cluster
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of simulation workers
    pub workers: usize,

    /// Settings shared by every worker
    pub worker: WorkerConfig,

    pub aggregator: AggregatorConfig,

    /// Base seed; worker `i` uses `seed + i`
    pub seed: Option<u64>,

    /// Run the periodic load check on every node
    pub load_check: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            worker: WorkerConfig::quick(),
            aggregator: AggregatorConfig::default(),
            seed: Some(7),
            load_check: false,
        }
    }
}

impl ClusterConfig {
    /// One worker, quick runs
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Three workers with load checks on
    pub fn standard() -> Self {
        Self {
            workers: 3,
            load_check: true,
            ..Self::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    fn node(&self, name: &str) -> NodeConfig {
        if self.load_check {
            NodeConfig::local_test(name)
        } else {
            NodeConfig::always_listening(name)
        }
    }
}

/// A message seen by the probe
#[derive(Debug, Clone)]
pub struct Observed {
    pub channel: String,
    pub message: SimulationMessage,
}

impl Observed {
    pub fn is(&self, channel: &str, command: Command) -> bool {
        self.channel == channel && self.message.params.command == command
    }
}

/// Running cluster
pub struct Cluster {
    bus: LocalBus,
    scheduler: Scheduler,
    handles: Vec<NodeHandle>,
    workers: Vec<Arc<SimulationWorker>>,
    aggregator: Arc<AggregationManager>,
    client: NodeName,
    probe: NotificationStream,
    pending: VecDeque<Observed>,
}

impl Cluster {
    /// Wire up and spawn every node on the current runtime
    pub async fn start(config: ClusterConfig) -> ClusterResult<Self> {
        let bus = LocalBus::new();
        let scheduler = Scheduler::start();

        let client = NodeName::new("client");
        bus.affiliate(PORTFOLIO_REQUESTS, &client, Affiliation::Publisher);

        let probe_name = NodeName::new("probe");
        let probe = bus.attach(&probe_name);
        for channel in [DEFAULTS, DISTRIBUTIONS, ERRORS] {
            bus.create_channel(channel);
            bus.subscribe(channel, &probe_name).await?;
        }

        let mut handles = Vec::new();
        handles.push(
            spawn_node(
                &bus,
                &scheduler,
                config.node("manager"),
                &[PORTFOLIO_REQUESTS],
                &[SIMULATIONS],
                Arc::new(SimulationManager::new()),
            )
            .await?,
        );

        let mut workers = Vec::new();
        for i in 0..config.workers {
            let mut factory = SimulatorFactory::with_defaults();
            if let Some(seed) = config.seed {
                factory = factory.with_seed(seed.wrapping_add(i as u64));
            }
            let worker = Arc::new(SimulationWorker::new(config.worker.clone(), factory));
            handles.push(
                spawn_node(
                    &bus,
                    &scheduler,
                    config.node(&format!("worker{}", i)),
                    &[SIMULATIONS],
                    &[DEFAULTS],
                    Arc::clone(&worker) as Arc<dyn Role>,
                )
                .await?,
            );
            workers.push(worker);
        }

        let aggregator = Arc::new(AggregationManager::new(&config.aggregator));
        handles.push(
            spawn_node(
                &bus,
                &scheduler,
                config.node("aggregator"),
                &[DEFAULTS],
                &[SIMULATIONS, DISTRIBUTIONS],
                Arc::clone(&aggregator) as Arc<dyn Role>,
            )
            .await?,
        );

        tracing::info!(workers = config.workers, "cluster started");
        Ok(Self {
            bus,
            scheduler,
            handles,
            workers,
            aggregator,
            client,
            probe,
            pending: VecDeque::new(),
        })
    }

    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn workers(&self) -> &[Arc<SimulationWorker>] {
        &self.workers
    }

    pub fn aggregator(&self) -> &Arc<AggregationManager> {
        &self.aggregator
    }

    /// Ask the manager to start a run
    pub async fn submit(
        &self,
        run_id: &str,
        portfolio: Option<Portfolio>,
        number_runs: u64,
    ) -> ClusterResult<()> {
        let params = RunParameters::new(run_id)
            .with_command(Command::Start)
            .with_number_runs(number_runs);
        let mut msg = SimulationMessage::new(params);
        if let Some(portfolio) = portfolio {
            msg = msg.with_portfolio(portfolio);
        }
        self.send(run_id, &msg).await
    }

    /// Ask the manager to stop a run
    pub async fn cancel(&self, run_id: &str) -> ClusterResult<()> {
        let msg = SimulationMessage::new(RunParameters::new(run_id).with_command(Command::Stop));
        self.send(run_id, &msg).await
    }

    async fn send(&self, run_id: &str, msg: &SimulationMessage) -> ClusterResult<()> {
        self.bus
            .publish(
                PORTFOLIO_REQUESTS,
                &self.client,
                msg.to_item(Some(run_id.to_string())),
            )
            .await?;
        Ok(())
    }

    /// Next message seen by the probe, `None` after `quiet` without traffic
    pub async fn next_observed(&mut self, quiet: Duration) -> ClusterResult<Option<Observed>> {
        loop {
            if let Some(observed) = self.pending.pop_front() {
                return Ok(Some(observed));
            }
            let notification = match timeout(quiet, self.probe.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(ClusterError::Disconnected),
                Ok(Some(notification)) => notification,
            };
            for item in notification.items {
                // items without a payload carry nothing to observe
                if let Some(envelope) = item.envelope()? {
                    self.pending.push_back(Observed {
                        channel: notification.channel.clone(),
                        message: envelope.into_message()?,
                    });
                }
            }
        }
    }

    /// Everything observed up to and including the first message matching
    /// `done`. Fails if nothing matches before `deadline`.
    pub async fn observe_until<F>(
        &mut self,
        deadline: Duration,
        mut done: F,
    ) -> ClusterResult<Vec<Observed>>
    where
        F: FnMut(&Observed) -> bool,
    {
        let started = Instant::now();
        let mut seen = Vec::new();
        loop {
            let left = deadline.saturating_sub(started.elapsed());
            if left.is_zero() {
                return Err(ClusterError::Timeout(deadline));
            }
            match self.next_observed(left).await? {
                Some(observed) => {
                    let matched = done(&observed);
                    seen.push(observed);
                    if matched {
                        return Ok(seen);
                    }
                }
                None => return Err(ClusterError::Timeout(deadline)),
            }
        }
    }

    /// Everything observed until the cluster has been quiet for `quiet`
    pub async fn drain(&mut self, quiet: Duration) -> ClusterResult<Vec<Observed>> {
        let mut seen = Vec::new();
        while let Some(observed) = self.next_observed(quiet).await? {
            seen.push(observed);
        }
        Ok(seen)
    }

    /// Stop every node, then the scheduler
    pub async fn shutdown(self) {
        for handle in self.handles {
            handle.shutdown().await;
        }
        self.scheduler.shutdown();
    }
}

async fn spawn_node(
    bus: &LocalBus,
    scheduler: &Scheduler,
    config: NodeConfig,
    inputs: &[&str],
    outputs: &[&str],
    role: Arc<dyn Role>,
) -> ClusterResult<NodeHandle> {
    for channel in outputs.iter().chain(std::iter::once(&ERRORS)) {
        bus.affiliate(channel, &config.name, Affiliation::Publisher);
    }
    let node = Node::new(&config, Arc::new(bus.clone()), scheduler.clone(), role);
    for channel in inputs {
        bus.create_channel(channel);
        node.context().add_input(channel).await?;
    }
    Ok(node.spawn())
}
