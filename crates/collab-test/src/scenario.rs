//! End-to-end scenarios
//!
//! Submit one run to a fresh cluster, wait for the aggregator's stop and
//! tally what came out of it.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use collab_core::{Asset, Command, Factor, Issuer, Portfolio, DEFAULTS_HISTOGRAM};
use collab_runtime::Role;
use collab_wire::SimulationMessage;

use crate::cluster::{
    Cluster, ClusterConfig, ClusterResult, Observed, DEFAULTS, DISTRIBUTIONS, ERRORS,
};

/// Portfolio with one asset per issuer, each issuer loading on every factor
pub fn generate_portfolio(issuers: usize, factors: usize, seed: u64) -> Portfolio {
    let mut rng = StdRng::seed_from_u64(seed);
    // factor weights are variance shares and must leave room for the
    // idiosyncratic draw
    let max_weight = 0.9 / factors.max(1) as f64;

    let mut portfolio = Portfolio::new(format!("generated-{}x{}", issuers, factors));
    for i in 0..issuers {
        let loadings: Vec<Factor> = (0..factors)
            .map(|f| Factor::new(format!("factor{}", f), rng.gen::<f64>() * max_weight))
            .collect();
        let issuer = Arc::new(Issuer::new(format!("issuer{}", i), loadings));
        portfolio.insert_asset(
            Asset::new(format!("asset{}", i))
                .with_dp(rng.gen_range(0.01..0.2))
                .with_issuer(issuer),
        );
    }
    portfolio
}

/// Configuration for a scenario
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub issuers: usize,
    pub factors: usize,
    /// Trials the run asks for
    pub number_runs: u64,
    pub cluster: ClusterConfig,
    /// Time allowed for the aggregator to stop the run
    pub deadline: Duration,
    /// Quiet period that ends collection after the stop
    pub settle: Duration,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            issuers: 3,
            factors: 2,
            number_runs: 1000,
            cluster: ClusterConfig::minimal(),
            deadline: Duration::from_secs(20),
            settle: Duration::from_millis(100),
        }
    }
}

impl ScenarioConfig {
    pub fn with_cluster(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = cluster;
        self
    }

    pub fn with_number_runs(mut self, number_runs: u64) -> Self {
        self.number_runs = number_runs;
        self
    }
}

/// What a scenario observed
#[derive(Debug, Clone, Default)]
pub struct ScenarioResult {
    /// Partial results published by workers
    pub worker_results: Vec<SimulationMessage>,

    /// Final results published by the aggregator
    pub final_results: Vec<SimulationMessage>,

    /// Stops published by the aggregator
    pub stops: usize,

    /// Progress heartbeats published by the aggregator
    pub heartbeats: usize,

    /// Anything published on the error channel
    pub errors: Vec<SimulationMessage>,

    /// Runs the aggregator still held state for at the end
    pub aggregator_runs: usize,

    /// Runs workers still had tasks for at the end
    pub worker_runs: usize,
}

impl ScenarioResult {
    fn tally(observed: impl IntoIterator<Item = Observed>) -> Self {
        let mut result = Self::default();
        for o in observed {
            if o.channel == ERRORS {
                result.errors.push(o.message);
            } else if o.is(DEFAULTS, Command::Results) {
                result.worker_results.push(o.message);
            } else if o.is(DISTRIBUTIONS, Command::Results) {
                result.final_results.push(o.message);
            } else if o.is(DISTRIBUTIONS, Command::Stop) {
                result.stops += 1;
            } else if o.is(DISTRIBUTIONS, Command::Info) {
                result.heartbeats += 1;
            }
        }
        result
    }

    /// The aggregator stopped the run exactly once
    pub fn converged(&self) -> bool {
        self.final_results.len() == 1 && self.stops == 1
    }

    pub fn passed(&self) -> bool {
        self.converged()
            && self.errors.is_empty()
            && self.aggregator_runs == 0
            && self.worker_runs == 0
    }

    /// Trials covered by the final distribution
    pub fn final_trials(&self) -> u64 {
        self.final_results
            .first()
            .and_then(|m| m.distributions.as_ref())
            .map(|d| d.total(DEFAULTS_HISTOGRAM))
            .unwrap_or(0)
    }

    /// Trials reported by workers
    pub fn worker_trials(&self) -> u64 {
        self.worker_results
            .iter()
            .filter_map(|m| m.progress)
            .map(|p| p.runs)
            .sum()
    }
}

/// Run one simulation through a fresh cluster
pub async fn run_scenario(config: ScenarioConfig) -> ClusterResult<ScenarioResult> {
    let mut cluster = Cluster::start(config.cluster.clone()).await?;
    let portfolio = generate_portfolio(config.issuers, config.factors, 42);

    cluster
        .submit("scenario", Some(portfolio), config.number_runs)
        .await?;
    let outcome = cluster
        .observe_until(config.deadline, |o| o.is(DISTRIBUTIONS, Command::Stop))
        .await;
    let mut observed = match outcome {
        Ok(observed) => observed,
        Err(e) => {
            cluster.shutdown().await;
            return Err(e);
        }
    };
    observed.extend(cluster.drain(config.settle).await?);
    let aggregator_runs = cluster.aggregator().active_runs();
    let worker_runs = cluster.workers().iter().map(|w| w.active_runs()).sum();
    cluster.shutdown().await;

    let result = ScenarioResult {
        aggregator_runs,
        worker_runs,
        ..ScenarioResult::tally(observed)
    };
    tracing::info!(
        worker_results = result.worker_results.len(),
        final_trials = result.final_trials(),
        heartbeats = result.heartbeats,
        errors = result.errors.len(),
        aggregator_runs = result.aggregator_runs,
        "scenario finished"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_core::RunId;
    use collab_runtime::WorkerConfig;
    use proptest::prelude::*;

    #[test]
    fn test_generated_portfolio() {
        let p = generate_portfolio(3, 2, 1);
        assert_eq!(p.len(), 3);
        assert_eq!(p.issuers().len(), 3);
        assert_eq!(p.factors().len(), 2);
        assert!(p.assets().all(|a| a.dp() > 0.0 && a.dp() < 0.2));
        assert_eq!(p.name(), generate_portfolio(3, 2, 1).name());
    }

    proptest! {
        #[test]
        fn prop_generated_portfolio_is_valid(
            issuers in 1usize..30,
            factors in 1usize..8,
            seed in any::<u64>(),
        ) {
            let p = generate_portfolio(issuers, factors, seed);
            prop_assert_eq!(p.len(), issuers);
            prop_assert_eq!(p.factors().len(), factors);
            prop_assert!(p.issuers().iter().all(|i| i.systematic_weight() < 1.0));
        }
    }

    #[tokio::test]
    async fn test_single_worker_end_to_end() {
        let result = run_scenario(ScenarioConfig::default()).await.unwrap();

        assert_eq!(result.worker_results.len(), 5);
        assert!(result
            .worker_results
            .iter()
            .all(|m| m.progress.map(|p| p.runs) == Some(200)));
        assert!(result.converged());
        assert!(result.passed());
        assert_eq!(result.final_trials(), 1000);
        assert_eq!(result.worker_trials(), 1000);
        assert_eq!(result.heartbeats, 5);
        // converged runs leave nothing behind
        assert_eq!(result.aggregator_runs, 0);
        assert_eq!(result.worker_runs, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_many_workers_stop_once() {
        let config = ScenarioConfig::default().with_cluster(ClusterConfig::standard());
        let result = run_scenario(config).await.unwrap();

        assert!(result.converged());
        assert_eq!(result.final_trials(), 1000);
        assert!(result.worker_results.len() >= 5);
        assert_eq!(result.aggregator_runs, 0);
    }

    #[tokio::test]
    async fn test_missing_portfolio_reported() {
        let mut cluster = Cluster::start(ClusterConfig::minimal()).await.unwrap();
        cluster.submit("bare", None, 100).await.unwrap();

        let seen = cluster
            .observe_until(Duration::from_secs(5), |o| o.channel == ERRORS)
            .await
            .unwrap();
        let report = &seen.last().unwrap().message;
        assert!(report.logger.as_ref().unwrap().has_errors());
        assert!(cluster.workers()[0].running().is_empty());
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_stops_worker() {
        // never finishes on its own
        let worker = WorkerConfig::default().with_broadcast_freq(200);
        let mut cluster = Cluster::start(ClusterConfig::minimal().with_worker(worker))
            .await
            .unwrap();
        cluster
            .submit("long", Some(generate_portfolio(3, 2, 5)), 1_000_000_000)
            .await
            .unwrap();

        cluster
            .observe_until(Duration::from_secs(10), |o| o.is(DEFAULTS, Command::Results))
            .await
            .unwrap();
        cluster.cancel("long").await.unwrap();
        cluster
            .observe_until(Duration::from_secs(10), |o| o.is(DEFAULTS, Command::Stop))
            .await
            .unwrap();

        assert!(cluster.workers()[0].task(&RunId::new("long")).is_none());
        assert!(!cluster.aggregator().is_stopped(&RunId::new("long")));
        cluster.shutdown().await;
    }
}
