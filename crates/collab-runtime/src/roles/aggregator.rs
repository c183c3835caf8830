//! Aggregation manager
//!
//! Merges worker results per run. Once a run has accounted for its target
//! number of trials the cumulative distributions go out once, followed by a
//! stop for the workers, and the run's state is dropped. Every merged result
//! is answered with a progress heartbeat.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use collab_core::{CollabError, CollabResult, Command, Logger, Progress, RunId};
use collab_state::{Absorbed, ConvergenceTracker};
use collab_wire::SimulationMessage;

use crate::{AggregatorConfig, Inbound, NodeContext, Role};

#[derive(Debug)]
pub struct AggregationManager {
    tracker: Mutex<ConvergenceTracker>,
}

impl AggregationManager {
    pub fn new(config: &AggregatorConfig) -> Self {
        AggregationManager {
            tracker: Mutex::new(ConvergenceTracker::with_capacity(config.retired_capacity)),
        }
    }

    pub fn runs_completed(&self, run_id: &RunId) -> u64 {
        self.tracker.lock().runs_completed(run_id)
    }

    pub fn is_stopped(&self, run_id: &RunId) -> bool {
        self.tracker.lock().is_stopped(run_id)
    }

    pub fn is_retired(&self, run_id: &RunId) -> bool {
        self.tracker.lock().is_retired(run_id)
    }

    /// Emit the final results and the stop for a converged run, then retire
    /// it. Workers that already finished never echo the stop back.
    async fn finish(
        &self,
        ctx: &Arc<NodeContext>,
        msg: &Inbound,
        run_id: &RunId,
        final_msg: SimulationMessage,
    ) -> CollabResult<()> {
        let emitted = match ctx.output(&final_msg).await {
            Ok(()) => ctx.broadcast_stop(&msg.params).await,
            Err(e) => Err(e),
        };
        match emitted {
            Ok(()) => {
                self.tracker.lock().retire(run_id);
                tracing::debug!(node = %ctx.name(), run_id = %run_id, "run state discarded");
            }
            Err(e) => {
                // let the next result for this run try again
                self.tracker.lock().reopen(run_id);
                ctx.errback(&e, None, Some(&msg.params)).await;
            }
        }
        Ok(())
    }
}

impl Default for AggregationManager {
    fn default() -> Self {
        Self::new(&AggregatorConfig::default())
    }
}

#[async_trait]
impl Role for AggregationManager {
    fn kind(&self) -> &'static str {
        "aggregation_manager"
    }

    async fn results(&self, ctx: &Arc<NodeContext>, msg: Inbound) -> CollabResult<()> {
        let run_id = msg.run_id().ok_or(CollabError::MissingRunId)?;
        let mut params = msg.params.clone();
        params.run_id = Some(run_id.clone());

        let distributions = msg.envelope.distributions()?;
        let progress = msg.envelope.progress();
        let (distributions, progress) = match (distributions, progress) {
            (Some(d), Some(p)) => (d, p),
            (d, p) => {
                let mut logger = Logger::new();
                if d.is_none() {
                    logger.error("Results without distributions");
                }
                if p.is_none() {
                    logger.error("Results without progress");
                }
                return ctx.broadcast_logs(logger, Some(&params)).await;
            }
        };

        let absorbed = self
            .tracker
            .lock()
            .absorb(&run_id, &distributions, progress, params.number_runs);

        match absorbed {
            Absorbed::Retired => return Ok(()),
            Absorbed::Converged {
                runs,
                distributions: cumulative,
            } => {
                tracing::info!(node = %ctx.name(), run_id = %run_id, runs, "run converged");
                let final_msg = SimulationMessage::new(params.relabel(Command::Results))
                    .with_distributions(cumulative)
                    .with_progress(Progress::new(runs));
                let inbound = Inbound {
                    params: params.clone(),
                    ..msg
                };
                self.finish(ctx, &inbound, &run_id, final_msg).await?;
            }
            Absorbed::Pending { .. } | Absorbed::AlreadyStopped { .. } => {}
        }

        let heartbeat =
            SimulationMessage::new(params.relabel(Command::Info)).with_progress(progress);
        ctx.output(&heartbeat).await
    }

    async fn stop(&self, ctx: &Arc<NodeContext>, msg: Inbound) -> CollabResult<()> {
        let Some(run_id) = msg.run_id() else {
            return Ok(());
        };
        if self.tracker.lock().retire(&run_id) {
            tracing::info!(node = %ctx.name(), run_id = %run_id, "run state discarded");
        }
        Ok(())
    }

    async fn start(&self, ctx: &Arc<NodeContext>, msg: Inbound) -> CollabResult<()> {
        if let Some(run_id) = msg.run_id() {
            if self.tracker.lock().revive(&run_id) {
                tracing::debug!(node = %ctx.name(), run_id = %run_id, "run id reused");
            }
        }
        Ok(())
    }

    fn active_runs(&self) -> usize {
        self.tracker.lock().active_runs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::testing::{drain, harness, inbound, params, ERRORS, OUT};
    use collab_core::{Distributions, DEFAULTS_HISTOGRAM};
    use collab_transport::BusOp;

    fn result(run_id: &str, target: u64, runs: u64) -> Inbound {
        let mut d = Distributions::new();
        d.add(DEFAULTS_HISTOGRAM, 0, runs / 2);
        d.add(DEFAULTS_HISTOGRAM, 1, runs - runs / 2);
        inbound(
            SimulationMessage::new(params(run_id, Command::Results).with_number_runs(target))
                .with_distributions(d)
                .with_progress(Progress::new(runs)),
        )
    }

    fn commands(out: &[(String, SimulationMessage)]) -> Vec<Command> {
        out.iter().map(|(_, m)| m.params.command).collect()
    }

    #[tokio::test]
    async fn test_heartbeat_then_single_final_emission() {
        let (_bus, ctx, mut inbox) = harness("aggregator").await;
        let agg = AggregationManager::default();

        for _ in 0..4 {
            agg.results(&ctx, result("r1", 1000, 200)).await.unwrap();
        }
        let out = drain(&mut inbox);
        assert_eq!(commands(&out), [Command::Info; 4]);
        assert!(out.iter().all(|(_, m)| m.progress == Some(Progress::new(200))));

        agg.results(&ctx, result("r1", 1000, 200)).await.unwrap();
        let out = drain(&mut inbox);
        assert_eq!(commands(&out), [Command::Results, Command::Stop, Command::Info]);
        let final_results = out[0].1.distributions.as_ref().unwrap();
        assert_eq!(final_results.total(DEFAULTS_HISTOGRAM), 1000);
        assert_eq!(out[0].1.progress, Some(Progress::new(1000)));

        // converged runs are retired without waiting for a stop
        let r1 = RunId::new("r1");
        assert_eq!(agg.active_runs(), 0);
        assert!(agg.is_retired(&r1));

        // late results: no second emission, no heartbeat
        agg.results(&ctx, result("r1", 1000, 200)).await.unwrap();
        assert!(drain(&mut inbox).is_empty());
        assert_eq!(agg.runs_completed(&r1), 0);
    }

    #[tokio::test]
    async fn test_failed_final_emission_is_retried() {
        let (bus, ctx, mut inbox) = harness("aggregator").await;
        let agg = AggregationManager::default();

        bus.fail_once(BusOp::Publish, OUT);
        agg.results(&ctx, result("r2", 100, 100)).await.unwrap();
        let out = drain(&mut inbox);
        // the failure report, then the heartbeat
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, ERRORS);
        assert_eq!(out[1].1.params.command, Command::Info);
        assert!(!agg.is_stopped(&RunId::new("r2")));
        assert_eq!(agg.active_runs(), 1);

        agg.results(&ctx, result("r2", 100, 100)).await.unwrap();
        let out = drain(&mut inbox);
        assert_eq!(commands(&out), [Command::Results, Command::Stop, Command::Info]);
        assert_eq!(
            out[0].1.distributions.as_ref().unwrap().total(DEFAULTS_HISTOGRAM),
            200
        );
        assert_eq!(agg.active_runs(), 0);
    }

    #[tokio::test]
    async fn test_stop_discards_and_late_results_ignored() {
        let (bus, ctx, mut inbox) = harness("aggregator").await;
        let agg = AggregationManager::default();
        let r3 = RunId::new("r3");

        agg.results(&ctx, result("r3", 1000, 200)).await.unwrap();
        assert_eq!(agg.active_runs(), 1);
        drain(&mut inbox);

        let stop = inbound(SimulationMessage::new(params("r3", Command::Stop)));
        agg.stop(&ctx, stop.clone()).await.unwrap();
        agg.stop(&ctx, stop).await.unwrap();
        assert_eq!(agg.active_runs(), 0);
        assert!(agg.is_retired(&r3));

        let published = bus.published(OUT);
        agg.results(&ctx, result("r3", 1000, 200)).await.unwrap();
        assert_eq!(bus.published(OUT), published);
        assert_eq!(agg.runs_completed(&r3), 0);

        // a new start for the same id aggregates again
        let start = inbound(SimulationMessage::new(params("r3", Command::Start)));
        agg.start(&ctx, start).await.unwrap();
        agg.results(&ctx, result("r3", 1000, 200)).await.unwrap();
        assert_eq!(agg.runs_completed(&r3), 200);
    }

    #[tokio::test]
    async fn test_stop_for_unknown_run_is_noop() {
        let (bus, ctx, mut inbox) = harness("aggregator").await;
        let agg = AggregationManager::default();
        let stop = inbound(SimulationMessage::new(params("ghost", Command::Stop)));
        agg.stop(&ctx, stop).await.unwrap();
        assert!(drain(&mut inbox).is_empty());
        assert_eq!(bus.published(OUT), 0);
        assert_eq!(agg.active_runs(), 0);
    }

    #[tokio::test]
    async fn test_results_missing_parts_are_reported() {
        let (_bus, ctx, mut inbox) = harness("aggregator").await;
        let agg = AggregationManager::default();
        let bare = inbound(SimulationMessage::new(
            params("r4", Command::Results).with_number_runs(10),
        ));
        agg.results(&ctx, bare).await.unwrap();

        let out = drain(&mut inbox);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, ERRORS);
        assert_eq!(
            out[0].1.logger.as_ref().unwrap().messages(collab_core::SEVERITY_ERROR).len(),
            2
        );
        assert_eq!(agg.active_runs(), 0);
    }

    #[tokio::test]
    async fn test_counter_grows_once_per_message() {
        let (_bus, ctx, _inbox) = harness("aggregator").await;
        let agg = AggregationManager::default();
        let mut d = Distributions::new();
        d.add(DEFAULTS_HISTOGRAM, 0, 50);
        d.add("losses", 3, 50);
        let msg = SimulationMessage::new(params("r5", Command::Results).with_number_runs(1000))
            .with_distributions(d)
            .with_progress(Progress::new(50));
        agg.results(&ctx, inbound(msg)).await.unwrap();
        assert_eq!(agg.runs_completed(&RunId::new("r5")), 50);
    }
}
