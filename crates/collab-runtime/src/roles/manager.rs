//! Simulation manager
//!
//! Entry point for clients. Validates start requests and forwards them to
//! the workers; forwards stop requests as they are. Keeps no state.

use std::sync::Arc;

use async_trait::async_trait;

use collab_core::{CollabError, CollabResult, Command, Logger};
use collab_wire::SimulationMessage;

use crate::{Inbound, NodeContext, Role};

#[derive(Clone, Copy, Debug, Default)]
pub struct SimulationManager;

impl SimulationManager {
    pub fn new() -> Self {
        SimulationManager
    }
}

#[async_trait]
impl Role for SimulationManager {
    fn kind(&self) -> &'static str {
        "simulation_manager"
    }

    async fn start(&self, ctx: &Arc<NodeContext>, msg: Inbound) -> CollabResult<()> {
        let run_id = msg.run_id().ok_or(CollabError::MissingRunId)?;
        let mut params = msg.params.relabel(Command::Start);
        params.run_id = Some(run_id.clone());

        let portfolio = match msg.envelope.portfolio() {
            Ok(portfolio) => portfolio,
            Err(e) => {
                tracing::warn!(node = %ctx.name(), run_id = %run_id, error = %e, "rejecting run");
                let mut logger = Logger::new();
                logger.error(&e);
                return ctx.broadcast_logs(logger, Some(&params)).await;
            }
        };

        tracing::info!(
            node = %ctx.name(),
            run_id = %run_id,
            portfolio = portfolio.name(),
            assets = portfolio.len(),
            number_runs = params.number_runs,
            "starting run"
        );
        let forward = SimulationMessage::new(params).with_portfolio(portfolio);
        ctx.output(&forward).await
    }

    async fn stop(&self, ctx: &Arc<NodeContext>, msg: Inbound) -> CollabResult<()> {
        let mut params = msg.params.clone();
        params.run_id = msg.run_id().or(params.run_id);
        ctx.broadcast_stop(&params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::testing::{drain, harness, inbound, params, portfolio, ERRORS, OUT};
    use collab_core::{Portfolio, RunParameters, SEVERITY_ERROR};
    use collab_wire::Envelope;

    #[tokio::test]
    async fn test_start_forwards_portfolio() {
        let (_bus, ctx, mut inbox) = harness("manager").await;
        let msg = SimulationMessage::new(params("run1", Command::Start).with_number_runs(500))
            .with_portfolio(portfolio());

        SimulationManager.start(&ctx, inbound(msg)).await.unwrap();

        let out = drain(&mut inbox);
        assert_eq!(out.len(), 1);
        let (channel, fwd) = &out[0];
        assert_eq!(channel, OUT);
        assert_eq!(fwd.params.command, Command::Start);
        assert_eq!(fwd.params.number_runs, 500);
        assert_eq!(fwd.portfolio.as_ref().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_start_takes_run_id_from_item() {
        let (_bus, ctx, mut inbox) = harness("manager").await;
        let msg = SimulationMessage::new(RunParameters::default().with_command(Command::Start))
            .with_portfolio(portfolio());
        let mut inb = inbound(msg);
        inb.item_id = Some("from-item".into());

        SimulationManager.start(&ctx, inb).await.unwrap();
        let out = drain(&mut inbox);
        assert_eq!(out[0].1.params.run_id.as_ref().unwrap().as_str(), "from-item");
    }

    #[tokio::test]
    async fn test_start_without_run_id_fails() {
        let (_bus, ctx, mut inbox) = harness("manager").await;
        let msg = SimulationMessage::new(RunParameters::default().with_command(Command::Start))
            .with_portfolio(portfolio());
        let err = SimulationManager.start(&ctx, inbound(msg)).await.unwrap_err();
        assert_eq!(err, CollabError::MissingRunId);
        assert!(drain(&mut inbox).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_portfolio_is_logged_not_forwarded() {
        let (bus, ctx, mut inbox) = harness("manager").await;

        // no portfolio at all
        let msg = SimulationMessage::new(params("run2", Command::Start));
        SimulationManager.start(&ctx, inbound(msg)).await.unwrap();

        let out = drain(&mut inbox);
        assert_eq!(out.len(), 1);
        let (channel, report) = &out[0];
        assert_eq!(channel, ERRORS);
        assert_eq!(report.params.command, Command::Info);
        assert!(report.logger.as_ref().unwrap().has_errors());
        assert_eq!(bus.published(OUT), 0);

        // a portfolio without a name
        let msg = SimulationMessage::new(params("run3", Command::Start))
            .with_portfolio(Portfolio::new("p"));
        let mut payload: serde_json::Value = serde_json::from_slice(&msg.encode()).unwrap();
        payload["simulation"]["portfolio"]
            .as_object_mut()
            .unwrap()
            .remove("name");
        let env = Envelope::decode(&serde_json::to_vec(&payload).unwrap())
            .unwrap()
            .unwrap();
        let inb = Inbound {
            item_id: Some("run3".into()),
            params: env.parameters().unwrap(),
            envelope: env,
        };
        SimulationManager.start(&ctx, inb).await.unwrap();
        let out = drain(&mut inbox);
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].1.logger.as_ref().unwrap().messages(SEVERITY_ERROR).len(),
            1
        );
    }

    #[tokio::test]
    async fn test_stop_relabels_and_forwards() {
        let (_bus, ctx, mut inbox) = harness("manager").await;
        let msg = SimulationMessage::new(params("run4", Command::Stop));
        SimulationManager.stop(&ctx, inbound(msg)).await.unwrap();

        let out = drain(&mut inbox);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, OUT);
        assert_eq!(out[0].1.params.command, Command::Stop);
        assert_eq!(out[0].1.params.run_id.as_ref().unwrap().as_str(), "run4");
    }

    #[tokio::test]
    async fn test_start_and_stop_agree_on_run_id() {
        let (_bus, ctx, mut inbox) = harness("manager").await;
        let start = SimulationMessage::new(params("in-params", Command::Start))
            .with_portfolio(portfolio());
        let mut inb = inbound(start);
        inb.item_id = Some("in-item".into());
        SimulationManager.start(&ctx, inb).await.unwrap();

        let mut inb = inbound(SimulationMessage::new(params("in-params", Command::Stop)));
        inb.item_id = Some("in-item".into());
        SimulationManager.stop(&ctx, inb).await.unwrap();

        let out = drain(&mut inbox);
        assert_eq!(out.len(), 2);
        assert!(out
            .iter()
            .all(|(_, m)| m.params.run_id.as_ref().unwrap().as_str() == "in-item"));
    }

    #[tokio::test]
    async fn test_other_commands_ignored() {
        let (bus, ctx, mut inbox) = harness("manager").await;
        for command in [Command::Info, Command::Results] {
            let msg = SimulationMessage::new(params("run5", command));
            crate::dispatch(&SimulationManager, &ctx, inbound(msg)).await.unwrap();
        }
        assert!(drain(&mut inbox).is_empty());
        assert_eq!(bus.published(OUT), 0);
    }
}
