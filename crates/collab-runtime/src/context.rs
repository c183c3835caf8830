//! Node ports
//!
//! `NodeContext` is what role handlers see of their node: its bus identity,
//! its scheduler, the channels it reads and writes, and the helpers every
//! role uses to report progress, stops and failures.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;

use collab_core::{
    CollabError, CollabResult, Command, Logger, NodeName, RunParameters, LOG_CHANNEL,
};
use collab_sched::{Scheduler, TaskState};
use collab_transport::{partition_channels, MessageBus};
use collab_wire::{Item, SimulationMessage};

use crate::{LoadCheckSettings, LOG_TARGET};

/// Per node counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub items_received: u64,
    /// Items without a simulation envelope or without parameters
    pub items_skipped: u64,
    /// Items whose decoding or handling failed
    pub items_failed: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub load_checks: u64,
    pub suspensions: u64,
    pub reloads: u64,
}

pub struct NodeContext {
    name: NodeName,
    bus: Arc<dyn MessageBus>,
    scheduler: Scheduler,
    stats: Mutex<NodeStats>,
    load_check: watch::Sender<LoadCheckSettings>,
}

impl NodeContext {
    pub fn new(
        name: NodeName,
        bus: Arc<dyn MessageBus>,
        scheduler: Scheduler,
        load_check: LoadCheckSettings,
    ) -> Self {
        let (load_check, _) = watch::channel(load_check);
        NodeContext {
            name,
            bus,
            scheduler,
            stats: Mutex::new(NodeStats::default()),
            load_check,
        }
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn stats(&self) -> NodeStats {
        self.stats.lock().clone()
    }

    pub(crate) fn record(&self, f: impl FnOnce(&mut NodeStats)) {
        f(&mut self.stats.lock());
    }

    pub fn load_check(&self) -> LoadCheckSettings {
        self.load_check.borrow().clone()
    }

    /// Replace the load check settings. A running node picks them up at once.
    pub fn set_load_check(&self, settings: LoadCheckSettings) {
        self.load_check.send_replace(settings);
    }

    pub(crate) fn watch_load_check(&self) -> watch::Receiver<LoadCheckSettings> {
        self.load_check.subscribe()
    }

    // Inputs

    /// Channels this node is subscribed to
    pub async fn inputs(&self) -> CollabResult<BTreeSet<String>> {
        self.bus.subscriptions(&self.name).await
    }

    /// Subscribe to `channel` unless already subscribed
    pub async fn add_input(&self, channel: &str) -> CollabResult<()> {
        if self.inputs().await?.contains(channel) {
            return Ok(());
        }
        self.bus.subscribe(channel, &self.name).await
    }

    /// Unsubscribe from `channel` if subscribed
    pub async fn remove_input(&self, channel: &str) -> CollabResult<()> {
        if !self.inputs().await?.contains(channel) {
            return Ok(());
        }
        self.bus.unsubscribe(channel, &self.name).await
    }

    // Outputs

    /// Publishable non-error channels, plus `log`
    pub async fn output_channels(&self) -> CollabResult<BTreeSet<String>> {
        let affiliations = self.bus.affiliations(&self.name).await?;
        Ok(partition_channels(&affiliations).0)
    }

    /// Publishable error channels, plus `log`
    pub async fn error_channels(&self) -> CollabResult<BTreeSet<String>> {
        let affiliations = self.bus.affiliations(&self.name).await?;
        Ok(partition_channels(&affiliations).1)
    }

    /// Publish on every output channel
    pub async fn output(self: &Arc<Self>, msg: &SimulationMessage) -> CollabResult<()> {
        let channels = self.output_channels().await?;
        self.publish_to(channels, msg).await
    }

    /// Publish on every error channel
    pub async fn error_output(self: &Arc<Self>, msg: &SimulationMessage) -> CollabResult<()> {
        let channels = self.error_channels().await?;
        self.publish_to(channels, msg).await
    }

    /// Publish one message on several channels as one scheduler job, one
    /// step per channel. Every channel is attempted; the publish fails if
    /// any of them failed.
    pub async fn publish_to(
        self: &Arc<Self>,
        channels: BTreeSet<String>,
        msg: &SimulationMessage,
    ) -> CollabResult<()> {
        let item_id = msg.params.run_id.as_ref().map(|r| r.as_str().to_string());
        let item = msg.to_item(item_id);
        let failures: Arc<Mutex<Vec<CollabError>>> = Arc::new(Mutex::new(Vec::new()));

        let ctx = Arc::clone(self);
        let sink = Arc::clone(&failures);
        let steps = channels.into_iter().map(move |channel| {
            let ctx = Arc::clone(&ctx);
            let sink = Arc::clone(&sink);
            let item = item.clone();
            async move {
                if let Err(e) = ctx.publish_one(&channel, item).await {
                    tracing::warn!(
                        node = %ctx.name,
                        channel = %channel,
                        error = %e,
                        "publish failed"
                    );
                    ctx.record(|s| s.publish_failures += 1);
                    sink.lock().push(e);
                }
                Ok::<(), CollabError>(())
            }
        });

        match self.scheduler.coiterate(steps).await {
            TaskState::Finished => {}
            TaskState::Done => return Err(CollabError::SchedulerShutdown),
            other => return Err(CollabError::TaskFailed(other.to_string())),
        }

        let first = failures.lock().drain(..).next();
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn publish_one(&self, channel: &str, item: Item) -> CollabResult<()> {
        if channel == LOG_CHANNEL {
            let body = item
                .payload
                .as_ref()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_default();
            tracing::info!(target: LOG_TARGET, node = %self.name, "{}", body);
            return Ok(());
        }
        self.bus.publish(channel, &self.name, item).await?;
        self.record(|s| s.published += 1);
        Ok(())
    }

    // Broadcast helpers

    /// Publish `logger` as an `info` message on the error channels
    pub async fn broadcast_logs(
        self: &Arc<Self>,
        logger: Logger,
        params: Option<&RunParameters>,
    ) -> CollabResult<()> {
        let params = params.cloned().unwrap_or_default().relabel(Command::Info);
        let msg = SimulationMessage::new(params).with_logger(logger);
        self.error_output(&msg).await
    }

    /// Report `err` on the error channels. Never fails; a broadcast that
    /// cannot be delivered is only logged here.
    pub async fn errback(
        self: &Arc<Self>,
        err: &CollabError,
        logger: Option<Logger>,
        params: Option<&RunParameters>,
    ) {
        let run_id = params.and_then(|p| p.run_id.as_ref());
        tracing::warn!(node = %self.name, run_id = ?run_id, error = %err, "reporting failure");

        let mut logger = logger.unwrap_or_default();
        logger.error(err);
        if let Err(e) = self.broadcast_logs(logger, params).await {
            tracing::error!(node = %self.name, error = %e, "could not broadcast failure");
        }
    }

    /// Tell downstream nodes that a run stopped
    pub async fn broadcast_stop(self: &Arc<Self>, params: &RunParameters) -> CollabResult<()> {
        let elapsed = params.elapsed_since(Utc::now());
        let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let elapsed = Duration::from_millis(millis);
        tracing::info!(
            node = %self.name,
            run_id = ?params.run_id,
            elapsed = %humantime::format_duration(elapsed),
            "stopping run"
        );
        let msg = SimulationMessage::new(params.relabel(Command::Stop));
        self.output(&msg).await
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}
