//! Collab Node - Run loop
//!
//! Each bus notification becomes one scheduler job with one step per item,
//! so a slow or failing item never holds up its siblings or the loop
//! itself. Between notifications the loop runs the periodic load check.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use collab_core::CollabResult;
use collab_sched::{Scheduler, TaskHandle};
use collab_transport::{MessageBus, Notification, NotificationStream};
use collab_wire::Item;

use crate::{
    dispatch, Inbound, LoadBalancer, LoadCheckSettings, LoadEnvironment, NodeConfig, NodeContext,
    Role,
};

pub struct Node {
    ctx: Arc<NodeContext>,
    role: Arc<dyn Role>,
    balancer: LoadBalancer,
    inbox: NotificationStream,
    overloaded: bool,
    /// Inputs dropped by the last suspension
    suspended: BTreeSet<String>,
}

impl Node {
    /// Attach a node to the bus. Notifications queue up until it runs.
    pub fn new(
        config: &NodeConfig,
        bus: Arc<dyn MessageBus>,
        scheduler: Scheduler,
        role: Arc<dyn Role>,
    ) -> Self {
        let inbox = bus.attach(&config.name);
        let ctx = NodeContext::new(config.name.clone(), bus, scheduler, config.load_check.clone());
        Node {
            ctx: Arc::new(ctx),
            role,
            balancer: LoadBalancer::from_config(&config.load_policy),
            inbox,
            overloaded: false,
            suspended: BTreeSet::new(),
        }
    }

    pub fn with_load_balancer(mut self, balancer: LoadBalancer) -> Self {
        self.balancer = balancer;
        self
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn role(&self) -> &Arc<dyn Role> {
        &self.role
    }

    pub fn is_overloaded(&self) -> bool {
        self.overloaded
    }

    pub fn suspended(&self) -> &BTreeSet<String> {
        &self.suspended
    }

    /// Process a notification as one job, one step per item
    pub fn handle_notification(&self, notification: Notification) -> TaskHandle {
        tracing::debug!(
            node = %self.ctx.name(),
            channel = %notification.channel,
            items = notification.items.len(),
            "notification"
        );
        let ctx = Arc::clone(&self.ctx);
        let role = Arc::clone(&self.role);
        let steps = notification
            .items
            .into_iter()
            .map(move |item| process_item(Arc::clone(&ctx), Arc::clone(&role), item));
        self.ctx.scheduler().cooperate(steps)
    }

    /// Ask the balancer about load and suspend or reload inputs on a change
    pub async fn check_load(&mut self) -> CollabResult<()> {
        self.ctx.record(|s| s.load_checks += 1);
        let env = self.balancer.sample(LoadEnvironment {
            load: self.ctx.scheduler().load(),
            active_runs: self.role.active_runs(),
            overloaded: self.overloaded,
            cpu_usage: None,
        });
        let overloaded = self.balancer.overloaded(&env);

        if overloaded && !self.overloaded {
            let suspended = self.balancer.suspend_all(&self.ctx).await?;
            tracing::warn!(
                node = %self.ctx.name(),
                policy = self.balancer.policy_name(),
                channels = ?suspended,
                "overloaded, inputs suspended"
            );
            self.suspended = suspended;
            self.overloaded = true;
            self.ctx.record(|s| s.suspensions += 1);
        } else if !overloaded && self.overloaded {
            let channels = std::mem::take(&mut self.suspended);
            self.overloaded = false;
            let reloaded = self.balancer.reload_all(&self.ctx, &channels).await;
            let lost: Vec<&String> = channels.difference(&reloaded).collect();
            if lost.is_empty() {
                tracing::info!(node = %self.ctx.name(), channels = ?reloaded, "inputs reloaded");
            } else {
                tracing::warn!(node = %self.ctx.name(), ?lost, "some inputs could not be reloaded");
            }
            self.ctx.record(|s| s.reloads += 1);
        }
        Ok(())
    }

    /// Run until `shutdown` turns true or its sender goes away
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut settings = self.ctx.watch_load_check();
        let mut ticker = load_ticker(&settings.borrow_and_update());
        let mut settings_open = true;

        tracing::info!(node = %self.ctx.name(), role = self.role.kind(), "node running");
        loop {
            tokio::select! {
                received = self.inbox.recv() => match received {
                    Some(notification) => {
                        self.handle_notification(notification);
                    }
                    None => {
                        tracing::warn!(node = %self.ctx.name(), "inbox closed");
                        break;
                    }
                },
                _ = next_tick(&mut ticker) => {
                    if let Err(e) = self.check_load().await {
                        self.ctx.errback(&e, None, None).await;
                    }
                }
                changed = settings.changed(), if settings_open => {
                    if changed.is_ok() {
                        let current = settings.borrow_and_update().clone();
                        tracing::info!(
                            node = %self.ctx.name(),
                            enabled = current.enabled,
                            interval = %humantime::format_duration(current.interval),
                            "load check reconfigured"
                        );
                        ticker = load_ticker(&current);
                    } else {
                        settings_open = false;
                    }
                }
                stop = shutdown.changed() => {
                    if stop.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(node = %self.ctx.name(), stats = ?self.ctx.stats(), "node stopped");
    }

    /// Run on the current runtime
    pub fn spawn(self) -> NodeHandle {
        let (tx, rx) = watch::channel(false);
        let ctx = Arc::clone(&self.ctx);
        let join = tokio::spawn(self.run(rx));
        NodeHandle {
            ctx,
            shutdown: tx,
            join,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", self.ctx.name())
            .field("role", &self.role.kind())
            .field("balancer", &self.balancer)
            .field("overloaded", &self.overloaded)
            .finish()
    }
}

/// A spawned node
pub struct NodeHandle {
    ctx: Arc<NodeContext>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl NodeHandle {
    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Stop the run loop and wait for it
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.join.await {
            tracing::error!(node = %self.ctx.name(), error = %e, "node loop panicked");
        }
    }
}

fn load_ticker(settings: &LoadCheckSettings) -> Option<Interval> {
    if !settings.enabled {
        return None;
    }
    let period = settings.interval.max(Duration::from_millis(1));
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Decode one item and hand it to the role. Failures are reported, never
/// returned, so one item cannot fail the notification's job.
async fn process_item(
    ctx: Arc<NodeContext>,
    role: Arc<dyn Role>,
    item: Item,
) -> CollabResult<()> {
    ctx.record(|s| s.items_received += 1);

    let envelope = match item.envelope() {
        Ok(Some(envelope)) if envelope.has_parameters() => envelope,
        Ok(_) => {
            ctx.record(|s| s.items_skipped += 1);
            return Ok(());
        }
        Err(e) => {
            ctx.record(|s| s.items_failed += 1);
            ctx.errback(&e, None, None).await;
            return Ok(());
        }
    };

    let params = match envelope.parameters() {
        Ok(params) => params,
        Err(e) => {
            ctx.record(|s| s.items_failed += 1);
            ctx.errback(&e, None, None).await;
            return Ok(());
        }
    };

    let msg = Inbound {
        item_id: item.id,
        params: params.clone(),
        envelope,
    };
    if let Err(e) = dispatch(role.as_ref(), &ctx, msg).await {
        ctx.record(|s| s.items_failed += 1);
        ctx.errback(&e, None, Some(&params)).await;
    }
    Ok(())
}
