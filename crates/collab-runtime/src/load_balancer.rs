//! Load balancing
//!
//! A node asks its balancer every few seconds whether it is overloaded.
//! When it becomes overloaded it unsubscribes from all its inputs; when the
//! pressure is gone it subscribes to them again. Channels that fail either
//! way are simply left out of the returned set.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use sysinfo::System;

use collab_core::CollabResult;
use collab_sched::{SchedulerLoad, TaskHandle, TaskState};

use crate::{LoadPolicyConfig, NodeContext};

/// What a policy gets to look at
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LoadEnvironment {
    pub load: SchedulerLoad,
    /// Runs the node's role currently holds state for
    pub active_runs: usize,
    /// Whether the node is suspended right now
    pub overloaded: bool,
    /// Global CPU usage in percent, if sampled
    pub cpu_usage: Option<f32>,
}

/// Pure overload decision
pub trait LoadPolicy: Send + Sync {
    fn overloaded(&self, env: &LoadEnvironment) -> bool;

    /// Whether `env.cpu_usage` must be sampled before asking
    fn wants_cpu(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str;
}

/// Never trips. For nodes that must stay connected.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverOverloaded;

impl LoadPolicy for NeverOverloaded {
    fn overloaded(&self, _env: &LoadEnvironment) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "never_overloaded"
    }
}

/// Scheduler backlog watermarks
#[derive(Clone, Copy, Debug)]
pub struct QueueDepth {
    pub high: usize,
    pub low: usize,
}

impl LoadPolicy for QueueDepth {
    fn overloaded(&self, env: &LoadEnvironment) -> bool {
        let depth = env.load.registered;
        if env.overloaded {
            depth > self.low
        } else {
            depth >= self.high
        }
    }

    fn name(&self) -> &'static str {
        "queue_depth"
    }
}

/// Global CPU usage threshold
#[derive(Clone, Copy, Debug)]
pub struct CpuUsage {
    pub threshold: f32,
}

impl LoadPolicy for CpuUsage {
    fn overloaded(&self, env: &LoadEnvironment) -> bool {
        env.cpu_usage.is_some_and(|usage| usage > self.threshold)
    }

    fn wants_cpu(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "cpu_usage"
    }
}

pub struct LoadBalancer {
    policy: Box<dyn LoadPolicy>,
    system: Mutex<Option<System>>,
}

impl LoadBalancer {
    pub fn new(policy: impl LoadPolicy + 'static) -> Self {
        LoadBalancer {
            policy: Box::new(policy),
            system: Mutex::new(None),
        }
    }

    pub fn from_config(config: &LoadPolicyConfig) -> Self {
        match *config {
            LoadPolicyConfig::NeverOverloaded => Self::new(NeverOverloaded),
            LoadPolicyConfig::QueueDepth { high, low } => Self::new(QueueDepth { high, low }),
            LoadPolicyConfig::CpuUsage { threshold } => Self::new(CpuUsage { threshold }),
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Fill in `cpu_usage` when the policy needs it
    pub fn sample(&self, mut env: LoadEnvironment) -> LoadEnvironment {
        if self.policy.wants_cpu() {
            let mut guard = self.system.lock();
            let system = guard.get_or_insert_with(System::new);
            system.refresh_cpu_usage();
            env.cpu_usage = Some(system.global_cpu_info().cpu_usage());
        }
        env
    }

    pub fn overloaded(&self, env: &LoadEnvironment) -> bool {
        self.policy.overloaded(env)
    }

    /// Unsubscribe from every current input concurrently. Returns the
    /// channels that were actually dropped.
    pub async fn suspend_all(&self, ctx: &Arc<NodeContext>) -> CollabResult<BTreeSet<String>> {
        let inputs = ctx.inputs().await?;
        Ok(fan_out(ctx, inputs, Direction::Remove).await)
    }

    /// Subscribe again to `channels` concurrently. Returns the channels that
    /// were actually restored.
    pub async fn reload_all(
        &self,
        ctx: &Arc<NodeContext>,
        channels: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        fan_out(ctx, channels.clone(), Direction::Add).await
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(NeverOverloaded)
    }
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("policy", &self.policy.name())
            .finish()
    }
}

#[derive(Clone, Copy, Debug)]
enum Direction {
    Add,
    Remove,
}

/// One scheduler job per channel, all awaited together
async fn fan_out(
    ctx: &Arc<NodeContext>,
    channels: BTreeSet<String>,
    direction: Direction,
) -> BTreeSet<String> {
    let tasks: Vec<(String, TaskHandle)> = channels
        .into_iter()
        .map(|channel| {
            let job_ctx = Arc::clone(ctx);
            let name = channel.clone();
            let step = async move {
                let result = match direction {
                    Direction::Add => job_ctx.add_input(&name).await,
                    Direction::Remove => job_ctx.remove_input(&name).await,
                };
                if let Err(e) = &result {
                    tracing::warn!(
                        node = %job_ctx.name(),
                        channel = %name,
                        ?direction,
                        error = %e,
                        "input change failed"
                    );
                }
                result
            };
            (channel, ctx.scheduler().cooperate(std::iter::once(step)))
        })
        .collect();

    let outcomes = join_all(tasks.iter().map(|(_, handle)| handle.finished())).await;
    tasks
        .into_iter()
        .zip(outcomes)
        .filter_map(|((channel, _), state)| (state == TaskState::Finished).then_some(channel))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_core::NodeName;
    use collab_sched::Scheduler;
    use collab_transport::{BusOp, LocalBus, MessageBus};
    use proptest::prelude::*;

    use crate::LoadCheckSettings;

    async fn subscribed_node(channels: &[&str]) -> (LocalBus, Arc<NodeContext>) {
        let bus = LocalBus::new();
        let name = NodeName::new("worker");
        for channel in channels {
            bus.create_channel(channel);
            bus.subscribe(channel, &name).await.unwrap();
        }
        let ctx = NodeContext::new(
            name,
            Arc::new(bus.clone()),
            Scheduler::start(),
            LoadCheckSettings::default(),
        );
        (bus, Arc::new(ctx))
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_suspend_all() {
        let (bus, ctx) = subscribed_node(&["1", "2", "3", "4"]).await;
        let lb = LoadBalancer::default();
        let suspended = lb.suspend_all(&ctx).await.unwrap();
        assert_eq!(suspended, set(&["1", "2", "3", "4"]));
        assert!(bus.subscriptions(ctx.name()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_suspend_all_partial_failure() {
        let (bus, ctx) = subscribed_node(&["1", "2", "3", "4"]).await;
        bus.fail_once(BusOp::Unsubscribe, "3");
        let lb = LoadBalancer::default();

        let suspended = lb.suspend_all(&ctx).await.unwrap();
        assert_eq!(suspended, set(&["1", "2", "4"]));
        assert_eq!(bus.subscriptions(ctx.name()).await.unwrap(), set(&["3"]));

        let reloaded = lb.reload_all(&ctx, &suspended).await;
        assert_eq!(reloaded.len(), 3);
        assert_eq!(bus.subscriptions(ctx.name()).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_reload_all_partial_failure() {
        let (bus, ctx) = subscribed_node(&[]).await;
        for channel in ["1", "2", "3", "4"] {
            bus.create_channel(channel);
        }
        bus.fail_once(BusOp::Subscribe, "2");
        let lb = LoadBalancer::default();
        let reloaded = lb.reload_all(&ctx, &set(&["1", "2", "3", "4"])).await;
        assert_eq!(reloaded, set(&["1", "3", "4"]));
    }

    #[test]
    fn test_never_overloaded() {
        let env = LoadEnvironment {
            load: SchedulerLoad {
                registered: 10_000,
                ready: 10_000,
                in_flight: 100,
            },
            ..Default::default()
        };
        assert!(!LoadBalancer::default().overloaded(&env));
    }

    #[test]
    fn test_queue_depth_hysteresis() {
        let policy = QueueDepth { high: 10, low: 3 };
        let env = |registered, overloaded| LoadEnvironment {
            load: SchedulerLoad {
                registered,
                ..Default::default()
            },
            overloaded,
            ..Default::default()
        };
        assert!(!policy.overloaded(&env(9, false)));
        assert!(policy.overloaded(&env(10, false)));
        // stays tripped until the backlog drains to the low mark
        assert!(policy.overloaded(&env(5, true)));
        assert!(!policy.overloaded(&env(3, true)));
    }

    #[test]
    fn test_cpu_policy() {
        let lb = LoadBalancer::from_config(&LoadPolicyConfig::CpuUsage { threshold: 90.0 });
        assert_eq!(lb.policy_name(), "cpu_usage");
        let sampled = lb.sample(LoadEnvironment::default());
        assert!(sampled.cpu_usage.is_some());

        let hot = LoadEnvironment {
            cpu_usage: Some(95.0),
            ..Default::default()
        };
        assert!(lb.overloaded(&hot));
        assert!(!lb.overloaded(&LoadEnvironment::default()));
    }

    proptest! {
        #[test]
        fn prop_queue_depth_band(low in 0usize..50, gap in 1usize..50, depth in 0usize..200) {
            let policy = QueueDepth { high: low + gap, low };
            let env = |overloaded| LoadEnvironment {
                load: SchedulerLoad {
                    registered: depth,
                    ..Default::default()
                },
                overloaded,
                ..Default::default()
            };
            // inside the band the previous state holds
            if depth > low && depth < low + gap {
                prop_assert!(!policy.overloaded(&env(false)));
                prop_assert!(policy.overloaded(&env(true)));
            } else {
                prop_assert_eq!(policy.overloaded(&env(false)), policy.overloaded(&env(true)));
            }
        }
    }
}
