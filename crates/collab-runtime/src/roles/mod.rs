//! Role handlers
//!
//! The node decodes each inbound item and hands it to its role by command.
//! Commands a role does not override are ignored.

pub mod manager;
pub mod worker;
pub mod aggregator;

pub use manager::*;
pub use worker::*;
pub use aggregator::*;

use std::sync::Arc;

use async_trait::async_trait;

use collab_core::{CollabResult, Command, RunId, RunParameters};
use collab_wire::Envelope;

use crate::NodeContext;

/// One decoded inbound message
#[derive(Clone, Debug)]
pub struct Inbound {
    /// Bus item id
    pub item_id: Option<String>,
    pub params: RunParameters,
    pub envelope: Envelope,
}

impl Inbound {
    /// Run id from the item id, falling back to the parameters
    pub fn run_id(&self) -> Option<RunId> {
        self.item_id
            .as_deref()
            .map(RunId::from)
            .or_else(|| self.params.run_id.clone())
    }
}

#[async_trait]
pub trait Role: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    async fn start(&self, _ctx: &Arc<NodeContext>, _msg: Inbound) -> CollabResult<()> {
        Ok(())
    }

    async fn stop(&self, _ctx: &Arc<NodeContext>, _msg: Inbound) -> CollabResult<()> {
        Ok(())
    }

    async fn results(&self, _ctx: &Arc<NodeContext>, _msg: Inbound) -> CollabResult<()> {
        Ok(())
    }

    async fn info(&self, _ctx: &Arc<NodeContext>, _msg: Inbound) -> CollabResult<()> {
        Ok(())
    }

    /// Runs this role currently holds state for
    fn active_runs(&self) -> usize {
        0
    }
}

/// Route `msg` to the handler for its command
pub async fn dispatch(role: &dyn Role, ctx: &Arc<NodeContext>, msg: Inbound) -> CollabResult<()> {
    match msg.params.command {
        Command::Start => role.start(ctx, msg).await,
        Command::Stop => role.stop(ctx, msg).await,
        Command::Results => role.results(ctx, msg).await,
        Command::Info => role.info(ctx, msg).await,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for role tests

    use std::sync::Arc;

    use collab_core::{Asset, Command, Factor, Issuer, NodeName, Portfolio, RunParameters};
    use collab_sched::Scheduler;
    use collab_transport::{Affiliation, LocalBus, MessageBus, NotificationStream};
    use collab_wire::SimulationMessage;

    use super::Inbound;
    use crate::{LoadCheckSettings, NodeContext};

    pub const OUT: &str = "out";
    pub const ERRORS: &str = "errors";

    /// A node publishing on `out` and `errors`, plus a probe subscribed to both
    pub async fn harness(name: &str) -> (LocalBus, Arc<NodeContext>, NotificationStream) {
        let bus = LocalBus::new();
        let node = NodeName::new(name);
        bus.affiliate(OUT, &node, Affiliation::Publisher);
        bus.affiliate(ERRORS, &node, Affiliation::Publisher);

        let probe = NodeName::new("probe");
        let inbox = bus.attach(&probe);
        bus.subscribe(OUT, &probe).await.unwrap();
        bus.subscribe(ERRORS, &probe).await.unwrap();

        let ctx = NodeContext::new(
            node,
            Arc::new(bus.clone()),
            Scheduler::start(),
            LoadCheckSettings::default(),
        );
        (bus, Arc::new(ctx), inbox)
    }

    pub fn portfolio() -> Portfolio {
        let mut p = Portfolio::new("book");
        for i in 0..3 {
            let issuer = Arc::new(Issuer::new(
                format!("issuer{}", i),
                vec![Factor::new("f1", 0.2), Factor::new("f2", 0.1)],
            ));
            p.insert_asset(
                Asset::new(format!("asset{}", i))
                    .with_dp(0.1)
                    .with_issuer(issuer),
            );
        }
        p
    }

    pub fn inbound(msg: SimulationMessage) -> Inbound {
        Inbound {
            item_id: msg.params.run_id.as_ref().map(|r| r.as_str().to_string()),
            params: msg.params.clone(),
            envelope: msg.to_envelope(),
        }
    }

    pub fn params(run_id: &str, command: Command) -> RunParameters {
        RunParameters::new(run_id).with_command(command)
    }

    /// Drain everything delivered so far as (channel, message) pairs
    pub fn drain(inbox: &mut NotificationStream) -> Vec<(String, SimulationMessage)> {
        let mut out = Vec::new();
        while let Ok(n) = inbox.try_recv() {
            for item in n.items {
                if let Ok(Some(env)) = item.envelope() {
                    if let Ok(msg) = env.into_message() {
                        out.push((n.channel.clone(), msg));
                    }
                }
            }
        }
        out
    }
}
