//! In-process bus

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use collab_core::{CollabError, CollabResult, NodeName};
use collab_wire::Item;

use crate::{Affiliation, MessageBus, Notification, NotificationStream};

/// Bus operation a fault can be injected into
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BusOp {
    Publish,
    Subscribe,
    Unsubscribe,
}

#[derive(Clone, Debug)]
struct Fault {
    op: BusOp,
    channel: String,
    persistent: bool,
}

#[derive(Default)]
struct Channel {
    subscribers: BTreeSet<NodeName>,
    affiliations: BTreeMap<NodeName, Affiliation>,
    published: u64,
}

#[derive(Default)]
struct BusState {
    channels: BTreeMap<String, Channel>,
    inboxes: HashMap<NodeName, mpsc::UnboundedSender<Notification>>,
    faults: Vec<Fault>,
}

impl BusState {
    /// Consume a matching fault, if any
    fn trip(&mut self, op: BusOp, channel: &str) -> CollabResult<()> {
        let hit = self
            .faults
            .iter()
            .position(|f| f.op == op && f.channel == channel);
        match hit {
            Some(i) => {
                if !self.faults[i].persistent {
                    self.faults.remove(i);
                }
                Err(CollabError::TransportError(format!(
                    "injected {:?} failure on {}",
                    op, channel
                )))
            }
            None => Ok(()),
        }
    }

    fn channel_mut(&mut self, channel: &str) -> CollabResult<&mut Channel> {
        self.channels
            .get_mut(channel)
            .ok_or_else(|| CollabError::TransportError(format!("item-not-found: {}", channel)))
    }
}

/// Shared in-memory bus. Clones refer to the same bus.
#[derive(Clone, Default)]
pub struct LocalBus {
    state: Arc<Mutex<BusState>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a channel if it does not exist yet
    pub fn create_channel(&self, channel: &str) {
        self.state
            .lock()
            .channels
            .entry(channel.to_string())
            .or_default();
    }

    /// Set `node`'s affiliation on `channel`, creating the channel
    pub fn affiliate(&self, channel: &str, node: &NodeName, affiliation: Affiliation) {
        self.state
            .lock()
            .channels
            .entry(channel.to_string())
            .or_default()
            .affiliations
            .insert(node.clone(), affiliation);
    }

    /// Fail the next `op` on `channel`
    pub fn fail_once(&self, op: BusOp, channel: &str) {
        self.inject(op, channel, false);
    }

    /// Fail every `op` on `channel` until faults are cleared
    pub fn fail_always(&self, op: BusOp, channel: &str) {
        self.inject(op, channel, true);
    }

    fn inject(&self, op: BusOp, channel: &str, persistent: bool) {
        self.state.lock().faults.push(Fault {
            op,
            channel: channel.to_string(),
            persistent,
        });
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    pub fn subscribers(&self, channel: &str) -> BTreeSet<NodeName> {
        self.state
            .lock()
            .channels
            .get(channel)
            .map(|c| c.subscribers.clone())
            .unwrap_or_default()
    }

    /// Number of notifications published on `channel` so far
    pub fn published(&self, channel: &str) -> u64 {
        self.state
            .lock()
            .channels
            .get(channel)
            .map_or(0, |c| c.published)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish_batch(
        &self,
        channel: &str,
        sender: &NodeName,
        items: Vec<Item>,
    ) -> CollabResult<()> {
        let mut state = self.state.lock();
        state.trip(BusOp::Publish, channel)?;

        let ch = state.channel_mut(channel)?;
        let allowed = ch
            .affiliations
            .get(sender)
            .is_some_and(|a| a.can_publish());
        if !allowed {
            return Err(CollabError::NotPublisher {
                node: sender.to_string(),
                channel: channel.to_string(),
            });
        }
        ch.published += 1;
        let subscribers: Vec<NodeName> = ch.subscribers.iter().cloned().collect();

        let notification = Notification::new(channel, items);
        for subscriber in subscribers {
            match state.inboxes.get(&subscriber) {
                Some(inbox) => {
                    if inbox.send(notification.clone()).is_err() {
                        tracing::debug!(node = %subscriber, channel, "inbox closed");
                    }
                }
                None => tracing::debug!(node = %subscriber, channel, "subscriber not attached"),
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str, subscriber: &NodeName) -> CollabResult<()> {
        let mut state = self.state.lock();
        state.trip(BusOp::Subscribe, channel)?;
        state
            .channel_mut(channel)?
            .subscribers
            .insert(subscriber.clone());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, subscriber: &NodeName) -> CollabResult<()> {
        let mut state = self.state.lock();
        state.trip(BusOp::Unsubscribe, channel)?;
        if state.channel_mut(channel)?.subscribers.remove(subscriber) {
            Ok(())
        } else {
            Err(CollabError::TransportError(format!(
                "not-subscribed: {} on {}",
                subscriber, channel
            )))
        }
    }

    async fn subscriptions(&self, subscriber: &NodeName) -> CollabResult<BTreeSet<String>> {
        Ok(self
            .state
            .lock()
            .channels
            .iter()
            .filter(|(_, c)| c.subscribers.contains(subscriber))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn affiliations(&self, node: &NodeName) -> CollabResult<BTreeMap<String, Affiliation>> {
        Ok(self
            .state
            .lock()
            .channels
            .iter()
            .filter_map(|(name, c)| c.affiliations.get(node).map(|a| (name.clone(), *a)))
            .collect())
    }

    fn attach(&self, node: &NodeName) -> NotificationStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().inboxes.insert(node.clone(), tx);
        rx
    }
}
