//! Bus interface

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use collab_core::{CollabResult, NodeName, ERROR_MARKER, LOG_CHANNEL};
use collab_wire::Item;

/// A node's standing on a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Affiliation {
    Owner,
    Publisher,
    Member,
    Outcast,
}

impl Affiliation {
    pub fn can_publish(self) -> bool {
        matches!(self, Affiliation::Owner | Affiliation::Publisher)
    }
}

impl fmt::Display for Affiliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Affiliation::Owner => "owner",
            Affiliation::Publisher => "publisher",
            Affiliation::Member => "member",
            Affiliation::Outcast => "outcast",
        };
        f.write_str(s)
    }
}

/// Items published on one channel, as seen by one subscriber
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub channel: String,
    pub items: Vec<Item>,
}

impl Notification {
    pub fn new(channel: impl Into<String>, items: Vec<Item>) -> Self {
        Notification {
            channel: channel.into(),
            items,
        }
    }
}

/// Notifications addressed to one node
pub type NotificationStream = mpsc::UnboundedReceiver<Notification>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish several items as one notification
    async fn publish_batch(
        &self,
        channel: &str,
        sender: &NodeName,
        items: Vec<Item>,
    ) -> CollabResult<()>;

    async fn publish(&self, channel: &str, sender: &NodeName, item: Item) -> CollabResult<()> {
        self.publish_batch(channel, sender, vec![item]).await
    }

    async fn subscribe(&self, channel: &str, subscriber: &NodeName) -> CollabResult<()>;

    async fn unsubscribe(&self, channel: &str, subscriber: &NodeName) -> CollabResult<()>;

    /// Channels `subscriber` is currently subscribed to
    async fn subscriptions(&self, subscriber: &NodeName) -> CollabResult<BTreeSet<String>>;

    /// Every channel on which `node` holds an affiliation
    async fn affiliations(&self, node: &NodeName) -> CollabResult<BTreeMap<String, Affiliation>>;

    /// Register `node` and return the stream its notifications arrive on.
    /// Attaching again replaces the previous stream.
    fn attach(&self, node: &NodeName) -> NotificationStream;
}

/// Output and error channel sets derived from a node's affiliations.
///
/// Both sets always contain the local `log` channel. Channels the node may
/// publish to are split on whether their name mentions `error`.
pub fn partition_channels(
    affiliations: &BTreeMap<String, Affiliation>,
) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut outputs = BTreeSet::from([LOG_CHANNEL.to_string()]);
    let mut errors = BTreeSet::from([LOG_CHANNEL.to_string()]);
    for (channel, affiliation) in affiliations {
        if !affiliation.can_publish() {
            continue;
        }
        if channel.contains(ERROR_MARKER) {
            errors.insert(channel.clone());
        } else {
            outputs.insert(channel.clone());
        }
    }
    (outputs, errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_channels() {
        let affs = BTreeMap::from([
            ("defaults".to_string(), Affiliation::Publisher),
            ("sim_errors".to_string(), Affiliation::Owner),
            ("simulations".to_string(), Affiliation::Member),
            ("error_log".to_string(), Affiliation::Outcast),
        ]);
        let (outputs, errors) = partition_channels(&affs);
        assert_eq!(
            outputs.into_iter().collect::<Vec<_>>(),
            ["defaults", "log"]
        );
        assert_eq!(
            errors.into_iter().collect::<Vec<_>>(),
            ["log", "sim_errors"]
        );
    }

    #[test]
    fn test_affiliation_publish_rights() {
        assert!(Affiliation::Owner.can_publish());
        assert!(Affiliation::Publisher.can_publish());
        assert!(!Affiliation::Member.can_publish());
        assert_eq!(Affiliation::Publisher.to_string(), "publisher");
    }
}
