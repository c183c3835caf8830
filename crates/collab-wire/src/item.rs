//! Pub/sub items
//!
//! An item is what the bus delivers: an optional item id plus an opaque
//! payload. The manager uses the item id as the run identifier.

use bytes::Bytes;

use collab_core::CollabResult;

use crate::Envelope;

/// One item of a bus notification
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Item {
    /// Item id assigned by the publisher
    pub id: Option<String>,
    /// Encoded envelope
    pub payload: Option<Bytes>,
}

impl Item {
    pub fn new(id: Option<String>, payload: Bytes) -> Self {
        Item {
            id,
            payload: Some(payload),
        }
    }

    /// Item carrying a payload and no id
    pub fn anonymous(payload: Bytes) -> Self {
        Item::new(None, payload)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Decode the embedded envelope. `Ok(None)` when the item has no
    /// payload or the payload holds no simulation element.
    pub fn envelope(&self) -> CollabResult<Option<Envelope>> {
        match &self.payload {
            Some(bytes) => Envelope::decode(bytes),
            None => Ok(None),
        }
    }
}
