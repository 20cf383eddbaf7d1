//! Change-notification payloads and pending-notification keys.
use super::kind::EntityType;
use super::status::UpdatedEntityStatus;
use masque_common::{ClientId, FakeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    #[serde(rename = "USER_DID_UPDATE_PERSONAL_INFORMATION")]
    UserDidUpdatePersonalInformation,
    #[serde(rename = "USER_DID_REVOKE_ACCESS")]
    UserDidRevokeAccess,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UserDidUpdatePersonalInformation => "USER_DID_UPDATE_PERSONAL_INFORMATION",
            EventType::UserDidRevokeAccess => "USER_DID_REVOKE_ACCESS",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sub-entity as the client sees it: virtualized id plus change status.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NotificationItem {
    pub id: FakeId,
    pub status: UpdatedEntityStatus,
    pub updated_fields: Vec<String>,
}

/// Body delivered to a client's update-notification handler.
///
/// Sub-entity lists are flattened next to `updated_fields`, keyed by entity type:
/// `{"event_type": ..., "user_id": ..., "updated_fields": ["emails"], "emails": [...]}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Notification {
    pub event_type: EventType,
    pub user_id: FakeId,
    #[serde(default)]
    pub updated_fields: Vec<String>,
    #[serde(flatten)]
    pub entities: BTreeMap<EntityType, Vec<NotificationItem>>,
}

impl Notification {
    pub fn new(event_type: EventType, user_id: FakeId) -> Self {
        Self {
            event_type,
            user_id,
            updated_fields: Vec::new(),
            entities: BTreeMap::new(),
        }
    }

    pub fn items(&self, entity_type: EntityType) -> &[NotificationItem] {
        self.entities
            .get(&entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Durable envelope appended to a client's pending list before delivery is queued.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PendingEnvelope {
    pub client_secret: String,
    pub handler_url: String,
    pub notification: Notification,
}

/// Key shared by a pending-notification list and the delivery message pointing at it.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryKey {
    pub client_id: ClientId,
    pub user_id: FakeId,
}

impl DeliveryKey {
    pub fn new(client_id: ClientId, user_id: FakeId) -> Self {
        Self { client_id, user_id }
    }
}

/// One envelope ready to be appended under its key.
#[derive(Debug, Clone)]
pub struct PendingAppend {
    pub key: DeliveryKey,
    pub envelope: PendingEnvelope,
}
