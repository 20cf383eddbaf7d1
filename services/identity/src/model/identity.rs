//! Identity mapping records and the (user, client) key shared by per-pair records.
use super::kind::{EntityKind, EntityType};
use masque_common::{ClientId, EntityId, FakeId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Key of every record owned jointly by a user and a client.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserClientKey {
    pub user_id: UserId,
    pub client_id: ClientId,
}

impl UserClientKey {
    pub fn new(user_id: UserId, client_id: ClientId) -> Self {
        Self { user_id, client_id }
    }
}

/// Mapping of one real id to the fake id a client sees for it.
///
/// `(user_id, client_id, real_id)` is unique, and `fake_id` is unique within a client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EntityIdentityRecord {
    pub user_id: UserId,
    pub client_id: ClientId,
    pub real_id: EntityId,
    pub fake_id: FakeId,
    pub tags: BTreeSet<EntityKind>,
    pub uses_test_account: bool,
}

impl EntityIdentityRecord {
    pub fn key(&self) -> UserClientKey {
        UserClientKey::new(self.user_id, self.client_id)
    }

    pub fn has_tag(&self, kind: EntityKind) -> bool {
        self.tags.contains(&kind)
    }

    /// Whether any tag of this record names the given entity type.
    pub fn represents(&self, entity_type: EntityType) -> bool {
        self.tags.iter().any(|tag| tag.entity_type() == entity_type)
    }
}

/// Insert-or-merge request for one identity record.
///
/// `fake_id` and `uses_test_account` apply only when the record is inserted;
/// an existing record only gains `tag`.
#[derive(Debug, Clone)]
pub struct IdentityUpsert {
    pub key: UserClientKey,
    pub real_id: EntityId,
    pub tag: EntityKind,
    pub fake_id: FakeId,
    pub uses_test_account: bool,
}
