//! Per-(user, client) status records and the transition table.
//!
//! # Transitions
//! ```text
//! new_user                   --GET-->               existing_user
//! existing_user              --qualifying change--> existing_user_after_update
//! existing_user              --test converted-->    existing_user_after_test
//! existing_user_after_test   --GET-->               existing_user
//! existing_user_after_update --GET-->               existing_user
//! ```
//! A transition requested from any other source state is dropped. Stores apply the
//! check and the write as one conditional update, see [`StatusTransition::permits`].
use super::identity::UserClientKey;
use super::kind::EntityType;
use super::scope::{Scope, ScopeField};
use masque_common::{ClientId, EntityId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    NewUser,
    ExistingUser,
    ExistingUserAfterTest,
    ExistingUserAfterUpdate,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::NewUser => "new_user",
            UserStatus::ExistingUser => "existing_user",
            UserStatus::ExistingUserAfterTest => "existing_user_after_test",
            UserStatus::ExistingUserAfterUpdate => "existing_user_after_update",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new_user" => Some(UserStatus::NewUser),
            "existing_user" => Some(UserStatus::ExistingUser),
            "existing_user_after_test" => Some(UserStatus::ExistingUserAfterTest),
            "existing_user_after_update" => Some(UserStatus::ExistingUserAfterUpdate),
            _ => None,
        }
    }

    /// Source states from which a conditional transition into `self` is legal.
    ///
    /// `existing_user` is only ever entered through the fetch reset and
    /// `new_user` only on insert, so neither has conditional sources.
    pub fn allowed_sources(&self) -> &'static [UserStatus] {
        match self {
            UserStatus::ExistingUserAfterUpdate => &[
                UserStatus::ExistingUser,
                UserStatus::ExistingUserAfterUpdate,
            ],
            UserStatus::ExistingUserAfterTest => &[UserStatus::ExistingUser],
            UserStatus::NewUser | UserStatus::ExistingUser => &[],
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UpdatedEntityStatus {
    New,
    Updated,
    Deleted,
}

/// One pending sub-entity change, keyed by the real entity id.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UpdatedEntity {
    pub id: EntityId,
    pub status: UpdatedEntityStatus,
    pub updated_fields: BTreeSet<String>,
}

impl UpdatedEntity {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            status: UpdatedEntityStatus::New,
            updated_fields: BTreeSet::new(),
        }
    }

    pub fn updated<I>(id: EntityId, fields: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            id,
            status: UpdatedEntityStatus::Updated,
            updated_fields: fields.into_iter().collect(),
        }
    }

    pub fn deleted(id: EntityId) -> Self {
        Self {
            id,
            status: UpdatedEntityStatus::Deleted,
            updated_fields: BTreeSet::new(),
        }
    }

    /// Fold a later change to the same entity into this one.
    fn absorb(&mut self, later: &UpdatedEntity) {
        match (self.status, later.status) {
            (_, UpdatedEntityStatus::Deleted) => {
                self.status = UpdatedEntityStatus::Deleted;
                self.updated_fields.clear();
            }
            (UpdatedEntityStatus::Deleted, _) => {}
            // The client has not seen the entity yet; it will receive every field anyway.
            (UpdatedEntityStatus::New, _) => {}
            (UpdatedEntityStatus::Updated, UpdatedEntityStatus::New) => {
                self.status = UpdatedEntityStatus::New;
                self.updated_fields.clear();
            }
            (UpdatedEntityStatus::Updated, UpdatedEntityStatus::Updated) => {
                self.updated_fields
                    .extend(later.updated_fields.iter().cloned());
            }
        }
    }
}

/// Changes accumulated between two fetches. Merging is a union, never an overwrite.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct StatusDelta {
    pub updated_fields: Scope,
    pub entities: Vec<(EntityType, UpdatedEntity)>,
}

impl StatusDelta {
    pub fn fields<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = ScopeField>,
    {
        Self {
            updated_fields: fields.into_iter().collect(),
            entities: Vec::new(),
        }
    }

    pub fn with_entity(mut self, entity_type: EntityType, entity: UpdatedEntity) -> Self {
        if let Some(field) = ScopeField::for_entity_type(entity_type) {
            self.updated_fields.insert(field);
        }
        self.entities.push((entity_type, entity));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.updated_fields.is_empty() && self.entities.is_empty()
    }
}

/// Conditional transition request.
#[derive(Debug, Clone)]
pub struct StatusTransition {
    pub to: UserStatus,
    pub delta: StatusDelta,
}

impl StatusTransition {
    pub fn permits(&self, from: UserStatus) -> bool {
        self.to.allowed_sources().contains(&from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// Source state did not permit the transition; nothing was written.
    Dropped { current: UserStatus },
    /// No status record exists for the pair.
    Missing,
}

impl TransitionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TransitionOutcome::Applied => "applied",
            TransitionOutcome::Dropped { .. } => "dropped",
            TransitionOutcome::Missing => "missing",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UserStatusRecord {
    pub user_id: UserId,
    pub client_id: ClientId,
    pub status: UserStatus,
    pub updated_fields: Scope,
    pub updated_emails: Vec<UpdatedEntity>,
    pub updated_phone_numbers: Vec<UpdatedEntity>,
    pub updated_addresses: Vec<UpdatedEntity>,
    pub use_test_account: bool,
}

impl UserStatusRecord {
    pub fn new(key: UserClientKey, use_test_account: bool) -> Self {
        Self {
            user_id: key.user_id,
            client_id: key.client_id,
            status: UserStatus::NewUser,
            updated_fields: Scope::new(),
            updated_emails: Vec::new(),
            updated_phone_numbers: Vec::new(),
            updated_addresses: Vec::new(),
            use_test_account,
        }
    }

    pub fn key(&self) -> UserClientKey {
        UserClientKey::new(self.user_id, self.client_id)
    }

    pub fn updates_for(&self, entity_type: EntityType) -> &[UpdatedEntity] {
        match entity_type {
            EntityType::Users => &[],
            EntityType::Emails => &self.updated_emails,
            EntityType::PhoneNumbers => &self.updated_phone_numbers,
            EntityType::Addresses => &self.updated_addresses,
        }
    }

    fn updates_for_mut(&mut self, entity_type: EntityType) -> Option<&mut Vec<UpdatedEntity>> {
        match entity_type {
            EntityType::Users => None,
            EntityType::Emails => Some(&mut self.updated_emails),
            EntityType::PhoneNumbers => Some(&mut self.updated_phone_numbers),
            EntityType::Addresses => Some(&mut self.updated_addresses),
        }
    }

    pub fn item_status(&self, entity_type: EntityType, id: EntityId) -> Option<&UpdatedEntity> {
        self.updates_for(entity_type).iter().find(|item| item.id == id)
    }

    /// Whether the client holds a local copy of the entity: it has fetched real data at least
    /// once, and the entity is not still waiting to be delivered as new.
    pub fn has_fetched(&self, entity_type: EntityType, id: EntityId) -> bool {
        if matches!(
            self.status,
            UserStatus::NewUser | UserStatus::ExistingUserAfterTest
        ) || self.use_test_account
        {
            return false;
        }
        !matches!(
            self.item_status(entity_type, id),
            Some(UpdatedEntity {
                status: UpdatedEntityStatus::New,
                ..
            })
        )
    }

    pub fn merge(&mut self, delta: &StatusDelta) {
        self.updated_fields
            .extend(delta.updated_fields.iter().copied());
        for (entity_type, change) in &delta.entities {
            let Some(items) = self.updates_for_mut(*entity_type) else {
                continue;
            };
            match items.iter_mut().find(|item| item.id == change.id) {
                Some(existing) => existing.absorb(change),
                None => items.push(change.clone()),
            }
        }
    }

    /// Apply a conditional transition in place. Returns `false` when the source state
    /// does not permit it, in which case the record is untouched.
    pub fn apply(&mut self, transition: &StatusTransition) -> bool {
        if !transition.permits(self.status) {
            return false;
        }
        self.status = transition.to;
        self.merge(&transition.delta);
        true
    }

    /// The client fetched the fields of `served`.
    ///
    /// Their pending updates are cleared, along with the item lists of the sub-entity
    /// types they name. The record only returns to `existing_user` once nothing is left
    /// pending, so a narrow fetch keeps the rest for the next one.
    pub fn mark_served(&mut self, served: &Scope) {
        self.updated_fields.retain(|field| !served.contains(field));
        for entity_type in EntityType::SUB_ENTITIES {
            let covered = ScopeField::for_entity_type(entity_type)
                .is_some_and(|field| served.contains(&field));
            if let (true, Some(items)) = (covered, self.updates_for_mut(entity_type)) {
                items.clear();
            }
        }
        if self.status == UserStatus::NewUser || !self.has_pending() {
            self.status = UserStatus::ExistingUser;
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.updated_fields.is_empty()
            || !self.updated_emails.is_empty()
            || !self.updated_phone_numbers.is_empty()
            || !self.updated_addresses.is_empty()
    }
}
