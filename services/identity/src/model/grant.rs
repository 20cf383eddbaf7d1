//! Grant (user authorization for a client) records.
use super::identity::UserClientKey;
use super::kind::{EntityKind, EntityType};
use super::scope::{Scope, ScopeField, ScopeFlags};
use masque_common::{ClientId, EntityId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type GrantedEntities = BTreeMap<EntityKind, BTreeSet<EntityId>>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GrantRecord {
    pub user_id: UserId,
    pub client_id: ClientId,
    pub scope: Scope,
    pub scope_flags: ScopeFlags,
    pub entities: GrantedEntities,
    pub address_to_be_selected_first: Option<EntityId>,
}

impl GrantRecord {
    pub fn new(key: UserClientKey) -> Self {
        Self {
            user_id: key.user_id,
            client_id: key.client_id,
            scope: Scope::new(),
            scope_flags: ScopeFlags::new(),
            entities: GrantedEntities::new(),
            address_to_be_selected_first: None,
        }
    }

    pub fn key(&self) -> UserClientKey {
        UserClientKey::new(self.user_id, self.client_id)
    }

    pub fn covers(&self, field: ScopeField) -> bool {
        self.scope.contains(&field)
    }

    /// Whether the client requested the whole collection of this type.
    pub fn requests_type(&self, entity_type: EntityType) -> bool {
        ScopeField::for_entity_type(entity_type).is_some_and(|field| self.covers(field))
    }

    /// Kinds under which this grant holds `entity_id`.
    pub fn kinds_holding(&self, entity_type: EntityType, entity_id: EntityId) -> Vec<EntityKind> {
        self.entities
            .iter()
            .filter(|(kind, ids)| kind.entity_type() == entity_type && ids.contains(&entity_id))
            .map(|(kind, _)| *kind)
            .collect()
    }

    /// Every granted `(kind, id)` pair of the given type.
    pub fn granted_of_type(&self, entity_type: EntityType) -> Vec<(EntityKind, EntityId)> {
        self.entities
            .iter()
            .filter(|(kind, _)| kind.entity_type() == entity_type)
            .flat_map(|(kind, ids)| ids.iter().map(move |id| (*kind, *id)))
            .collect()
    }

    /// Additive merge: scope, flags and entity sets only grow.
    pub fn absorb(&mut self, other: &GrantRecord) -> GrantDelta {
        let mut delta = GrantDelta::default();
        for field in &other.scope {
            if self.scope.insert(*field) {
                delta.added_scope.insert(*field);
            }
        }
        self.scope_flags.extend(other.scope_flags.iter().copied());
        for (kind, ids) in &other.entities {
            let entry = self.entities.entry(*kind).or_default();
            for id in ids {
                if entry.insert(*id) {
                    delta.added_entities.entry(*kind).or_default().insert(*id);
                }
            }
        }
        if other.address_to_be_selected_first.is_some() {
            self.address_to_be_selected_first = other.address_to_be_selected_first;
        }
        delta
    }
}

/// What an additive merge actually added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantDelta {
    pub added_scope: Scope,
    pub added_entities: GrantedEntities,
}

impl GrantDelta {
    pub fn is_empty(&self) -> bool {
        self.added_scope.is_empty() && self.added_entities.values().all(BTreeSet::is_empty)
    }
}

/// Result of merging a grant into the store.
#[derive(Debug, Clone)]
pub struct GrantMerge {
    pub grant: GrantRecord,
    pub created: bool,
    pub delta: GrantDelta,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> UserClientKey {
        UserClientKey::new(UserId::new(), ClientId::new())
    }

    #[test]
    fn absorb_only_grows_and_reports_additions() {
        let key = key();
        let first_email = EntityId::new();
        let second_email = EntityId::new();
        let mut grant = GrantRecord::new(key);
        grant.scope.insert(ScopeField::Emails);
        grant
            .entities
            .entry(EntityKind::Emails)
            .or_default()
            .insert(first_email);

        let mut incoming = GrantRecord::new(key);
        incoming.scope.insert(ScopeField::Emails);
        incoming.scope.insert(ScopeField::FirstName);
        incoming
            .entities
            .entry(EntityKind::Emails)
            .or_default()
            .insert(second_email);

        let delta = grant.absorb(&incoming);
        assert_eq!(delta.added_scope, Scope::from([ScopeField::FirstName]));
        assert_eq!(
            delta.added_entities.get(&EntityKind::Emails),
            Some(&BTreeSet::from([second_email]))
        );
        assert_eq!(grant.entities[&EntityKind::Emails].len(), 2);

        let delta = grant.absorb(&incoming);
        assert!(delta.is_empty());
    }

    #[test]
    fn kinds_holding_finds_every_phone_kind() {
        let phone = EntityId::new();
        let mut grant = GrantRecord::new(key());
        grant
            .entities
            .entry(EntityKind::UnknownPhoneNumbers)
            .or_default()
            .insert(phone);
        grant
            .entities
            .entry(EntityKind::MobilePhoneNumbers)
            .or_default()
            .insert(phone);
        let kinds = grant.kinds_holding(EntityType::PhoneNumbers, phone);
        assert_eq!(kinds.len(), 2);
        assert!(grant.kinds_holding(EntityType::Emails, phone).is_empty());
    }
}
