//! Which clients hold grants covering a mutated entity.
use crate::error::IdentityResult;
use crate::model::{ClientRecord, EntityKind, EntityType, GrantRecord, UserClientKey};
use crate::store::IdentityProviderStore;
use masque_common::{ClientId, EntityId, UserId};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationEvent {
    Save,
    Remove,
}

/// What is happening to which type of entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationContext {
    pub entity_type: EntityType,
    pub event: MutationEvent,
}

impl MutationContext {
    pub fn save(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            event: MutationEvent::Save,
        }
    }

    pub fn remove(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            event: MutationEvent::Remove,
        }
    }
}

/// A grant covering the mutated entity, with its client and the kind it was granted under.
#[derive(Debug, Clone)]
pub struct ResolvedGrant {
    pub grant: GrantRecord,
    pub client: ClientRecord,
    pub kind: EntityKind,
}

impl ResolvedGrant {
    pub fn key(&self) -> UserClientKey {
        self.grant.key()
    }
}

pub struct AuthorizationResolver {
    store: Arc<dyn IdentityProviderStore>,
}

impl AuthorizationResolver {
    pub fn new(store: Arc<dyn IdentityProviderStore>) -> Self {
        Self { store }
    }

    /// Grants of `user_id` that cover the entity. `entity_id` is `None` for an entity that
    /// has not been persisted yet.
    ///
    /// - `users`: every grant of the user.
    /// - new sub-entity: every grant requesting the type, for types shared with new
    ///   clients; nothing otherwise.
    /// - existing sub-entity: grants holding the id under any kind of the type.
    /// - removal also drops clients that never fetched the entity.
    pub async fn grants_for(
        &self,
        context: &MutationContext,
        entity_id: Option<EntityId>,
        user_id: UserId,
    ) -> IdentityResult<Vec<ResolvedGrant>> {
        let entity_type = context.entity_type;
        let grants = self.store.list_grants_for_user(user_id).await?;
        let mut matched: Vec<(GrantRecord, EntityKind)> = grants
            .into_iter()
            .filter_map(|grant| {
                let kind = match (entity_type, entity_id) {
                    (EntityType::Users, _) => Some(EntityKind::Users),
                    (_, None) => (entity_type.shared_with_new_clients()
                        && grant.requests_type(entity_type))
                    .then(|| entity_type.default_kind()),
                    (_, Some(id)) => {
                        EntityKind::preferred(grant.kinds_holding(entity_type, id))
                    }
                }?;
                Some((grant, kind))
            })
            .collect();

        if context.event == MutationEvent::Remove {
            let id = entity_id.unwrap_or_else(|| user_id.into());
            let mut fetched = Vec::with_capacity(matched.len());
            for (grant, kind) in matched {
                let status = self.store.find_status(grant.key()).await?;
                if status.is_some_and(|status| status.has_fetched(entity_type, id)) {
                    fetched.push((grant, kind));
                } else {
                    tracing::debug!(
                        client_id = %grant.client_id,
                        %entity_type,
                        "skipping client that never fetched the entity"
                    );
                }
            }
            matched = fetched;
        }

        let client_ids: Vec<ClientId> = matched.iter().map(|(grant, _)| grant.client_id).collect();
        let mut clients: HashMap<ClientId, ClientRecord> = self
            .store
            .list_clients(&client_ids)
            .await?
            .into_iter()
            .map(|client| (client.client_id, client))
            .collect();
        Ok(matched
            .into_iter()
            .filter_map(|(grant, kind)| {
                let client = clients.remove(&grant.client_id)?;
                Some(ResolvedGrant {
                    grant,
                    client,
                    kind,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Scope, ScopeField, UserStatusRecord};
    use crate::store::memory::InMemoryStore;
    use crate::store::{ClientStore, GrantStore, StatusStore};

    struct Fixture {
        store: Arc<InMemoryStore>,
        resolver: AuthorizationResolver,
        user: UserId,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryStore::default());
            Self {
                resolver: AuthorizationResolver::new(store.clone()),
                store,
                user: UserId::new(),
            }
        }

        async fn client_with_grant(&self, grant: impl FnOnce(&mut GrantRecord)) -> UserClientKey {
            let client = self
                .store
                .create_client(ClientRecord::register("client", None))
                .await
                .expect("client");
            let key = UserClientKey::new(self.user, client.client_id);
            let mut record = GrantRecord::new(key);
            grant(&mut record);
            self.store.merge_grant(record).await.expect("grant");
            key
        }
    }

    #[tokio::test]
    async fn new_addresses_reach_every_client_requesting_addresses() {
        let fx = Fixture::new();
        let wants_addresses = fx
            .client_with_grant(|g| {
                g.scope.insert(ScopeField::Addresses);
            })
            .await;
        fx.client_with_grant(|g| {
            g.scope.insert(ScopeField::FirstName);
        })
        .await;

        let grants = fx
            .resolver
            .grants_for(&MutationContext::save(EntityType::Addresses), None, fx.user)
            .await
            .expect("resolve");
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].key(), wants_addresses);
        assert_eq!(grants[0].kind, EntityKind::Addresses);
    }

    #[tokio::test]
    async fn new_emails_reach_nobody() {
        let fx = Fixture::new();
        fx.client_with_grant(|g| {
            g.scope.insert(ScopeField::Emails);
        })
        .await;
        let grants = fx
            .resolver
            .grants_for(&MutationContext::save(EntityType::Emails), None, fx.user)
            .await
            .expect("resolve");
        assert!(grants.is_empty());
    }

    #[tokio::test]
    async fn existing_entities_resolve_by_granted_id_with_phone_precedence() {
        let fx = Fixture::new();
        let phone = EntityId::new();
        let holder = fx
            .client_with_grant(|g| {
                g.scope.insert(ScopeField::PhoneNumbers);
                g.entities
                    .entry(EntityKind::LandlinePhoneNumbers)
                    .or_default()
                    .insert(phone);
                g.entities
                    .entry(EntityKind::UnknownPhoneNumbers)
                    .or_default()
                    .insert(phone);
            })
            .await;
        fx.client_with_grant(|g| {
            g.scope.insert(ScopeField::PhoneNumbers);
        })
        .await;

        let grants = fx
            .resolver
            .grants_for(
                &MutationContext::save(EntityType::PhoneNumbers),
                Some(phone),
                fx.user,
            )
            .await
            .expect("resolve");
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].key(), holder);
        assert_eq!(grants[0].kind, EntityKind::UnknownPhoneNumbers);
    }

    #[tokio::test]
    async fn removal_skips_clients_that_never_fetched() {
        let fx = Fixture::new();
        let address = EntityId::new();
        let grant_address = |g: &mut GrantRecord| {
            g.scope.insert(ScopeField::Addresses);
            g.entities
                .entry(EntityKind::Addresses)
                .or_default()
                .insert(address);
        };
        let never_fetched = fx.client_with_grant(grant_address).await;
        let fetched = fx.client_with_grant(grant_address).await;
        for key in [never_fetched, fetched] {
            fx.store
                .insert_status_if_absent(UserStatusRecord::new(key, false))
                .await
                .expect("status");
        }
        fx.store
            .reset_status(fetched, &Scope::from(ScopeField::ALL))
            .await
            .expect("fetch");

        let grants = fx
            .resolver
            .grants_for(
                &MutationContext::remove(EntityType::Addresses),
                Some(address),
                fx.user,
            )
            .await
            .expect("resolve");
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].key(), fetched);
    }

    #[tokio::test]
    async fn users_match_every_grant() {
        let fx = Fixture::new();
        fx.client_with_grant(|_| {}).await;
        fx.client_with_grant(|_| {}).await;
        let grants = fx
            .resolver
            .grants_for(
                &MutationContext::save(EntityType::Users),
                Some(fx.user.into()),
                fx.user,
            )
            .await
            .expect("resolve");
        assert_eq!(grants.len(), 2);
        assert!(grants.iter().all(|g| g.kind == EntityKind::Users));
    }
}
