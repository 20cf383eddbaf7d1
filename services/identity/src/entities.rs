//! Save and remove of user-owned entities, running the change-notification pipeline.
//!
//! A save resolves the covering grants against the stored version first, then validates
//! and plans every write: the entity itself, grant and identity bookkeeping for a new
//! entity, and the notifications. The plan commits as one store mutation, so a failing
//! step leaves nothing behind. Delivery to the queue runs after the commit.
use crate::error::{IdentityError, IdentityResult};
use crate::model::{
    EntityBody, EntityRecord, EntityType, IdentityUpsert, PhoneType, UpdatedEntityStatus,
};
use crate::notifier::{ChangeNotifier, MutationResult, NotifyReport, reclassify_phone};
use crate::phone::PhoneTypeDetector;
use crate::resolver::{AuthorizationResolver, MutationContext, ResolvedGrant};
use crate::store::{EntityMutation, EntityWrite, GrantAddition, IdentityProviderStore};
use masque_common::{EntityId, FakeId, UserId};
use std::collections::HashMap;
use std::sync::Arc;

/// Result of a save or remove.
#[derive(Debug, Clone)]
pub struct EntityChange {
    pub entity: EntityRecord,
    pub notified: NotifyReport,
}

pub struct EntityService {
    store: Arc<dyn IdentityProviderStore>,
    resolver: AuthorizationResolver,
    notifier: Arc<ChangeNotifier>,
    detector: Arc<dyn PhoneTypeDetector>,
}

impl EntityService {
    pub fn new(
        store: Arc<dyn IdentityProviderStore>,
        notifier: Arc<ChangeNotifier>,
        detector: Arc<dyn PhoneTypeDetector>,
    ) -> Self {
        Self {
            resolver: AuthorizationResolver::new(store.clone()),
            store,
            notifier,
            detector,
        }
    }

    /// Create (`entity_id == None`) or update an entity of `user_id`.
    ///
    /// The profile is keyed by the user id, so saving a `users` body always targets it.
    pub async fn save(
        &self,
        user_id: UserId,
        mut body: EntityBody,
        entity_id: Option<EntityId>,
    ) -> IdentityResult<EntityChange> {
        let entity_type = body.entity_type();
        let entity_id = match entity_type {
            EntityType::Users => Some(EntityId::from(user_id)),
            _ => entity_id,
        };
        let existing = match (entity_type, entity_id) {
            (EntityType::Users, Some(id)) => self.store.find_entity(id).await?,
            (_, Some(id)) => Some(self.owned(user_id, id).await?),
            (_, None) => None,
        };
        if let Some(existing) = &existing {
            if existing.entity_type() != entity_type {
                return Err(IdentityError::validation(
                    "entity_type",
                    format!("entity is a {}", existing.entity_type()),
                ));
            }
        }
        if let Some(phone) = body.as_phone_mut() {
            phone.phone_type = self.detector.detect(&phone.number, &phone.country);
        }

        let context = MutationContext::save(entity_type);
        let grants = self
            .resolver
            .grants_for(&context, existing.as_ref().map(|e| e.id), user_id)
            .await?;

        let mut changed = body.modified_fields(existing.as_ref().map(|e| &e.body));
        let mut identity_tags = Vec::new();
        if let (Some(existing), Some(phone)) = (&existing, body.as_phone()) {
            let previous = existing
                .body
                .as_phone()
                .map(|p| p.phone_type)
                .unwrap_or(PhoneType::Unknown);
            identity_tags = reclassify_phone(&grants, existing.id, previous, phone.phone_type)?;
            if previous == PhoneType::Unknown {
                changed.remove("phone_type");
            }
        }

        let record = match &existing {
            Some(existing) => EntityRecord {
                id: existing.id,
                user_id,
                body,
            },
            None => EntityRecord::new(user_id, body),
        };
        let status = match (entity_type, &existing) {
            (EntityType::Users, _) | (_, Some(_)) => UpdatedEntityStatus::Updated,
            (_, None) => UpdatedEntityStatus::New,
        };
        let mut mutation = EntityMutation::new(EntityWrite::Put(record.clone()));
        mutation.identity_tags = identity_tags;
        if status == UpdatedEntityStatus::New {
            share_new_entity(&mut mutation, &grants, record.id);
        }

        let result = MutationResult {
            context,
            user_id,
            entity_id: record.id,
            status,
            changed_fields: changed,
            grants,
        };
        let notified = self.commit(mutation, &result).await?;
        tracing::debug!(
            %user_id,
            entity_id = %record.id,
            %entity_type,
            changed = result.changed_fields.len(),
            "entity saved"
        );
        Ok(EntityChange {
            entity: record,
            notified,
        })
    }

    pub async fn remove(&self, user_id: UserId, entity_id: EntityId) -> IdentityResult<EntityChange> {
        let existing = self.owned(user_id, entity_id).await?;
        let entity_type = existing.entity_type();
        if entity_type == EntityType::Users {
            return Err(IdentityError::validation(
                "entity_type",
                "the user profile cannot be removed",
            ));
        }
        let context = MutationContext::remove(entity_type);
        let grants = self
            .resolver
            .grants_for(&context, Some(entity_id), user_id)
            .await?;
        let result = MutationResult {
            context,
            user_id,
            entity_id,
            status: UpdatedEntityStatus::Deleted,
            changed_fields: Default::default(),
            grants,
        };
        let notified = self
            .commit(EntityMutation::new(EntityWrite::Delete(entity_id)), &result)
            .await?;
        tracing::debug!(%user_id, %entity_id, %entity_type, "entity removed");
        Ok(EntityChange {
            entity: existing,
            notified,
        })
    }

    /// Plan the notifications, commit them with `mutation`, then hand them to delivery.
    async fn commit(
        &self,
        mut mutation: EntityMutation,
        result: &MutationResult,
    ) -> IdentityResult<NotifyReport> {
        let plan = self.notifier.plan(result, &mutation.identities).await?;
        plan.attach(&mut mutation);
        let outcomes = self.store.commit_mutation(mutation).await?;
        Ok(self.notifier.deliver(&plan, outcomes).await)
    }

    async fn owned(&self, user_id: UserId, entity_id: EntityId) -> IdentityResult<EntityRecord> {
        match self.store.find_entity(entity_id).await? {
            Some(entity) if entity.user_id == user_id => Ok(entity),
            Some(entity) => Err(IdentityError::unknown_entity(entity.entity_type(), entity_id)),
            None => Err(IdentityError::NotFound(format!("entity {entity_id}"))),
        }
    }
}

/// Grant a freshly created entity to every client the resolver matched, minting its fake
/// ids up front. A client matched under several kinds gets one fake id.
fn share_new_entity(mutation: &mut EntityMutation, grants: &[ResolvedGrant], entity_id: EntityId) {
    let mut minted: HashMap<_, FakeId> = HashMap::new();
    for resolved in grants {
        let key = resolved.key();
        let fake_id = *minted.entry(key).or_insert_with(FakeId::new);
        mutation.grant_additions.push(GrantAddition {
            key,
            kind: resolved.kind,
            entity_id,
        });
        mutation.identities.push(IdentityUpsert {
            key,
            real_id: entity_id,
            tag: resolved.kind,
            fake_id,
            uses_test_account: false,
        });
    }
}
