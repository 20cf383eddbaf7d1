//! Change-notification pipeline.
//!
//! # Purpose
//! Turns one entity mutation into one virtualized notification per interested client.
//! Interested means: the client holds a grant covering the entity (see
//! [`AuthorizationResolver`](crate::resolver::AuthorizationResolver)) and registered an
//! update-notification handler.
//!
//! # Ordering
//! 1. [`ChangeNotifier::plan`] looks up fake ids for every client and builds every
//!    envelope and status change before anything is written.
//! 2. The caller commits the plan together with the entity write in one
//!    [`EntityMutation`](crate::store::EntityMutation).
//! 3. [`ChangeNotifier::deliver`] hands the keys to the delivery queue. The envelopes are
//!    already durable at this point, so a queue failure is logged and counted under
//!    `masque_delivery_enqueue_failures_total` and never fails the mutation.
use crate::delivery::DeliveryQueue;
use crate::error::{IdentityError, IdentityResult};
use crate::model::{
    ClientRecord, DeliveryKey, EntityType, EventType, IdentityUpsert, Notification,
    NotificationItem, PendingAppend, PendingEnvelope, PhoneType, ScopeField, StatusDelta,
    StatusTransition, TransitionOutcome, UpdatedEntity, UpdatedEntityStatus, UserClientKey,
    UserStatus,
};
use crate::resolver::{MutationContext, ResolvedGrant};
use crate::status::record_outcome;
use crate::store::{EntityMutation, IdentityProviderStore, IdentityTag};
use crate::virtualizer::IdentityVirtualizer;
use masque_common::{EntityId, FakeId, UserId};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Everything the pipeline stages pass along for one mutation.
#[derive(Debug, Clone)]
pub struct MutationResult {
    pub context: MutationContext,
    pub user_id: UserId,
    pub entity_id: EntityId,
    /// `new`, `updated` or `deleted`. Ignored for the user profile.
    pub status: UpdatedEntityStatus,
    /// Trackable fields that actually changed.
    pub changed_fields: BTreeSet<String>,
    /// Grants resolved before the entity was persisted.
    pub grants: Vec<ResolvedGrant>,
}

/// Envelopes and status changes of one mutation, built before anything is written.
#[derive(Debug, Clone, Default)]
pub struct NotificationPlan {
    entity_type: Option<EntityType>,
    pending: Vec<PendingAppend>,
    transitions: Vec<(UserClientKey, StatusTransition)>,
}

impl NotificationPlan {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Add the plan's writes to `mutation`.
    pub fn attach(&self, mutation: &mut EntityMutation) {
        mutation.pending.extend(self.pending.iter().cloned());
        mutation.transitions.extend(self.transitions.iter().cloned());
    }
}

/// What a notification run did.
#[derive(Debug, Clone, Default)]
pub struct NotifyReport {
    /// Keys whose envelopes were stored.
    pub delivered: Vec<DeliveryKey>,
    pub transitions: Vec<(UserClientKey, TransitionOutcome)>,
    /// Whether the delivery queue accepted the keys.
    pub enqueued: bool,
}

impl NotifyReport {
    pub fn is_empty(&self) -> bool {
        self.delivered.is_empty()
    }
}

pub struct ChangeNotifier {
    virtualizer: IdentityVirtualizer,
    queue: Arc<dyn DeliveryQueue>,
}

impl ChangeNotifier {
    pub fn new(store: Arc<dyn IdentityProviderStore>, queue: Arc<dyn DeliveryQueue>) -> Self {
        Self {
            virtualizer: IdentityVirtualizer::new(store),
            queue,
        }
    }

    /// Build the notifications of `mutation`. `staged` holds identity upserts committed
    /// along with the mutation, so fake ids minted for a new entity resolve already.
    pub async fn plan(
        &self,
        mutation: &MutationResult,
        staged: &[IdentityUpsert],
    ) -> IdentityResult<NotificationPlan> {
        let entity_type = mutation.context.entity_type;
        let deleting = mutation.status == UpdatedEntityStatus::Deleted
            && entity_type != EntityType::Users;
        let mut plan = NotificationPlan {
            entity_type: Some(entity_type),
            ..NotificationPlan::default()
        };
        if mutation.changed_fields.is_empty() && !deleting {
            return Ok(plan);
        }
        for resolved in &mutation.grants {
            let Some(handler_url) = resolved.client.handler() else {
                continue;
            };
            if let Some((append, delta)) =
                self.plan_client(mutation, resolved, handler_url, staged).await?
            {
                plan.pending.push(append);
                plan.transitions.push((
                    resolved.key(),
                    StatusTransition {
                        to: UserStatus::ExistingUserAfterUpdate,
                        delta,
                    },
                ));
            }
        }
        Ok(plan)
    }

    async fn plan_client(
        &self,
        mutation: &MutationResult,
        resolved: &ResolvedGrant,
        handler_url: &str,
        staged: &[IdentityUpsert],
    ) -> IdentityResult<Option<(PendingAppend, StatusDelta)>> {
        let key = resolved.key();
        let entity_type = mutation.context.entity_type;
        let mut map = self.virtualizer.identity_map(key).await?;
        for upsert in staged {
            map.stage(upsert);
        }
        let user_fake = map.user_fake_id()?;
        let mut notification =
            Notification::new(EventType::UserDidUpdatePersonalInformation, user_fake);

        let delta = match ScopeField::for_entity_type(entity_type) {
            None => {
                let covered: Vec<ScopeField> = mutation
                    .changed_fields
                    .iter()
                    .filter_map(|field| ScopeField::parse(field))
                    .filter(|field| resolved.grant.covers(*field))
                    .collect();
                if covered.is_empty() {
                    return Ok(None);
                }
                notification.updated_fields = covered.iter().map(|f| f.to_string()).collect();
                StatusDelta::fields(covered)
            }
            Some(_) => {
                let entity_fake = map.fake_id(resolved.kind, mutation.entity_id)?;
                let fields: Vec<String> = match mutation.status {
                    UpdatedEntityStatus::Updated => {
                        mutation.changed_fields.iter().cloned().collect()
                    }
                    UpdatedEntityStatus::New | UpdatedEntityStatus::Deleted => Vec::new(),
                };
                notification.updated_fields = vec![entity_type.to_string()];
                notification.entities.insert(
                    entity_type,
                    vec![NotificationItem {
                        id: entity_fake,
                        status: mutation.status,
                        updated_fields: fields.clone(),
                    }],
                );
                StatusDelta::default().with_entity(
                    entity_type,
                    UpdatedEntity {
                        id: mutation.entity_id,
                        status: mutation.status,
                        updated_fields: fields.into_iter().collect(),
                    },
                )
            }
        };

        Ok(Some((
            PendingAppend {
                key: DeliveryKey::new(key.client_id, user_fake),
                envelope: envelope(&resolved.client, handler_url, notification),
            },
            delta,
        )))
    }

    /// Hand the keys of a committed plan to the delivery queue. `outcomes` are the
    /// transition outcomes the store returned for the plan, in order.
    pub async fn deliver(
        &self,
        plan: &NotificationPlan,
        outcomes: Vec<TransitionOutcome>,
    ) -> NotifyReport {
        if plan.is_empty() {
            return NotifyReport::default();
        }
        for ((key, transition), outcome) in plan.transitions.iter().zip(&outcomes) {
            record_outcome(*key, transition, *outcome);
        }
        let delivered: Vec<DeliveryKey> = plan.pending.iter().map(|item| item.key).collect();
        let enqueued = self.dispatch(delivered.clone()).await;
        if let Some(entity_type) = plan.entity_type {
            metrics::counter!(
                "masque_notifications_total",
                "entity_type" => entity_type.as_str()
            )
            .increment(delivered.len() as u64);
            tracing::debug!(
                %entity_type,
                clients = delivered.len(),
                enqueued,
                "change notifications stored"
            );
        }
        NotifyReport {
            transitions: plan
                .transitions
                .iter()
                .map(|(key, _)| *key)
                .zip(outcomes)
                .collect(),
            delivered,
            enqueued,
        }
    }

    /// Append-side envelope of a revocation notice, if the client has a handler.
    pub fn revocation(&self, client: &ClientRecord, user_fake: FakeId) -> Option<PendingAppend> {
        let handler_url = client.handler()?;
        let notification = Notification::new(EventType::UserDidRevokeAccess, user_fake);
        Some(PendingAppend {
            key: DeliveryKey::new(client.client_id, user_fake),
            envelope: envelope(client, handler_url, notification),
        })
    }

    /// Enqueue keys whose envelopes are already stored. Returns whether the queue took
    /// them; the envelopes stay pending either way.
    pub async fn dispatch(&self, keys: Vec<DeliveryKey>) -> bool {
        let count = keys.len();
        match self.queue.enqueue(keys).await {
            Ok(()) => true,
            Err(err) => {
                metrics::counter!("masque_delivery_enqueue_failures_total").increment(1);
                tracing::warn!(error = %err, keys = count, "delivery enqueue failed");
                false
            }
        }
    }
}

/// Reconcile a phone number changing line type with the clients holding it.
///
/// A client that was granted the number under the old specific type blocks the change.
/// Otherwise every holder's identity record gains the new type's tag so typed and
/// type-less grants keep resolving to the same number. Nothing is written here; the
/// returned tags go into the save's mutation.
pub fn reclassify_phone(
    grants: &[ResolvedGrant],
    phone_id: EntityId,
    from: PhoneType,
    to: PhoneType,
) -> IdentityResult<Vec<IdentityTag>> {
    if from == to {
        return Ok(Vec::new());
    }
    let holders: Vec<&ResolvedGrant> = grants
        .iter()
        .filter(|resolved| {
            !resolved
                .grant
                .kinds_holding(EntityType::PhoneNumbers, phone_id)
                .is_empty()
        })
        .collect();
    if from != PhoneType::Unknown {
        let blocked = holders.iter().any(|resolved| {
            resolved
                .grant
                .kinds_holding(EntityType::PhoneNumbers, phone_id)
                .contains(&from.kind())
        });
        if blocked {
            return Err(IdentityError::validation(
                "phone_number",
                format!("a {from} phone number is required by an authorized application"),
            ));
        }
    }
    Ok(holders
        .iter()
        .map(|resolved| IdentityTag {
            key: resolved.key(),
            real_id: phone_id,
            tag: to.kind(),
        })
        .collect())
}

fn envelope(client: &ClientRecord, handler_url: &str, notification: Notification) -> PendingEnvelope {
    PendingEnvelope {
        client_secret: client.client_secret.clone(),
        handler_url: handler_url.to_string(),
        notification,
    }
}
