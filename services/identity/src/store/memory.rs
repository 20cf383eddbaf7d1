//! In-memory implementation of the identity-provider store.
//!
//! # Purpose
//! Implements every store trait with `HashMap`s guarded by `tokio::sync::RwLock`. Used for
//! local development, tests, and deployments that do not need durability.
//!
//! # Durability and consistency
//! - **Not durable**: all state is lost on process restart.
//! - Each operation holds the write lock of the map it mutates for its whole duration, so
//!   upsert-with-merge and conditional status transitions are atomic within one process.
//! - [`EntityStore::commit_mutation`] takes the entity, identity, grant, status and
//!   pending locks in that order, validates everything, then writes. No other operation
//!   holds two of these locks at once.
//! - Client deletion cascades by scanning keys, which is fine for dev-sized data sets.
use super::{
    ClientStore, EntityMutation, EntityStore, EntityWrite, GrantStore, IdentityProviderStore,
    IdentityStore, NotificationStore, StatusStore, StoreError, StoreResult, TestAccountStore,
};
use crate::model::{
    ClientRecord, DeliveryKey, EntityIdentityRecord, EntityRecord, GrantMerge, GrantRecord,
    IdentityUpsert, PendingAppend, PendingEnvelope, Scope, StatusTransition, TestAccount,
    TransitionOutcome, UserClientKey, UserStatusRecord,
};
use async_trait::async_trait;
use masque_common::{ClientId, EntityId, FakeId, UserId};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

type Identities = HashMap<UserClientKey, Vec<EntityIdentityRecord>>;

pub struct InMemoryStore {
    clients: Arc<RwLock<HashMap<ClientId, ClientRecord>>>,
    entities: Arc<RwLock<HashMap<EntityId, EntityRecord>>>,
    /// Identity records per (user, client), in insertion order.
    identities: Arc<RwLock<Identities>>,
    grants: Arc<RwLock<HashMap<UserClientKey, GrantRecord>>>,
    statuses: Arc<RwLock<HashMap<UserClientKey, UserStatusRecord>>>,
    /// Envelopes per delivery key in append order.
    pending: Arc<RwLock<HashMap<DeliveryKey, Vec<PendingEnvelope>>>>,
    test_accounts: Arc<RwLock<HashMap<UserClientKey, TestAccount>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            entities: Arc::new(RwLock::new(HashMap::new())),
            identities: Arc::new(RwLock::new(HashMap::new())),
            grants: Arc::new(RwLock::new(HashMap::new())),
            statuses: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(RwLock::new(HashMap::new())),
            test_accounts: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn identity_count(identities: &Identities) -> usize {
    identities.values().map(Vec::len).sum()
}

fn fake_id_issued(identities: &Identities, client_id: ClientId, fake_id: FakeId) -> bool {
    identities
        .iter()
        .filter(|(key, _)| key.client_id == client_id)
        .flat_map(|(_, records)| records.iter())
        .any(|record| record.fake_id == fake_id)
}

fn has_identity(identities: &Identities, key: UserClientKey, real_id: EntityId) -> bool {
    identities
        .get(&key)
        .is_some_and(|records| records.iter().any(|r| r.real_id == real_id))
}

/// Insert the record or add the tag. The caller has checked the fake id.
fn apply_upsert(identities: &mut Identities, upsert: IdentityUpsert) -> EntityIdentityRecord {
    let records = identities.entry(upsert.key).or_default();
    if let Some(record) = records.iter_mut().find(|r| r.real_id == upsert.real_id) {
        record.tags.insert(upsert.tag);
        return record.clone();
    }
    let record = EntityIdentityRecord {
        user_id: upsert.key.user_id,
        client_id: upsert.key.client_id,
        real_id: upsert.real_id,
        fake_id: upsert.fake_id,
        tags: BTreeSet::from([upsert.tag]),
        uses_test_account: upsert.uses_test_account,
    };
    records.push(record.clone());
    record
}

fn apply_transition(
    statuses: &mut HashMap<UserClientKey, UserStatusRecord>,
    key: UserClientKey,
    transition: &StatusTransition,
) -> TransitionOutcome {
    let Some(record) = statuses.get_mut(&key) else {
        return TransitionOutcome::Missing;
    };
    let current = record.status;
    if record.apply(transition) {
        TransitionOutcome::Applied
    } else {
        TransitionOutcome::Dropped { current }
    }
}

#[async_trait]
impl ClientStore for InMemoryStore {
    async fn create_client(&self, client: ClientRecord) -> StoreResult<ClientRecord> {
        let mut clients = self.clients.write().await;
        if clients.contains_key(&client.client_id) {
            return Err(StoreError::Conflict("client exists".into()));
        }
        clients.insert(client.client_id, client.clone());
        metrics::gauge!("masque_clients_total").set(clients.len() as f64);
        Ok(client)
    }

    async fn get_client(&self, client_id: ClientId) -> StoreResult<ClientRecord> {
        self.clients
            .read()
            .await
            .get(&client_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("client".into()))
    }

    async fn list_clients(&self, client_ids: &[ClientId]) -> StoreResult<Vec<ClientRecord>> {
        let clients = self.clients.read().await;
        Ok(client_ids
            .iter()
            .filter_map(|id| clients.get(id).cloned())
            .collect())
    }

    async fn delete_client(&self, client_id: ClientId) -> StoreResult<()> {
        let mut clients = self.clients.write().await;
        if clients.remove(&client_id).is_none() {
            return Err(StoreError::NotFound("client".into()));
        }
        metrics::gauge!("masque_clients_total").set(clients.len() as f64);
        drop(clients);
        // Cascade to every per-(user, client) record of this client.
        let mut identities = self.identities.write().await;
        identities.retain(|key, _| key.client_id != client_id);
        metrics::gauge!("masque_identity_records_total").set(identity_count(&identities) as f64);
        drop(identities);
        self.grants
            .write()
            .await
            .retain(|key, _| key.client_id != client_id);
        self.statuses
            .write()
            .await
            .retain(|key, _| key.client_id != client_id);
        self.test_accounts
            .write()
            .await
            .retain(|key, _| key.client_id != client_id);
        self.pending
            .write()
            .await
            .retain(|key, _| key.client_id != client_id);
        Ok(())
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn find_entity(&self, entity_id: EntityId) -> StoreResult<Option<EntityRecord>> {
        Ok(self.entities.read().await.get(&entity_id).cloned())
    }

    async fn commit_mutation(
        &self,
        mutation: EntityMutation,
    ) -> StoreResult<Vec<TransitionOutcome>> {
        let mut entities = self.entities.write().await;
        let mut identities = self.identities.write().await;
        let mut grants = self.grants.write().await;
        let mut statuses = self.statuses.write().await;
        let mut pending = self.pending.write().await;

        // Validate everything before the first write.
        match &mutation.write {
            EntityWrite::Put(entity) => {
                if entities
                    .get(&entity.id)
                    .is_some_and(|existing| existing.user_id != entity.user_id)
                {
                    return Err(StoreError::Conflict("entity belongs to another user".into()));
                }
            }
            EntityWrite::Delete(entity_id) => {
                if !entities.contains_key(entity_id) {
                    return Err(StoreError::NotFound("entity".into()));
                }
            }
        }
        if mutation
            .grant_additions
            .iter()
            .any(|addition| !grants.contains_key(&addition.key))
        {
            return Err(StoreError::NotFound("grant".into()));
        }
        let mut staged: HashSet<(UserClientKey, EntityId)> = HashSet::new();
        let mut issued: HashSet<(ClientId, FakeId)> = HashSet::new();
        for upsert in &mutation.identities {
            if has_identity(&identities, upsert.key, upsert.real_id)
                || !staged.insert((upsert.key, upsert.real_id))
            {
                continue;
            }
            if !issued.insert((upsert.key.client_id, upsert.fake_id))
                || fake_id_issued(&identities, upsert.key.client_id, upsert.fake_id)
            {
                return Err(StoreError::Conflict("fake id already issued for client".into()));
            }
        }

        match mutation.write {
            EntityWrite::Put(entity) => {
                entities.insert(entity.id, entity);
            }
            EntityWrite::Delete(entity_id) => {
                entities.remove(&entity_id);
            }
        }
        for addition in &mutation.grant_additions {
            if let Some(grant) = grants.get_mut(&addition.key) {
                grant
                    .entities
                    .entry(addition.kind)
                    .or_default()
                    .insert(addition.entity_id);
            }
        }
        for upsert in mutation.identities {
            apply_upsert(&mut identities, upsert);
        }
        for tag in &mutation.identity_tags {
            if let Some(record) = identities
                .get_mut(&tag.key)
                .and_then(|records| records.iter_mut().find(|r| r.real_id == tag.real_id))
            {
                record.tags.insert(tag.tag);
            }
        }
        metrics::gauge!("masque_identity_records_total").set(identity_count(&identities) as f64);
        let appended = mutation.pending.len() as u64;
        for item in mutation.pending {
            pending.entry(item.key).or_default().push(item.envelope);
        }
        metrics::counter!("masque_pending_notifications_total").increment(appended);
        Ok(mutation
            .transitions
            .iter()
            .map(|(key, transition)| apply_transition(&mut statuses, *key, transition))
            .collect())
    }
}

#[async_trait]
impl IdentityStore for InMemoryStore {
    async fn upsert_identity(&self, upsert: IdentityUpsert) -> StoreResult<EntityIdentityRecord> {
        let mut identities = self.identities.write().await;
        if !has_identity(&identities, upsert.key, upsert.real_id)
            && fake_id_issued(&identities, upsert.key.client_id, upsert.fake_id)
        {
            return Err(StoreError::Conflict("fake id already issued for client".into()));
        }
        let record = apply_upsert(&mut identities, upsert);
        metrics::gauge!("masque_identity_records_total").set(identity_count(&identities) as f64);
        Ok(record)
    }

    async fn list_identities(&self, key: UserClientKey) -> StoreResult<Vec<EntityIdentityRecord>> {
        Ok(self
            .identities
            .read()
            .await
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_test_identities(
        &self,
        key: UserClientKey,
    ) -> StoreResult<Vec<EntityIdentityRecord>> {
        let mut identities = self.identities.write().await;
        let Some(records) = identities.get_mut(&key) else {
            return Ok(Vec::new());
        };
        let (deleted, kept): (Vec<_>, Vec<_>) = records
            .drain(..)
            .partition(|record| record.uses_test_account);
        *records = kept;
        if records.is_empty() {
            identities.remove(&key);
        }
        metrics::gauge!("masque_identity_records_total").set(identity_count(&identities) as f64);
        Ok(deleted)
    }

    async fn delete_identities(&self, key: UserClientKey) -> StoreResult<u64> {
        let mut identities = self.identities.write().await;
        let removed = identities.remove(&key).map(|r| r.len()).unwrap_or(0);
        metrics::gauge!("masque_identity_records_total").set(identity_count(&identities) as f64);
        Ok(removed as u64)
    }
}

#[async_trait]
impl GrantStore for InMemoryStore {
    async fn merge_grant(&self, grant: GrantRecord) -> StoreResult<GrantMerge> {
        let key = grant.key();
        let mut grants = self.grants.write().await;
        match grants.get_mut(&key) {
            Some(existing) => {
                let delta = existing.absorb(&grant);
                metrics::counter!("masque_grant_merges_total", "op" => "merged").increment(1);
                Ok(GrantMerge {
                    grant: existing.clone(),
                    created: false,
                    delta,
                })
            }
            None => {
                let mut created = GrantRecord::new(key);
                let delta = created.absorb(&grant);
                grants.insert(key, created.clone());
                metrics::counter!("masque_grant_merges_total", "op" => "created").increment(1);
                Ok(GrantMerge {
                    grant: created,
                    created: true,
                    delta,
                })
            }
        }
    }

    async fn find_grant(&self, key: UserClientKey) -> StoreResult<Option<GrantRecord>> {
        Ok(self.grants.read().await.get(&key).cloned())
    }

    async fn list_grants_for_user(&self, user_id: UserId) -> StoreResult<Vec<GrantRecord>> {
        let mut grants: Vec<_> = self
            .grants
            .read()
            .await
            .values()
            .filter(|grant| grant.user_id == user_id)
            .cloned()
            .collect();
        grants.sort_by_key(|grant| grant.client_id);
        Ok(grants)
    }

    async fn delete_grant(&self, key: UserClientKey) -> StoreResult<()> {
        self.grants.write().await.remove(&key);
        Ok(())
    }
}

#[async_trait]
impl StatusStore for InMemoryStore {
    async fn insert_status_if_absent(&self, record: UserStatusRecord) -> StoreResult<bool> {
        let mut statuses = self.statuses.write().await;
        let key = record.key();
        if statuses.contains_key(&key) {
            return Ok(false);
        }
        statuses.insert(key, record);
        Ok(true)
    }

    async fn find_status(&self, key: UserClientKey) -> StoreResult<Option<UserStatusRecord>> {
        Ok(self.statuses.read().await.get(&key).cloned())
    }

    async fn transition_status(
        &self,
        key: UserClientKey,
        transition: &StatusTransition,
    ) -> StoreResult<TransitionOutcome> {
        // Check and write under one write lock: concurrent transitions serialize here.
        let mut statuses = self.statuses.write().await;
        Ok(apply_transition(&mut statuses, key, transition))
    }

    async fn reset_status(&self, key: UserClientKey, served: &Scope) -> StoreResult<()> {
        let mut statuses = self.statuses.write().await;
        let record = statuses
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound("status".into()))?;
        record.mark_served(served);
        Ok(())
    }

    async fn set_use_test_account(&self, key: UserClientKey, value: bool) -> StoreResult<()> {
        let mut statuses = self.statuses.write().await;
        let record = statuses
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound("status".into()))?;
        record.use_test_account = value;
        Ok(())
    }

    async fn delete_status(&self, key: UserClientKey) -> StoreResult<()> {
        self.statuses.write().await.remove(&key);
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for InMemoryStore {
    async fn append_pending(&self, batch: Vec<PendingAppend>) -> StoreResult<()> {
        let mut pending = self.pending.write().await;
        let appended = batch.len() as u64;
        for item in batch {
            pending.entry(item.key).or_default().push(item.envelope);
        }
        metrics::counter!("masque_pending_notifications_total").increment(appended);
        Ok(())
    }

    async fn list_pending(&self, key: DeliveryKey) -> StoreResult<Vec<PendingEnvelope>> {
        Ok(self
            .pending
            .read()
            .await
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl TestAccountStore for InMemoryStore {
    async fn put_test_account(&self, account: TestAccount) -> StoreResult<()> {
        self.test_accounts.write().await.insert(account.key, account);
        Ok(())
    }

    async fn find_test_account(&self, key: UserClientKey) -> StoreResult<Option<TestAccount>> {
        Ok(self.test_accounts.read().await.get(&key).cloned())
    }

    async fn delete_test_account(&self, key: UserClientKey) -> StoreResult<()> {
        self.test_accounts.write().await.remove(&key);
        Ok(())
    }
}

#[async_trait]
impl IdentityProviderStore for InMemoryStore {
    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    /// In-memory state does not survive a restart.
    fn is_durable(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Email, EntityBody, EntityKind, EventType, Notification, ScopeField, StatusDelta,
        UserStatus,
    };
    use crate::store::{GrantAddition, IdentityTag};

    fn key() -> UserClientKey {
        UserClientKey::new(UserId::new(), ClientId::new())
    }

    fn upsert(key: UserClientKey, real_id: EntityId, tag: EntityKind) -> IdentityUpsert {
        IdentityUpsert {
            key,
            real_id,
            tag,
            fake_id: FakeId::new(),
            uses_test_account: false,
        }
    }

    fn envelope(user: FakeId) -> PendingEnvelope {
        PendingEnvelope {
            client_secret: "secret".into(),
            handler_url: "https://client.test/hook".into(),
            notification: Notification::new(EventType::UserDidUpdatePersonalInformation, user),
        }
    }

    #[tokio::test]
    async fn upsert_keeps_first_fake_id_and_unions_tags() {
        let store = InMemoryStore::default();
        let key = key();
        let phone = EntityId::new();
        let first = store
            .upsert_identity(upsert(key, phone, EntityKind::UnknownPhoneNumbers))
            .await
            .expect("insert");
        let second = store
            .upsert_identity(upsert(key, phone, EntityKind::MobilePhoneNumbers))
            .await
            .expect("merge");
        assert_eq!(first.fake_id, second.fake_id);
        assert_eq!(second.tags.len(), 2);
        assert_eq!(store.list_identities(key).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn duplicate_fake_id_within_client_conflicts() {
        let store = InMemoryStore::default();
        let client = ClientId::new();
        let fake = FakeId::new();
        let mut first = upsert(UserClientKey::new(UserId::new(), client), EntityId::new(), EntityKind::Emails);
        first.fake_id = fake;
        store.upsert_identity(first).await.expect("insert");
        let mut second = upsert(UserClientKey::new(UserId::new(), client), EntityId::new(), EntityKind::Emails);
        second.fake_id = fake;
        let err = store.upsert_identity(second).await.expect_err("conflict");
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_test_identities_returns_only_test_rows() {
        let store = InMemoryStore::default();
        let key = key();
        let mut test_row = upsert(key, EntityId::new(), EntityKind::Emails);
        test_row.uses_test_account = true;
        store.upsert_identity(test_row).await.expect("test row");
        store
            .upsert_identity(upsert(key, EntityId::new(), EntityKind::Addresses))
            .await
            .expect("real row");
        let deleted = store.delete_test_identities(key).await.expect("delete");
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].uses_test_account);
        let left = store.list_identities(key).await.expect("list");
        assert_eq!(left.len(), 1);
        assert!(!left[0].uses_test_account);
    }

    #[tokio::test]
    async fn conditional_transition_is_dropped_for_new_user() {
        let store = InMemoryStore::default();
        let key = key();
        store
            .insert_status_if_absent(UserStatusRecord::new(key, false))
            .await
            .expect("insert");
        let transition = StatusTransition {
            to: UserStatus::ExistingUserAfterUpdate,
            delta: StatusDelta::fields([ScopeField::FirstName]),
        };
        let outcome = store.transition_status(key, &transition).await.expect("transition");
        assert_eq!(
            outcome,
            TransitionOutcome::Dropped {
                current: UserStatus::NewUser
            }
        );
        let status = store.find_status(key).await.expect("find").expect("status");
        assert_eq!(status.status, UserStatus::NewUser);
        assert!(status.updated_fields.is_empty());

        store
            .reset_status(key, &Scope::from([ScopeField::FirstName]))
            .await
            .expect("reset");
        let outcome = store.transition_status(key, &transition).await.expect("transition");
        assert_eq!(outcome, TransitionOutcome::Applied);
    }

    #[tokio::test]
    async fn pending_envelopes_are_never_evicted() {
        let store = InMemoryStore::new();
        let user = FakeId::new();
        let key = DeliveryKey::new(ClientId::new(), user);
        for _ in 0..40 {
            store
                .append_pending(vec![PendingAppend {
                    key,
                    envelope: envelope(user),
                }])
                .await
                .expect("append");
        }
        assert_eq!(store.list_pending(key).await.expect("list").len(), 40);
    }

    fn email_record(user: UserId, address: &str) -> EntityRecord {
        EntityRecord::new(
            user,
            EntityBody::Emails(Email {
                address: address.into(),
                ..Email::default()
            }),
        )
    }

    #[tokio::test]
    async fn commit_mutation_writes_every_part() {
        let store = InMemoryStore::default();
        let key = key();
        store.merge_grant(GrantRecord::new(key)).await.expect("grant");
        store
            .insert_status_if_absent(UserStatusRecord::new(key, false))
            .await
            .expect("status");
        store
            .reset_status(key, &Scope::from(ScopeField::ALL))
            .await
            .expect("fetched");
        let entity = email_record(key.user_id, "a@example.com");
        let fake = FakeId::new();
        let mut mutation = EntityMutation::new(EntityWrite::Put(entity.clone()));
        mutation.grant_additions.push(GrantAddition {
            key,
            kind: EntityKind::Emails,
            entity_id: entity.id,
        });
        mutation.identities.push(IdentityUpsert {
            fake_id: fake,
            ..upsert(key, entity.id, EntityKind::Emails)
        });
        let delivery = DeliveryKey::new(key.client_id, fake);
        mutation.pending.push(PendingAppend {
            key: delivery,
            envelope: envelope(fake),
        });
        mutation.transitions.push((
            key,
            StatusTransition {
                to: UserStatus::ExistingUserAfterUpdate,
                delta: StatusDelta::fields([ScopeField::Emails]),
            },
        ));

        let outcomes = store.commit_mutation(mutation).await.expect("commit");
        assert_eq!(outcomes, vec![TransitionOutcome::Applied]);
        assert_eq!(store.find_entity(entity.id).await.expect("find"), Some(entity.clone()));
        let grant = store.find_grant(key).await.expect("find").expect("grant");
        assert!(grant.entities[&EntityKind::Emails].contains(&entity.id));
        assert_eq!(store.list_identities(key).await.expect("ids")[0].fake_id, fake);
        assert_eq!(store.list_pending(delivery).await.expect("pending").len(), 1);
    }

    #[tokio::test]
    async fn failed_commit_writes_nothing() {
        let store = InMemoryStore::default();
        let key = key();
        let entity = email_record(key.user_id, "a@example.com");
        let fake = FakeId::new();
        let mut mutation = EntityMutation::new(EntityWrite::Put(entity.clone()));
        mutation.identities.push(upsert(key, entity.id, EntityKind::Emails));
        mutation.pending.push(PendingAppend {
            key: DeliveryKey::new(key.client_id, fake),
            envelope: envelope(fake),
        });
        // No grant row for the pair.
        mutation.grant_additions.push(GrantAddition {
            key,
            kind: EntityKind::Emails,
            entity_id: entity.id,
        });

        let err = store.commit_mutation(mutation).await.expect_err("no grant");
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.find_entity(entity.id).await.expect("find").is_none());
        assert!(store.list_identities(key).await.expect("ids").is_empty());
        assert!(
            store
                .list_pending(DeliveryKey::new(key.client_id, fake))
                .await
                .expect("pending")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn commit_rejects_foreign_entity_and_missing_delete() {
        let store = InMemoryStore::default();
        let entity = email_record(UserId::new(), "a@example.com");
        store
            .commit_mutation(EntityMutation::new(EntityWrite::Put(entity.clone())))
            .await
            .expect("create");
        let stolen = EntityRecord {
            user_id: UserId::new(),
            ..entity.clone()
        };
        let err = store
            .commit_mutation(EntityMutation::new(EntityWrite::Put(stolen)))
            .await
            .expect_err("foreign");
        assert!(matches!(err, StoreError::Conflict(_)));

        store
            .commit_mutation(EntityMutation::new(EntityWrite::Delete(entity.id)))
            .await
            .expect("delete");
        let err = store
            .commit_mutation(EntityMutation::new(EntityWrite::Delete(entity.id)))
            .await
            .expect_err("gone");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn identity_tags_skip_missing_records() {
        let store = InMemoryStore::default();
        let key = key();
        let phone = EntityId::new();
        store
            .upsert_identity(upsert(key, phone, EntityKind::UnknownPhoneNumbers))
            .await
            .expect("identity");
        let entity = email_record(key.user_id, "a@example.com");
        let mut mutation = EntityMutation::new(EntityWrite::Put(entity));
        mutation.identity_tags = vec![
            IdentityTag {
                key,
                real_id: phone,
                tag: EntityKind::MobilePhoneNumbers,
            },
            IdentityTag {
                key,
                real_id: EntityId::new(),
                tag: EntityKind::MobilePhoneNumbers,
            },
        ];
        store.commit_mutation(mutation).await.expect("commit");
        let records = store.list_identities(key).await.expect("ids");
        assert_eq!(records.len(), 1);
        assert!(records[0].has_tag(EntityKind::MobilePhoneNumbers));
        assert!(records[0].has_tag(EntityKind::UnknownPhoneNumbers));
    }

    #[tokio::test]
    async fn delete_client_cascades() {
        let store = InMemoryStore::default();
        let client = store
            .create_client(ClientRecord::register("shop", None))
            .await
            .expect("client");
        let key = UserClientKey::new(UserId::new(), client.client_id);
        store
            .upsert_identity(upsert(key, key.user_id.into(), EntityKind::Users))
            .await
            .expect("identity");
        store.merge_grant(GrantRecord::new(key)).await.expect("grant");
        store
            .insert_status_if_absent(UserStatusRecord::new(key, false))
            .await
            .expect("status");

        store.delete_client(client.client_id).await.expect("delete");
        assert!(store.list_identities(key).await.expect("list").is_empty());
        assert!(store.find_grant(key).await.expect("grant").is_none());
        assert!(store.find_status(key).await.expect("status").is_none());
        let err = store.get_client(client.client_id).await.expect_err("gone");
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
