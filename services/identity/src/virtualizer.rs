//! Per-(user, client) translation between real ids and the fake ids clients see.
//!
//! # Purpose
//! A client never receives a real id. The first time an entity is granted to a client an
//! identity record is created with a random fake id; later grants of the same entity only
//! add a tag. Test-session records reuse the synthetic entity id as the fake id, and on
//! conversion to a real account those fake ids are carried over role by role so the client
//! keeps seeing the same ids.
use crate::error::{IdentityError, IdentityResult};
use crate::model::{
    EntityIdentityRecord, EntityKind, EntityType, GrantRecord, IdentityUpsert, UserClientKey,
};
use crate::store::IdentityProviderStore;
use futures::future::join_all;
use masque_common::{EntityId, FakeId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

/// Which id [`resolve`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdDirection {
    Real,
    Fake,
}

/// Find an id among the identity records of one (user, client) pair.
///
/// With `given`, the record whose opposite id equals `given` is selected and its
/// `direction` id returned. Without it, the first record of the type wins. Records match
/// a type when one of their tags names it. No match is `None`.
pub fn resolve(
    records: &[EntityIdentityRecord],
    entity_type: EntityType,
    direction: IdDirection,
    given: Option<Uuid>,
) -> Option<Uuid> {
    records
        .iter()
        .filter(|record| record.represents(entity_type))
        .find(|record| match (given, direction) {
            (None, _) => true,
            (Some(id), IdDirection::Fake) => record.real_id.as_uuid() == id,
            (Some(id), IdDirection::Real) => record.fake_id.as_uuid() == id,
        })
        .map(|record| match direction {
            IdDirection::Real => record.real_id.as_uuid(),
            IdDirection::Fake => record.fake_id.as_uuid(),
        })
}

pub fn fake_id_of(
    records: &[EntityIdentityRecord],
    entity_type: EntityType,
    real_id: EntityId,
) -> Option<FakeId> {
    resolve(records, entity_type, IdDirection::Fake, Some(real_id.as_uuid()))
        .map(FakeId::from_uuid)
}

pub fn real_id_of(
    records: &[EntityIdentityRecord],
    entity_type: EntityType,
    fake_id: FakeId,
) -> Option<EntityId> {
    resolve(records, entity_type, IdDirection::Real, Some(fake_id.as_uuid()))
        .map(EntityId::from_uuid)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Real,
    Test,
}

impl Mode {
    fn label(&self) -> &'static str {
        match self {
            Mode::Real => "real",
            Mode::Test => "test",
        }
    }
}

/// Loaded identity records of one pair.
#[derive(Debug, Clone)]
pub struct IdentityMap {
    key: UserClientKey,
    records: Vec<EntityIdentityRecord>,
}

impl IdentityMap {
    pub fn new(key: UserClientKey, records: Vec<EntityIdentityRecord>) -> Self {
        Self { key, records }
    }

    pub fn records(&self) -> &[EntityIdentityRecord] {
        &self.records
    }

    /// Apply an upsert that is not written yet, the way the store will apply it.
    pub fn stage(&mut self, upsert: &IdentityUpsert) {
        if upsert.key != self.key {
            return;
        }
        match self.records.iter_mut().find(|r| r.real_id == upsert.real_id) {
            Some(record) => {
                record.tags.insert(upsert.tag);
            }
            None => self.records.push(EntityIdentityRecord {
                user_id: upsert.key.user_id,
                client_id: upsert.key.client_id,
                real_id: upsert.real_id,
                fake_id: upsert.fake_id,
                tags: [upsert.tag].into(),
                uses_test_account: upsert.uses_test_account,
            }),
        }
    }

    /// Fake id of an entity the caller knows was granted. Absence is a bookkeeping bug.
    pub fn fake_id(&self, kind: EntityKind, real_id: EntityId) -> IdentityResult<FakeId> {
        fake_id_of(&self.records, kind.entity_type(), real_id).ok_or_else(|| {
            tracing::error!(
                user_id = %self.key.user_id,
                client_id = %self.key.client_id,
                %kind,
                %real_id,
                "fake id missing for granted entity"
            );
            IdentityError::MissingFakeId {
                user_id: self.key.user_id,
                client_id: self.key.client_id,
                kind,
                real_id,
            }
        })
    }

    pub fn user_fake_id(&self) -> IdentityResult<FakeId> {
        self.fake_id(EntityKind::Users, self.key.user_id.into())
    }

    /// Real id behind a client-provided fake id.
    pub fn real_id(&self, entity_type: EntityType, fake_id: FakeId) -> IdentityResult<EntityId> {
        real_id_of(&self.records, entity_type, fake_id)
            .ok_or_else(|| IdentityError::unknown_entity(entity_type, fake_id))
    }
}

pub struct IdentityVirtualizer {
    store: Arc<dyn IdentityProviderStore>,
}

impl IdentityVirtualizer {
    pub fn new(store: Arc<dyn IdentityProviderStore>) -> Self {
        Self { store }
    }

    /// Idempotent: returns the existing fake id, or mints one.
    pub async fn ensure(
        &self,
        key: UserClientKey,
        kind: EntityKind,
        real_id: EntityId,
    ) -> IdentityResult<FakeId> {
        self.upsert(key, kind, real_id, FakeId::new(), Mode::Real)
            .await
    }

    /// Test-session variant: the synthetic entity id doubles as the fake id, except for
    /// the user itself which always gets a dedicated id.
    pub async fn ensure_test(
        &self,
        key: UserClientKey,
        kind: EntityKind,
        test_id: EntityId,
    ) -> IdentityResult<FakeId> {
        let fake_id = match kind {
            EntityKind::Users => FakeId::new(),
            _ => test_id.as_fake(),
        };
        self.upsert(key, kind, test_id, fake_id, Mode::Test).await
    }

    /// Ensure every `(kind, real id)` in parallel. All writes are attempted; failures are
    /// reported together.
    pub async fn ensure_all(
        &self,
        key: UserClientKey,
        entities: &[(EntityKind, EntityId)],
    ) -> IdentityResult<Vec<FakeId>> {
        let results = join_all(
            entities
                .iter()
                .map(|(kind, real_id)| self.ensure(key, *kind, *real_id)),
        )
        .await;
        IdentityError::collect(results)
    }

    pub async fn ensure_all_test(
        &self,
        key: UserClientKey,
        entities: &[(EntityKind, EntityId)],
    ) -> IdentityResult<Vec<FakeId>> {
        let results = join_all(
            entities
                .iter()
                .map(|(kind, test_id)| self.ensure_test(key, *kind, *test_id)),
        )
        .await;
        IdentityError::collect(results)
    }

    /// Replace the test-session records of a pair by records for the real grant.
    ///
    /// Test records are deleted first. Each new record takes the fake id of a deleted test
    /// record of the same entity type, so the client keeps its ids across the switch.
    pub async fn convert_test_account(
        &self,
        key: UserClientKey,
        grant: &GrantRecord,
    ) -> IdentityResult<Vec<EntityIdentityRecord>> {
        let deleted = self.store.delete_test_identities(key).await?;
        let mut seeds: HashMap<EntityType, VecDeque<FakeId>> = HashMap::new();
        for record in &deleted {
            if let Some(role) = record.tags.iter().next().map(EntityKind::entity_type) {
                seeds.entry(role).or_default().push_back(record.fake_id);
            }
        }

        let mut wanted = vec![(EntityKind::Users, EntityId::from(key.user_id))];
        for (kind, ids) in &grant.entities {
            wanted.extend(ids.iter().map(|id| (*kind, *id)));
        }
        // One seed per real id, even when it is granted under several kinds.
        let mut assigned: HashMap<EntityId, FakeId> = HashMap::new();
        let mut upserts = Vec::with_capacity(wanted.len());
        for (kind, real_id) in wanted {
            let fake_id = *assigned.entry(real_id).or_insert_with(|| {
                seeds
                    .get_mut(&kind.entity_type())
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(FakeId::new)
            });
            upserts.push(IdentityUpsert {
                key,
                real_id,
                tag: kind,
                fake_id,
                uses_test_account: false,
            });
        }
        tracing::debug!(
            user_id = %key.user_id,
            client_id = %key.client_id,
            removed = deleted.len(),
            created = upserts.len(),
            "converting test identities"
        );
        // Records sharing a real id must not race on insert: the first write per id
        // creates the record, later kinds only add tags.
        let (first, rest): (Vec<_>, Vec<_>) = {
            let mut seen = HashSet::new();
            upserts
                .into_iter()
                .partition(|upsert| seen.insert(upsert.real_id))
        };
        let results = join_all(first.into_iter().map(|upsert| self.store_upsert(upsert))).await;
        let mut records = IdentityError::collect(results)?;
        let results = join_all(rest.into_iter().map(|upsert| self.store_upsert(upsert))).await;
        records.extend(IdentityError::collect(results)?);
        metrics::counter!("masque_test_conversions_total").increment(1);
        Ok(records)
    }

    pub async fn identity_map(&self, key: UserClientKey) -> IdentityResult<IdentityMap> {
        let records = self.store.list_identities(key).await?;
        Ok(IdentityMap::new(key, records))
    }

    async fn upsert(
        &self,
        key: UserClientKey,
        kind: EntityKind,
        real_id: EntityId,
        fake_id: FakeId,
        mode: Mode,
    ) -> IdentityResult<FakeId> {
        let record = self
            .store_upsert(IdentityUpsert {
                key,
                real_id,
                tag: kind,
                fake_id,
                uses_test_account: mode == Mode::Test,
            })
            .await?;
        metrics::counter!("masque_identity_ensures_total", "mode" => mode.label()).increment(1);
        Ok(record.fake_id)
    }

    async fn store_upsert(&self, upsert: IdentityUpsert) -> IdentityResult<EntityIdentityRecord> {
        Ok(self.store.upsert_identity(upsert).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use masque_common::{ClientId, UserId};

    fn setup() -> (IdentityVirtualizer, UserClientKey) {
        let store: Arc<dyn IdentityProviderStore> = Arc::new(InMemoryStore::default());
        (
            IdentityVirtualizer::new(store),
            UserClientKey::new(UserId::new(), ClientId::new()),
        )
    }

    #[tokio::test]
    async fn ensure_is_idempotent_and_round_trips() {
        let (virtualizer, key) = setup();
        let email = EntityId::new();
        let first = virtualizer
            .ensure(key, EntityKind::Emails, email)
            .await
            .expect("ensure");
        let second = virtualizer
            .ensure(key, EntityKind::Emails, email)
            .await
            .expect("ensure again");
        assert_eq!(first, second);

        let map = virtualizer.identity_map(key).await.expect("map");
        let fake = resolve(
            map.records(),
            EntityType::Emails,
            IdDirection::Fake,
            Some(email.as_uuid()),
        );
        assert_eq!(fake, Some(first.as_uuid()));
        let real = resolve(
            map.records(),
            EntityType::Emails,
            IdDirection::Real,
            Some(first.as_uuid()),
        );
        assert_eq!(real, Some(email.as_uuid()));
        assert_ne!(first.as_uuid(), email.as_uuid());
    }

    #[tokio::test]
    async fn resolve_without_id_returns_first_of_type() {
        let (virtualizer, key) = setup();
        let address = EntityId::new();
        virtualizer
            .ensure(key, EntityKind::Users, key.user_id.into())
            .await
            .expect("user");
        let fake = virtualizer
            .ensure(key, EntityKind::Addresses, address)
            .await
            .expect("address");
        let map = virtualizer.identity_map(key).await.expect("map");
        assert_eq!(
            resolve(map.records(), EntityType::Addresses, IdDirection::Fake, None),
            Some(fake.as_uuid())
        );
        assert_eq!(
            resolve(map.records(), EntityType::Emails, IdDirection::Fake, None),
            None
        );
    }

    #[tokio::test]
    async fn missing_fake_id_is_an_invariant_error() {
        let (virtualizer, key) = setup();
        let map = virtualizer.identity_map(key).await.expect("map");
        let err = map
            .fake_id(EntityKind::Emails, EntityId::new())
            .expect_err("missing");
        assert!(matches!(err, IdentityError::MissingFakeId { .. }));
        let err = map
            .real_id(EntityType::Emails, FakeId::new())
            .expect_err("unknown");
        assert!(matches!(err, IdentityError::NotFound(_)));
    }

    #[tokio::test]
    async fn staged_upserts_resolve_before_they_are_written() {
        let (virtualizer, key) = setup();
        let phone = EntityId::new();
        let fake = virtualizer
            .ensure(key, EntityKind::UnknownPhoneNumbers, phone)
            .await
            .expect("phone");
        let mut map = virtualizer.identity_map(key).await.expect("map");
        let address = EntityId::new();
        let minted = FakeId::new();
        for upsert in [
            IdentityUpsert {
                key,
                real_id: address,
                tag: EntityKind::Addresses,
                fake_id: minted,
                uses_test_account: false,
            },
            IdentityUpsert {
                key,
                real_id: phone,
                tag: EntityKind::MobilePhoneNumbers,
                fake_id: FakeId::new(),
                uses_test_account: false,
            },
            IdentityUpsert {
                key: UserClientKey::new(key.user_id, ClientId::new()),
                real_id: EntityId::new(),
                tag: EntityKind::Emails,
                fake_id: FakeId::new(),
                uses_test_account: false,
            },
        ] {
            map.stage(&upsert);
        }
        assert_eq!(map.records().len(), 2);
        assert_eq!(map.fake_id(EntityKind::Addresses, address).expect("staged"), minted);
        assert_eq!(
            map.fake_id(EntityKind::MobilePhoneNumbers, phone).expect("tagged"),
            fake
        );
        assert!(virtualizer.identity_map(key).await.expect("map").records().len() == 1);
    }

    #[tokio::test]
    async fn test_identities_reuse_test_ids_except_users() {
        let (virtualizer, key) = setup();
        let test_email = EntityId::new();
        let fake = virtualizer
            .ensure_test(key, EntityKind::Emails, test_email)
            .await
            .expect("email");
        assert_eq!(fake, test_email.as_fake());
        let test_user = EntityId::new();
        let fake_user = virtualizer
            .ensure_test(key, EntityKind::Users, test_user)
            .await
            .expect("user");
        assert_ne!(fake_user, test_user.as_fake());
    }

    #[tokio::test]
    async fn conversion_carries_fake_ids_over_by_role() {
        let (virtualizer, key) = setup();
        let test_user = EntityId::new();
        let test_phone = EntityId::new();
        let fake_user = virtualizer
            .ensure_test(key, EntityKind::Users, test_user)
            .await
            .expect("user");
        let fake_phone = virtualizer
            .ensure_test(key, EntityKind::MobilePhoneNumbers, test_phone)
            .await
            .expect("phone");

        let real_phone = EntityId::new();
        let mut grant = GrantRecord::new(key);
        grant
            .entities
            .entry(EntityKind::UnknownPhoneNumbers)
            .or_default()
            .insert(real_phone);
        grant
            .entities
            .entry(EntityKind::MobilePhoneNumbers)
            .or_default()
            .insert(real_phone);

        let records = virtualizer
            .convert_test_account(key, &grant)
            .await
            .expect("convert");
        assert!(records.iter().all(|record| !record.uses_test_account));

        let map = virtualizer.identity_map(key).await.expect("map");
        assert_eq!(map.records().len(), 2);
        assert_eq!(map.user_fake_id().expect("user"), fake_user);
        assert_eq!(
            map.fake_id(EntityKind::MobilePhoneNumbers, real_phone)
                .expect("phone"),
            fake_phone
        );
        let phone = map
            .records()
            .iter()
            .find(|record| record.real_id == real_phone)
            .expect("phone record");
        assert!(phone.has_tag(EntityKind::UnknownPhoneNumbers));
        assert!(phone.has_tag(EntityKind::MobilePhoneNumbers));
    }

    #[tokio::test]
    async fn ensure_all_aggregates_failures() {
        let (virtualizer, key) = setup();
        // Pre-occupy two fake ids so the test-mode writes collide.
        let taken_a = EntityId::new();
        let taken_b = EntityId::new();
        virtualizer
            .ensure_test(key, EntityKind::Emails, taken_a)
            .await
            .expect("a");
        virtualizer
            .ensure_test(key, EntityKind::Addresses, taken_b)
            .await
            .expect("b");
        let other = UserClientKey::new(UserId::new(), key.client_id);
        let results = virtualizer
            .ensure_all_test(
                other,
                &[
                    (EntityKind::Emails, taken_a),
                    (EntityKind::Addresses, taken_b),
                    (EntityKind::Emails, EntityId::new()),
                ],
            )
            .await;
        match results {
            Err(IdentityError::Aggregate(failures)) => {
                assert_eq!(failures.len(), 2);
                assert!(
                    failures
                        .iter()
                        .all(|err| matches!(err, IdentityError::Conflict(_)))
                );
            }
            other => panic!("expected aggregate, got {other:?}"),
        }
        assert_eq!(
            virtualizer
                .identity_map(other)
                .await
                .expect("map")
                .records()
                .len(),
            1
        );
    }
}
