//! Storage seams for the identity provider.
//!
//! # Purpose
//! Every component receives an `Arc<dyn IdentityProviderStore>` at construction. The
//! traits below split the contract by record family; backends implement all of them.
//!
//! # Write semantics
//! - Identity and grant writes are upserts with additive merge. Callers never read a
//!   record, modify it, and write it back.
//! - Status transitions are conditional: the source-state check and the write happen
//!   atomically inside the backend, and a losing writer gets
//!   [`TransitionOutcome::Dropped`].
//! - Pending notifications are appended as one batch; a batch is either fully durable
//!   or not written at all, and nothing is ever evicted.
//! - An entity save or removal is one [`EntityMutation`]: the entity write, the grant and
//!   identity bookkeeping, the pending envelopes and the status transitions commit
//!   together or not at all.
use crate::model::{
    ClientRecord, DeliveryKey, EntityIdentityRecord, EntityKind, EntityRecord, GrantMerge,
    GrantRecord, IdentityUpsert, PendingAppend, PendingEnvelope, Scope, StatusTransition,
    TestAccount, TransitionOutcome, UserClientKey, UserStatusRecord,
};
use async_trait::async_trait;
use masque_common::{ClientId, EntityId, UserId};
use thiserror::Error;

pub mod memory;
pub mod postgres;

/// The entity row an [`EntityMutation`] writes.
#[derive(Debug, Clone)]
pub enum EntityWrite {
    Put(EntityRecord),
    Delete(EntityId),
}

/// A freshly created entity added to a client's grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantAddition {
    pub key: UserClientKey,
    pub kind: EntityKind,
    pub entity_id: EntityId,
}

/// A tag added to an existing identity record. Missing records are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityTag {
    pub key: UserClientKey,
    pub real_id: EntityId,
    pub tag: EntityKind,
}

/// Every write caused by one entity save or removal.
#[derive(Debug, Clone)]
pub struct EntityMutation {
    pub write: EntityWrite,
    pub grant_additions: Vec<GrantAddition>,
    /// Upserted with the semantics of [`IdentityStore::upsert_identity`].
    pub identities: Vec<IdentityUpsert>,
    pub identity_tags: Vec<IdentityTag>,
    pub pending: Vec<PendingAppend>,
    /// Conditional, as in [`StatusStore::transition_status`].
    pub transitions: Vec<(UserClientKey, StatusTransition)>,
}

impl EntityMutation {
    pub fn new(write: EntityWrite) -> Self {
        Self {
            write,
            grant_additions: Vec::new(),
            identities: Vec::new(),
            identity_tags: Vec::new(),
            pending: Vec::new(),
            transitions: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ClientStore: Send + Sync {
    async fn create_client(&self, client: ClientRecord) -> StoreResult<ClientRecord>;
    async fn get_client(&self, client_id: ClientId) -> StoreResult<ClientRecord>;
    /// Clients among `client_ids`; unknown ids are skipped.
    async fn list_clients(&self, client_ids: &[ClientId]) -> StoreResult<Vec<ClientRecord>>;
    /// Removes the client together with every identity, grant, status, test account
    /// and pending notification it owns.
    async fn delete_client(&self, client_id: ClientId) -> StoreResult<()>;
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find_entity(&self, entity_id: EntityId) -> StoreResult<Option<EntityRecord>>;
    /// Apply every write of `mutation` or none of them.
    ///
    /// Putting an entity owned by another user is a conflict, deleting a missing one is
    /// not found, and so is a grant addition for a pair without a grant. Transition
    /// outcomes are returned in the order of `mutation.transitions`.
    async fn commit_mutation(
        &self,
        mutation: EntityMutation,
    ) -> StoreResult<Vec<TransitionOutcome>>;
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Insert the record, or add `tag` to the existing one. Returns the stored record.
    /// A fake id already used by another record of the same client is a conflict.
    async fn upsert_identity(&self, upsert: IdentityUpsert) -> StoreResult<EntityIdentityRecord>;
    /// Records of one (user, client) pair in insertion order.
    async fn list_identities(&self, key: UserClientKey) -> StoreResult<Vec<EntityIdentityRecord>>;
    /// Delete the test-account records of a pair and return them.
    async fn delete_test_identities(
        &self,
        key: UserClientKey,
    ) -> StoreResult<Vec<EntityIdentityRecord>>;
    async fn delete_identities(&self, key: UserClientKey) -> StoreResult<u64>;
}

#[async_trait]
pub trait GrantStore: Send + Sync {
    /// Additive merge: scope, flags and entity sets of `grant` are unioned into the stored one.
    async fn merge_grant(&self, grant: GrantRecord) -> StoreResult<GrantMerge>;
    async fn find_grant(&self, key: UserClientKey) -> StoreResult<Option<GrantRecord>>;
    async fn list_grants_for_user(&self, user_id: UserId) -> StoreResult<Vec<GrantRecord>>;
    async fn delete_grant(&self, key: UserClientKey) -> StoreResult<()>;
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Returns `false` when a record already exists; the existing one is kept.
    async fn insert_status_if_absent(&self, record: UserStatusRecord) -> StoreResult<bool>;
    async fn find_status(&self, key: UserClientKey) -> StoreResult<Option<UserStatusRecord>>;
    async fn transition_status(
        &self,
        key: UserClientKey,
        transition: &StatusTransition,
    ) -> StoreResult<TransitionOutcome>;
    /// The client fetched the fields of `served`: their pending updates are cleared, see
    /// [`UserStatusRecord::mark_served`].
    async fn reset_status(&self, key: UserClientKey, served: &Scope) -> StoreResult<()>;
    async fn set_use_test_account(&self, key: UserClientKey, value: bool) -> StoreResult<()>;
    async fn delete_status(&self, key: UserClientKey) -> StoreResult<()>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn append_pending(&self, batch: Vec<PendingAppend>) -> StoreResult<()>;
    async fn list_pending(&self, key: DeliveryKey) -> StoreResult<Vec<PendingEnvelope>>;
}

#[async_trait]
pub trait TestAccountStore: Send + Sync {
    async fn put_test_account(&self, account: TestAccount) -> StoreResult<()>;
    async fn find_test_account(&self, key: UserClientKey) -> StoreResult<Option<TestAccount>>;
    async fn delete_test_account(&self, key: UserClientKey) -> StoreResult<()>;
}

#[async_trait]
pub trait IdentityProviderStore:
    ClientStore
    + EntityStore
    + IdentityStore
    + GrantStore
    + StatusStore
    + NotificationStore
    + TestAccountStore
{
    async fn health_check(&self) -> StoreResult<()>;
    fn is_durable(&self) -> bool;
    fn backend_name(&self) -> &'static str;
}
