//! Per-(user, client) status machine on top of the status store.
//!
//! Guards live in the store: every transition here is a conditional write, and a write the
//! source state does not permit is dropped. Dropped transitions are logged at debug and
//! counted under `masque_status_transitions_total{outcome="dropped"}`.
use crate::error::IdentityResult;
use crate::model::{
    Scope, StatusDelta, StatusTransition, TransitionOutcome, UserClientKey, UserStatus,
    UserStatusRecord,
};
use crate::store::IdentityProviderStore;
use std::sync::Arc;

pub struct UserStatusMachine {
    store: Arc<dyn IdentityProviderStore>,
}

impl UserStatusMachine {
    pub fn new(store: Arc<dyn IdentityProviderStore>) -> Self {
        Self { store }
    }

    /// First authorization of a pair. Returns `false` if a record already existed.
    pub async fn insert_new(&self, key: UserClientKey, use_test_account: bool) -> IdentityResult<bool> {
        let inserted = self
            .store
            .insert_status_if_absent(UserStatusRecord::new(key, use_test_account))
            .await?;
        if inserted {
            metrics::counter!(
                "masque_status_transitions_total",
                "to" => UserStatus::NewUser.as_str(),
                "outcome" => "applied"
            )
            .increment(1);
        }
        Ok(inserted)
    }

    pub async fn current(&self, key: UserClientKey) -> IdentityResult<Option<UserStatusRecord>> {
        Ok(self.store.find_status(key).await?)
    }

    /// A qualifying change happened; merge it and move to `existing_user_after_update`.
    pub async fn mark_updated(
        &self,
        key: UserClientKey,
        delta: StatusDelta,
    ) -> IdentityResult<TransitionOutcome> {
        self.transition(
            key,
            StatusTransition {
                to: UserStatus::ExistingUserAfterUpdate,
                delta,
            },
        )
        .await
    }

    /// The test session of a pair became a real account. The client must re-read every
    /// field of `scope`.
    pub async fn mark_converted(
        &self,
        key: UserClientKey,
        scope: &Scope,
    ) -> IdentityResult<TransitionOutcome> {
        self.transition(
            key,
            StatusTransition {
                to: UserStatus::ExistingUserAfterTest,
                delta: StatusDelta::fields(scope.iter().copied()),
            },
        )
        .await
    }

    /// The client fetched the fields of `served`. Call only once the response is fully
    /// built.
    pub async fn mark_fetched(&self, key: UserClientKey, served: &Scope) -> IdentityResult<()> {
        self.store.reset_status(key, served).await?;
        metrics::counter!(
            "masque_status_transitions_total",
            "to" => UserStatus::ExistingUser.as_str(),
            "outcome" => "applied"
        )
        .increment(1);
        Ok(())
    }

    pub async fn set_use_test_account(&self, key: UserClientKey, value: bool) -> IdentityResult<()> {
        Ok(self.store.set_use_test_account(key, value).await?)
    }

    pub async fn remove(&self, key: UserClientKey) -> IdentityResult<()> {
        Ok(self.store.delete_status(key).await?)
    }

    async fn transition(
        &self,
        key: UserClientKey,
        transition: StatusTransition,
    ) -> IdentityResult<TransitionOutcome> {
        let outcome = self.store.transition_status(key, &transition).await?;
        record_outcome(key, &transition, outcome);
        Ok(outcome)
    }
}

/// Count and log the outcome of a transition written by the store.
pub fn record_outcome(
    key: UserClientKey,
    transition: &StatusTransition,
    outcome: TransitionOutcome,
) {
    metrics::counter!(
        "masque_status_transitions_total",
        "to" => transition.to.as_str(),
        "outcome" => outcome.label()
    )
    .increment(1);
    match outcome {
        TransitionOutcome::Applied => {}
        TransitionOutcome::Dropped { current } => {
            tracing::debug!(
                user_id = %key.user_id,
                client_id = %key.client_id,
                from = %current,
                to = %transition.to,
                "status transition dropped"
            );
        }
        // The grant was revoked between resolution and this write.
        TransitionOutcome::Missing => {
            tracing::warn!(
                user_id = %key.user_id,
                client_id = %key.client_id,
                to = %transition.to,
                "status record missing for transition"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScopeField;
    use crate::store::memory::InMemoryStore;
    use masque_common::{ClientId, UserId};

    fn machine() -> (UserStatusMachine, UserClientKey) {
        let store: Arc<dyn IdentityProviderStore> = Arc::new(InMemoryStore::default());
        (
            UserStatusMachine::new(store),
            UserClientKey::new(UserId::new(), ClientId::new()),
        )
    }

    #[tokio::test]
    async fn update_while_new_user_is_dropped() {
        let (machine, key) = machine();
        assert!(machine.insert_new(key, false).await.expect("insert"));
        assert!(!machine.insert_new(key, false).await.expect("second insert"));
        let outcome = machine
            .mark_updated(key, StatusDelta::fields([ScopeField::Nickname]))
            .await
            .expect("transition");
        assert!(matches!(outcome, TransitionOutcome::Dropped { .. }));
        let record = machine.current(key).await.expect("current").expect("record");
        assert_eq!(record.status, UserStatus::NewUser);
    }

    #[tokio::test]
    async fn concurrent_updates_union_their_fields() {
        let (machine, key) = machine();
        machine.insert_new(key, false).await.expect("insert");
        machine
            .mark_fetched(key, &Scope::from(ScopeField::ALL))
            .await
            .expect("fetch");

        let (a, b) = tokio::join!(
            machine.mark_updated(key, StatusDelta::fields([ScopeField::FirstName])),
            machine.mark_updated(key, StatusDelta::fields([ScopeField::Timezone])),
        );
        assert_eq!(a.expect("a"), TransitionOutcome::Applied);
        assert_eq!(b.expect("b"), TransitionOutcome::Applied);
        let record = machine.current(key).await.expect("current").expect("record");
        assert_eq!(record.status, UserStatus::ExistingUserAfterUpdate);
        assert_eq!(
            record.updated_fields,
            Scope::from([ScopeField::FirstName, ScopeField::Timezone])
        );
    }

    #[tokio::test]
    async fn conversion_forces_the_full_scope() {
        let (machine, key) = machine();
        machine.insert_new(key, true).await.expect("insert");
        machine
            .mark_fetched(key, &Scope::from(ScopeField::ALL))
            .await
            .expect("fetch");
        let scope = Scope::from([ScopeField::FirstName, ScopeField::Emails]);
        let outcome = machine.mark_converted(key, &scope).await.expect("convert");
        assert_eq!(outcome, TransitionOutcome::Applied);
        let record = machine.current(key).await.expect("current").expect("record");
        assert_eq!(record.status, UserStatus::ExistingUserAfterTest);
        assert_eq!(record.updated_fields, scope);

        // after_test only moves on through a fetch.
        let outcome = machine
            .mark_updated(key, StatusDelta::fields([ScopeField::LastName]))
            .await
            .expect("update");
        assert!(matches!(outcome, TransitionOutcome::Dropped { .. }));
    }

    #[tokio::test]
    async fn transition_without_record_reports_missing() {
        let (machine, key) = machine();
        let outcome = machine
            .mark_updated(key, StatusDelta::default())
            .await
            .expect("transition");
        assert_eq!(outcome, TransitionOutcome::Missing);
        assert!(machine.current(key).await.expect("current").is_none());
    }
}
