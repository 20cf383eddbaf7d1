//! Client registration, authorization, test sessions and revocation.
//!
//! # Authorization
//! A grant only ever grows. Re-authorizing merges the request into the stored grant, and
//! whatever the merge actually added is reported to the client through its status record.
//! A pair still running on a test account is converted to the real account on its first
//! real authorization, keeping the fake ids the client already knows.
//!
//! # Test sessions
//! A test session stores synthetic entities and identity records flagged as test rows. It
//! creates no grant, so entity mutations of the real user never reach the client.
use crate::error::{IdentityError, IdentityResult};
use crate::model::{
    ClientRecord, EntityKind, EntityType, GrantRecord, GrantedEntities, PhoneType, Scope,
    ScopeField, ScopeFlag, ScopeFlags, StatusDelta, TestAccount, UpdatedEntity, UserClientKey,
};
use crate::notifier::ChangeNotifier;
use crate::status::UserStatusMachine;
use crate::store::IdentityProviderStore;
use crate::virtualizer::IdentityVirtualizer;
use masque_common::{ClientId, EntityId, FakeId, UserId};
use std::sync::Arc;

/// What a user agreed to share with a client.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub user_id: UserId,
    pub client_id: ClientId,
    pub scope: Scope,
    pub scope_flags: ScopeFlags,
    pub entities: GrantedEntities,
    pub address_to_be_selected_first: Option<EntityId>,
}

impl AuthorizationRequest {
    pub fn new(user_id: UserId, client_id: ClientId) -> Self {
        Self {
            user_id,
            client_id,
            scope: Scope::new(),
            scope_flags: ScopeFlags::new(),
            entities: GrantedEntities::new(),
            address_to_be_selected_first: None,
        }
    }

    pub fn with_scope<I>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = ScopeField>,
    {
        self.scope.extend(fields);
        self
    }

    pub fn with_flags<I>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = ScopeFlag>,
    {
        self.scope_flags.extend(flags);
        self
    }

    pub fn grant(mut self, kind: EntityKind, entity_id: EntityId) -> Self {
        self.entities.entry(kind).or_default().insert(entity_id);
        self
    }

    /// Grant a phone number under the kind the request's flags ask for.
    pub fn grant_phone(self, entity_id: EntityId) -> Self {
        let kind = self.phone_kind();
        self.grant(kind, entity_id)
    }

    pub fn select_address_first(mut self, entity_id: EntityId) -> Self {
        self.address_to_be_selected_first = Some(entity_id);
        self
    }

    pub fn key(&self) -> UserClientKey {
        UserClientKey::new(self.user_id, self.client_id)
    }

    /// `mobile_phone_number` wins over `landline_phone_number`; no flag means any type.
    pub fn phone_kind(&self) -> EntityKind {
        if self.scope_flags.contains(&ScopeFlag::MobilePhoneNumber) {
            EntityKind::MobilePhoneNumbers
        } else if self.scope_flags.contains(&ScopeFlag::LandlinePhoneNumber) {
            EntityKind::LandlinePhoneNumbers
        } else {
            EntityKind::UnknownPhoneNumbers
        }
    }

    fn to_grant(&self) -> GrantRecord {
        GrantRecord {
            scope: self.scope.clone(),
            scope_flags: self.scope_flags.clone(),
            entities: self.entities.clone(),
            address_to_be_selected_first: self.address_to_be_selected_first,
            ..GrantRecord::new(self.key())
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthorizationOutcome {
    pub grant: GrantRecord,
    /// The id the client knows the user by.
    pub user_id: FakeId,
    pub first_authorization: bool,
    pub converted_from_test: bool,
}

#[derive(Debug, Clone)]
pub struct TestSession {
    pub account: TestAccount,
    pub user_id: FakeId,
}

pub struct Authorizer {
    store: Arc<dyn IdentityProviderStore>,
    virtualizer: IdentityVirtualizer,
    status: UserStatusMachine,
    notifier: Arc<ChangeNotifier>,
}

impl Authorizer {
    pub fn new(store: Arc<dyn IdentityProviderStore>, notifier: Arc<ChangeNotifier>) -> Self {
        Self {
            virtualizer: IdentityVirtualizer::new(store.clone()),
            status: UserStatusMachine::new(store.clone()),
            store,
            notifier,
        }
    }

    pub async fn register_client(
        &self,
        name: &str,
        update_notification_handler: Option<String>,
    ) -> IdentityResult<ClientRecord> {
        if name.trim().is_empty() {
            return Err(IdentityError::validation("name", "must not be empty"));
        }
        let client = self
            .store
            .create_client(ClientRecord::register(name.trim(), update_notification_handler))
            .await?;
        tracing::info!(client_id = %client.client_id, name = %client.name, "client registered");
        Ok(client)
    }

    pub async fn client(&self, client_id: ClientId) -> IdentityResult<ClientRecord> {
        Ok(self.store.get_client(client_id).await?)
    }

    /// Remove a client with every record it owns.
    pub async fn delete_client(&self, client_id: ClientId) -> IdentityResult<()> {
        self.store.delete_client(client_id).await?;
        tracing::info!(%client_id, "client deleted");
        Ok(())
    }

    pub async fn authorize(
        &self,
        request: AuthorizationRequest,
    ) -> IdentityResult<AuthorizationOutcome> {
        let key = request.key();
        self.store.get_client(key.client_id).await?;
        self.validate(&request).await?;

        let converting = self
            .status
            .current(key)
            .await?
            .is_some_and(|status| status.use_test_account);
        let merged = self.store.merge_grant(request.to_grant()).await?;

        if converting {
            self.virtualizer
                .convert_test_account(key, &merged.grant)
                .await?;
        } else {
            let mut wanted = vec![(EntityKind::Users, EntityId::from(key.user_id))];
            for (kind, ids) in &request.entities {
                wanted.extend(ids.iter().map(|id| (*kind, *id)));
            }
            self.virtualizer.ensure_all(key, &wanted).await?;
        }

        let first_authorization = self.status.insert_new(key, false).await?;
        if converting {
            self.status.set_use_test_account(key, false).await?;
            self.status.mark_converted(key, &merged.grant.scope).await?;
            self.store.delete_test_account(key).await?;
        } else if !first_authorization && !merged.delta.is_empty() {
            let mut delta = StatusDelta::fields(
                merged
                    .delta
                    .added_scope
                    .iter()
                    .copied()
                    .filter(|field| field.entity_type().is_none()),
            );
            for (kind, ids) in &merged.delta.added_entities {
                for id in ids {
                    delta = delta.with_entity(kind.entity_type(), UpdatedEntity::new(*id));
                }
            }
            if !delta.is_empty() {
                self.status.mark_updated(key, delta).await?;
            }
        }

        let user_id = self.virtualizer.identity_map(key).await?.user_fake_id()?;
        let kind = match (converting, first_authorization) {
            (true, _) => "conversion",
            (false, true) => "first",
            (false, false) => "repeat",
        };
        metrics::counter!("masque_authorizations_total", "kind" => kind).increment(1);
        tracing::info!(
            user_id = %key.user_id,
            client_id = %key.client_id,
            first_authorization,
            converted = converting,
            "user authorized client"
        );
        Ok(AuthorizationOutcome {
            grant: merged.grant,
            user_id,
            first_authorization,
            converted_from_test: converting,
        })
    }

    /// Start (or resume) a test session for a pair that has no real grant yet.
    pub async fn start_test_session(
        &self,
        user_id: UserId,
        client_id: ClientId,
    ) -> IdentityResult<TestSession> {
        let key = UserClientKey::new(user_id, client_id);
        self.store.get_client(client_id).await?;
        if self.store.find_grant(key).await?.is_some() {
            return Err(IdentityError::Conflict(format!(
                "user {user_id} already authorized client {client_id}"
            )));
        }
        let account = match self.store.find_test_account(key).await? {
            Some(account) => account,
            None => {
                let account = TestAccount::generate(key);
                self.store.put_test_account(account.clone()).await?;
                let mut wanted = vec![(EntityKind::Users, account.user_entity_id())];
                wanted.extend(account.entities.iter().filter_map(|entity| {
                    let kind = match entity.body.as_phone() {
                        Some(phone) => phone.phone_type.kind(),
                        None => entity.entity_type().default_kind(),
                    };
                    (kind != EntityKind::Users).then_some((kind, entity.id))
                }));
                self.virtualizer.ensure_all_test(key, &wanted).await?;
                if !self.status.insert_new(key, true).await? {
                    self.status.set_use_test_account(key, true).await?;
                }
                tracing::info!(%user_id, %client_id, "test session started");
                account
            }
        };
        let map = self.virtualizer.identity_map(key).await?;
        let user_fake = map.fake_id(EntityKind::Users, account.user_entity_id())?;
        Ok(TestSession {
            account,
            user_id: user_fake,
        })
    }

    /// Withdraw everything a client was granted for a user.
    ///
    /// The revocation notice is appended before any record is deleted and handed to the
    /// delivery queue once the deletion is complete.
    pub async fn revoke(&self, user_id: UserId, client_id: ClientId) -> IdentityResult<()> {
        let key = UserClientKey::new(user_id, client_id);
        let client = self.store.get_client(client_id).await?;
        if self.store.find_grant(key).await?.is_none() {
            return Err(IdentityError::NotFound(format!(
                "grant of user {user_id} for client {client_id}"
            )));
        }
        let map = self.virtualizer.identity_map(key).await?;
        let notice = match map.user_fake_id() {
            Ok(user_fake) => self.notifier.revocation(&client, user_fake),
            Err(err) => {
                tracing::warn!(%user_id, %client_id, error = %err, "revoking without user identity");
                None
            }
        };
        if let Some(notice) = &notice {
            self.store.append_pending(vec![notice.clone()]).await?;
        }

        let removed = self.store.delete_identities(key).await?;
        self.store.delete_grant(key).await?;
        self.status.remove(key).await?;
        self.store.delete_test_account(key).await?;
        if let Some(notice) = notice {
            self.notifier.dispatch(vec![notice.key]).await;
        }
        metrics::counter!("masque_revocations_total").increment(1);
        tracing::info!(%user_id, %client_id, identities = removed, "grant revoked");
        Ok(())
    }

    async fn validate(&self, request: &AuthorizationRequest) -> IdentityResult<()> {
        let profile = self.store.find_entity(request.user_id.into()).await?;
        if profile.is_none() {
            return Err(IdentityError::NotFound(format!("user {}", request.user_id)));
        }
        for (kind, ids) in &request.entities {
            let entity_type = kind.entity_type();
            if entity_type == EntityType::Users {
                return Err(IdentityError::validation(
                    "entities",
                    "the user profile is granted through scope fields",
                ));
            }
            if !request
                .scope
                .iter()
                .any(|field| field.entity_type() == Some(entity_type))
            {
                return Err(IdentityError::validation(
                    entity_type.as_str(),
                    format!("{entity_type} is not part of the requested scope"),
                ));
            }
            for id in ids {
                let entity = self
                    .store
                    .find_entity(*id)
                    .await?
                    .filter(|entity| {
                        entity.user_id == request.user_id && entity.entity_type() == entity_type
                    })
                    .ok_or_else(|| IdentityError::unknown_entity(entity_type, id))?;
                if let (Some(wanted), Some(phone)) = (kind.phone_type(), entity.body.as_phone()) {
                    if wanted != PhoneType::Unknown && wanted != phone.phone_type {
                        return Err(IdentityError::validation(
                            "phone_number",
                            format!("a {wanted} phone number is required"),
                        ));
                    }
                }
            }
        }
        if let Some(first) = request.address_to_be_selected_first {
            let in_request = request
                .entities
                .get(&EntityKind::Addresses)
                .is_some_and(|ids| ids.contains(&first));
            let in_grant = in_request
                || self
                    .store
                    .find_grant(request.key())
                    .await?
                    .is_some_and(|grant| {
                        !grant.kinds_holding(EntityType::Addresses, first).is_empty()
                    });
            if !in_grant {
                return Err(IdentityError::validation(
                    "address_to_be_selected_first",
                    "must be one of the granted addresses",
                ));
            }
        }
        Ok(())
    }
}
