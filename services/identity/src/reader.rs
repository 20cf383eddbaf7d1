//! Read side: the user as one client is allowed to see it.
//!
//! Every id in a view is a fake id of the requesting client. Per-item statuses come from
//! the status record's update lists, and entities deleted since the last fetch are listed
//! as tombstones without data. Once the view is complete the status record forgets what
//! the view served; changes outside the served scope stay pending for a later fetch.
use crate::error::{IdentityError, IdentityResult};
use crate::model::{
    Address, Email, EntityBody, EntityKind, EntityRecord, EntityType, GrantRecord, PhoneNumber,
    Scope, ScopeField, TestAccount, UpdatedEntityStatus, UserClientKey, UserProfile, UserStatus,
    UserStatusRecord,
};
use crate::status::UserStatusMachine;
use crate::store::IdentityProviderStore;
use crate::virtualizer::{IdentityMap, IdentityVirtualizer};
use masque_common::{ClientId, EntityId, FakeId, UserId};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ViewItem<T> {
    pub id: FakeId,
    /// Pending change since the client's last fetch, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<UpdatedEntityStatus>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub updated_fields: Vec<String>,
    /// `None` for a deleted entity.
    pub data: Option<T>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UserView {
    pub user_id: FakeId,
    pub status: UserStatus,
    pub updated_fields: Vec<String>,
    pub test_account: bool,
    pub profile: UserProfile,
    pub emails: Vec<ViewItem<Email>>,
    pub phone_numbers: Vec<ViewItem<PhoneNumber>>,
    pub addresses: Vec<ViewItem<Address>>,
}

/// Where the entities of a view come from.
enum Source {
    Real(GrantRecord),
    Test(TestAccount),
}

pub struct UserReader {
    store: Arc<dyn IdentityProviderStore>,
    virtualizer: IdentityVirtualizer,
    status: UserStatusMachine,
}

impl UserReader {
    pub fn new(store: Arc<dyn IdentityProviderStore>) -> Self {
        Self {
            virtualizer: IdentityVirtualizer::new(store.clone()),
            status: UserStatusMachine::new(store.clone()),
            store,
        }
    }

    /// Build the view of `user_id` for `client_id`, restricted to `requested` and to what
    /// the client was granted, then mark the served fields and entity types as fetched.
    pub async fn fetch(
        &self,
        user_id: UserId,
        client_id: ClientId,
        requested: &Scope,
    ) -> IdentityResult<UserView> {
        let key = UserClientKey::new(user_id, client_id);
        let status = self.status.current(key).await?.ok_or_else(|| {
            IdentityError::NotFound(format!("authorization of user {user_id} for client {client_id}"))
        })?;
        let source = if status.use_test_account {
            let account = self.store.find_test_account(key).await?.ok_or_else(|| {
                IdentityError::invariant(format!(
                    "test session of user {user_id} for client {client_id} has no test account"
                ))
            })?;
            Source::Test(account)
        } else {
            let grant = self.store.find_grant(key).await?.ok_or_else(|| {
                IdentityError::NotFound(format!("grant of user {user_id} for client {client_id}"))
            })?;
            Source::Real(grant)
        };
        let scope: Scope = match &source {
            Source::Real(grant) => requested.intersection(&grant.scope).copied().collect(),
            Source::Test(_) => requested.clone(),
        };

        let map = self.virtualizer.identity_map(key).await?;
        let view = match &source {
            Source::Real(grant) => self.real_view(&map, grant, &status, &scope).await?,
            Source::Test(account) => test_view(&map, account, &status, &scope)?,
        };

        self.status.mark_fetched(key, &scope).await?;
        let source = match source {
            Source::Real(_) => "real",
            Source::Test(_) => "test",
        };
        metrics::counter!("masque_user_fetches_total", "source" => source).increment(1);
        Ok(view)
    }

    /// Translate a client-provided fake id back to the real entity id.
    pub async fn real_id_for(
        &self,
        user_id: UserId,
        client_id: ClientId,
        entity_type: EntityType,
        fake_id: FakeId,
    ) -> IdentityResult<EntityId> {
        let key = UserClientKey::new(user_id, client_id);
        self.virtualizer
            .identity_map(key)
            .await?
            .real_id(entity_type, fake_id)
    }

    async fn real_view(
        &self,
        map: &IdentityMap,
        grant: &GrantRecord,
        status: &UserStatusRecord,
        scope: &Scope,
    ) -> IdentityResult<UserView> {
        let profile = self
            .store
            .find_entity(grant.user_id.into())
            .await?
            .and_then(|entity| match entity.body {
                EntityBody::Users(profile) => Some(profile),
                _ => None,
            })
            .unwrap_or_default();

        let mut items = Vec::new();
        for entity_type in EntityType::SUB_ENTITIES {
            if !scope.iter().any(|field| field.entity_type() == Some(entity_type)) {
                continue;
            }
            let mut seen = HashSet::new();
            let mut granted: Vec<(EntityKind, EntityId)> = grant
                .granted_of_type(entity_type)
                .into_iter()
                .filter(|(_, id)| seen.insert(*id))
                .collect();
            if entity_type == EntityType::Addresses {
                if let Some(first) = grant.address_to_be_selected_first {
                    granted.sort_by_key(|(_, id)| *id != first);
                }
            }
            for (kind, id) in granted {
                let entity = self.store.find_entity(id).await?;
                items.push((kind, id, entity));
            }
        }
        let entities = virtualize(map, status, items)?;
        Ok(UserView {
            user_id: map.user_fake_id()?,
            status: status.status,
            updated_fields: updated_fields(status, scope),
            test_account: false,
            profile: restrict(profile, scope),
            ..entities
        })
    }
}

fn test_view(
    map: &IdentityMap,
    account: &TestAccount,
    status: &UserStatusRecord,
    scope: &Scope,
) -> IdentityResult<UserView> {
    let profile = account
        .entity_of_type(EntityType::Users)
        .and_then(|entity| match &entity.body {
            EntityBody::Users(profile) => Some(profile.clone()),
            _ => None,
        })
        .unwrap_or_default();
    let items = account
        .entities
        .iter()
        .filter(|entity| {
            scope
                .iter()
                .any(|field| field.entity_type() == Some(entity.entity_type()))
        })
        .map(|entity| {
            let kind = match entity.body.as_phone() {
                Some(phone) => phone.phone_type.kind(),
                None => entity.entity_type().default_kind(),
            };
            (kind, entity.id, Some(entity.clone()))
        })
        .collect();
    let entities = virtualize(map, status, items)?;
    Ok(UserView {
        user_id: map.fake_id(EntityKind::Users, account.user_entity_id())?,
        status: status.status,
        updated_fields: updated_fields(status, scope),
        test_account: true,
        profile: restrict(profile, scope),
        ..entities
    })
}

/// Sub-entity lists of a view, with fake ids and item statuses.
///
/// Granted entities missing from the store are listed only when the status record has
/// them as deleted.
fn virtualize(
    map: &IdentityMap,
    status: &UserStatusRecord,
    items: Vec<(EntityKind, EntityId, Option<EntityRecord>)>,
) -> IdentityResult<UserView> {
    let mut view = UserView {
        user_id: FakeId::default(),
        status: status.status,
        updated_fields: Vec::new(),
        test_account: false,
        profile: UserProfile::default(),
        emails: Vec::new(),
        phone_numbers: Vec::new(),
        addresses: Vec::new(),
    };
    for (kind, id, entity) in items {
        let entity_type = kind.entity_type();
        let pending = status.item_status(entity_type, id).map(|update| {
            (
                update.status,
                update.updated_fields.iter().cloned().collect::<Vec<_>>(),
            )
        });
        if entity.is_none() && !matches!(pending, Some((UpdatedEntityStatus::Deleted, _))) {
            continue;
        }
        let fake_id = map.fake_id(kind, id)?;
        let (status, updated_fields) = match pending {
            Some((status, fields)) => (Some(status), fields),
            None => (None, Vec::new()),
        };
        match entity.map(|entity| entity.body) {
            Some(EntityBody::Emails(email)) => view.emails.push(ViewItem {
                id: fake_id,
                status,
                updated_fields,
                data: Some(email),
            }),
            Some(EntityBody::PhoneNumbers(phone)) => view.phone_numbers.push(ViewItem {
                id: fake_id,
                status,
                updated_fields,
                data: Some(phone),
            }),
            Some(EntityBody::Addresses(address)) => view.addresses.push(ViewItem {
                id: fake_id,
                status,
                updated_fields,
                data: Some(address),
            }),
            Some(EntityBody::Users(_)) => {}
            None => match entity_type {
                EntityType::Emails => view.emails.push(tombstone(fake_id)),
                EntityType::PhoneNumbers => view.phone_numbers.push(tombstone(fake_id)),
                EntityType::Addresses => view.addresses.push(tombstone(fake_id)),
                EntityType::Users => {}
            },
        }
    }
    Ok(view)
}

fn tombstone<T>(id: FakeId) -> ViewItem<T> {
    ViewItem {
        id,
        status: Some(UpdatedEntityStatus::Deleted),
        updated_fields: Vec::new(),
        data: None,
    }
}

fn updated_fields(status: &UserStatusRecord, scope: &Scope) -> Vec<String> {
    status
        .updated_fields
        .intersection(scope)
        .map(ScopeField::to_string)
        .collect()
}

/// Blank out profile fields outside `scope`.
fn restrict(profile: UserProfile, scope: &Scope) -> UserProfile {
    let keep = |field: ScopeField, value: Option<String>| {
        if scope.contains(&field) { value } else { None }
    };
    UserProfile {
        first_name: keep(ScopeField::FirstName, profile.first_name),
        last_name: keep(ScopeField::LastName, profile.last_name),
        nickname: keep(ScopeField::Nickname, profile.nickname),
        profil_photo: keep(ScopeField::ProfilPhoto, profile.profil_photo),
        gender: keep(ScopeField::Gender, profile.gender),
        date_of_birth: keep(ScopeField::DateOfBirth, profile.date_of_birth),
        place_of_birth: keep(ScopeField::PlaceOfBirth, profile.place_of_birth),
        nationality: keep(ScopeField::Nationality, profile.nationality),
        timezone: keep(ScopeField::Timezone, profile.timezone),
    }
}
