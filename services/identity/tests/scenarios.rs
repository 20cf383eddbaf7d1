mod common;

use common::{Harness, address, phone};
use identity::authorizer::AuthorizationRequest;
use identity::error::IdentityError;
use identity::model::{
    EntityKind, EntityType, PhoneType, Scope, ScopeField, ScopeFlag, UpdatedEntityStatus,
    UserClientKey, UserProfile, UserStatus, EntityBody,
};
use identity::store::{EntityStore, IdentityStore};

#[tokio::test]
async fn mobile_phone_grant_then_first_fetch() {
    let h = Harness::new();
    let user = h.user("Ada").await;
    let client_a = h.client("client-a", Some("https://a.test/hook")).await;
    let number = h.create(user, phone("+33638490374", "FR")).await;

    let stored = h
        .store
        .find_entity(number)
        .await
        .expect("phone")
        .expect("stored phone");
    assert_eq!(
        stored.body.as_phone().expect("phone body").phone_type,
        PhoneType::Mobile
    );

    h.provider
        .authorizer()
        .authorize(
            AuthorizationRequest::new(user, client_a.client_id)
                .with_scope([ScopeField::PhoneNumbers])
                .with_flags([ScopeFlag::MobilePhoneNumber])
                .grant_phone(number),
        )
        .await
        .expect("authorize");
    assert_eq!(
        h.status(user, client_a.client_id).await.status,
        UserStatus::NewUser
    );

    let key = UserClientKey::new(user, client_a.client_id);
    let identities = h.store.list_identities(key).await.expect("identities");
    let record = identities
        .iter()
        .find(|record| record.real_id == number)
        .expect("phone identity");
    assert!(record.has_tag(EntityKind::MobilePhoneNumbers));

    let view = h
        .provider
        .reader()
        .fetch(user, client_a.client_id, &Scope::from([ScopeField::PhoneNumbers]))
        .await
        .expect("fetch");
    assert_eq!(view.status, UserStatus::NewUser);
    assert_eq!(view.phone_numbers.len(), 1);
    assert_eq!(view.phone_numbers[0].id, record.fake_id);
    assert_eq!(
        h.status(user, client_a.client_id).await.status,
        UserStatus::ExistingUser
    );
}

#[tokio::test]
async fn reclassifying_a_granted_mobile_number_is_rejected() {
    let h = Harness::new();
    let user = h.user("Ada").await;
    let client_a = h.client("client-a", Some("https://a.test/hook")).await;
    let number = h.create(user, phone("+33638490374", "FR")).await;
    h.provider
        .authorizer()
        .authorize(
            AuthorizationRequest::new(user, client_a.client_id)
                .with_scope([ScopeField::PhoneNumbers])
                .with_flags([ScopeFlag::MobilePhoneNumber])
                .grant_phone(number),
        )
        .await
        .expect("authorize");

    let err = h
        .provider
        .entities()
        .save(user, phone("+33142685300", "FR"), Some(number))
        .await
        .expect_err("reclassification");
    match err {
        IdentityError::Validation { field, message } => {
            assert_eq!(field, "phone_number");
            assert!(message.contains("mobile"), "message: {message}");
        }
        other => panic!("expected validation error, got {other:?}"),
    }

    let stored = h
        .store
        .find_entity(number)
        .await
        .expect("phone")
        .expect("stored phone");
    let stored = stored.body.as_phone().expect("phone body");
    assert_eq!(stored.number, "+33638490374");
    assert_eq!(stored.phone_type, PhoneType::Mobile);
    assert!(h.queue.is_empty().await);
}

#[tokio::test]
async fn client_without_handler_gets_no_pending_notification() {
    let h = Harness::new();
    let user = h.user("Ada").await;
    let client_b = h.client("client-b", None).await;
    let outcome = h
        .provider
        .authorizer()
        .authorize(
            AuthorizationRequest::new(user, client_b.client_id)
                .with_scope([ScopeField::FirstName]),
        )
        .await
        .expect("authorize");
    h.provider
        .reader()
        .fetch(user, client_b.client_id, &Scope::from([ScopeField::FirstName]))
        .await
        .expect("fetch");

    let change = h
        .provider
        .entities()
        .save(
            user,
            EntityBody::Users(UserProfile {
                first_name: Some("Augusta".to_string()),
                last_name: Some("Lovelace".to_string()),
                ..UserProfile::default()
            }),
            None,
        )
        .await
        .expect("save");
    assert!(change.notified.is_empty());
    assert!(h.pending(client_b.client_id, outcome.user_id).await.is_empty());
    assert!(h.queue.is_empty().await);
}

#[tokio::test]
async fn deleted_address_only_reaches_clients_that_fetched_it() {
    let h = Harness::new();
    let user = h.user("Ada").await;
    let home = h.create(user, address("12 rue des Archives")).await;
    let client_c = h.client("client-c", Some("https://c.test/hook")).await;
    let client_d = h.client("client-d", Some("https://d.test/hook")).await;

    let mut user_fakes = Vec::new();
    for client in [&client_c, &client_d] {
        let outcome = h
            .provider
            .authorizer()
            .authorize(
                AuthorizationRequest::new(user, client.client_id)
                    .with_scope([ScopeField::Addresses])
                    .grant(EntityKind::Addresses, home),
            )
            .await
            .expect("authorize");
        user_fakes.push(outcome.user_id);
    }
    let seen_by_d = h
        .provider
        .reader()
        .fetch(user, client_d.client_id, &Scope::from([ScopeField::Addresses]))
        .await
        .expect("fetch");
    let home_for_d = seen_by_d.addresses[0].id;

    let change = h
        .provider
        .entities()
        .remove(user, home)
        .await
        .expect("remove");
    assert_eq!(change.notified.delivered.len(), 1);
    assert_eq!(change.notified.delivered[0].client_id, client_d.client_id);

    assert!(h.pending(client_c.client_id, user_fakes[0]).await.is_empty());
    let pending = h.pending(client_d.client_id, user_fakes[1]).await;
    assert_eq!(pending.len(), 1);
    let notification = &pending[0].notification;
    assert_eq!(notification.user_id, user_fakes[1]);
    assert_eq!(notification.updated_fields, vec!["addresses".to_string()]);
    let items = notification.items(EntityType::Addresses);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, home_for_d);
    assert_eq!(items[0].status, UpdatedEntityStatus::Deleted);

    let status_d = h.status(user, client_d.client_id).await;
    assert_eq!(status_d.status, UserStatus::ExistingUserAfterUpdate);
    assert_eq!(status_d.updated_addresses[0].status, UpdatedEntityStatus::Deleted);
    assert_eq!(h.status(user, client_c.client_id).await.status, UserStatus::NewUser);
}

#[tokio::test]
async fn saves_stick_when_the_delivery_queue_is_full() {
    let h = Harness::with_queue_capacity(1);
    let user = h.user("Ada").await;
    let client = h.client("client", Some("https://client.test/hook")).await;
    let outcome = h
        .provider
        .authorizer()
        .authorize(
            AuthorizationRequest::new(user, client.client_id).with_scope([ScopeField::FirstName]),
        )
        .await
        .expect("authorize");
    h.provider
        .reader()
        .fetch(user, client.client_id, &Scope::from([ScopeField::FirstName]))
        .await
        .expect("fetch");

    let profile = |first_name: &str| {
        EntityBody::Users(UserProfile {
            first_name: Some(first_name.to_string()),
            last_name: Some("Lovelace".to_string()),
            ..UserProfile::default()
        })
    };
    let first = h
        .provider
        .entities()
        .save(user, profile("Augusta"), Some(user.into()))
        .await
        .expect("first save");
    assert!(first.notified.enqueued);
    let second = h
        .provider
        .entities()
        .save(user, profile("Countess"), Some(user.into()))
        .await
        .expect("save with a full queue");
    assert!(!second.notified.enqueued);
    assert_eq!(second.notified.delivered.len(), 1);

    let stored = h
        .store
        .find_entity(user.into())
        .await
        .expect("profile")
        .expect("stored profile");
    match stored.body {
        EntityBody::Users(profile) => {
            assert_eq!(profile.first_name.as_deref(), Some("Countess"))
        }
        other => panic!("expected a profile, got {other:?}"),
    }
    assert_eq!(h.pending(client.client_id, outcome.user_id).await.len(), 2);
    assert_eq!(
        h.status(user, client.client_id).await.status,
        UserStatus::ExistingUserAfterUpdate
    );
    assert_eq!(h.queue.len().await, 1);
}
