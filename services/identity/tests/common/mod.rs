use identity::delivery::InMemoryDeliveryQueue;
use identity::model::{
    Address, ClientRecord, DeliveryKey, Email, EntityBody, PendingEnvelope, PhoneNumber,
    PhoneType, UserClientKey, UserProfile, UserStatusRecord,
};
use identity::phone::PrefixTableDetector;
use identity::provider::IdentityProvider;
use identity::store::memory::InMemoryStore;
use identity::store::{NotificationStore, StatusStore};
use masque_common::{ClientId, EntityId, FakeId, UserId};
use std::sync::Arc;

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub queue: InMemoryDeliveryQueue,
    pub provider: IdentityProvider,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_queue_capacity(64)
    }

    pub fn with_queue_capacity(capacity: usize) -> Self {
        let store = Arc::new(InMemoryStore::default());
        let queue = InMemoryDeliveryQueue::new(capacity);
        let provider = IdentityProvider::new(
            store.clone(),
            Arc::new(queue.clone()),
            Arc::new(PrefixTableDetector::new()),
        );
        Self {
            store,
            queue,
            provider,
        }
    }

    /// A user with a saved profile.
    pub async fn user(&self, first_name: &str) -> UserId {
        let user = UserId::new();
        self.provider
            .entities()
            .save(
                user,
                EntityBody::Users(UserProfile {
                    first_name: Some(first_name.to_string()),
                    last_name: Some("Lovelace".to_string()),
                    ..UserProfile::default()
                }),
                None,
            )
            .await
            .expect("profile");
        user
    }

    pub async fn client(&self, name: &str, handler: Option<&str>) -> ClientRecord {
        self.provider
            .authorizer()
            .register_client(name, handler.map(str::to_string))
            .await
            .expect("client")
    }

    pub async fn create(&self, user: UserId, body: EntityBody) -> EntityId {
        self.provider
            .entities()
            .save(user, body, None)
            .await
            .expect("create entity")
            .entity
            .id
    }

    pub async fn status(&self, user: UserId, client: ClientId) -> UserStatusRecord {
        self.store
            .find_status(UserClientKey::new(user, client))
            .await
            .expect("find status")
            .expect("status record")
    }

    pub async fn pending(&self, client: ClientId, user: FakeId) -> Vec<PendingEnvelope> {
        self.store
            .list_pending(DeliveryKey::new(client, user))
            .await
            .expect("pending")
    }
}

pub fn email(address: &str) -> EntityBody {
    EntityBody::Emails(Email {
        address: address.to_string(),
        is_verified: true,
        is_main_address: false,
    })
}

pub fn phone(number: &str, country: &str) -> EntityBody {
    EntityBody::PhoneNumbers(PhoneNumber {
        number: number.to_string(),
        country: country.to_string(),
        phone_type: PhoneType::Unknown,
    })
}

pub fn address(line: &str) -> EntityBody {
    EntityBody::Addresses(Address {
        full_name: Some("Ada Lovelace".to_string()),
        address_line_1: line.to_string(),
        city: "Paris".to_string(),
        postal_code: "75004".to_string(),
        country: "FR".to_string(),
        ..Address::default()
    })
}
