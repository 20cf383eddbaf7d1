//! Wiring of the identity provider components around one store.
use crate::authorizer::Authorizer;
use crate::delivery::DeliveryQueue;
use crate::entities::EntityService;
use crate::notifier::ChangeNotifier;
use crate::phone::PhoneTypeDetector;
use crate::reader::UserReader;
use crate::store::IdentityProviderStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct IdentityProvider {
    store: Arc<dyn IdentityProviderStore>,
    entities: Arc<EntityService>,
    authorizer: Arc<Authorizer>,
    reader: Arc<UserReader>,
}

impl IdentityProvider {
    pub fn new(
        store: Arc<dyn IdentityProviderStore>,
        queue: Arc<dyn DeliveryQueue>,
        detector: Arc<dyn PhoneTypeDetector>,
    ) -> Self {
        let notifier = Arc::new(ChangeNotifier::new(store.clone(), queue));
        Self {
            entities: Arc::new(EntityService::new(
                store.clone(),
                notifier.clone(),
                detector,
            )),
            authorizer: Arc::new(Authorizer::new(store.clone(), notifier)),
            reader: Arc::new(UserReader::new(store.clone())),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn IdentityProviderStore> {
        &self.store
    }

    pub fn entities(&self) -> &EntityService {
        &self.entities
    }

    pub fn authorizer(&self) -> &Authorizer {
        &self.authorizer
    }

    pub fn reader(&self) -> &UserReader {
        &self.reader
    }
}
