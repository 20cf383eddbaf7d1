//! Synthetic per-(user, client) data served during a test session.
use super::entity::{Address, Email, EntityBody, EntityRecord, PhoneNumber, UserProfile};
use super::identity::UserClientKey;
use super::kind::{EntityType, PhoneType};
use masque_common::{EntityId, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TestAccount {
    pub key: UserClientKey,
    /// Synthetic user id; never a real user.
    pub test_user_id: UserId,
    pub entities: Vec<EntityRecord>,
}

impl TestAccount {
    /// Build the synthetic account. Content is fixed; ids are fresh per session.
    pub fn generate(key: UserClientKey) -> Self {
        let test_user_id = UserId::new();
        let entities = vec![
            EntityRecord::profile(
                test_user_id,
                UserProfile {
                    first_name: Some("John".into()),
                    last_name: Some("Doe".into()),
                    nickname: Some("johndoe".into()),
                    profil_photo: None,
                    gender: Some("male".into()),
                    date_of_birth: Some("1990-01-01".into()),
                    place_of_birth: Some("Paris".into()),
                    nationality: Some("FR".into()),
                    timezone: Some("Europe/Paris".into()),
                },
            ),
            EntityRecord::new(
                test_user_id,
                EntityBody::Emails(Email {
                    address: "john.doe@example.com".into(),
                    is_verified: true,
                    is_main_address: true,
                }),
            ),
            EntityRecord::new(
                test_user_id,
                EntityBody::PhoneNumbers(PhoneNumber {
                    number: "+33612345678".into(),
                    country: "FR".into(),
                    phone_type: PhoneType::Mobile,
                }),
            ),
            EntityRecord::new(
                test_user_id,
                EntityBody::Addresses(Address {
                    full_name: Some("John Doe".into()),
                    address_line_1: "1 rue de Rivoli".into(),
                    address_line_2: None,
                    access_code: None,
                    city: "Paris".into(),
                    state: None,
                    postal_code: "75001".into(),
                    country: "FR".into(),
                    address_type: Some("shipping".into()),
                }),
            ),
        ];
        Self {
            key,
            test_user_id,
            entities,
        }
    }

    pub fn entity_of_type(&self, entity_type: EntityType) -> Option<&EntityRecord> {
        self.entities
            .iter()
            .find(|entity| entity.entity_type() == entity_type)
    }

    pub fn user_entity_id(&self) -> EntityId {
        self.test_user_id.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use masque_common::ClientId;

    #[test]
    fn generated_account_has_one_entity_per_type() {
        let account = TestAccount::generate(UserClientKey::new(UserId::new(), ClientId::new()));
        for entity_type in [
            EntityType::Users,
            EntityType::Emails,
            EntityType::PhoneNumbers,
            EntityType::Addresses,
        ] {
            let entity = account.entity_of_type(entity_type).expect("entity");
            assert_eq!(entity.user_id, account.test_user_id);
        }
        assert_eq!(
            account.entity_of_type(EntityType::Users).map(|e| e.id),
            Some(account.user_entity_id())
        );
    }

    #[test]
    fn content_is_deterministic() {
        let key = UserClientKey::new(UserId::new(), ClientId::new());
        let a = TestAccount::generate(key);
        let b = TestAccount::generate(key);
        let bodies_a: Vec<_> = a.entities.iter().map(|e| e.body.clone()).collect();
        let bodies_b: Vec<_> = b.entities.iter().map(|e| e.body.clone()).collect();
        assert_eq!(bodies_a, bodies_b);
    }
}
