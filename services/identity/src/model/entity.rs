//! User-owned entities: the profile and its emails, phone numbers and addresses.
use super::kind::{EntityType, PhoneType};
use masque_common::{EntityId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct UserProfile {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub nickname: Option<String>,
    pub profil_photo: Option<String>,
    pub gender: Option<String>,
    pub date_of_birth: Option<String>,
    pub place_of_birth: Option<String>,
    pub nationality: Option<String>,
    pub timezone: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Email {
    pub address: String,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub is_main_address: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PhoneNumber {
    /// E.164 formatted number.
    pub number: String,
    /// ISO 3166 region code, e.g. `FR`.
    pub country: String,
    #[serde(default = "PhoneNumber::default_type")]
    pub phone_type: PhoneType,
}

impl PhoneNumber {
    fn default_type() -> PhoneType {
        PhoneType::Unknown
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Address {
    pub full_name: Option<String>,
    pub address_line_1: String,
    pub address_line_2: Option<String>,
    pub access_code: Option<String>,
    pub city: String,
    pub state: Option<String>,
    pub postal_code: String,
    pub country: String,
    pub address_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "entity_type", rename_all = "snake_case")]
pub enum EntityBody {
    Users(UserProfile),
    Emails(Email),
    PhoneNumbers(PhoneNumber),
    Addresses(Address),
}

impl EntityBody {
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityBody::Users(_) => EntityType::Users,
            EntityBody::Emails(_) => EntityType::Emails,
            EntityBody::PhoneNumbers(_) => EntityType::PhoneNumbers,
            EntityBody::Addresses(_) => EntityType::Addresses,
        }
    }

    pub fn as_phone(&self) -> Option<&PhoneNumber> {
        match self {
            EntityBody::PhoneNumbers(phone) => Some(phone),
            _ => None,
        }
    }

    pub fn as_phone_mut(&mut self) -> Option<&mut PhoneNumber> {
        match self {
            EntityBody::PhoneNumbers(phone) => Some(phone),
            _ => None,
        }
    }

    fn field_values(&self) -> Value {
        // Serializing a plain struct into a JSON value cannot fail.
        let value = match self {
            EntityBody::Users(body) => serde_json::to_value(body),
            EntityBody::Emails(body) => serde_json::to_value(body),
            EntityBody::PhoneNumbers(body) => serde_json::to_value(body),
            EntityBody::Addresses(body) => serde_json::to_value(body),
        };
        value.unwrap_or(Value::Null)
    }

    /// Trackable fields whose values differ between `previous` and `self`.
    /// With no previous version every trackable field counts as modified.
    pub fn modified_fields(&self, previous: Option<&EntityBody>) -> BTreeSet<String> {
        let entity_type = self.entity_type();
        let current = self.field_values();
        let before = previous
            .filter(|prev| prev.entity_type() == entity_type)
            .map(EntityBody::field_values);
        entity_type
            .trackable_fields()
            .iter()
            .filter(|field| match &before {
                None => true,
                Some(before) => before.get(**field) != current.get(**field),
            })
            .map(|field| field.to_string())
            .collect()
    }
}

/// A stored entity. The profile entity's id equals its owner's id.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub id: EntityId,
    pub user_id: UserId,
    pub body: EntityBody,
}

impl EntityRecord {
    pub fn profile(user_id: UserId, profile: UserProfile) -> Self {
        Self {
            id: user_id.into(),
            user_id,
            body: EntityBody::Users(profile),
        }
    }

    pub fn new(user_id: UserId, body: EntityBody) -> Self {
        let id = match body {
            EntityBody::Users(_) => user_id.into(),
            _ => EntityId::new(),
        };
        Self { id, user_id, body }
    }

    pub fn entity_type(&self) -> EntityType {
        self.body.entity_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modified_fields_only_reports_trackable_changes() {
        let before = EntityBody::Users(UserProfile {
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            ..UserProfile::default()
        });
        let after = EntityBody::Users(UserProfile {
            first_name: Some("Augusta".into()),
            last_name: Some("Lovelace".into()),
            ..UserProfile::default()
        });
        let changed = after.modified_fields(Some(&before));
        assert_eq!(changed, BTreeSet::from(["first_name".to_string()]));
        assert!(before.modified_fields(Some(&before)).is_empty());
    }

    #[test]
    fn new_entities_report_every_trackable_field() {
        let email = EntityBody::Emails(Email {
            address: "ada@example.com".into(),
            ..Email::default()
        });
        assert_eq!(email.modified_fields(None).len(), 3);
    }

    #[test]
    fn bodies_are_tagged_by_entity_type() {
        let record = EntityRecord::new(
            UserId::new(),
            EntityBody::PhoneNumbers(PhoneNumber {
                number: "+33638490374".into(),
                country: "FR".into(),
                phone_type: PhoneType::Mobile,
            }),
        );
        let value = serde_json::to_value(&record.body).expect("serialize");
        assert_eq!(value["entity_type"], "phone_numbers");
        assert_eq!(value["phone_type"], "mobile");
        assert_ne!(record.id, EntityId::from(record.user_id));
    }
}
