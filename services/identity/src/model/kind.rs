//! Entity types, grant/tag kinds and phone types.
//!
//! # Purpose
//! An [`EntityType`] names a trackable collection (`users`, `emails`, ...). An
//! [`EntityKind`] names the key a client was granted an entity under; phone
//! numbers are granted per phone type, so one phone number may be known to
//! different clients as `unknown_phone_numbers` or `mobile_phone_numbers`.
//! Kinds double as the tags stored on identity records.
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Users,
    Emails,
    PhoneNumbers,
    Addresses,
}

impl EntityType {
    pub const SUB_ENTITIES: [EntityType; 3] = [
        EntityType::Emails,
        EntityType::PhoneNumbers,
        EntityType::Addresses,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Users => "users",
            EntityType::Emails => "emails",
            EntityType::PhoneNumbers => "phone_numbers",
            EntityType::Addresses => "addresses",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "users" => Some(EntityType::Users),
            "emails" => Some(EntityType::Emails),
            "phone_numbers" => Some(EntityType::PhoneNumbers),
            "addresses" => Some(EntityType::Addresses),
            _ => None,
        }
    }

    /// Fields whose modification is reported to clients.
    pub fn trackable_fields(&self) -> &'static [&'static str] {
        match self {
            EntityType::Users => &[
                "first_name",
                "last_name",
                "nickname",
                "profil_photo",
                "gender",
                "date_of_birth",
                "place_of_birth",
                "nationality",
                "timezone",
            ],
            EntityType::Emails => &["address", "is_verified", "is_main_address"],
            EntityType::PhoneNumbers => &["number", "country", "phone_type"],
            EntityType::Addresses => &[
                "full_name",
                "address_line_1",
                "address_line_2",
                "access_code",
                "city",
                "state",
                "postal_code",
                "country",
                "address_type",
            ],
        }
    }

    /// Whether a freshly created entity of this type is visible to every client that
    /// requested the type, before any explicit grant of its id.
    pub fn shared_with_new_clients(&self) -> bool {
        matches!(self, EntityType::Addresses)
    }

    /// The kind used when an entity of this type is granted without a more specific preference.
    pub fn default_kind(&self) -> EntityKind {
        match self {
            EntityType::Users => EntityKind::Users,
            EntityType::Emails => EntityKind::Emails,
            EntityType::PhoneNumbers => EntityKind::UnknownPhoneNumbers,
            EntityType::Addresses => EntityKind::Addresses,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Users,
    Emails,
    UnknownPhoneNumbers,
    MobilePhoneNumbers,
    LandlinePhoneNumbers,
    Addresses,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Users => "users",
            EntityKind::Emails => "emails",
            EntityKind::UnknownPhoneNumbers => "unknown_phone_numbers",
            EntityKind::MobilePhoneNumbers => "mobile_phone_numbers",
            EntityKind::LandlinePhoneNumbers => "landline_phone_numbers",
            EntityKind::Addresses => "addresses",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "users" => Some(EntityKind::Users),
            "emails" => Some(EntityKind::Emails),
            "unknown_phone_numbers" => Some(EntityKind::UnknownPhoneNumbers),
            "mobile_phone_numbers" => Some(EntityKind::MobilePhoneNumbers),
            "landline_phone_numbers" => Some(EntityKind::LandlinePhoneNumbers),
            "addresses" => Some(EntityKind::Addresses),
            _ => None,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityKind::Users => EntityType::Users,
            EntityKind::Emails => EntityType::Emails,
            EntityKind::UnknownPhoneNumbers
            | EntityKind::MobilePhoneNumbers
            | EntityKind::LandlinePhoneNumbers => EntityType::PhoneNumbers,
            EntityKind::Addresses => EntityType::Addresses,
        }
    }

    /// Phone type a client asked for, `None` for non-phone kinds.
    pub fn phone_type(&self) -> Option<PhoneType> {
        match self {
            EntityKind::UnknownPhoneNumbers => Some(PhoneType::Unknown),
            EntityKind::MobilePhoneNumbers => Some(PhoneType::Mobile),
            EntityKind::LandlinePhoneNumbers => Some(PhoneType::Landline),
            _ => None,
        }
    }

    /// Precedence when one grant holds the same entity under several kinds.
    /// Lower ranks win: unknown > mobile > landline.
    fn precedence(&self) -> u8 {
        match self {
            EntityKind::UnknownPhoneNumbers => 0,
            EntityKind::MobilePhoneNumbers => 1,
            EntityKind::LandlinePhoneNumbers => 2,
            _ => 0,
        }
    }

    pub fn preferred<I>(kinds: I) -> Option<EntityKind>
    where
        I: IntoIterator<Item = EntityKind>,
    {
        kinds.into_iter().min_by_key(|kind| kind.precedence())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PhoneType {
    Unknown,
    Mobile,
    Landline,
}

impl PhoneType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhoneType::Unknown => "unknown",
            PhoneType::Mobile => "mobile",
            PhoneType::Landline => "landline",
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            PhoneType::Unknown => EntityKind::UnknownPhoneNumbers,
            PhoneType::Mobile => EntityKind::MobilePhoneNumbers,
            PhoneType::Landline => EntityKind::LandlinePhoneNumbers,
        }
    }
}

impl fmt::Display for PhoneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
