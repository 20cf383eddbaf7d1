//! Scope fields and scope flags a client may request.
use super::kind::EntityType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ScopeField {
    FirstName,
    LastName,
    Nickname,
    ProfilPhoto,
    Gender,
    DateOfBirth,
    PlaceOfBirth,
    Nationality,
    Timezone,
    Emails,
    PhoneNumbers,
    Addresses,
}

impl ScopeField {
    pub const ALL: [ScopeField; 12] = [
        ScopeField::FirstName,
        ScopeField::LastName,
        ScopeField::Nickname,
        ScopeField::ProfilPhoto,
        ScopeField::Gender,
        ScopeField::DateOfBirth,
        ScopeField::PlaceOfBirth,
        ScopeField::Nationality,
        ScopeField::Timezone,
        ScopeField::Emails,
        ScopeField::PhoneNumbers,
        ScopeField::Addresses,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeField::FirstName => "first_name",
            ScopeField::LastName => "last_name",
            ScopeField::Nickname => "nickname",
            ScopeField::ProfilPhoto => "profil_photo",
            ScopeField::Gender => "gender",
            ScopeField::DateOfBirth => "date_of_birth",
            ScopeField::PlaceOfBirth => "place_of_birth",
            ScopeField::Nationality => "nationality",
            ScopeField::Timezone => "timezone",
            ScopeField::Emails => "emails",
            ScopeField::PhoneNumbers => "phone_numbers",
            ScopeField::Addresses => "addresses",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.as_str() == value)
    }

    /// Scope entry covering a whole sub-entity collection.
    pub fn for_entity_type(entity_type: EntityType) -> Option<Self> {
        match entity_type {
            EntityType::Users => None,
            EntityType::Emails => Some(ScopeField::Emails),
            EntityType::PhoneNumbers => Some(ScopeField::PhoneNumbers),
            EntityType::Addresses => Some(ScopeField::Addresses),
        }
    }

    pub fn entity_type(&self) -> Option<EntityType> {
        match self {
            ScopeField::Emails => Some(EntityType::Emails),
            ScopeField::PhoneNumbers => Some(EntityType::PhoneNumbers),
            ScopeField::Addresses => Some(EntityType::Addresses),
            _ => None,
        }
    }
}

impl fmt::Display for ScopeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ScopeFlag {
    MobilePhoneNumber,
    LandlinePhoneNumber,
    SeparateShippingBillingAddress,
}

impl ScopeFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeFlag::MobilePhoneNumber => "mobile_phone_number",
            ScopeFlag::LandlinePhoneNumber => "landline_phone_number",
            ScopeFlag::SeparateShippingBillingAddress => "separate_shipping_billing_address",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mobile_phone_number" => Some(ScopeFlag::MobilePhoneNumber),
            "landline_phone_number" => Some(ScopeFlag::LandlinePhoneNumber),
            "separate_shipping_billing_address" => Some(ScopeFlag::SeparateShippingBillingAddress),
            _ => None,
        }
    }
}

pub type Scope = BTreeSet<ScopeField>;
pub type ScopeFlags = BTreeSet<ScopeFlag>;

/// Parse stored scope strings, dropping names this build no longer knows.
pub fn parse_scope<'a, I>(values: I) -> Scope
where
    I: IntoIterator<Item = &'a String>,
{
    values
        .into_iter()
        .filter_map(|value| ScopeField::parse(value))
        .collect()
}

pub fn parse_scope_flags<'a, I>(values: I) -> ScopeFlags
where
    I: IntoIterator<Item = &'a String>,
{
    values
        .into_iter()
        .filter_map(|value| ScopeFlag::parse(value))
        .collect()
}
