// Shared identifier types used by the identity service and its collaborators.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("config error: {0}")]
    Config(String),
}

pub mod ids {
    // Strongly typed IDs so a client-facing id can never be passed where a real id is expected.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use uuid::Uuid;

    macro_rules! id_type {
        ($(#[$meta:meta])* $name:ident) => {
            $(#[$meta])*
            #[derive(
                Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
            )]
            #[serde(transparent)]
            pub struct $name(Uuid);

            impl $name {
                // Mint a fresh random id.
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                pub fn from_uuid(uuid: Uuid) -> Self {
                    Self(uuid)
                }

                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    let uuid =
                        Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
                    Ok(Self(uuid))
                }
            }
        };
    }

    id_type!(
        /// Canonical id of a user account.
        UserId
    );
    id_type!(
        /// Id of a registered third-party client.
        ClientId
    );
    id_type!(
        /// Store-internal id of any entity, users included.
        EntityId
    );
    id_type!(
        /// Opaque per-(user, client) id handed to a client in place of an [`EntityId`].
        FakeId
    );

    impl From<UserId> for EntityId {
        fn from(user_id: UserId) -> Self {
            EntityId::from_uuid(user_id.as_uuid())
        }
    }

    impl EntityId {
        // Reuse a real entity id as a client-facing id. Only test-account entities do this.
        pub fn as_fake(&self) -> FakeId {
            FakeId::from_uuid(self.0)
        }
    }
}

pub use ids::{ClientId, EntityId, FakeId, UserId};
