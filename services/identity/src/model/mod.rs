pub mod client;
pub mod entity;
pub mod grant;
pub mod identity;
pub mod kind;
pub mod notification;
pub mod scope;
pub mod status;
pub mod test_account;

pub use client::ClientRecord;
pub use entity::{Address, Email, EntityBody, EntityRecord, PhoneNumber, UserProfile};
pub use grant::{GrantDelta, GrantMerge, GrantRecord, GrantedEntities};
pub use identity::{EntityIdentityRecord, IdentityUpsert, UserClientKey};
pub use kind::{EntityKind, EntityType, PhoneType};
pub use notification::{
    DeliveryKey, EventType, Notification, NotificationItem, PendingAppend, PendingEnvelope,
};
pub use scope::{Scope, ScopeField, ScopeFlag, ScopeFlags};
pub use status::{
    StatusDelta, StatusTransition, TransitionOutcome, UpdatedEntity, UpdatedEntityStatus,
    UserStatus, UserStatusRecord,
};
pub use test_account::TestAccount;
