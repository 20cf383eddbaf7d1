//! Domain errors surfaced by the identity provider components.
use crate::delivery::DeliveryError;
use crate::model::{EntityKind, EntityType};
use crate::store::StoreError;
use masque_common::{ClientId, EntityId, UserId};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    /// A client-facing id, client or entity that does not resolve.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// Field-level user input error, recoverable by resubmitting.
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },
    /// Grant bookkeeping is inconsistent. Never mapped to a user-facing error.
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error(
        "invariant violated: no fake id for {kind} {real_id} (user {user_id}, client {client_id})"
    )]
    MissingFakeId {
        user_id: UserId,
        client_id: ClientId,
        kind: EntityKind,
        real_id: EntityId,
    },
    /// Every failure of a batch of independent writes.
    #[error("{} operations failed: {}", .0.len(), FailureList(.0))]
    Aggregate(Vec<IdentityError>),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

pub type IdentityResult<T> = Result<T, IdentityError>;

struct FailureList<'a>(&'a [IdentityError]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, err) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl From<StoreError> for IdentityError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => IdentityError::NotFound(what),
            StoreError::Conflict(what) => IdentityError::Conflict(what),
            other => IdentityError::Store(other),
        }
    }
}

impl IdentityError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        IdentityError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "identity invariant violated");
        IdentityError::Invariant(message)
    }

    pub fn unknown_entity(entity_type: EntityType, id: impl fmt::Display) -> Self {
        IdentityError::NotFound(format!("{entity_type} {id}"))
    }

    /// Whether this error indicates a bug rather than a bad request.
    pub fn is_invariant(&self) -> bool {
        match self {
            IdentityError::Invariant(_) | IdentityError::MissingFakeId { .. } => true,
            IdentityError::Aggregate(errors) => errors.iter().any(IdentityError::is_invariant),
            _ => false,
        }
    }

    /// Collapse a batch of results: every success, or one aggregate of every failure.
    pub fn collect<T>(results: Vec<IdentityResult<T>>) -> IdentityResult<Vec<T>> {
        let mut values = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(value) => values.push(value),
                Err(err) => failures.push(err),
            }
        }
        if failures.is_empty() {
            Ok(values)
        } else {
            Err(IdentityError::Aggregate(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_not_found() {
        let err: IdentityError = StoreError::NotFound("client".into()).into();
        assert!(matches!(err, IdentityError::NotFound(ref what) if what == "client"));
    }

    #[test]
    fn collect_keeps_every_failure() {
        let results: Vec<IdentityResult<u8>> = vec![
            Ok(1),
            Err(IdentityError::Conflict("a".into())),
            Ok(2),
            Err(IdentityError::NotFound("b".into())),
        ];
        let err = IdentityError::collect(results).expect_err("aggregate");
        match &err {
            IdentityError::Aggregate(failures) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            "2 operations failed: conflict: a; not found: b"
        );
    }

    #[test]
    fn missing_fake_id_is_an_invariant() {
        let err = IdentityError::MissingFakeId {
            user_id: UserId::new(),
            client_id: ClientId::new(),
            kind: EntityKind::Emails,
            real_id: EntityId::new(),
        };
        assert!(err.is_invariant());
        assert!(!IdentityError::validation("phone_number", "x").is_invariant());
    }
}
