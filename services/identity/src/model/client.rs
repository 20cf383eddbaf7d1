//! Registered third-party clients.
use masque_common::ClientId;
use rand::RngCore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub client_id: ClientId,
    pub name: String,
    pub client_secret: String,
    pub update_notification_handler: Option<String>,
}

impl ClientRecord {
    /// Register a client with a freshly minted secret.
    pub fn register(name: impl Into<String>, update_notification_handler: Option<String>) -> Self {
        Self {
            client_id: ClientId::new(),
            name: name.into(),
            client_secret: mint_secret(),
            update_notification_handler: update_notification_handler
                .filter(|url| !url.trim().is_empty()),
        }
    }

    pub fn handler(&self) -> Option<&str> {
        self.update_notification_handler.as_deref()
    }
}

/// 32 random bytes, hex encoded.
pub fn mint_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
