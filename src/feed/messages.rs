//! Change message definitions and serialization

use crate::error::{DirectoryError, Result};
use crate::types::{ChangeEvent, ChangeKind, ProviderId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exchange carrying provider change messages
pub const CHANGE_EXCHANGE: &str = "directory.changes";

/// Binding key matching every provider change
pub const PROVIDER_BINDING_KEY: &str = "provider.#";

/// Table whose changes the directory follows
pub const PROVIDER_TABLE: &str = "driver_profiles";

fn default_table() -> String {
    PROVIDER_TABLE.to_string()
}

/// A change notification as it travels over AMQP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeMessage {
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(alias = "type", alias = "eventType")]
    pub kind: ChangeKind,
    #[serde(alias = "id")]
    pub provider_id: ProviderId,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChangeMessage {
    pub fn new(provider_id: impl Into<ProviderId>, kind: ChangeKind) -> Self {
        Self {
            table: default_table(),
            kind,
            provider_id: provider_id.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn from_event(event: &ChangeEvent) -> Self {
        Self {
            table: default_table(),
            kind: event.kind,
            provider_id: event.provider_id.clone(),
            timestamp: Some(event.received_at),
        }
    }

    /// Whether the message concerns the provider table
    pub fn is_provider_change(&self) -> bool {
        self.table == PROVIDER_TABLE
    }

    /// Routing key used when publishing, e.g. `provider.update`
    pub fn routing_key(&self) -> String {
        format!("provider.{}", self.kind)
    }

    /// Convert into a feed event stamped with the local receive time
    pub fn into_event(self) -> ChangeEvent {
        ChangeEvent::new(self.provider_id, self.kind)
    }
}

/// Message serialization and validation utilities
pub struct MessageUtils;

impl MessageUtils {
    /// Serialize a change message to bytes
    pub fn serialize_change(message: &ChangeMessage) -> Result<Vec<u8>> {
        Self::validate_change(message)?;
        serde_json::to_vec(message).map_err(|e| {
            DirectoryError::InternalError {
                message: format!("Failed to serialize change message: {}", e),
            }
            .into()
        })
    }

    /// Deserialize a change message from bytes
    pub fn deserialize_change(bytes: &[u8]) -> Result<ChangeMessage> {
        let message: ChangeMessage =
            serde_json::from_slice(bytes).map_err(|e| DirectoryError::InvalidChangeMessage {
                reason: format!("Failed to deserialize change message: {}", e),
            })?;

        Self::validate_change(&message)?;
        Ok(message)
    }

    /// Validate a change message
    pub fn validate_change(message: &ChangeMessage) -> Result<()> {
        if message.provider_id.trim().is_empty() {
            return Err(DirectoryError::InvalidChangeMessage {
                reason: "Provider ID cannot be empty".to_string(),
            }
            .into());
        }

        if message.table.trim().is_empty() {
            return Err(DirectoryError::InvalidChangeMessage {
                reason: "Table name cannot be empty".to_string(),
            }
            .into());
        }

        Ok(())
    }
}
