// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authorization credential carried by upload and list requests.
//!
//! A credential is a Nostr event serialized as JSON, sent either as
//! `Authorization: Nostr <base64(json)>`, as the raw JSON in the header, or
//! through the `auth` query parameter. Only presence and consistency are
//! checked here; event signatures are not verified.
//!
//! ```json
//! {
//!   "id": "…", "pubkey": "…", "kind": 24242, "created_at": 1700000000,
//!   "tags": [["size", "1024"], ["expiration", "1700003600"]]
//! }
//! ```

use base64ct::{Base64, Encoding};
use serde::{Deserialize, Serialize};

use super::CredentialError;

/// Header scheme prefix for base64-encoded events.
pub const NOSTR_SCHEME: &str = "Nostr ";

/// Wire form of the signed event. Unknown fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NostrEvent {
    pub id: String,
    pub pubkey: String,
    #[serde(default)]
    pub kind: u32,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
}

impl NostrEvent {
    /// Value of the first tag named `name`.
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }
}

/// Credential as seen by the upload and list paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCredential {
    /// Unique id, consumed on successful upload.
    pub id: String,
    /// Subject key of the uploader.
    pub pubkey: String,
    pub kind: u32,
    pub created_at: i64,
    /// Declared payload size.
    pub size: Option<u64>,
    /// End of the validity window (unix seconds).
    pub expiration: Option<i64>,
}

impl AuthCredential {
    /// Parse an `Authorization` header or `auth` query value.
    pub fn parse(value: &str) -> Result<Self, CredentialError> {
        let value = value.trim();
        let json = match value.strip_prefix(NOSTR_SCHEME) {
            Some(encoded) => {
                let bytes = Base64::decode_vec(encoded.trim())
                    .map_err(|_| CredentialError::InvalidEncoding)?;
                String::from_utf8(bytes).map_err(|_| CredentialError::InvalidEncoding)?
            }
            None if value.starts_with('{') => value.to_string(),
            None => return Err(CredentialError::InvalidEncoding),
        };

        let event: NostrEvent = serde_json::from_str(&json)
            .map_err(|e| CredentialError::MalformedEvent(e.to_string()))?;
        Self::from_event(&event)
    }

    pub fn from_event(event: &NostrEvent) -> Result<Self, CredentialError> {
        if event.id.trim().is_empty() {
            return Err(CredentialError::MalformedEvent("missing id".into()));
        }
        if event.pubkey.trim().is_empty() {
            return Err(CredentialError::MalformedEvent("missing pubkey".into()));
        }

        let size = event
            .tag("size")
            .map(|v| v.trim().parse::<u64>())
            .transpose()
            .map_err(|_| CredentialError::MalformedEvent("size tag is not a byte count".into()))?;
        let expiration = event
            .tag("expiration")
            .map(|v| v.trim().parse::<i64>())
            .transpose()
            .map_err(|_| CredentialError::MalformedEvent("expiration tag is not a timestamp".into()))?;

        Ok(Self {
            id: event.id.clone(),
            pubkey: event.pubkey.to_ascii_lowercase(),
            kind: event.kind,
            created_at: event.created_at,
            size,
            expiration,
        })
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration.is_some_and(|at| at <= now)
    }

    /// Fail with [`CredentialError::Expired`] once the window has passed.
    pub fn ensure_valid(&self, now: i64) -> Result<(), CredentialError> {
        if self.is_expired(now) {
            return Err(CredentialError::Expired);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn encode_header(event: &NostrEvent) -> String {
    let json = serde_json::to_string(event).unwrap();
    format!("{NOSTR_SCHEME}{}", Base64::encode_string(json.as_bytes()))
}
