// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Authorization Credentials
//!
//! Uploads (and, when configured, listings) are authorized by a signed
//! Nostr event describing the request.
//!
//! ## Flow
//!
//! 1. Client signs an event with `size` and `expiration` tags
//! 2. Client sends `Authorization: Nostr <base64 event>` (or `?auth=<json>`)
//! 3. Server:
//!    - Parses the event into an [`AuthCredential`]
//!    - Rejects it once `expiration` has passed
//!    - Compares the declared `size` with the received byte count
//!    - Burns the event id so it cannot authorize a second upload
//!
//! Signatures are not verified.

pub mod credential;
pub mod error;
pub mod extractor;

pub use credential::{AuthCredential, NostrEvent};
pub use error::CredentialError;
pub use extractor::OptionalCredential;
