// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Blossom Server - Content-Addressed Blob Server
//!
//! Blobs are stored and served by the SHA-256 of their bytes. Misses are
//! resolved through a waterfall of sources (local storage, relay discovery,
//! upstream hosts), and remote hits are verified and cached on the way to
//! the client.
//!
//! ## Modules
//!
//! - `api` - HTTP API handlers (Axum)
//! - `auth` - Signed upload credentials
//! - `claims` - Per-hash exclusion between fills, uploads and the pruner
//! - `discovery` - Relay and upstream pointer lookup
//! - `resolver` - Blob resolution waterfall and cache fill
//! - `upload` - Upload admission and commit
//! - `pruner` - Background expiration, eviction and reconciliation
//! - `storage` - Blob backends (local disk, S3) and the metadata database

pub mod api;
pub mod auth;
pub mod claims;
pub mod config;
pub mod content_type;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod models;
pub mod pruner;
pub mod resolver;
pub mod rules;
pub mod staging;
pub mod state;
pub mod storage;
pub mod transport;
pub mod upload;
