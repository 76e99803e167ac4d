// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names, default values and the
//! immutable [`Config`] assembled from them at startup. Components receive
//! the parts of the configuration they need at construction and never read
//! the environment themselves.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `3000` |
//! | `PUBLIC_DOMAIN` | Base URL used when building blob links | `http://127.0.0.1:3000` |
//! | `DATA_DIR` | Root for staging files and the metadata database | `data` |
//! | `DATABASE_PATH` | redb metadata file | `{DATA_DIR}/blobs.redb` |
//! | `STORAGE_BACKEND` | `local` or `s3` | `local` |
//! | `STORAGE_LOCAL_DIR` | Blob directory for the local backend | `{DATA_DIR}/blobs` |
//! | `S3_ENDPOINT` | S3-compatible endpoint URL | Required for `s3` |
//! | `S3_ACCESS_KEY` / `S3_SECRET_KEY` | Static credentials | Required for `s3` |
//! | `S3_BUCKET` | Bucket name | Required for `s3` |
//! | `S3_REGION` | Signing region | `us-east-1` |
//! | `S3_PREFIX` | Key prefix inside the bucket | none |
//! | `S3_PUBLIC_URL` | Public base URL for objects | none |
//! | `STORAGE_RULES` | JSON array of storage rules | `[]` |
//! | `UPLOAD_ENABLED` | Accept uploads | `false` |
//! | `UPLOAD_REQUIRE_AUTH` | Require a credential and exact size match | `true` |
//! | `UPLOAD_REQUIRE_PUBKEY_IN_RULE` | Only pubkey-listed rules admit uploads | `false` |
//! | `UPLOAD_MAX_SIZE` | Maximum upload size in bytes | unlimited |
//! | `LIST_REQUIRE_AUTH` | Require a credential to list blobs | `false` |
//! | `LIST_ALLOW_OTHERS` | Allow listing another pubkey's blobs | `true` |
//! | `DISCOVERY_NOSTR_ENABLED` | Query relays for missing blobs | `false` |
//! | `DISCOVERY_NOSTR_RELAYS` | Comma separated relay URLs | empty |
//! | `DISCOVERY_UPSTREAM_ENABLED` | Fetch missing blobs from upstream hosts | `false` |
//! | `DISCOVERY_UPSTREAM_DOMAINS` | Comma separated upstream base URLs | empty |
//! | `REMOTE_FETCH_TIMEOUT_SECS` | Timeout per remote fetch attempt | `10` |
//! | `PRUNE_INTERVAL_SECS` | Pruner sweep interval | `30` |
//! | `PRUNE_GRACE_SECS` | Skip records touched this recently | `60` |
//! | `MAX_STORAGE_BYTES` | Evict least recently used blobs above this | none |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::rules::Rule;

pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const PUBLIC_DOMAIN_ENV: &str = "PUBLIC_DOMAIN";

/// Environment variable name for the data directory.
///
/// Holds the staging area for in-flight uploads and fetches, the redb
/// metadata file, and (for the local backend) the blobs themselves.
pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const DATABASE_PATH_ENV: &str = "DATABASE_PATH";

pub const STORAGE_BACKEND_ENV: &str = "STORAGE_BACKEND";
pub const STORAGE_LOCAL_DIR_ENV: &str = "STORAGE_LOCAL_DIR";
pub const S3_ENDPOINT_ENV: &str = "S3_ENDPOINT";
pub const S3_ACCESS_KEY_ENV: &str = "S3_ACCESS_KEY";
pub const S3_SECRET_KEY_ENV: &str = "S3_SECRET_KEY";
pub const S3_BUCKET_ENV: &str = "S3_BUCKET";
pub const S3_REGION_ENV: &str = "S3_REGION";
pub const S3_PREFIX_ENV: &str = "S3_PREFIX";
pub const S3_PUBLIC_URL_ENV: &str = "S3_PUBLIC_URL";

/// JSON array of [`Rule`]s, evaluated in order.
pub const STORAGE_RULES_ENV: &str = "STORAGE_RULES";

pub const UPLOAD_ENABLED_ENV: &str = "UPLOAD_ENABLED";
pub const UPLOAD_REQUIRE_AUTH_ENV: &str = "UPLOAD_REQUIRE_AUTH";
pub const UPLOAD_REQUIRE_PUBKEY_IN_RULE_ENV: &str = "UPLOAD_REQUIRE_PUBKEY_IN_RULE";
pub const UPLOAD_MAX_SIZE_ENV: &str = "UPLOAD_MAX_SIZE";
pub const LIST_REQUIRE_AUTH_ENV: &str = "LIST_REQUIRE_AUTH";
pub const LIST_ALLOW_OTHERS_ENV: &str = "LIST_ALLOW_OTHERS";

pub const DISCOVERY_NOSTR_ENABLED_ENV: &str = "DISCOVERY_NOSTR_ENABLED";
pub const DISCOVERY_NOSTR_RELAYS_ENV: &str = "DISCOVERY_NOSTR_RELAYS";
pub const DISCOVERY_UPSTREAM_ENABLED_ENV: &str = "DISCOVERY_UPSTREAM_ENABLED";
pub const DISCOVERY_UPSTREAM_DOMAINS_ENV: &str = "DISCOVERY_UPSTREAM_DOMAINS";
pub const REMOTE_FETCH_TIMEOUT_ENV: &str = "REMOTE_FETCH_TIMEOUT_SECS";

pub const PRUNE_INTERVAL_ENV: &str = "PRUNE_INTERVAL_SECS";
pub const PRUNE_GRACE_ENV: &str = "PRUNE_GRACE_SECS";
pub const MAX_STORAGE_BYTES_ENV: &str = "MAX_STORAGE_BYTES";

pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_PUBLIC_DOMAIN: &str = "http://127.0.0.1:3000";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_S3_REGION: &str = "us-east-1";
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_PRUNE_GRACE: Duration = Duration::from_secs(60);
/// Orphan reconciliation runs on the first sweep and then every N sweeps.
const DEFAULT_RECONCILE_EVERY: u64 = 120;

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is required for the {context}")]
    Missing {
        name: &'static str,
        context: &'static str,
    },

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

// =============================================================================
// Configuration Sections
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

/// Backend discriminator plus its connection parameters.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    Local { dir: PathBuf },
    S3(S3Config),
}

/// Connection parameters for an S3-compatible object store.
#[derive(Clone)]
pub struct S3Config {
    pub endpoint: Url,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
    pub prefix: Option<String>,
    /// Public base URL used instead of `PUBLIC_DOMAIN` for blob links.
    pub public_url: Option<Url>,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint.as_str())
            .field("access_key", &"[REDACTED]")
            .field("secret_key", &"[REDACTED]")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("prefix", &self.prefix)
            .field("public_url", &self.public_url.as_ref().map(Url::as_str))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub enabled: bool,
    pub require_auth: bool,
    pub require_pubkey_in_rule: bool,
    pub max_size: Option<u64>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            require_auth: true,
            require_pubkey_in_rule: false,
            max_size: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListConfig {
    pub require_auth: bool,
    pub allow_list_others: bool,
}

impl Default for ListConfig {
    fn default() -> Self {
        Self {
            require_auth: false,
            allow_list_others: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub nostr_enabled: bool,
    pub relays: Vec<Url>,
    pub upstream_enabled: bool,
    pub upstream_domains: Vec<Url>,
    /// Ceiling for each remote attempt (and each idle gap while streaming).
    pub fetch_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            nostr_enabled: false,
            relays: Vec::new(),
            upstream_enabled: false,
            upstream_domains: Vec::new(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrunerConfig {
    pub interval: Duration,
    pub grace: Duration,
    pub max_storage_bytes: Option<u64>,
    pub reconcile_every: u64,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PRUNE_INTERVAL,
            grace: DEFAULT_PRUNE_GRACE,
            max_storage_bytes: None,
            reconcile_every: DEFAULT_RECONCILE_EVERY,
        }
    }
}

// =============================================================================
// Config
// =============================================================================

/// Complete server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub public_domain: Url,
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub storage: StorageConfig,
    pub rules: Vec<Rule>,
    pub upload: UploadConfig,
    pub list: ListConfig,
    pub discovery: DiscoveryConfig,
    pub pruner: PrunerConfig,
    pub log_format: LogFormat,
}

impl Config {
    /// Defaults rooted at `data_dir`: local storage, no rules, uploads off.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            bind_addr: SocketAddr::new(
                IpAddr::from_str(DEFAULT_HOST).unwrap_or(IpAddr::from([0, 0, 0, 0])),
                DEFAULT_PORT,
            ),
            public_domain: default_public_domain(),
            database_path: data_dir.join("blobs.redb"),
            storage: StorageConfig::Local {
                dir: data_dir.join("blobs"),
            },
            data_dir,
            rules: Vec::new(),
            upload: UploadConfig::default(),
            list: ListConfig::default(),
            discovery: DiscoveryConfig::default(),
            pruner: PrunerConfig::default(),
            log_format: LogFormat::default(),
        }
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let data_dir = PathBuf::from(get(DATA_DIR_ENV).unwrap_or_else(|| DEFAULT_DATA_DIR.into()));
        let mut config = Self::with_data_dir(data_dir.clone());

        let host = get(HOST_ENV).unwrap_or_else(|| DEFAULT_HOST.into());
        let ip = IpAddr::from_str(host.trim()).map_err(|e| invalid(HOST_ENV, e))?;
        let port = parse_or(get(PORT_ENV), PORT_ENV, DEFAULT_PORT)?;
        config.bind_addr = SocketAddr::new(ip, port);

        if let Some(domain) = get(PUBLIC_DOMAIN_ENV) {
            config.public_domain = parse_url(PUBLIC_DOMAIN_ENV, &domain)?;
        }
        if let Some(path) = get(DATABASE_PATH_ENV) {
            config.database_path = PathBuf::from(path);
        }

        config.storage = match get(STORAGE_BACKEND_ENV).as_deref().map(str::trim) {
            None | Some("local") => StorageConfig::Local {
                dir: get(STORAGE_LOCAL_DIR_ENV)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| data_dir.join("blobs")),
            },
            Some("s3") => {
                let require = |name: &'static str| {
                    get(name).ok_or(ConfigError::Missing {
                        name,
                        context: "s3 storage backend",
                    })
                };
                StorageConfig::S3(S3Config {
                    endpoint: parse_url(S3_ENDPOINT_ENV, &require(S3_ENDPOINT_ENV)?)?,
                    access_key: require(S3_ACCESS_KEY_ENV)?,
                    secret_key: require(S3_SECRET_KEY_ENV)?,
                    bucket: require(S3_BUCKET_ENV)?,
                    region: get(S3_REGION_ENV).unwrap_or_else(|| DEFAULT_S3_REGION.into()),
                    prefix: get(S3_PREFIX_ENV),
                    public_url: get(S3_PUBLIC_URL_ENV)
                        .map(|u| parse_url(S3_PUBLIC_URL_ENV, &u))
                        .transpose()?,
                })
            }
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: STORAGE_BACKEND_ENV,
                    reason: format!("unknown backend '{other}' (expected 'local' or 's3')"),
                })
            }
        };

        if let Some(rules) = get(STORAGE_RULES_ENV) {
            config.rules = serde_json::from_str(&rules).map_err(|e| invalid(STORAGE_RULES_ENV, e))?;
        }

        let upload = &mut config.upload;
        upload.enabled = parse_or(get(UPLOAD_ENABLED_ENV), UPLOAD_ENABLED_ENV, upload.enabled)?;
        upload.require_auth = parse_or(
            get(UPLOAD_REQUIRE_AUTH_ENV),
            UPLOAD_REQUIRE_AUTH_ENV,
            upload.require_auth,
        )?;
        upload.require_pubkey_in_rule = parse_or(
            get(UPLOAD_REQUIRE_PUBKEY_IN_RULE_ENV),
            UPLOAD_REQUIRE_PUBKEY_IN_RULE_ENV,
            upload.require_pubkey_in_rule,
        )?;
        upload.max_size = parse_opt(get(UPLOAD_MAX_SIZE_ENV), UPLOAD_MAX_SIZE_ENV)?;

        let list = &mut config.list;
        list.require_auth = parse_or(get(LIST_REQUIRE_AUTH_ENV), LIST_REQUIRE_AUTH_ENV, list.require_auth)?;
        list.allow_list_others = parse_or(
            get(LIST_ALLOW_OTHERS_ENV),
            LIST_ALLOW_OTHERS_ENV,
            list.allow_list_others,
        )?;

        let discovery = &mut config.discovery;
        discovery.nostr_enabled = parse_or(
            get(DISCOVERY_NOSTR_ENABLED_ENV),
            DISCOVERY_NOSTR_ENABLED_ENV,
            discovery.nostr_enabled,
        )?;
        discovery.relays = parse_url_list(DISCOVERY_NOSTR_RELAYS_ENV, get(DISCOVERY_NOSTR_RELAYS_ENV))?;
        discovery.upstream_enabled = parse_or(
            get(DISCOVERY_UPSTREAM_ENABLED_ENV),
            DISCOVERY_UPSTREAM_ENABLED_ENV,
            discovery.upstream_enabled,
        )?;
        discovery.upstream_domains =
            parse_url_list(DISCOVERY_UPSTREAM_DOMAINS_ENV, get(DISCOVERY_UPSTREAM_DOMAINS_ENV))?;
        if let Some(secs) = parse_opt::<u64>(get(REMOTE_FETCH_TIMEOUT_ENV), REMOTE_FETCH_TIMEOUT_ENV)? {
            discovery.fetch_timeout = Duration::from_secs(secs.max(1));
        }

        let pruner = &mut config.pruner;
        if let Some(secs) = parse_opt::<u64>(get(PRUNE_INTERVAL_ENV), PRUNE_INTERVAL_ENV)? {
            pruner.interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_opt::<u64>(get(PRUNE_GRACE_ENV), PRUNE_GRACE_ENV)? {
            pruner.grace = Duration::from_secs(secs);
        }
        pruner.max_storage_bytes = parse_opt(get(MAX_STORAGE_BYTES_ENV), MAX_STORAGE_BYTES_ENV)?;

        config.log_format = match get(LOG_FORMAT_ENV).as_deref().map(str::trim) {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: LOG_FORMAT_ENV,
                    reason: format!("unknown format '{other}' (expected 'json' or 'pretty')"),
                })
            }
        };

        Ok(config)
    }

    /// Staging directory for partially received blobs.
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }
}

fn default_public_domain() -> Url {
    Url::parse(DEFAULT_PUBLIC_DOMAIN).expect("default public domain is a valid URL")
}

fn invalid(name: &'static str, error: impl fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: error.to_string(),
    }
}

fn parse_url(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value.trim()).map_err(|e| invalid(name, e))
}

fn parse_url_list(name: &'static str, value: Option<String>) -> Result<Vec<Url>, ConfigError> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_url(name, s))
        .collect()
}

fn parse_opt<T>(value: Option<String>, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .map(|v| v.trim().parse::<T>().map_err(|e| invalid(name, e)))
        .transpose()
}

fn parse_or<T>(value: Option<String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    Ok(parse_opt(value, name)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.database_path, PathBuf::from("data/blobs.redb"));
        assert!(matches!(config.storage, StorageConfig::Local { ref dir } if dir == &PathBuf::from("data/blobs")));
        assert!(!config.upload.enabled);
        assert!(config.upload.require_auth);
        assert!(config.rules.is_empty());
        assert!(!config.discovery.nostr_enabled);
        assert_eq!(config.pruner.interval, Duration::from_secs(30));
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn parses_discovery_and_rules() {
        let config = load(&[
            ("DISCOVERY_UPSTREAM_ENABLED", "true"),
            ("DISCOVERY_UPSTREAM_DOMAINS", "https://a.example, https://b.example"),
            ("STORAGE_RULES", r#"[{"id":"all","type":"*","expiration":"1 week"}]"#),
            ("REMOTE_FETCH_TIMEOUT_SECS", "3"),
        ])
        .unwrap();

        assert!(config.discovery.upstream_enabled);
        assert_eq!(config.discovery.upstream_domains.len(), 2);
        assert_eq!(config.discovery.upstream_domains[1].host_str(), Some("b.example"));
        assert_eq!(config.rules[0].id, "all");
        assert_eq!(config.discovery.fetch_timeout, Duration::from_secs(3));
    }

    #[test]
    fn s3_backend_requires_credentials() {
        let err = load(&[("STORAGE_BACKEND", "s3"), ("S3_ENDPOINT", "http://minio:9000")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { name: S3_ACCESS_KEY_ENV, .. }));

        let config = load(&[
            ("STORAGE_BACKEND", "s3"),
            ("S3_ENDPOINT", "http://minio:9000"),
            ("S3_ACCESS_KEY", "key"),
            ("S3_SECRET_KEY", "hunter2-value"),
            ("S3_BUCKET", "blobs"),
        ])
        .unwrap();
        let StorageConfig::S3(s3) = config.storage else {
            panic!("expected s3 backend");
        };
        assert_eq!(s3.region, "us-east-1");
        assert!(!format!("{s3:?}").contains("hunter2-value"));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(load(&[("STORAGE_BACKEND", "ftp")]).is_err());
        assert!(load(&[("UPLOAD_ENABLED", "maybe")]).is_err());
        assert!(load(&[("STORAGE_RULES", "not json")]).is_err());
        assert!(load(&[("LOG_FORMAT", "xml")]).is_err());
        assert!(load(&[("DISCOVERY_NOSTR_RELAYS", "not a url")]).is_err());
    }
}
