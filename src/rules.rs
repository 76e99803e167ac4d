// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Admission and Retention Rules
//!
//! An ordered list of [`Rule`]s decides whether an upload is accepted and
//! how long the blob is retained.
//!
//! ## Evaluation
//!
//! Rules are scanned in declaration order. The first rule whose MIME matcher
//! accepts the candidate type (and, if the rule carries a pubkey allow-list,
//! whose list contains the uploader) wins. No match is a rejection.
//!
//! ## Rule JSON
//!
//! ```json
//! [
//!   { "id": "images", "type": "image/*", "expiration": "1 month" },
//!   { "id": "friends", "type": "*", "pubkeys": ["ab12..."], "expiration": "never" }
//! ]
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::content_type::essence;

// =============================================================================
// Expiration Policy
// =============================================================================

/// Retention policy of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    Never,
    After(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid expiration '{0}' (expected 'never' or e.g. '30 days', '12h', '1 month')")]
pub struct InvalidExpiration(pub String);

impl Expiration {
    /// Absolute expiration for a blob admitted at `now`; `None` means never.
    pub fn at(&self, now: DateTime<Utc>) -> Option<i64> {
        match self {
            Expiration::Never => None,
            Expiration::After(duration) => {
                let secs = i64::try_from(duration.as_secs()).unwrap_or(i64::MAX);
                Some(now.timestamp().saturating_add(secs))
            }
        }
    }
}

impl FromStr for Expiration {
    type Err = InvalidExpiration;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim().to_ascii_lowercase();
        if input == "never" {
            return Ok(Expiration::Never);
        }

        let split = input
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| InvalidExpiration(s.to_string()))?;
        let (amount, unit) = input.split_at(split);
        let amount: u64 = amount.parse().map_err(|_| InvalidExpiration(s.to_string()))?;

        let unit_secs: u64 = match unit.trim() {
            "s" | "sec" | "secs" | "second" | "seconds" => 1,
            "m" | "min" | "mins" | "minute" | "minutes" => 60,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
            "d" | "day" | "days" => 86_400,
            "w" | "week" | "weeks" => 7 * 86_400,
            "month" | "months" => 30 * 86_400,
            "y" | "year" | "years" => 365 * 86_400,
            _ => return Err(InvalidExpiration(s.to_string())),
        };

        // Must stay representable as a signed unix offset.
        amount
            .checked_mul(unit_secs)
            .filter(|secs| i64::try_from(*secs).is_ok())
            .map(|secs| Expiration::After(Duration::from_secs(secs)))
            .ok_or_else(|| InvalidExpiration(s.to_string()))
    }
}

impl fmt::Display for Expiration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expiration::Never => f.write_str("never"),
            Expiration::After(duration) => write!(f, "{}s", duration.as_secs()),
        }
    }
}

impl<'de> Deserialize<'de> for Expiration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for Expiration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// =============================================================================
// Rule
// =============================================================================

/// One admission rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub id: String,
    /// `*`, `type/*` or an exact MIME type.
    #[serde(rename = "type")]
    pub mime_type: String,
    /// Optional allow-list of uploader pubkeys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkeys: Option<Vec<String>>,
    pub expiration: Expiration,
}

impl Rule {
    pub fn matches_mime(&self, candidate: Option<&str>) -> bool {
        let pattern = self.mime_type.trim().to_ascii_lowercase();
        if pattern == "*" || pattern == "*/*" {
            return true;
        }
        let Some(candidate) = candidate.map(essence) else {
            return false;
        };
        match pattern.strip_suffix("/*") {
            Some(top_level) => candidate
                .split_once('/')
                .is_some_and(|(kind, _)| kind == top_level),
            None => candidate == pattern,
        }
    }

    fn admits_pubkey(&self, pubkey: Option<&str>, require_listed: bool) -> bool {
        match (&self.pubkeys, pubkey) {
            (Some(allowed), Some(key)) => allowed.iter().any(|k| k.eq_ignore_ascii_case(key)),
            (Some(_), None) => false,
            (None, _) => !require_listed,
        }
    }
}

// =============================================================================
// Rule Engine
// =============================================================================

/// Properties of an upload the rules are evaluated against.
#[derive(Debug, Clone, Copy, Default)]
pub struct Candidate<'a> {
    pub mime_type: Option<&'a str>,
    pub pubkey: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no storage rule matches type '{}'", .mime_type.as_deref().unwrap_or("unknown"))]
pub struct NoMatchingRule {
    pub mime_type: Option<String>,
}

/// Ordered rule list with first-match semantics.
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
    /// Only rules that list the uploader's pubkey may admit an upload.
    require_pubkey_in_rule: bool,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>, require_pubkey_in_rule: bool) -> Self {
        Self {
            rules,
            require_pubkey_in_rule,
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// First rule admitting the candidate.
    pub fn evaluate(&self, candidate: Candidate<'_>) -> Result<&Rule, NoMatchingRule> {
        self.rules
            .iter()
            .find(|rule| {
                rule.matches_mime(candidate.mime_type)
                    && rule.admits_pubkey(candidate.pubkey, self.require_pubkey_in_rule)
            })
            .ok_or_else(|| NoMatchingRule {
                mime_type: candidate.mime_type.map(str::to_string),
            })
    }

    pub fn expiration_for(rule: &Rule, now: DateTime<Utc>) -> Option<i64> {
        rule.expiration.at(now)
    }

    /// Retention for a blob cached from a remote source: the first rule whose
    /// type matches, ignoring uploader restrictions. `None` keeps it forever.
    pub fn retention_for(&self, mime_type: Option<&str>, now: DateTime<Utc>) -> Option<i64> {
        self.rules
            .iter()
            .find(|rule| rule.matches_mime(mime_type))
            .and_then(|rule| rule.expiration.at(now))
    }
}
