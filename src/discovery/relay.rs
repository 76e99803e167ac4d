// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Relay-based discovery over the Nostr websocket protocol.
//!
//! One exchange per relay: `REQ` with a file-metadata filter, collect
//! `EVENT`s until `EOSE` (or `CLOSED`), then `CLOSE` the subscription.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{future::join_all, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::{dedup_pointers, BlobSearch, DiscoveryNetwork, Pointer};
use crate::auth::NostrEvent;

/// NIP-94 file metadata.
pub const FILE_METADATA_KIND: u32 = 1063;

/// Cap on events requested from a single relay.
const EVENT_LIMIT: u32 = 20;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("relay timed out")]
    Timeout,

    #[error("relay closed the subscription: {0}")]
    Closed(String),
}

#[derive(Debug, Clone)]
pub struct RelayDiscovery {
    relays: Vec<Url>,
    timeout: Duration,
}

impl RelayDiscovery {
    pub fn new(relays: Vec<Url>, timeout: Duration) -> Self {
        Self { relays, timeout }
    }

    pub fn relays(&self) -> &[Url] {
        &self.relays
    }

    async fn query(&self, relay: &Url, search: &BlobSearch) -> Result<Vec<Pointer>, RelayError> {
        tokio::time::timeout(self.timeout, query_relay(relay, search))
            .await
            .map_err(|_| RelayError::Timeout)?
    }
}

#[async_trait]
impl DiscoveryNetwork for RelayDiscovery {
    async fn search(&self, search: &BlobSearch) -> Vec<Pointer> {
        let results = join_all(self.relays.iter().map(|relay| async move {
            match self.query(relay, search).await {
                Ok(pointers) => {
                    debug!(relay = %relay, hash = %search.hash, found = pointers.len(), "Relay answered");
                    pointers
                }
                Err(e) => {
                    warn!(relay = %relay, hash = %search.hash, error = %e, "Relay query failed");
                    Vec::new()
                }
            }
        }))
        .await;

        dedup_pointers(results.into_iter().flatten().collect())
    }
}

/// Subscription filter for file metadata events naming `hash`.
pub fn build_filter(search: &BlobSearch) -> Value {
    let mut filter = json!({
        "kinds": [FILE_METADATA_KIND],
        "#x": [search.hash.as_str()],
        "limit": EVENT_LIMIT,
    });
    if let Some(pubkey) = &search.pubkey {
        filter["authors"] = json!([pubkey]);
    }
    filter
}

/// Pointer advertised by a file metadata event, if it describes `search`.
pub fn pointer_from_event(event: &NostrEvent, search: &BlobSearch) -> Option<Pointer> {
    if event.kind != FILE_METADATA_KIND {
        return None;
    }
    // Relays are not trusted to apply the tag filter.
    if !event
        .tag("x")
        .is_some_and(|x| x.eq_ignore_ascii_case(search.hash.as_str()))
    {
        return None;
    }
    let location = Url::parse(event.tag("url")?).ok()?;
    if !matches!(location.scheme(), "http" | "https") {
        return None;
    }
    Some(Pointer {
        location,
        mime_type: event.tag("m").map(str::to_string),
    })
}

async fn query_relay(relay: &Url, search: &BlobSearch) -> Result<Vec<Pointer>, RelayError> {
    let (ws_stream, _) = connect_async(relay.as_str()).await?;
    let (mut write, mut read) = ws_stream.split();

    let sub_id = Uuid::new_v4().simple().to_string();
    let request = json!(["REQ", sub_id, build_filter(search)]);
    write.send(Message::Text(request.to_string())).await?;

    let mut pointers = Vec::new();
    while let Some(message) = read.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(Value::Array(frame)) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let label = frame.first().and_then(Value::as_str);
        let for_us = frame.get(1).and_then(Value::as_str) == Some(sub_id.as_str());

        match label {
            Some("EVENT") if for_us => {
                let event = frame
                    .get(2)
                    .cloned()
                    .and_then(|raw| serde_json::from_value::<NostrEvent>(raw).ok());
                if let Some(pointer) = event.and_then(|e| pointer_from_event(&e, search)) {
                    pointers.push(pointer);
                }
            }
            Some("EOSE") if for_us => break,
            Some("CLOSED") if for_us => {
                let reason = frame.get(2).and_then(Value::as_str).unwrap_or_default();
                return Err(RelayError::Closed(reason.to_string()));
            }
            _ => {}
        }
    }

    let close = json!(["CLOSE", sub_id]);
    write.send(Message::Text(close.to_string())).await.ok();
    write.close().await.ok();

    Ok(pointers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BlobHash;
    use tokio::net::TcpListener;

    fn file_event(hash: &BlobHash, url: &str) -> NostrEvent {
        NostrEvent {
            id: "e1".into(),
            pubkey: "author".into(),
            kind: FILE_METADATA_KIND,
            created_at: 0,
            tags: vec![
                vec!["x".into(), hash.to_string()],
                vec!["url".into(), url.into()],
                vec!["m".into(), "image/png".into()],
            ],
            content: String::new(),
        }
    }

    #[test]
    fn filter_restricts_author_when_given() {
        let mut search = BlobSearch::new(BlobHash::of(b"x"));
        let open = build_filter(&search);
        assert_eq!(open["kinds"][0], 1063);
        assert!(open.get("authors").is_none());

        search.pubkey = Some("abc".into());
        assert_eq!(build_filter(&search)["authors"][0], "abc");
    }

    #[test]
    fn pointer_requires_matching_hash_and_http_url() {
        let hash = BlobHash::of(b"x");
        let search = BlobSearch::new(hash.clone());

        let pointer = pointer_from_event(&file_event(&hash, "https://cdn.example/a.png"), &search).unwrap();
        assert_eq!(pointer.location.as_str(), "https://cdn.example/a.png");
        assert_eq!(pointer.mime_type.as_deref(), Some("image/png"));

        let other = file_event(&BlobHash::of(b"y"), "https://cdn.example/a.png");
        assert!(pointer_from_event(&other, &search).is_none());
        assert!(pointer_from_event(&file_event(&hash, "ftp://cdn.example/a"), &search).is_none());
    }

    /// Minimal relay that answers every REQ with one event and EOSE.
    async fn spawn_relay(event: NostrEvent) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let frame: Value = serde_json::from_str(&text).unwrap();
                if frame[0] == "REQ" {
                    let sub = frame[1].clone();
                    let notice = json!(["NOTICE", "hello"]);
                    ws.send(Message::Text(notice.to_string())).await.unwrap();
                    let reply = json!(["EVENT", sub, event]);
                    ws.send(Message::Text(reply.to_string())).await.unwrap();
                    ws.send(Message::Text(json!(["EOSE", sub]).to_string())).await.unwrap();
                }
            }
        });
        Url::parse(&format!("ws://{addr}")).unwrap()
    }

    #[tokio::test]
    async fn queries_relay_until_eose() {
        let hash = BlobHash::of(b"relay blob");
        let relay = spawn_relay(file_event(&hash, "https://cdn.example/blob")).await;
        let discovery = RelayDiscovery::new(vec![relay], Duration::from_secs(5));

        let pointers = discovery.search(&BlobSearch::new(hash)).await;
        assert_eq!(pointers.len(), 1);
        assert_eq!(pointers[0].location.as_str(), "https://cdn.example/blob");
    }

    #[tokio::test]
    async fn unreachable_relay_yields_nothing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let relay = Url::parse(&format!("ws://{addr}")).unwrap();
        let discovery = RelayDiscovery::new(vec![relay], Duration::from_secs(2));
        assert!(discovery
            .search(&BlobSearch::new(BlobHash::of(b"x")))
            .await
            .is_empty());
    }
}
