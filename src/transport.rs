// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! HTTP client for fetching blobs from remote locations.

use std::io;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use tracing::debug;
use url::Url;

use crate::storage::BlobStream;

#[derive(Debug, thiserror::Error)]
pub enum RemoteFetchError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("remote returned {0}")]
    Status(StatusCode),

    #[error("remote did not answer within {0:?}")]
    Timeout(Duration),
}

/// An open remote response body.
pub struct RemoteBlob {
    pub stream: BlobStream,
    pub mime_type: Option<String>,
    pub content_length: Option<u64>,
}

impl std::fmt::Debug for RemoteBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBlob")
            .field("mime_type", &self.mime_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: Client,
    timeout: Duration,
}

impl HttpTransport {
    /// `timeout` bounds connecting and receiving the response head. The body
    /// is streamed without an overall deadline.
    pub fn new(timeout: Duration) -> Result<Self, RemoteFetchError> {
        let http = Client::builder()
            .connect_timeout(timeout)
            .user_agent(concat!("blossom-server/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteFetchError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// GET `url`, succeeding only on a 2xx status.
    pub async fn fetch(&self, url: &Url) -> Result<RemoteBlob, RemoteFetchError> {
        let response = tokio::time::timeout(self.timeout, self.http.get(url.clone()).send())
            .await
            .map_err(|_| RemoteFetchError::Timeout(self.timeout))?
            .map_err(|e| RemoteFetchError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RemoteFetchError::Status(response.status()));
        }

        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = response.content_length();
        debug!(url = %url, ?mime_type, ?content_length, "Remote source answered");

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(io::Error::other))
            .boxed();

        Ok(RemoteBlob {
            stream,
            mime_type,
            content_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetches_body_and_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blob"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/plain")
                    .set_body_bytes(b"remote bytes".to_vec()),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let url = Url::parse(&format!("{}/blob", server.uri())).unwrap();
        let mut remote = transport.fetch(&url).await.unwrap();
        assert_eq!(remote.mime_type.as_deref(), Some("text/plain"));

        let mut body = Vec::new();
        while let Some(chunk) = remote.stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"remote bytes");
    }

    #[tokio::test]
    async fn non_success_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        assert!(matches!(
            transport.fetch(&url).await,
            Err(RemoteFetchError::Status(StatusCode::NOT_FOUND))
        ));
    }

    #[tokio::test]
    async fn slow_remote_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Duration::from_millis(200)).unwrap();
        let url = Url::parse(&format!("{}/slow", server.uri())).unwrap();
        assert!(matches!(
            transport.fetch(&url).await,
            Err(RemoteFetchError::Timeout(_))
        ));
    }
}
