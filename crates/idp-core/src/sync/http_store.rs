//! HTTP/JSON document store client
//!
//! Documents live at `{base}/v1/collections/{collection}/documents/{id}`;
//! changes are read by polling `{base}/v1/collections/{collection}/changes`.
//! The last cursor per collection outlives a feed, so a resubscribe resumes
//! where the previous poller stopped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use super::remote::{
    ChangeEvent, ChangeFeed, ChangeKind, DocumentStore, Fields, RemoteDocument, RemoteError,
};
use crate::util::{compact_text, is_http_url, sanitize};

/// Consecutive poll failures after which a change feed is closed
const MAX_POLL_FAILURES: u32 = 3;
/// Upper bound on any single request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct HttpDocumentStore {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
    poll_interval: Duration,
    poll_timeout: Duration,
    cursors: Arc<Mutex<HashMap<String, String>>>,
}

impl std::fmt::Debug for HttpDocumentStore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpDocumentStore")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("poll_interval", &self.poll_interval)
            .field("poll_timeout", &self.poll_timeout)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct UpsertBody<'a> {
    fields: &'a Fields,
}

#[derive(Debug, Deserialize)]
struct ChangePage {
    cursor: Option<String>,
    #[serde(default)]
    events: Vec<WireEvent>,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: ChangeKind,
    document: RemoteDocument,
}

impl HttpDocumentStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, RemoteError> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        if !is_http_url(&base_url) {
            return Err(RemoteError::InvalidResponse(format!(
                "document store URL must start with http:// or https://, got `{base_url}`"
            )));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| RemoteError::Unavailable(sanitize(&error)))?;
        Ok(Self {
            base_url,
            token,
            client,
            poll_interval: Duration::from_secs(2),
            poll_timeout: REQUEST_TIMEOUT,
            cursors: Arc::default(),
        })
    }

    /// Delay between change polls when nothing new arrived
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Longest a single change poll may take before it counts as failed
    #[must_use]
    pub const fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Last change cursor received for `collection`
    pub async fn cursor(&self, collection: &str) -> Option<String> {
        self.cursors.lock().await.get(collection).cloned()
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/v1/collections/{collection}", self.base_url)
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!("{}/documents/{id}", self.collection_url(collection))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn transport_error(error: &reqwest::Error) -> RemoteError {
    RemoteError::Unavailable(sanitize(error))
}

async fn status_error(response: reqwest::Response) -> RemoteError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = format!("status {status}: {}", compact_text(&body));
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RemoteError::Unavailable(message)
    } else {
        RemoteError::Rejected(message)
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn upsert(&self, collection: &str, id: &str, fields: Fields) -> Result<(), RemoteError> {
        let response = self
            .authorize(self.client.put(self.document_url(collection, id)))
            .json(&UpsertBody { fields: &fields })
            .send()
            .await
            .map_err(|error| transport_error(&error))?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<RemoteDocument>, RemoteError> {
        let response = self
            .authorize(self.client.get(self.document_url(collection, id)))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|error| transport_error(&error))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let document = response
            .json::<RemoteDocument>()
            .await
            .map_err(|error| RemoteError::InvalidResponse(sanitize(&error)))?;
        Ok(Some(document))
    }

    async fn probe(&self, collection: &str) -> Result<(), RemoteError> {
        let url = format!("{}/documents", self.collection_url(collection));
        let response = self
            .authorize(self.client.get(url))
            .query(&[("limit", "1")])
            .send()
            .await
            .map_err(|error| transport_error(&error))?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }

    async fn subscribe(&self, collection: &str) -> Result<ChangeFeed, RemoteError> {
        self.probe(collection).await?;
        let (tx, feed) = ChangeFeed::channel();
        let poller = ChangePoller {
            store: self.clone(),
            collection: collection.to_string(),
        };
        tokio::spawn(poller.run(tx));
        Ok(feed)
    }
}

struct ChangePoller {
    store: HttpDocumentStore,
    collection: String,
}

impl ChangePoller {
    async fn run(self, tx: mpsc::UnboundedSender<ChangeEvent>) {
        let mut cursor = self.store.cursor(&self.collection).await;
        let mut failures = 0_u32;

        while !tx.is_closed() {
            match self.fetch(cursor.as_deref()).await {
                Ok(page) => {
                    failures = 0;
                    let idle = page.events.is_empty();
                    for event in page.events {
                        let event = ChangeEvent {
                            kind: event.kind,
                            collection: self.collection.clone(),
                            document: event.document,
                        };
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                    if let Some(next) = page.cursor {
                        self.store
                            .cursors
                            .lock()
                            .await
                            .insert(self.collection.clone(), next.clone());
                        cursor = Some(next);
                    }
                    if idle {
                        tokio::time::sleep(self.store.poll_interval).await;
                    }
                }
                Err(error) => {
                    failures += 1;
                    tracing::warn!(
                        collection = %self.collection,
                        failures,
                        "Change poll failed: {error}"
                    );
                    if failures >= MAX_POLL_FAILURES {
                        tracing::warn!(collection = %self.collection, "Closing change feed");
                        return;
                    }
                    tokio::time::sleep(self.store.poll_interval).await;
                }
            }
        }
    }

    async fn fetch(&self, cursor: Option<&str>) -> Result<ChangePage, RemoteError> {
        tokio::time::timeout(self.store.poll_timeout, self.fetch_page(cursor))
            .await
            .map_err(|_| {
                RemoteError::Unavailable(format!(
                    "change poll timed out after {:?}",
                    self.store.poll_timeout
                ))
            })?
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<ChangePage, RemoteError> {
        let url = format!("{}/changes", self.store.collection_url(&self.collection));
        let mut request = self.store.authorize(self.store.client.get(url));
        if let Some(cursor) = cursor {
            request = request.query(&[("after", cursor)]);
        }
        let response = request
            .send()
            .await
            .map_err(|error| transport_error(&error))?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        response
            .json::<ChangePage>()
            .await
            .map_err(|error| RemoteError::InvalidResponse(sanitize(&error)))
    }
}
