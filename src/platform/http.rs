//! REST client for the ontology platform.
//!
//! Actions and object reads are plain JSON requests. A change feed is a
//! long-lived response streaming one JSON [`FeedMessage`] per line; the
//! stream ending for any reason is reported as a closed subscription.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{FeedListener, FeedMessage, OntologyPlatform, PlatformSubscription};
use crate::error::{Result, SyncError};
use crate::ingest::RecordSink;

pub struct HttpPlatform {
    http_client: HttpClient,
    /// Separate client without a request timeout for change feeds.
    stream_client: HttpClient,
    base_url: String,
    token: String,
    ontology: String,
}

impl HttpPlatform {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        ontology: impl Into<String>,
    ) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let stream_client = HttpClient::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http_client,
            stream_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            ontology: ontology.into(),
        })
    }

    fn ontology_url(&self, path: &str) -> String {
        format!(
            "{}/api/v2/ontologies/{}{}",
            self.base_url, self.ontology, path
        )
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SyncError::Upstream {
            service: "platform",
            status: status.as_u16(),
            message: body,
        })
    }
}

#[async_trait]
impl OntologyPlatform for HttpPlatform {
    fn subscribe(
        &self,
        object_type: &str,
        listener: FeedListener,
    ) -> Box<dyn PlatformSubscription> {
        let request = self
            .stream_client
            .get(self.ontology_url(&format!("/objects/{object_type}/subscribe")))
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/x-ndjson");
        let object_type = object_type.to_string();

        let task = tokio::spawn(async move {
            let reason = match run_feed(request, &listener).await {
                Ok(()) => "change feed ended".to_string(),
                Err(e) => e.to_string(),
            };
            debug!(object_type = %object_type, reason = %reason, "Change feed closed");
            let _ = listener.send(FeedMessage::Error {
                message: reason,
                subscription_closed: true,
            });
        });

        Box::new(StreamSubscription { task: Some(task) })
    }

    async fn apply_action(&self, action: &str, params: Value) -> Result<Value> {
        let url = self.ontology_url(&format!("/actions/{action}/apply"));
        let response = self
            .send(self.http_client.post(&url).json(&json!({ "parameters": params })))
            .await?;
        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body).map_err(|e| SyncError::decode("action result", e))
    }

    async fn fetch_one(&self, object_type: &str, primary_key: &str) -> Result<Option<Value>> {
        let url = self.ontology_url(&format!("/objects/{object_type}/{primary_key}"));
        match self.send(self.http_client.get(&url)).await {
            Ok(response) => response
                .json()
                .await
                .map(Some)
                .map_err(|e| SyncError::decode("platform object", e)),
            Err(SyncError::Upstream { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RecordSink for HttpPlatform {
    async fn push_records(&self, stream: &str, records: Vec<Value>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let url = format!(
            "{}/stream-proxy/api/streams/{}/jsonRecords",
            self.base_url, stream
        );
        let body: Vec<Value> = records.into_iter().map(|r| json!({ "value": r })).collect();
        self.send(self.http_client.post(&url).json(&body)).await?;
        Ok(())
    }
}

async fn run_feed(request: RequestBuilder, listener: &FeedListener) -> Result<()> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SyncError::SubscriptionClosed(format!("{status}: {body}")));
    }

    let mut stream = response.bytes_stream();
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
        for line in drain_lines(&mut buffer) {
            match serde_json::from_str::<FeedMessage>(&line) {
                Ok(message) => {
                    if listener.send(message).is_err() {
                        // Nobody is listening any more.
                        return Ok(());
                    }
                }
                Err(e) => warn!(error = %e, "Skipping malformed change-feed line"),
            }
        }
    }
    Ok(())
}

/// Remove every complete, non-blank line from `buffer`.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let Some(last_newline) = buffer.iter().rposition(|b| *b == b'\n') else {
        return Vec::new();
    };
    let rest = buffer.split_off(last_newline + 1);
    let complete = std::mem::replace(buffer, rest);
    String::from_utf8_lossy(&complete)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

struct StreamSubscription {
    task: Option<JoinHandle<()>>,
}

impl PlatformSubscription for StreamSubscription {
    fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
